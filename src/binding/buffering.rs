//! Buffered copies of messages and fan-out acknowledgement

use super::event_message::{write_event_binary, EventMessage};
use super::message::{BinaryWriter, BoxMessage, Encoding, Finisher, Message, StructuredWriter};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::Format;
use crate::types::Value;
use crate::version::Attribute;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};

enum Buffered {
    Structured {
        format: &'static dyn Format,
        body: Bytes,
    },
    Binary {
        attributes: Vec<(&'static Attribute, Value)>,
        extensions: Vec<(String, Value)>,
        data: Option<Bytes>,
    },
    Event(Event),
}

/// An in-memory copy that can be read any number of times
pub struct BufferedMessage {
    content: Buffered,
    finisher: Finisher,
}

impl fmt::Debug for BufferedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedMessage")
            .field("encoding", &self.encoding())
            .field("finisher", &self.finisher)
            .finish()
    }
}

impl Message for BufferedMessage {
    fn encoding(&self) -> Encoding {
        match self.content {
            Buffered::Structured { .. } => Encoding::Structured,
            Buffered::Binary { .. } => Encoding::Binary,
            Buffered::Event(_) => Encoding::Event,
        }
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        match &self.content {
            Buffered::Structured { format, body } => writer.set_structured_event(*format, body.clone()),
            Buffered::Event(event) => EventMessage::new(event.clone()).write_structured(writer),
            Buffered::Binary { .. } => Err(CloudEventError::NotStructured),
        }
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        match &self.content {
            Buffered::Binary {
                attributes,
                extensions,
                data,
            } => {
                writer.start()?;
                for (attr, value) in attributes {
                    writer.set_attribute(attr, value.clone())?;
                }
                for (name, value) in extensions {
                    writer.set_extension(name, value.clone())?;
                }
                if let Some(data) = data {
                    writer.set_data(data.clone())?;
                }
                writer.end()
            }
            Buffered::Event(event) => write_event_binary(event, writer),
            Buffered::Structured { .. } => Err(CloudEventError::NotBinary),
        }
    }

    fn as_event(&self) -> Option<&Event> {
        match &self.content {
            Buffered::Event(event) => Some(event),
            _ => None,
        }
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

#[derive(Default)]
struct StructuredCapture {
    captured: Option<(&'static dyn Format, Bytes)>,
}

impl StructuredWriter for StructuredCapture {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.captured = Some((format, event));
        Ok(())
    }
}

#[derive(Default)]
struct BinaryCapture {
    attributes: Vec<(&'static Attribute, Value)>,
    extensions: Vec<(String, Value)>,
    data: Option<Bytes>,
}

impl BinaryWriter for BinaryCapture {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        self.attributes.push((attribute, value));
        Ok(())
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.extensions.push((name.to_string(), value));
        Ok(())
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.data = Some(data);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read `message` once into an independent in-memory message
///
/// Finishing the copy does not finish the source.
pub fn copy_message(message: &mut dyn Message) -> Result<BufferedMessage> {
    let content = match message.encoding() {
        Encoding::Structured => {
            let mut capture = StructuredCapture::default();
            message.write_structured(&mut capture)?;
            let (format, body) = capture.captured.ok_or_else(|| {
                CloudEventError::Format("structured message wrote no event".to_string())
            })?;
            Buffered::Structured { format, body }
        }
        Encoding::Binary => {
            let mut capture = BinaryCapture::default();
            message.write_binary(&mut capture)?;
            Buffered::Binary {
                attributes: capture.attributes,
                extensions: capture.extensions,
                data: capture.data,
            }
        }
        Encoding::Event => match message.as_event() {
            Some(event) => Buffered::Event(event.clone()),
            None => return Err(CloudEventError::EncodingUnknown),
        },
        Encoding::Unknown => return Err(CloudEventError::EncodingUnknown),
    };
    Ok(BufferedMessage {
        content,
        finisher: Finisher::default(),
    })
}

/// Copy `message` and tie the copy's finish to the source
///
/// Finishing the copy finishes the source exactly once. When the copy
/// cannot be made, the source is finished with that error.
pub fn buffer_message(mut message: BoxMessage) -> Result<BufferedMessage> {
    match copy_message(message.as_mut()) {
        Ok(mut copy) => {
            copy.finisher = Finisher::new(move |error| message.finish(error));
            Ok(copy)
        }
        Err(e) => {
            if let Err(finish_err) = message.finish(Some(&e)) {
                tracing::warn!(error = %finish_err, "Failed to finish source after copy error");
            }
            Err(e)
        }
    }
}

struct Acks {
    message: BoxMessage,
    remaining: usize,
}

/// Shares one message among `n` consumers
///
/// Each clone is a handle to the same source. The source is finished when
/// the `n`-th finish arrives, with the error of that last call.
#[derive(Clone)]
pub struct AcksBeforeFinish {
    inner: Arc<Mutex<Acks>>,
}

impl fmt::Debug for AcksBeforeFinish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self.inner.lock().map(|a| a.remaining).unwrap_or_default();
        f.debug_struct("AcksBeforeFinish")
            .field("remaining", &remaining)
            .finish()
    }
}

/// Wrap `message` so that the source sees a finish after `n` finishes
pub fn with_acks_before_finish(message: BoxMessage, n: usize) -> AcksBeforeFinish {
    AcksBeforeFinish {
        inner: Arc::new(Mutex::new(Acks {
            message,
            remaining: n.max(1),
        })),
    }
}

impl AcksBeforeFinish {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Acks>> {
        self.inner
            .lock()
            .map_err(|e| CloudEventError::Config(format!("Shared message lock poisoned: {}", e)))
    }

    /// Finishes still expected before the source is released
    pub fn remaining(&self) -> usize {
        self.lock().map(|a| a.remaining).unwrap_or_default()
    }
}

impl Message for AcksBeforeFinish {
    fn encoding(&self) -> Encoding {
        self.lock()
            .map(|a| a.message.encoding())
            .unwrap_or(Encoding::Unknown)
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        self.lock()?.message.write_structured(writer)
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        self.lock()?.message.write_binary(writer)
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        let mut acks = self.lock()?;
        if acks.remaining == 0 {
            tracing::warn!("Shared message finished more times than expected; ignoring");
            return Ok(());
        }
        acks.remaining -= 1;
        if acks.remaining == 0 {
            return acks.message.finish(error);
        }
        Ok(())
    }
}
