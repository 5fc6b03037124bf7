//! Message and writer contracts shared by every transport

use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::Format;
use crate::types::Value;
use crate::version::Attribute;
use bytes::Bytes;
use std::fmt;

/// Wire encoding of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Attributes in transport headers, data in the body
    Binary,
    /// The whole event serialised by a [`Format`]
    Structured,
    /// An in-memory [`Event`]
    Event,
    Unknown,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Encoding::Binary => "binary",
            Encoding::Structured => "structured",
            Encoding::Event => "event",
            Encoding::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Receives a whole serialised event
pub trait StructuredWriter {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()>;
}

/// Receives an event attribute by attribute
///
/// Call order: `start`, then `set_attribute` / `set_extension` in any
/// order (the spec version first), an optional `set_data`, then `end`.
/// Implementations format values canonically and apply their transport's
/// name prefix; the data content type goes to the native content-type field.
pub trait BinaryWriter {
    fn start(&mut self) -> Result<()>;

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()>;

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()>;

    fn set_data(&mut self, data: Bytes) -> Result<()>;

    /// Payload that is opaque bytes whatever its content type
    ///
    /// Writers with no notion of binary data treat it like `set_data`.
    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.set_data(data)
    }

    fn end(&mut self) -> Result<()>;
}

impl<W: StructuredWriter + ?Sized> StructuredWriter for &mut W {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        (**self).set_structured_event(format, event)
    }
}

impl<W: BinaryWriter + ?Sized> BinaryWriter for &mut W {
    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        (**self).set_attribute(attribute, value)
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        (**self).set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        (**self).set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        (**self).set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        (**self).end()
    }
}

/// A readable CloudEvents message
///
/// A message supports at least one of structured or binary reads; the
/// other answers [`CloudEventError::NotStructured`] /
/// [`CloudEventError::NotBinary`] so the pipeline can try another path.
/// `finish` must be called once the message has been consumed; later calls
/// are ignored.
pub trait Message: Send {
    fn encoding(&self) -> Encoding;

    fn write_structured(&mut self, _writer: &mut dyn StructuredWriter) -> Result<()> {
        Err(CloudEventError::NotStructured)
    }

    fn write_binary(&mut self, _writer: &mut dyn BinaryWriter) -> Result<()> {
        Err(CloudEventError::NotBinary)
    }

    /// The in-memory event, for messages of [`Encoding::Event`]
    fn as_event(&self) -> Option<&Event> {
        None
    }

    /// Release the message, reporting the processing outcome to its source
    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()>;
}

pub type BoxMessage = Box<dyn Message>;

impl<M: Message + ?Sized> Message for Box<M> {
    fn encoding(&self) -> Encoding {
        (**self).encoding()
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        (**self).write_structured(writer)
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        (**self).write_binary(writer)
    }

    fn as_event(&self) -> Option<&Event> {
        (**self).as_event()
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        (**self).finish(error)
    }
}

type FinishHook = Box<dyn FnOnce(Option<&CloudEventError>) -> Result<()> + Send>;

/// Runs a finish hook at most once
///
/// Message implementations embed a `Finisher` so that `finish` is affine:
/// the first call runs the hook, every later call logs and does nothing.
#[derive(Default)]
pub struct Finisher {
    hook: Option<FinishHook>,
    finished: bool,
}

impl Finisher {
    pub fn new(hook: impl FnOnce(Option<&CloudEventError>) -> Result<()> + Send + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        if self.finished {
            tracing::warn!("Message finished more than once; ignoring");
            return Ok(());
        }
        self.finished = true;
        match self.hook.take() {
            Some(hook) => hook(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Finisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finisher")
            .field("finished", &self.finished)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_finisher_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut finisher = Finisher::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        finisher.finish(None).unwrap();
        finisher.finish(Some(&CloudEventError::Cancelled)).unwrap();
        assert!(finisher.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finisher_passes_error() {
        let mut finisher = Finisher::new(|err| match err {
            Some(e) => Err(CloudEventError::Nack(e.to_string())),
            None => Ok(()),
        });
        let out = finisher.finish(Some(&CloudEventError::Cancelled));
        assert!(matches!(out, Err(CloudEventError::Nack(_))));
    }

    #[test]
    fn test_encoding_display() {
        assert_eq!(Encoding::Binary.to_string(), "binary");
        assert_eq!(Encoding::Unknown.to_string(), "unknown");
    }
}
