//! In-memory event exposed as a message

use super::message::{BinaryWriter, Encoding, Finisher, Message, StructuredWriter};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::{self, Format};
use bytes::Bytes;

/// A message backed by an [`Event`]
///
/// Structured reads use the JSON format unless another one is chosen with
/// [`EventMessage::with_format`].
#[derive(Debug)]
pub struct EventMessage {
    event: Event,
    format: &'static dyn Format,
    finisher: Finisher,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            format: format::json(),
            finisher: Finisher::default(),
        }
    }

    pub fn with_format(mut self, format: &'static dyn Format) -> Self {
        self.format = format;
        self
    }

    /// Attach a hook that runs when the message is finished
    pub fn with_finisher(mut self, finisher: Finisher) -> Self {
        self.finisher = finisher;
        self
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

impl From<Event> for EventMessage {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}

impl Message for EventMessage {
    fn encoding(&self) -> Encoding {
        Encoding::Event
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        let bytes = self.format.marshal(&self.event)?;
        writer.set_structured_event(self.format, Bytes::from(bytes))
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        write_event_binary(&self.event, writer)
    }

    fn as_event(&self) -> Option<&Event> {
        Some(&self.event)
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

/// Walk an event through the binary writer lifecycle
///
/// Attributes go out in table order, so the spec version is always first.
/// The payload is written exactly as stored.
pub fn write_event_binary(event: &Event, writer: &mut dyn BinaryWriter) -> Result<()> {
    writer.start()?;
    for (attr, value) in event.context().attribute_values() {
        writer.set_attribute(attr, value)?;
    }
    for (name, value) in event.extensions() {
        writer.set_extension(name, value.clone())?;
    }
    if let Some(data) = event.data().filter(|d| !d.is_empty()) {
        writer.set_data(data.clone())?;
    }
    writer.end()
}
