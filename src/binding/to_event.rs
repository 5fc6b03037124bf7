//! Materialise any message into an [`Event`]

use super::message::{BinaryWriter, Encoding, Message, StructuredWriter};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::Format;
use crate::types::Value;
use crate::version::{Attribute, AttributeKind, SpecVersion};
use bytes::Bytes;

/// Builds an event from either writer contract
#[derive(Debug, Default)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

impl StructuredWriter for EventBuilder {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.event = format.unmarshal(&event)?;
        Ok(())
    }
}

impl BinaryWriter for EventBuilder {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        if attribute.kind() == AttributeKind::SpecVersion {
            let version: SpecVersion = value.to_canonical().parse()?;
            self.event.set_spec_version(version);
            return Ok(());
        }
        attribute.set(&mut self.event.context, Some(value))
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.event.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.event.set_wire_data(data);
        Ok(())
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.event.set_raw_data((!data.is_empty()).then_some(data), true);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read a message into a new event
///
/// Event-encoded messages are cloned; unknown encodings fail with
/// [`CloudEventError::EncodingUnknown`].
pub fn to_event(message: &mut dyn Message) -> Result<Event> {
    if let Some(event) = message.as_event() {
        return Ok(event.clone());
    }
    let mut builder = EventBuilder::new();
    match message.encoding() {
        Encoding::Structured => message.write_structured(&mut builder)?,
        Encoding::Binary => message.write_binary(&mut builder)?,
        Encoding::Event | Encoding::Unknown => return Err(CloudEventError::EncodingUnknown),
    }
    Ok(builder.into_event())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::EventMessage;
    use crate::format;

    #[test]
    fn test_binary_builder_switches_version() {
        let mut b = EventBuilder::new();
        let v03 = SpecVersion::V03;
        b.start().unwrap();
        b.set_attribute(v03.attribute(AttributeKind::SpecVersion).unwrap(), Value::String("0.3".into()))
            .unwrap();
        b.set_attribute(v03.attribute(AttributeKind::Id).unwrap(), Value::String("1".into()))
            .unwrap();
        b.set_attribute(v03.attribute(AttributeKind::Source).unwrap(), Value::String("/s".into()))
            .unwrap();
        b.set_attribute(v03.attribute(AttributeKind::Type).unwrap(), Value::String("t".into()))
            .unwrap();
        b.set_extension("Exta", Value::String("a".into())).unwrap();
        b.set_data(Bytes::from_static(b"\x00\x01")).unwrap();
        b.end().unwrap();

        let e = b.into_event();
        assert_eq!(e.spec_version(), SpecVersion::V03);
        assert_eq!(e.id(), "1");
        assert_eq!(e.source().unwrap().as_str(), "/s");
        assert_eq!(e.extension("exta"), Some(&Value::String("a".into())));
        assert!(e.is_data_binary());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_structured_builder_unmarshals() {
        let mut b = EventBuilder::new();
        b.set_structured_event(
            format::json(),
            Bytes::from_static(br#"{"specversion":"0.2","id":"1","type":"t","source":"/s"}"#),
        )
        .unwrap();
        let e = b.into_event();
        assert_eq!(e.spec_version(), SpecVersion::V02);
        assert_eq!(e.ty(), "t");
    }

    #[test]
    fn test_to_event_clones_event_messages() {
        let mut e = Event::new();
        e.set_id("x");
        let mut msg = EventMessage::new(e.clone());
        assert_eq!(to_event(&mut msg).unwrap(), e);
    }
}
