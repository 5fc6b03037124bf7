//! The write pipeline
//!
//! Moves a source message into a structured and/or binary writer. Direct
//! paths hand the source straight to a (wrapped) writer, so structured
//! bytes are forwarded verbatim and binary headers are never parsed into an
//! event. When neither direct path works the source is materialised into an
//! event, the event transformers run once, and the event is written
//! without any wrapper so that no transformer applies twice.

use super::event_message::EventMessage;
use super::message::{BinaryWriter, Encoding, Message, StructuredWriter};
use super::options::PipelineOptions;
use super::to_event::to_event;
use super::transformer::TransformerFactory;
use crate::error::{CloudEventError, Result};

/// Wrap `base` with each factory's structured wrapper
///
/// The first factory ends up outermost, so it sees the source's calls
/// first. `None` as soon as one factory declines.
fn chain_structured<'a>(
    base: &'a mut dyn StructuredWriter,
    transformers: &[&dyn TransformerFactory],
) -> Option<Box<dyn StructuredWriter + 'a>> {
    let mut writer: Box<dyn StructuredWriter + 'a> = Box::new(base);
    for factory in transformers.iter().rev() {
        writer = factory.structured_transformer(writer)?;
    }
    Some(writer)
}

fn chain_binary<'a>(
    base: &'a mut dyn BinaryWriter,
    transformers: &[&dyn TransformerFactory],
) -> Option<Box<dyn BinaryWriter + 'a>> {
    let mut writer: Box<dyn BinaryWriter + 'a> = Box::new(base);
    for factory in transformers.iter().rev() {
        writer = factory.binary_transformer(writer)?;
    }
    Some(writer)
}

/// Write `message` to whichever writer fits, returning the encoding used
///
/// The message is not finished here; callers finish it with the outcome.
/// `NotStructured`/`NotBinary` never escape: they only steer the fallback.
pub fn write(
    message: &mut dyn Message,
    mut structured: Option<&mut dyn StructuredWriter>,
    mut binary: Option<&mut dyn BinaryWriter>,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<Encoding> {
    let source = message.encoding();

    if source != Encoding::Event {
        if let (Some(writer), false) = (structured.as_deref_mut(), options.skip_direct_structured) {
            if let Some(mut chained) = chain_structured(writer, transformers) {
                match message.write_structured(chained.as_mut()) {
                    Ok(()) => return Ok(Encoding::Structured),
                    Err(e) if e.is_fallback_signal() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if let (Some(writer), false) = (binary.as_deref_mut(), options.skip_direct_binary) {
            if let Some(mut chained) = chain_binary(writer, transformers) {
                match message.write_binary(chained.as_mut()) {
                    Ok(()) => return Ok(Encoding::Binary),
                    Err(e) if e.is_fallback_signal() => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    if structured.is_none() && binary.is_none() {
        return Err(CloudEventError::Config(
            "write needs a structured or a binary writer".to_string(),
        ));
    }

    let mut event = to_event(message)?;
    for factory in transformers {
        if let Some(transform) = factory.event_transformer() {
            transform(&mut event)?;
        }
    }
    tracing::trace!(%source, event_id = %event.id(), "Writing through event form");

    let mut fallback = EventMessage::new(event);
    let use_structured = match (&structured, &binary) {
        (Some(_), Some(_)) => options.preferred_encoding == Encoding::Structured,
        (Some(_), None) => true,
        _ => false,
    };
    match (use_structured, structured, binary) {
        (true, Some(writer), _) => {
            fallback.write_structured(writer)?;
            Ok(Encoding::Structured)
        }
        (_, _, Some(writer)) => {
            fallback.write_binary(writer)?;
            Ok(Encoding::Binary)
        }
        _ => Err(CloudEventError::EncodingUnknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{AddExtension, EventBuilder, Finisher};
    use crate::event::Event;
    use crate::format::{self, Format};
    use crate::types::Value;
    use crate::version::Attribute;
    use bytes::Bytes;

    /// Structured-only source
    struct RawStructured(Bytes);

    impl Message for RawStructured {
        fn encoding(&self) -> Encoding {
            Encoding::Structured
        }

        fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
            writer.set_structured_event(format::json(), self.0.clone())
        }

        fn finish(&mut self, _error: Option<&CloudEventError>) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture {
        body: Option<Bytes>,
    }

    impl StructuredWriter for Capture {
        fn set_structured_event(&mut self, _format: &'static dyn Format, event: Bytes) -> Result<()> {
            self.body = Some(event);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Headers {
        attrs: Vec<(String, String)>,
    }

    impl BinaryWriter for Headers {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
            self.attrs.push((attribute.name().to_string(), value.to_canonical()));
            Ok(())
        }

        fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
            self.attrs.push((name.to_string(), value.to_canonical()));
            Ok(())
        }

        fn set_data(&mut self, _data: Bytes) -> Result<()> {
            Ok(())
        }

        fn end(&mut self) -> Result<()> {
            Ok(())
        }
    }

    // Not valid JSON on purpose: a direct copy must not parse it
    const OPAQUE: &[u8] = b"{not json";

    #[test]
    fn test_structured_forwarded_verbatim() {
        let mut src = RawStructured(Bytes::from_static(OPAQUE));
        let mut out = Capture::default();
        let enc = write(&mut src, Some(&mut out), None, &[], &PipelineOptions::default()).unwrap();
        assert_eq!(enc, Encoding::Structured);
        assert_eq!(out.body.unwrap(), Bytes::from_static(OPAQUE));
    }

    #[test]
    fn test_structured_to_binary_falls_back() {
        let mut src = RawStructured(Bytes::from_static(
            br#"{"specversion":"1.0","id":"1","type":"t","source":"/s","exta":"a"}"#,
        ));
        let mut out = Headers::default();
        let enc = write(&mut src, None, Some(&mut out), &[], &PipelineOptions::default()).unwrap();
        assert_eq!(enc, Encoding::Binary);
        assert!(out.attrs.contains(&("id".to_string(), "1".to_string())));
        assert!(out.attrs.contains(&("exta".to_string(), "a".to_string())));
    }

    #[test]
    fn test_transformer_applies_once_on_fallback() {
        let mut src = RawStructured(Bytes::from_static(
            br#"{"specversion":"1.0","id":"1","type":"t","source":"/s"}"#,
        ));
        let add = AddExtension::new("extb", Value::Integer(1));
        let mut out = Headers::default();
        write(&mut src, None, Some(&mut out), &[&add], &PipelineOptions::default()).unwrap();
        let count = out.attrs.iter().filter(|(k, _)| k == "extb").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_structured_with_transformer_is_reencoded() {
        let mut src = RawStructured(Bytes::from_static(
            br#"{"specversion":"1.0","id":"1","type":"t","source":"/s"}"#,
        ));
        let add = AddExtension::new("extb", Value::Integer(1));
        let mut out = Capture::default();
        let enc = write(&mut src, Some(&mut out), None, &[&add], &PipelineOptions::default()).unwrap();
        assert_eq!(enc, Encoding::Structured);
        let event = format::json().unmarshal(&out.body.unwrap()).unwrap();
        assert_eq!(event.extension("extb"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_event_source_prefers_options() {
        let mut e = Event::new();
        e.set_id("1");
        e.set_type("t");
        e.set_source("/s");

        let mut sw = Capture::default();
        let mut bw = Headers::default();
        let enc = write(
            &mut EventMessage::new(e.clone()),
            Some(&mut sw),
            Some(&mut bw),
            &[],
            &PipelineOptions::default(),
        )
        .unwrap();
        assert_eq!(enc, Encoding::Binary);

        let enc = write(
            &mut EventMessage::new(e),
            Some(&mut sw),
            Some(&mut bw),
            &[],
            &PipelineOptions::force_structured(),
        )
        .unwrap();
        assert_eq!(enc, Encoding::Structured);
    }

    #[test]
    fn test_unknown_source_fails() {
        struct Opaque;
        impl Message for Opaque {
            fn encoding(&self) -> Encoding {
                Encoding::Unknown
            }
            fn finish(&mut self, _error: Option<&CloudEventError>) -> Result<()> {
                Ok(())
            }
        }
        let mut out = EventBuilder::new();
        let err = write(&mut Opaque, None, Some(&mut out), &[], &PipelineOptions::default());
        assert!(matches!(err, Err(CloudEventError::EncodingUnknown)));
    }

    #[test]
    fn test_no_writer_is_an_error() {
        let mut msg = EventMessage::new(Event::new()).with_finisher(Finisher::default());
        assert!(write(&mut msg, None, None, &[], &PipelineOptions::default()).is_err());
    }
}
