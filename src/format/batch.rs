//! JSON batch format (`application/cloudevents-batch+json`)

use super::json::{from_json, to_json};
use super::{Format, JSON_BATCH_MEDIA_TYPE};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use serde_json::Value as Json;

/// JSON batch format: a JSON array of JSON-format events
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBatchFormat;

impl Format for JsonBatchFormat {
    fn media_type(&self) -> &'static str {
        JSON_BATCH_MEDIA_TYPE
    }

    /// A single event is written as a one-element batch
    fn marshal(&self, event: &Event) -> Result<Vec<u8>> {
        self.marshal_batch(std::slice::from_ref(event))
    }

    /// Only a batch of exactly one event can be read as a single event
    fn unmarshal(&self, bytes: &[u8]) -> Result<Event> {
        let mut events = self.unmarshal_batch(bytes)?;
        if events.len() != 1 {
            return Err(CloudEventError::Format(format!(
                "expected a batch of one event, found {}",
                events.len()
            )));
        }
        Ok(events.remove(0))
    }

    fn marshal_batch(&self, events: &[Event]) -> Result<Vec<u8>> {
        let docs = events.iter().map(to_json).collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_vec(&Json::Array(docs))?)
    }

    fn unmarshal_batch(&self, bytes: &[u8]) -> Result<Vec<Event>> {
        let doc: Json = serde_json::from_slice(bytes)?;
        let Json::Array(items) = doc else {
            return Err(CloudEventError::Format(
                "batch must be a JSON array".to_string(),
            ));
        };
        items.into_iter().map(from_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Event {
        let mut e = Event::new();
        e.set_id(id);
        e.set_type("t");
        e.set_source("/s");
        e
    }

    #[test]
    fn test_batch_roundtrip() {
        let events = vec![event("1"), event("2"), event("3")];
        let bytes = JsonBatchFormat.marshal_batch(&events).unwrap();
        let back = JsonBatchFormat.unmarshal_batch(&bytes).unwrap();
        assert_eq!(back, events);
    }

    #[test]
    fn test_empty_batch() {
        let back = JsonBatchFormat.unmarshal_batch(b"[]").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_single_event_requires_batch_of_one() {
        let bytes = JsonBatchFormat.marshal(&event("1")).unwrap();
        assert_eq!(JsonBatchFormat.unmarshal(&bytes).unwrap().id(), "1");

        let two = JsonBatchFormat.marshal_batch(&[event("1"), event("2")]).unwrap();
        assert!(JsonBatchFormat.unmarshal(&two).is_err());
    }

    #[test]
    fn test_batch_rejects_object() {
        assert!(JsonBatchFormat.unmarshal_batch(br#"{"specversion":"1.0"}"#).is_err());
    }
}
