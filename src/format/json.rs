//! JSON event format (`application/cloudevents+json`)

use super::{Format, JSON_MEDIA_TYPE};
use crate::error::{CloudEventError, Result};
use crate::event::{is_json_content_type, Event};
use crate::types::{self, Value};
use crate::version::{AttributeKind, SpecVersion};
use bytes::Bytes;
use serde_json::{Map, Value as Json};

const DATA: &str = "data";
const DATA_BASE64: &str = "data_base64";
const EXTENSIONS: &str = "extensions";

/// JSON format
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl Format for JsonFormat {
    fn media_type(&self) -> &'static str {
        JSON_MEDIA_TYPE
    }

    fn marshal(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&to_json(event)?)?)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Event> {
        let doc: Json = serde_json::from_slice(bytes)?;
        from_json(doc)
    }
}

fn extension_to_json(value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => Json::from(*i),
        other => Json::String(other.to_canonical()),
    }
}

/// Build the JSON document for one event
pub(crate) fn to_json(event: &Event) -> Result<Json> {
    let version = event.spec_version();
    let mut map = Map::new();

    for (attr, value) in event.context().attribute_values() {
        map.insert(attr.name().to_string(), Json::String(value.to_canonical()));
    }

    let extensions: Map<String, Json> = event
        .extensions()
        .iter()
        .map(|(k, v)| (k.clone(), extension_to_json(v)))
        .collect();
    if version == SpecVersion::V01 {
        if !extensions.is_empty() {
            map.insert(EXTENSIONS.to_string(), Json::Object(extensions));
        }
    } else {
        for (k, v) in extensions {
            map.entry(k).or_insert(v);
        }
    }

    if let Some(data) = event.data() {
        let base64_encoded = version == SpecVersion::V03
            && event.data_content_encoding() == Some("base64");
        if version == SpecVersion::V10 && event.is_data_binary() {
            map.insert(DATA_BASE64.to_string(), Json::String(types::format_binary(data)));
        } else if base64_encoded {
            map.insert(DATA.to_string(), Json::String(String::from_utf8_lossy(data).into_owned()));
        } else {
            map.insert(DATA.to_string(), data_to_json(event, data));
        }
    }

    Ok(Json::Object(map))
}

fn data_to_json(event: &Event, data: &Bytes) -> Json {
    if !event.is_data_binary() && is_json_content_type(event.data_content_type()) {
        if let Ok(doc) = serde_json::from_slice::<Json>(data) {
            return doc;
        }
    }
    match std::str::from_utf8(data) {
        Ok(s) => Json::String(s.to_string()),
        Err(_) => Json::String(types::format_binary(data)),
    }
}

fn detect_version(map: &Map<String, Json>) -> Result<SpecVersion> {
    let raw = map
        .get("specversion")
        .or_else(|| map.get("cloudEventsVersion"))
        .and_then(Json::as_str)
        .ok_or_else(|| CloudEventError::Format("missing specversion".to_string()))?;
    raw.parse()
}

/// Build an event from its JSON document
pub(crate) fn from_json(doc: Json) -> Result<Event> {
    let Json::Object(map) = doc else {
        return Err(CloudEventError::Format(
            "structured event must be a JSON object".to_string(),
        ));
    };
    let version = detect_version(&map)?;
    let mut event = Event::with_version(version);
    let mut data: Option<Json> = None;
    let mut data_base64: Option<Json> = None;

    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        if key == DATA {
            data = Some(value);
            continue;
        }
        if key == DATA_BASE64 && version == SpecVersion::V10 {
            data_base64 = Some(value);
            continue;
        }
        if key == EXTENSIONS && version == SpecVersion::V01 {
            let Json::Object(exts) = value else {
                return Err(CloudEventError::Format("'extensions' must be an object".to_string()));
            };
            for (name, v) in exts {
                if !v.is_null() {
                    event.set_extension(&name, v)?;
                }
            }
            continue;
        }
        match version.attribute_by_name(&key) {
            Some(attr) if attr.kind() == AttributeKind::SpecVersion => {}
            Some(attr) => {
                let value = types::validate(value)?;
                attr.set(&mut event.context, Some(value))?;
            }
            None => event.set_extension(&key, value)?,
        }
    }

    if let Some(encoded) = data_base64 {
        let s = encoded
            .as_str()
            .ok_or_else(|| CloudEventError::Format("'data_base64' must be a string".to_string()))?;
        event.set_raw_data(Some(types::parse_binary(s)?), true);
    } else if let Some(data) = data {
        let base64_encoded = version == SpecVersion::V03
            && event.data_content_encoding() == Some("base64");
        let bytes = match data {
            Json::String(s) if base64_encoded || !is_json_content_type(event.data_content_type()) => {
                Bytes::from(s)
            }
            other => Bytes::from(serde_json::to_vec(&other)?),
        };
        event.set_raw_data(Some(bytes), false);
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::json;

    fn sample() -> Event {
        let mut e = Event::new();
        e.set_id("ABC-123");
        e.set_type("com.example.test");
        e.set_source("/unit/test/client");
        e.set_data("application/json", &serde_json::json!({"sq": 42, "msg": "hello"}))
            .unwrap();
        e
    }

    #[test]
    fn test_marshal_v10_sorted_document() {
        let out = json().marshal(&sample()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"data":{"msg":"hello","sq":42},"datacontenttype":"application/json","id":"ABC-123","source":"/unit/test/client","specversion":"1.0","type":"com.example.test"}"#
        );
    }

    #[test]
    fn test_roundtrip_v10_with_extensions() {
        let mut e = sample();
        e.set_extension("count", 7).unwrap();
        e.set_extension("flag", true).unwrap();
        e.set_extension("label", "x").unwrap();
        e.set_time_str("2020-03-21T12:34:56.5Z");

        let bytes = json().marshal(&e).unwrap();
        let back = json().unmarshal(&bytes).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.extension("count"), Some(&Value::Integer(7)));
    }

    #[test]
    fn test_binary_payload_uses_data_base64() {
        let mut e = sample();
        e.set_data_binary("application/octet-stream", vec![1u8, 2, 3]);
        let doc = to_json(&e).unwrap();
        assert_eq!(doc["data_base64"], "AQID");
        assert!(doc.get("data").is_none());

        let back = from_json(doc).unwrap();
        assert!(back.is_data_binary());
        assert_eq!(&back.data().unwrap()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_v01_nests_extensions() {
        let mut e = Event::with_version(SpecVersion::V01);
        e.set_id("1");
        e.set_type("t");
        e.set_source("/s");
        e.set_extension("exta", "a").unwrap();

        let doc = to_json(&e).unwrap();
        assert_eq!(doc["cloudEventsVersion"], "0.1");
        assert_eq!(doc["eventID"], "1");
        assert_eq!(doc["extensions"]["exta"], "a");
        assert!(doc.get("exta").is_none());

        assert_eq!(from_json(doc).unwrap(), e);
    }

    #[test]
    fn test_v03_base64_data_is_a_string() {
        let mut e = Event::with_version(SpecVersion::V03);
        e.set_id("1");
        e.set_type("t");
        e.set_source("/s");
        e.set_data_content_encoding("base64");
        e.set_data("application/json", &serde_json::json!({"a": 1})).unwrap();

        let doc = to_json(&e).unwrap();
        assert_eq!(doc["data"], "eyJhIjoxfQ==");
        assert_eq!(doc["datacontentencoding"], "base64");

        let back = from_json(doc).unwrap();
        let data: serde_json::Value = back.data_as().unwrap().unwrap();
        assert_eq!(data, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_text_payload() {
        let mut e = sample();
        e.set_data("text/plain", &"hello").unwrap();
        let doc = to_json(&e).unwrap();
        assert_eq!(doc["data"], "hello");
        let back = from_json(doc).unwrap();
        assert_eq!(back.data_as::<String>().unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_missing_specversion() {
        let err = json().unmarshal(br#"{"id":"1"}"#).unwrap_err();
        assert!(matches!(err, CloudEventError::Format(_)));
    }

    #[test]
    fn test_not_an_object() {
        assert!(json().unmarshal(b"[1,2]").is_err());
    }
}
