//! Outbound HTTP requests and responses

use super::{encode_header_value, CONTENT_TYPE, PREFIX};
use crate::binding::{self, BinaryWriter, Encoding, Message, PipelineOptions, StructuredWriter, TransformerFactory};
use crate::error::{CloudEventError, Result};
use crate::format::Format;
use crate::types::Value;
use crate::version::{prefixed, Attribute, AttributeKind};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Collects headers and body for one HTTP unit
///
/// Content type goes to `Content-Type`; every other attribute and extension
/// becomes a `ce-` header with its canonical value percent-encoded.
#[derive(Debug, Default)]
pub struct HttpWriter {
    headers: HeaderMap,
    body: Bytes,
}

impl HttpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_parts(self) -> (HeaderMap, Bytes) {
        (self.headers, self.body)
    }

    fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::try_from(name)
            .map_err(|e| CloudEventError::InvalidValue(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| CloudEventError::InvalidValue(format!("invalid header value for '{}': {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(())
    }
}

impl StructuredWriter for HttpWriter {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.insert(CONTENT_TYPE, format.media_type())?;
        self.body = event;
        Ok(())
    }
}

impl BinaryWriter for HttpWriter {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        let canonical = attribute.format(&value)?;
        if attribute.kind() == AttributeKind::DataContentType {
            return self.insert(CONTENT_TYPE, &canonical);
        }
        self.insert(&attribute.prefixed_name(PREFIX), &encode_header_value(&canonical))
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.insert(&prefixed(PREFIX, name), &encode_header_value(&value.to_canonical()))
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.body = data;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Run the pipeline into fresh headers and body
///
/// Each direct path gets its own writer so a path abandoned halfway leaves
/// nothing behind in the chosen one.
pub(crate) fn write_parts(
    message: &mut dyn Message,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<(Encoding, HeaderMap, Bytes)> {
    let mut structured = HttpWriter::new();
    let mut binary = HttpWriter::new();
    let encoding = binding::write(message, Some(&mut structured), Some(&mut binary), transformers, options)?;
    let chosen = match encoding {
        Encoding::Structured => structured,
        _ => binary,
    };
    let (headers, body) = chosen.into_parts();
    Ok((encoding, headers, body))
}

/// Write a message into an HTTP request
pub fn write_request(
    message: &mut dyn Message,
    request: &mut http::Request<Bytes>,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<Encoding> {
    let (encoding, headers, body) = write_parts(message, transformers, options)?;
    for (name, value) in &headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    *request.body_mut() = body;
    Ok(encoding)
}

/// Write a message into an HTTP response
pub fn write_response(
    message: &mut dyn Message,
    response: &mut http::Response<Bytes>,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<Encoding> {
    let (encoding, headers, body) = write_parts(message, transformers, options)?;
    for (name, value) in &headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    *response.body_mut() = body;
    Ok(encoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::EventMessage;
    use crate::event::Event;

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
    fn test_binary_request() {
        let mut req = http::Request::new(Bytes::new());
        let enc = write_request(
            &mut EventMessage::new(sample()),
            &mut req,
            &[],
            &PipelineOptions::default(),
        )
        .unwrap();
        assert_eq!(enc, Encoding::Binary);
        let h = req.headers();
        assert_eq!(h["ce-specversion"], "1.0");
        assert_eq!(h["ce-id"], "ABC-123");
        assert_eq!(h["ce-type"], "com.example.test");
        assert_eq!(h["ce-source"], "/unit/test/client");
        assert_eq!(h["content-type"], "application/json");
        assert!(h.get("ce-datacontenttype").is_none());
        assert_eq!(&req.body()[..], br#"{"msg":"hello","sq":42}"#);
    }

    #[test]
    fn test_structured_response() {
        let mut resp = http::Response::new(Bytes::new());
        let enc = write_response(
            &mut EventMessage::new(sample()),
            &mut resp,
            &[],
            &PipelineOptions::force_structured(),
        )
        .unwrap();
        assert_eq!(enc, Encoding::Structured);
        assert_eq!(resp.headers()["content-type"], "application/cloudevents+json");
        assert!(resp.headers().get("ce-id").is_none());
    }

    #[test]
    fn test_non_ascii_extension_is_percent_encoded() {
        let mut e = sample();
        e.set_extension("exta", "café 100%").unwrap();
        let mut req = http::Request::new(Bytes::new());
        write_request(&mut EventMessage::new(e), &mut req, &[], &PipelineOptions::default()).unwrap();
        assert_eq!(req.headers()["ce-exta"], "caf%C3%A9 100%25");
    }
}
