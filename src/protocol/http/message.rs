//! Inbound HTTP requests and responses as messages

use super::{decode_header_value, CONTENT_TYPE, PREFIX};
use crate::binding::{BinaryWriter, Encoding, Finisher, Message, StructuredWriter};
use crate::error::{CloudEventError, Result};
use crate::format::{self, Format};
use crate::types::Value;
use crate::version::{version_from_header, AttributeKind, SpecVersion};
use bytes::Bytes;
use http::HeaderMap;
use std::fmt;

/// An HTTP request or response carrying a CloudEvent
pub struct HttpMessage {
    headers: HeaderMap,
    body: Bytes,
    format: Option<&'static dyn Format>,
    version: Option<SpecVersion>,
    finisher: Finisher,
}

impl HttpMessage {
    /// Inspect headers to decide the encoding
    pub fn new(headers: HeaderMap, body: Bytes) -> Self {
        let format = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(format::lookup);
        let version = match format {
            Some(_) => None,
            None => version_from_header(PREFIX, |name| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_string())
            }),
        };
        Self {
            headers,
            body,
            format,
            version,
            finisher: Finisher::default(),
        }
    }

    pub fn from_request(request: http::Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self::new(parts.headers, body)
    }

    pub fn from_response(response: http::Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self::new(parts.headers, body)
    }

    pub fn with_finisher(mut self, finisher: Finisher) -> Self {
        self.finisher = finisher;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Structured format named by `Content-Type`, if any
    pub fn format(&self) -> Option<&'static dyn Format> {
        self.format
    }
}

impl fmt::Debug for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessage")
            .field("encoding", &self.encoding())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Message for HttpMessage {
    fn encoding(&self) -> Encoding {
        if self.format.is_some() {
            Encoding::Structured
        } else if self.version.is_some() {
            Encoding::Binary
        } else {
            Encoding::Unknown
        }
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        let format = self.format.ok_or(CloudEventError::NotStructured)?;
        writer.set_structured_event(format, self.body.clone())
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        let version = self.version.ok_or(CloudEventError::NotBinary)?;
        writer.start()?;
        if let Some(attr) = version.attribute(AttributeKind::SpecVersion) {
            writer.set_attribute(attr, Value::String(version.as_str().to_string()))?;
        }

        for (name, value) in &self.headers {
            let name = name.as_str();
            if name == CONTENT_TYPE {
                let ct = value.to_str().map_err(|e| {
                    CloudEventError::InvalidValue(format!("content-type is not ASCII: {}", e))
                })?;
                if let Some(attr) = version.attribute(AttributeKind::DataContentType) {
                    writer.set_attribute(attr, Value::String(ct.to_string()))?;
                }
                continue;
            }
            let Some(short) = name.strip_prefix(PREFIX) else {
                continue;
            };
            let decoded = decode_header_value(value.as_bytes());
            match version.attribute_by_name(short) {
                Some(attr) if attr.kind() == AttributeKind::SpecVersion => {}
                Some(attr) => writer.set_attribute(attr, attr.parse(&decoded)?)?,
                None => writer.set_extension(short, Value::String(decoded))?,
            }
        }

        if !self.body.is_empty() {
            writer.set_data(self.body.clone())?;
        }
        writer.end()
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::to_event;
    use http::HeaderValue;

    fn binary_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("ce-specversion", HeaderValue::from_static("1.0"));
        h.insert("ce-id", HeaderValue::from_static("ABC-123"));
        h.insert("ce-type", HeaderValue::from_static("com.example.test"));
        h.insert("ce-source", HeaderValue::from_static("/unit/test/client"));
        h.insert("ce-exta", HeaderValue::from_static("caf%C3%A9"));
        h.insert("content-type", HeaderValue::from_static("text/plain"));
        h
    }

    #[test]
    fn test_detects_binary() {
        let mut msg = HttpMessage::new(binary_headers(), Bytes::from_static(b"hello"));
        assert_eq!(msg.encoding(), Encoding::Binary);

        let e = to_event(&mut msg).unwrap();
        assert_eq!(e.id(), "ABC-123");
        assert_eq!(e.data_content_type(), Some("text/plain"));
        assert_eq!(e.extension("exta"), Some(&Value::String("café".into())));
        assert_eq!(e.data_as::<String>().unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_detects_structured_with_parameters() {
        let mut h = HeaderMap::new();
        h.insert(
            "content-type",
            HeaderValue::from_static("application/cloudevents+json; charset=utf-8"),
        );
        let msg = HttpMessage::new(h, Bytes::from_static(b"{}"));
        assert_eq!(msg.encoding(), Encoding::Structured);
    }

    #[test]
    fn test_plain_request_is_unknown() {
        let mut h = HeaderMap::new();
        h.insert("content-type", HeaderValue::from_static("application/json"));
        let mut msg = HttpMessage::new(h, Bytes::from_static(b"{}"));
        assert_eq!(msg.encoding(), Encoding::Unknown);
        assert!(matches!(to_event(&mut msg), Err(CloudEventError::EncodingUnknown)));
    }

    #[test]
    fn test_bad_attribute_value_is_a_conversion_error() {
        let mut h = binary_headers();
        h.insert("ce-time", HeaderValue::from_static("yesterday"));
        let mut msg = HttpMessage::new(h, Bytes::new());
        assert!(matches!(
            to_event(&mut msg),
            Err(CloudEventError::Conversion { .. })
        ));
    }
}
