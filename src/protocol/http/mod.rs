//! HTTP transport
//!
//! Binary mode carries attributes as `ce-` headers with the data content
//! type in `Content-Type`; structured mode sets `Content-Type` to the
//! format's media type. Header values are percent-encoded outside printable
//! ASCII. The client side uses `reqwest`, the server side `hyper`.

mod client;
mod message;
mod server;
mod write;

pub use client::{HttpClientConfig, HttpSender};
pub use message::HttpMessage;
pub use server::{HttpServer, HttpServerConfig};
pub use write::{write_request, write_response, HttpWriter};

use crate::binding::{to_event, Message};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::{self, JSON_BATCH_MEDIA_TYPE};
use crate::types::media_type_essence;
use bytes::Bytes;
use http::header::HeaderValue;

/// Header prefix for attributes and extensions
pub const PREFIX: &str = "ce-";

pub(crate) const CONTENT_TYPE: &str = "content-type";

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Percent-encode everything outside printable ASCII, plus `"` and `%`
pub(crate) fn encode_header_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b' '..=b'~' if b != b'"' && b != b'%' => out.push(b as char),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

pub(crate) fn decode_header_value(raw: &[u8]) -> String {
    let hex = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let (Some(hi), Some(lo)) = (hex(raw[i + 1]), hex(raw[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

/// Every event in an inbound message
///
/// A `application/cloudevents-batch+json` body yields all of its events;
/// anything else yields the single event the message carries.
pub fn to_events(message: &mut HttpMessage) -> Result<Vec<Event>> {
    let is_batch = message
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| media_type_essence(ct) == JSON_BATCH_MEDIA_TYPE)
        .unwrap_or(false);
    if is_batch {
        return format::json_batch().unmarshal_batch(message.body());
    }
    Ok(vec![to_event(message as &mut dyn Message)?])
}

/// Fill `request` with a JSON batch of `events`
pub fn write_batch_request(events: &[Event], request: &mut http::Request<Bytes>) -> Result<()> {
    let body = format::json_batch().marshal_batch(events)?;
    request.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_BATCH_MEDIA_TYPE),
    );
    *request.body_mut() = Bytes::from(body);
    Ok(())
}

pub(crate) fn status_error(status: http::StatusCode, body: Bytes) -> CloudEventError {
    CloudEventError::Status {
        code: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_codec() {
        assert_eq!(encode_header_value("plain"), "plain");
        assert_eq!(encode_header_value("a\"b"), "a%22b");
        assert_eq!(decode_header_value(b"caf%C3%A9"), "café");
        assert_eq!(decode_header_value(b"100%"), "100%");
        assert_eq!(decode_header_value(b"%zz"), "%zz");
    }

    #[test]
    fn test_batch_request_roundtrip() {
        let mut a = Event::new();
        a.set_id("1");
        a.set_type("t");
        a.set_source("/s");
        let mut b = a.clone();
        b.set_id("2");

        let mut req = http::Request::new(Bytes::new());
        write_batch_request(&[a.clone(), b.clone()], &mut req).unwrap();
        let mut msg = HttpMessage::from_request(req);
        assert_eq!(to_events(&mut msg).unwrap(), vec![a, b]);
    }
}
