//! Data codecs keyed by content type
//!
//! JSON covers `application/json`, `text/json`, any `+json` suffix and an
//! absent content type. `text/*` carries plain strings.

use crate::error::{CloudEventError, Result};
use crate::types::media_type_essence;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Codec {
    Json,
    Text,
}

/// True for media types whose payload is a JSON document
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let essence = media_type_essence(ct);
            essence.is_empty()
                || essence == "application/json"
                || essence == "text/json"
                || essence.ends_with("+json")
        }
    }
}

pub(crate) fn codec_for(content_type: Option<&str>) -> Result<Codec> {
    if is_json_content_type(content_type) {
        return Ok(Codec::Json);
    }
    let essence = content_type.map(media_type_essence).unwrap_or_default();
    if essence.starts_with("text/") {
        return Ok(Codec::Text);
    }
    Err(CloudEventError::Format(format!(
        "no data codec for content type '{}'",
        essence
    )))
}

pub(crate) fn encode(content_type: Option<&str>, value: serde_json::Value) -> Result<Bytes> {
    match codec_for(content_type)? {
        Codec::Json => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        Codec::Text => match value {
            serde_json::Value::String(s) => Ok(Bytes::from(s)),
            other => Err(CloudEventError::Format(format!(
                "text codec expects a string, got {}",
                other
            ))),
        },
    }
}

pub(crate) fn decode(content_type: Option<&str>, bytes: &[u8]) -> Result<serde_json::Value> {
    match codec_for(content_type)? {
        Codec::Json => Ok(serde_json::from_slice(bytes)?),
        Codec::Text => String::from_utf8(bytes.to_vec())
            .map(serde_json::Value::String)
            .map_err(|e| CloudEventError::Format(format!("text payload is not UTF-8: {}", e))),
    }
}
