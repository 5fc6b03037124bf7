//! In-memory CloudEvent
//!
//! An [`Event`] is a context, an optional encoded payload and two flags
//! describing that payload. Setters normalise their input and record
//! per-field errors instead of failing; [`Event::validate`] reports them
//! together with any missing mandatory attribute.

mod context;
mod data;

pub use context::EventContext;
pub use data::is_json_content_type;

use crate::error::{CloudEventError, Result, ValidationError};
use crate::types::{self, IntoValue, Uri, UriRef, Value};
use crate::version::{AttributeKind, SpecVersion};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// `datacontentencoding` tokens accepted by 0.3
const CONTENT_ENCODINGS: [&str; 5] = ["7bit", "8bit", "binary", "quoted-printable", "base64"];

const BASE64_ENCODING: &str = "base64";

/// A CloudEvent held in memory
#[derive(Debug, Clone)]
pub struct Event {
    pub(crate) context: EventContext,
    pub(crate) data: Option<Bytes>,
    /// Payload is the codec serialisation of a logical value
    pub(crate) data_encoded: bool,
    /// Payload is opaque bytes
    pub(crate) data_binary: bool,
    field_errors: BTreeMap<String, String>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.data == other.data
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    /// Create an empty event at the latest spec version
    pub fn new() -> Self {
        Self::with_version(SpecVersion::latest())
    }

    /// Create an empty event at a given spec version
    pub fn with_version(version: SpecVersion) -> Self {
        Self {
            context: EventContext::new(version),
            data: None,
            data_encoded: false,
            data_binary: false,
            field_errors: BTreeMap::new(),
        }
    }

    pub(crate) fn from_context(context: EventContext) -> Self {
        Self {
            context,
            data: None,
            data_encoded: false,
            data_binary: false,
            field_errors: BTreeMap::new(),
        }
    }

    // ─── Getters ─────────────────────────────────────────────────

    pub fn context(&self) -> &EventContext {
        &self.context
    }

    pub fn spec_version(&self) -> SpecVersion {
        self.context.spec_version
    }

    pub fn id(&self) -> &str {
        &self.context.id
    }

    pub fn source(&self) -> Option<&UriRef> {
        self.context.source.as_ref()
    }

    pub fn ty(&self) -> &str {
        &self.context.ty
    }

    pub fn subject(&self) -> Option<&str> {
        self.context.subject()
    }

    pub fn time(&self) -> Option<&DateTime<Utc>> {
        self.context.time()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.context.data_content_type()
    }

    pub fn data_schema(&self) -> Option<&Uri> {
        self.context.data_schema()
    }

    pub fn data_content_encoding(&self) -> Option<&str> {
        self.context.data_content_encoding()
    }

    pub fn extensions(&self) -> &BTreeMap<String, Value> {
        &self.context.extensions
    }

    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.context.extension(name)
    }

    /// Raw payload bytes as stored
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn is_data_binary(&self) -> bool {
        self.data_binary
    }

    pub fn is_data_encoded(&self) -> bool {
        self.data_encoded
    }

    /// Errors recorded by setters since the field was last set successfully
    pub fn field_errors(&self) -> &BTreeMap<String, String> {
        &self.field_errors
    }

    // ─── Setters ─────────────────────────────────────────────────

    fn record(&mut self, field: &str, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                self.field_errors.remove(field);
            }
            Err(e) => {
                tracing::debug!(field, error = %e, "Event field rejected");
                self.field_errors.insert(field.to_string(), e.to_string());
            }
        }
    }

    /// Convert the event to another spec version
    ///
    /// Leaving 0.3 with `datacontentencoding: base64` decodes the payload and
    /// marks it binary.
    pub fn set_spec_version(&mut self, version: SpecVersion) {
        let from = self.context.spec_version;
        if from == version {
            return;
        }
        if from == SpecVersion::V03 && self.is_base64_encoded() {
            let decoded = match self.data.as_deref() {
                Some(d) => types::parse_binary_unquoted(d).map(Some),
                None => Ok(None),
            };
            match decoded {
                Ok(data) => {
                    self.data = data;
                    self.data_binary = true;
                    self.data_encoded = false;
                    self.context.data_content_encoding = None;
                }
                Err(e) => self.record("data", Err(e)),
            }
        }
        self.context.convert_to(version);
    }

    pub fn set_id(&mut self, id: impl AsRef<str>) {
        let id = id.as_ref().trim();
        let outcome = if id.is_empty() {
            Err(CloudEventError::InvalidValue("id must not be empty".to_string()))
        } else {
            self.context.id = id.to_string();
            Ok(())
        };
        self.record("id", outcome);
    }

    pub fn set_type(&mut self, ty: impl AsRef<str>) {
        let ty = ty.as_ref().trim();
        let outcome = if ty.is_empty() {
            Err(CloudEventError::InvalidValue("type must not be empty".to_string()))
        } else {
            self.context.ty = ty.to_string();
            Ok(())
        };
        self.record("type", outcome);
    }

    pub fn set_source(&mut self, source: impl AsRef<str>) {
        let outcome = UriRef::parse(source.as_ref().trim()).map(|s| {
            self.context.source = Some(s);
        });
        self.record("source", outcome);
    }

    /// Empty input clears the subject
    pub fn set_subject(&mut self, subject: impl AsRef<str>) {
        let subject = subject.as_ref().trim();
        self.context.subject = (!subject.is_empty()).then(|| subject.to_string());
        self.record("subject", Ok(()));
    }

    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.context.time = Some(time);
        self.record("time", Ok(()));
    }

    /// Parse and set an RFC 3339 time
    pub fn set_time_str(&mut self, time: impl AsRef<str>) {
        let outcome = types::parse_time(time.as_ref()).map(|t| {
            self.context.time = Some(t);
        });
        self.record("time", outcome);
    }

    /// Empty input clears the content type
    pub fn set_data_content_type(&mut self, content_type: impl AsRef<str>) {
        let ct = content_type.as_ref().trim();
        let outcome = if ct.is_empty() {
            self.context.data_content_type = None;
            Ok(())
        } else {
            types::validate_media_type(ct).map(|()| {
                self.context.data_content_type = Some(ct.to_string());
            })
        };
        self.record("datacontenttype", outcome);
    }

    pub fn set_data_schema(&mut self, schema: impl AsRef<str>) {
        let schema = schema.as_ref().trim();
        let outcome = if schema.is_empty() {
            self.context.data_schema = None;
            Ok(())
        } else {
            Uri::parse(schema).map(|u| {
                self.context.data_schema = Some(u);
            })
        };
        self.record("dataschema", outcome);
    }

    /// 0.3 only; tokens are lowercased
    pub fn set_data_content_encoding(&mut self, encoding: impl AsRef<str>) {
        let enc = encoding.as_ref().trim().to_ascii_lowercase();
        let outcome = if self.context.spec_version != SpecVersion::V03 {
            Err(CloudEventError::InvalidValue(format!(
                "datacontentencoding is not defined for spec version {}",
                self.context.spec_version
            )))
        } else if enc.is_empty() {
            self.context.data_content_encoding = None;
            Ok(())
        } else if !CONTENT_ENCODINGS.contains(&enc.as_str()) {
            Err(CloudEventError::InvalidValue(format!(
                "unsupported datacontentencoding '{}'",
                enc
            )))
        } else {
            self.context.data_content_encoding = Some(enc);
            Ok(())
        };
        self.record("datacontentencoding", outcome);
    }

    /// Set an extension; the name is lowercased and must not be reserved
    pub fn set_extension<V: IntoValue>(&mut self, name: &str, value: V) -> Result<()> {
        let name = name.trim().to_ascii_lowercase();
        let outcome = self
            .check_extension_name(&name)
            .and_then(|()| types::validate(value));
        match outcome {
            Ok(value) => {
                self.context.extensions.insert(name.clone(), value);
                self.record(&name, Ok(()));
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.field_errors.insert(name, reason);
                Err(e)
            }
        }
    }

    pub fn remove_extension(&mut self, name: &str) -> Option<Value> {
        let name = name.to_ascii_lowercase();
        self.field_errors.remove(&name);
        self.context.extensions.remove(&name)
    }

    fn check_extension_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CloudEventError::InvalidValue(
                "extension name must not be empty".to_string(),
            ));
        }
        let version = self.context.spec_version;
        if version.is_reserved(name) {
            return Err(CloudEventError::InvalidValue(format!(
                "'{}' is a reserved attribute name in {}",
                name, version
            )));
        }
        if version == SpecVersion::V10 && !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(CloudEventError::InvalidValue(format!(
                "extension name '{}' must be lowercase alphanumeric",
                name
            )));
        }
        Ok(())
    }

    // ─── Data ────────────────────────────────────────────────────

    fn is_base64_encoded(&self) -> bool {
        self.context.spec_version == SpecVersion::V03
            && self.context.data_content_encoding.as_deref() == Some(BASE64_ENCODING)
    }

    /// Encode a value with the codec for `content_type` and store it
    pub fn set_data<T: Serialize + ?Sized>(&mut self, content_type: &str, value: &T) -> Result<()> {
        self.set_data_content_type(content_type);
        let value = serde_json::to_value(value)?;
        let mut encoded = data::encode(self.data_content_type(), value)?;
        if self.is_base64_encoded() {
            encoded = Bytes::from(types::format_binary(&encoded));
        }
        self.data = Some(encoded);
        self.data_encoded = true;
        self.data_binary = false;
        Ok(())
    }

    /// Store raw bytes as the payload
    pub fn set_data_binary(&mut self, content_type: &str, data: impl Into<Bytes>) {
        self.set_data_content_type(content_type);
        let mut data: Bytes = data.into();
        if self.is_base64_encoded() {
            data = Bytes::from(types::format_binary(&data));
        }
        self.data = Some(data);
        self.data_binary = true;
        self.data_encoded = false;
    }

    /// Store payload bytes exactly as received from a wire representation
    pub(crate) fn set_raw_data(&mut self, data: Option<Bytes>, binary: bool) {
        self.data_encoded = data.is_some() && !binary;
        self.data_binary = data.is_some() && binary;
        self.data = data;
    }

    /// Store a payload read from a binary-mode message
    ///
    /// Media types without a data codec are kept as opaque bytes, and so is
    /// a body with no content type that is not a JSON document.
    pub(crate) fn set_wire_data(&mut self, data: Bytes) {
        let binary = match self.data_content_type() {
            None => serde_json::from_slice::<serde::de::IgnoredAny>(&data).is_err(),
            ct => match data::codec_for(ct) {
                Ok(data::Codec::Json) => false,
                Ok(data::Codec::Text) => std::str::from_utf8(&data).is_err(),
                Err(_) => true,
            },
        };
        self.set_raw_data((!data.is_empty()).then_some(data), binary);
    }

    /// Remove the payload
    pub fn clear_data(&mut self) {
        self.data = None;
        self.data_binary = false;
        self.data_encoded = false;
    }

    /// Payload bytes with the 0.3 base64 transfer encoding removed
    pub fn data_bytes(&self) -> Result<Option<Bytes>> {
        match &self.data {
            None => Ok(None),
            Some(d) if d.is_empty() => Ok(None),
            Some(d) if self.is_base64_encoded() => types::parse_binary_unquoted(d).map(Some),
            Some(d) => Ok(Some(d.clone())),
        }
    }

    /// Decode the payload into `T`; an empty payload yields `None`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let Some(bytes) = self.data_bytes()? else {
            return Ok(None);
        };
        let value = data::decode(self.data_content_type(), &bytes)?;
        Ok(Some(serde_json::from_value(value)?))
    }

    // ─── Validation ──────────────────────────────────────────────

    /// Check mandatory attributes and report every recorded field error
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationError::new();
        for (field, reason) in &self.field_errors {
            errors.add(field.clone(), reason.clone());
        }

        let version = self.context.spec_version;
        for attr in version.attributes().iter().filter(|a| a.is_required()) {
            if attr.get(&self.context).is_none() {
                errors.add(attr.name(), "required but missing");
            }
        }

        if let Some(ct) = self.data_content_type() {
            if let Err(e) = types::validate_media_type(ct) {
                errors.add(name_of(version, AttributeKind::DataContentType), e.to_string());
            }
        }

        if let Some(enc) = self.data_content_encoding() {
            if !CONTENT_ENCODINGS.contains(&enc) {
                errors.add("datacontentencoding", format!("unsupported encoding '{}'", enc));
            }
        }

        for name in self.context.extensions.keys() {
            if let Err(e) = self.check_extension_name(name) {
                errors.add(name.clone(), e.to_string());
            }
        }

        errors.into_result()
    }
}

fn name_of(version: SpecVersion, kind: AttributeKind) -> &'static str {
    version.attribute(kind).map(|a| a.name()).unwrap_or("unknown")
}
