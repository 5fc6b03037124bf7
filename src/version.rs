//! Spec-version registry
//!
//! Each CloudEvents version is described by an ordered attribute table.
//! The tables are static, so the registry is immutable for the life of
//! the process. Binary-mode transports use [`version_from_header`] to
//! decide which table applies to an inbound message.

use crate::error::{CloudEventError, Result};
use crate::event::EventContext;
use crate::types::{self, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered CloudEvents specification version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpecVersion {
    #[serde(rename = "0.1")]
    V01,
    #[serde(rename = "0.2")]
    V02,
    #[serde(rename = "0.3")]
    V03,
    #[serde(rename = "1.0")]
    V10,
}

/// The closed set of context attribute kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    SpecVersion,
    Id,
    Type,
    Source,
    Subject,
    Time,
    DataContentType,
    /// `dataschema` in 1.0, `schemaurl` before
    DataSchema,
    /// 0.3 only
    DataContentEncoding,
}

impl AttributeKind {
    /// Name of the value kind this attribute holds
    pub fn value_kind(&self) -> &'static str {
        match self {
            AttributeKind::Source => "URI-reference",
            AttributeKind::DataSchema => "URI",
            AttributeKind::Time => "Timestamp",
            _ => "String",
        }
    }
}

/// One row of a version's attribute table
#[derive(Debug, PartialEq, Eq)]
pub struct Attribute {
    kind: AttributeKind,
    name: &'static str,
    version: SpecVersion,
    required: bool,
}

const fn attr(kind: AttributeKind, name: &'static str, version: SpecVersion, required: bool) -> Attribute {
    Attribute { kind, name, version, required }
}

use AttributeKind as K;
use SpecVersion as V;

static V01_ATTRIBUTES: [Attribute; 7] = [
    attr(K::SpecVersion, "cloudEventsVersion", V::V01, true),
    attr(K::Type, "eventType", V::V01, true),
    attr(K::Source, "source", V::V01, true),
    attr(K::Id, "eventID", V::V01, true),
    attr(K::Time, "eventTime", V::V01, false),
    attr(K::DataSchema, "schemaURL", V::V01, false),
    attr(K::DataContentType, "contentType", V::V01, false),
];

static V02_ATTRIBUTES: [Attribute; 7] = [
    attr(K::SpecVersion, "specversion", V::V02, true),
    attr(K::Type, "type", V::V02, true),
    attr(K::Source, "source", V::V02, true),
    attr(K::Id, "id", V::V02, true),
    attr(K::Time, "time", V::V02, false),
    attr(K::DataSchema, "schemaurl", V::V02, false),
    attr(K::DataContentType, "contenttype", V::V02, false),
];

static V03_ATTRIBUTES: [Attribute; 9] = [
    attr(K::SpecVersion, "specversion", V::V03, true),
    attr(K::Type, "type", V::V03, true),
    attr(K::Source, "source", V::V03, true),
    attr(K::Id, "id", V::V03, true),
    attr(K::Subject, "subject", V::V03, false),
    attr(K::Time, "time", V::V03, false),
    attr(K::DataSchema, "schemaurl", V::V03, false),
    attr(K::DataContentType, "datacontenttype", V::V03, false),
    attr(K::DataContentEncoding, "datacontentencoding", V::V03, false),
];

static V10_ATTRIBUTES: [Attribute; 8] = [
    attr(K::SpecVersion, "specversion", V::V10, true),
    attr(K::Id, "id", V::V10, true),
    attr(K::Source, "source", V::V10, true),
    attr(K::Type, "type", V::V10, true),
    attr(K::Subject, "subject", V::V10, false),
    attr(K::Time, "time", V::V10, false),
    attr(K::DataSchema, "dataschema", V::V10, false),
    attr(K::DataContentType, "datacontenttype", V::V10, false),
];

impl SpecVersion {
    /// Every registered version, newest first
    pub const ALL: [SpecVersion; 4] = [V::V10, V::V03, V::V02, V::V01];

    pub fn latest() -> Self {
        V::V10
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            V::V01 => "0.1",
            V::V02 => "0.2",
            V::V03 => "0.3",
            V::V10 => "1.0",
        }
    }

    /// Attribute table in canonical order
    pub fn attributes(&self) -> &'static [Attribute] {
        match self {
            V::V01 => &V01_ATTRIBUTES,
            V::V02 => &V02_ATTRIBUTES,
            V::V03 => &V03_ATTRIBUTES,
            V::V10 => &V10_ATTRIBUTES,
        }
    }

    /// Descriptor for a kind, if this version defines it
    pub fn attribute(&self, kind: AttributeKind) -> Option<&'static Attribute> {
        self.attributes().iter().find(|a| a.kind == kind)
    }

    /// Descriptor by unprefixed name, case-insensitive
    pub fn attribute_by_name(&self, name: &str) -> Option<&'static Attribute> {
        self.attributes()
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Name of the attribute that carries the version itself
    pub fn spec_version_name(&self) -> &'static str {
        match self {
            V::V01 => "cloudEventsVersion",
            _ => "specversion",
        }
    }

    /// True if `name` is claimed by this version and cannot be an extension
    pub fn is_reserved(&self, name: &str) -> bool {
        if self.attribute_by_name(name).is_some() || name.eq_ignore_ascii_case("data") {
            return true;
        }
        match self {
            V::V01 => name.eq_ignore_ascii_case("extensions"),
            V::V10 => name.eq_ignore_ascii_case("data_base64"),
            _ => false,
        }
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecVersion {
    type Err = CloudEventError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0.1" => Ok(V::V01),
            "0.2" => Ok(V::V02),
            "0.3" => Ok(V::V03),
            "1.0" => Ok(V::V10),
            other => Err(CloudEventError::UnknownVersion(other.to_string())),
        }
    }
}

/// Look up binary-mode headers for a spec version
///
/// Tries each distinct prefixed spec-version header name against `lookup`
/// and returns the version named by the first value that parses.
pub fn version_from_header<F>(prefix: &str, lookup: F) -> Option<SpecVersion>
where
    F: Fn(&str) -> Option<String>,
{
    let mut tried: Vec<&str> = Vec::with_capacity(2);
    for version in SpecVersion::ALL {
        let name = version.spec_version_name();
        if tried.contains(&name) {
            continue;
        }
        tried.push(name);
        let header = prefixed(prefix, name);
        if let Some(value) = lookup(&header) {
            if let Ok(found) = value.parse::<SpecVersion>() {
                return Some(found);
            }
        }
    }
    None
}

/// Lowercased on-wire name with a transport prefix
pub fn prefixed(prefix: &str, name: &str) -> String {
    let mut s = String::with_capacity(prefix.len() + name.len());
    s.push_str(prefix);
    s.push_str(&name.to_ascii_lowercase());
    s
}

impl Attribute {
    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Unprefixed on-wire name
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn version(&self) -> SpecVersion {
        self.version
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn prefixed_name(&self, prefix: &str) -> String {
        prefixed(prefix, self.name)
    }

    /// Parse a canonical string into this attribute's value kind
    pub fn parse(&self, s: &str) -> Result<Value> {
        let value = Value::String(s.to_string());
        self.coerce(&value)
    }

    /// Convert any compatible value into this attribute's value kind
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let converted = match self.kind {
            K::Source => types::to_uri_ref(value).map(Value::UriRef),
            K::DataSchema => types::to_uri(value).map(Value::Uri),
            K::Time => types::to_time(value).map(Value::Timestamp),
            _ => Ok(Value::String(types::to_string(value))),
        };
        converted.map_err(|e| CloudEventError::Conversion {
            attribute: self.name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Canonical string form of a value for this attribute
    pub fn format(&self, value: &Value) -> Result<String> {
        self.coerce(value).map(|v| v.to_canonical())
    }

    /// Read this attribute from a context
    pub fn get(&self, ctx: &EventContext) -> Option<Value> {
        match self.kind {
            K::SpecVersion => Some(Value::String(ctx.spec_version.as_str().to_string())),
            K::Id => non_empty(&ctx.id),
            K::Type => non_empty(&ctx.ty),
            K::Source => ctx.source.clone().map(Value::UriRef),
            K::Subject => ctx.subject.clone().map(Value::String),
            K::Time => ctx.time.map(Value::Timestamp),
            K::DataContentType => ctx.data_content_type.clone().map(Value::String),
            K::DataSchema => ctx.data_schema.clone().map(Value::Uri),
            K::DataContentEncoding => ctx.data_content_encoding.clone().map(Value::String),
        }
    }

    /// Write this attribute into a context; `None` clears it
    ///
    /// Setting the spec version converts the whole context.
    pub fn set(&self, ctx: &mut EventContext, value: Option<Value>) -> Result<()> {
        let value = match value {
            Some(v) => Some(self.coerce(&v)?),
            None => None,
        };
        let as_string = |v: Option<Value>| v.map(|v| v.to_canonical().trim().to_string());
        match self.kind {
            K::SpecVersion => {
                let v = value.ok_or_else(|| CloudEventError::InvalidValue("specversion cannot be cleared".to_string()))?;
                let target: SpecVersion = v.to_canonical().parse()?;
                ctx.convert_to(target);
            }
            K::Id => ctx.id = as_string(value).unwrap_or_default(),
            K::Type => ctx.ty = as_string(value).unwrap_or_default(),
            K::Source => {
                ctx.source = match value {
                    Some(v) => Some(types::to_uri_ref(&v)?),
                    None => None,
                }
            }
            K::Subject => ctx.subject = as_string(value),
            K::Time => {
                ctx.time = match value {
                    Some(v) => Some(types::to_time(&v)?),
                    None => None,
                }
            }
            K::DataContentType => ctx.data_content_type = as_string(value),
            K::DataSchema => {
                ctx.data_schema = match value {
                    Some(v) => Some(types::to_uri(&v)?),
                    None => None,
                }
            }
            K::DataContentEncoding => {
                ctx.data_content_encoding = as_string(value).map(|s| s.to_ascii_lowercase())
            }
        }
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<Value> {
    if s.is_empty() {
        None
    } else {
        Some(Value::String(s.to_string()))
    }
}
