//! Attribute type system and canonical string forms
//!
//! Every context attribute and extension value is one of the kinds in
//! [`Value`]. Each kind has exactly one canonical string form, used by
//! binary-mode transports and by the JSON format for non-native kinds.

use crate::error::{CloudEventError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;

/// A validated attribute or extension value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Integer(i32),
    String(String),
    Binary(Bytes),
    Uri(Uri),
    UriRef(UriRef),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Name of the kind, as used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::String(_) => "String",
            Value::Binary(_) => "Binary",
            Value::Uri(_) => "URI",
            Value::UriRef(_) => "URI-reference",
            Value::Timestamp(_) => "Timestamp",
        }
    }

    /// Canonical string form
    pub fn to_canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => f.write_str(&format_binary(b)),
            Value::Uri(u) => f.write_str(u.as_str()),
            Value::UriRef(u) => f.write_str(u.as_str()),
            Value::Timestamp(t) => f.write_str(&format_time(t)),
        }
    }
}

// ─── Timestamps ──────────────────────────────────────────────────

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CloudEventError::parse("Timestamp", s, e))
}

/// Format a timestamp as RFC 3339 UTC, keeping every significant fractional digit
pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// ─── Binary ──────────────────────────────────────────────────────

/// Standard base64 with padding; empty input formats to an empty string
pub fn format_binary(b: &[u8]) -> String {
    BASE64.encode(b)
}

/// Decode standard base64
pub fn parse_binary(s: &str) -> Result<Bytes> {
    BASE64
        .decode(s.trim())
        .map(Bytes::from)
        .map_err(|e| CloudEventError::parse("Binary", s, e))
}

/// Decode base64 that may arrive wrapped in JSON double quotes
///
/// Only the 0.3 `datacontentencoding: base64` path strips quotes.
pub(crate) fn parse_binary_unquoted(b: &[u8]) -> Result<Bytes> {
    let s = std::str::from_utf8(b).map_err(|e| CloudEventError::parse("Binary", "<bytes>", e))?;
    let s = s.trim();
    let s = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s);
    parse_binary(s)
}

// ─── Integer & Boolean ───────────────────────────────────────────

pub fn parse_integer(s: &str) -> Result<i32> {
    let trimmed = s.trim();
    match trimmed.parse::<i64>() {
        Ok(n) => i32::try_from(n).map_err(|_| CloudEventError::OutOfRange(format!("{} does not fit in Integer", n))),
        Err(e) => Err(CloudEventError::parse("Integer", s, e)),
    }
}

/// Only the literals `true` and `false` are accepted
pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CloudEventError::parse("Boolean", s, "expected 'true' or 'false'")),
    }
}

// ─── URI & URI-reference ─────────────────────────────────────────

/// Structural parts of an RFC 3986 reference, as byte ranges into the source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct UriParts {
    scheme: Option<(usize, usize)>,
    authority: Option<(usize, usize)>,
    path: (usize, usize),
    query: Option<(usize, usize)>,
    fragment: Option<(usize, usize)>,
}

fn split_uri(s: &str) -> Result<UriParts> {
    let illegal = |c: &char| {
        c.is_whitespace() || c.is_control() || matches!(*c, '<' | '>' | '"' | '\\' | '^' | '`' | '{' | '|' | '}')
    };
    if let Some(bad) = s.chars().find(illegal) {
        return Err(CloudEventError::parse("URI-reference", s, format!("illegal character {:?}", bad)));
    }
    check_percent_encoding(s)?;

    let mut parts = UriParts::default();
    let mut rest_start = 0;

    if let Some(colon) = s.find(':') {
        let candidate = &s[..colon];
        let before_delims = !candidate.contains(['/', '?', '#']);
        if before_delims && is_scheme(candidate) {
            parts.scheme = Some((0, colon));
            rest_start = colon + 1;
        }
    }

    let mut end = s.len();
    if let Some(hash) = s[rest_start..].find('#') {
        let at = rest_start + hash;
        parts.fragment = Some((at + 1, s.len()));
        end = at;
    }
    if let Some(q) = s[rest_start..end].find('?') {
        let at = rest_start + q;
        parts.query = Some((at + 1, end));
        end = at;
    }

    let hier = &s[rest_start..end];
    if let Some(after) = hier.strip_prefix("//") {
        let auth_start = rest_start + 2;
        let auth_len = after.find('/').unwrap_or(after.len());
        parts.authority = Some((auth_start, auth_start + auth_len));
        parts.path = (auth_start + auth_len, end);
    } else {
        parts.path = (rest_start, end);
    }
    Ok(parts)
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn check_percent_encoding(s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let ok = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
            if !ok {
                return Err(CloudEventError::parse("URI-reference", s, "malformed percent-encoding"));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// A URI-reference: absolute URI or relative reference, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriRef {
    raw: String,
    parts: UriParts,
}

impl UriRef {
    pub fn parse(s: &str) -> Result<Self> {
        let parts = split_uri(s)?;
        Ok(Self { raw: s.to_string(), parts })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn slice(&self, range: Option<(usize, usize)>) -> Option<&str> {
        range.map(|(a, b)| &self.raw[a..b])
    }

    pub fn scheme(&self) -> Option<&str> {
        self.slice(self.parts.scheme)
    }

    pub fn authority(&self) -> Option<&str> {
        self.slice(self.parts.authority)
    }

    pub fn path(&self) -> &str {
        &self.raw[self.parts.path.0..self.parts.path.1]
    }

    pub fn query(&self) -> Option<&str> {
        self.slice(self.parts.query)
    }

    pub fn fragment(&self) -> Option<&str> {
        self.slice(self.parts.fragment)
    }

    /// True when the reference carries a scheme
    pub fn is_absolute(&self) -> bool {
        self.parts.scheme.is_some()
    }
}

impl FromStr for UriRef {
    type Err = CloudEventError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for UriRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// An absolute URI (scheme required), kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri(UriRef);

impl Uri {
    pub fn parse(s: &str) -> Result<Self> {
        let r = UriRef::parse(s).map_err(|e| match e {
            CloudEventError::Parse { value, reason, .. } => CloudEventError::Parse { kind: "URI", value, reason },
            other => other,
        })?;
        if !r.is_absolute() {
            return Err(CloudEventError::parse("URI", s, "missing scheme"));
        }
        Ok(Self(r))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_uri_ref(&self) -> &UriRef {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme().unwrap_or_default()
    }
}

impl FromStr for Uri {
    type Err = CloudEventError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Media types ─────────────────────────────────────────────────

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
        })
}

/// Check `type/subtype *(; name=value)` syntax
pub fn validate_media_type(s: &str) -> Result<()> {
    let mut segments = s.split(';');
    let essence = segments.next().unwrap_or_default().trim();
    let valid_essence = essence
        .split_once('/')
        .is_some_and(|(t, sub)| is_token(t) && is_token(sub));
    if !valid_essence {
        return Err(CloudEventError::parse("media type", s, "expected type/subtype"));
    }
    for param in segments {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let valid = param.split_once('=').is_some_and(|(name, value)| {
            let value = value.trim();
            is_token(name.trim())
                && (is_token(value) || (value.len() >= 2 && value.starts_with('"') && value.ends_with('"')))
        });
        if !valid {
            return Err(CloudEventError::parse("media type", s, format!("malformed parameter '{}'", param)));
        }
    }
    Ok(())
}

/// Lowercased `type/subtype` with parameters stripped
pub fn media_type_essence(s: &str) -> String {
    s.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

// ─── Promotion into the closed set ───────────────────────────────

/// Native Rust values that can be promoted into a [`Value`]
pub trait IntoValue {
    fn into_value(self) -> Result<Value>;
}

/// Promote a native value into the closed attribute type set
pub fn validate<V: IntoValue>(v: V) -> Result<Value> {
    v.into_value()
}

impl IntoValue for Value {
    fn into_value(self) -> Result<Value> {
        Ok(self)
    }
}

impl IntoValue for &Value {
    fn into_value(self) -> Result<Value> {
        Ok(self.clone())
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Bool(self))
    }
}

macro_rules! lossless_int {
    ($($t:ty),*) => {$(
        impl IntoValue for $t {
            fn into_value(self) -> Result<Value> {
                Ok(Value::Integer(i32::from(self)))
            }
        }
    )*};
}
lossless_int!(i8, i16, i32, u8, u16);

macro_rules! ranged_int {
    ($($t:ty),*) => {$(
        impl IntoValue for $t {
            fn into_value(self) -> Result<Value> {
                i32::try_from(self)
                    .map(Value::Integer)
                    .map_err(|_| CloudEventError::OutOfRange(format!("{} does not fit in Integer", self)))
            }
        }
    )*};
}
ranged_int!(i64, u32, u64, isize, usize, i128, u128);

impl IntoValue for f64 {
    fn into_value(self) -> Result<Value> {
        if self.fract() != 0.0 || !self.is_finite() || self < i32::MIN as f64 || self > i32::MAX as f64 {
            return Err(CloudEventError::OutOfRange(format!("{} is not representable as Integer", self)));
        }
        Ok(Value::Integer(self as i32))
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Result<Value> {
        f64::from(self).into_value()
    }
}

impl IntoValue for String {
    fn into_value(self) -> Result<Value> {
        Ok(Value::String(self))
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Result<Value> {
        Ok(Value::String(self.to_string()))
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Result<Value> {
        Ok(Value::String(self.clone()))
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Binary(Bytes::from(self)))
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Binary(Bytes::copy_from_slice(self)))
    }
}

impl IntoValue for Bytes {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Binary(self))
    }
}

impl IntoValue for Uri {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Uri(self))
    }
}

impl IntoValue for UriRef {
    fn into_value(self) -> Result<Value> {
        Ok(Value::UriRef(self))
    }
}

impl IntoValue for DateTime<Utc> {
    fn into_value(self) -> Result<Value> {
        Ok(Value::Timestamp(self))
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Result<Value> {
        match self {
            Some(v) => v.into_value(),
            None => Err(CloudEventError::InvalidValue("value is nil".to_string())),
        }
    }
}

impl IntoValue for serde_json::Value {
    fn into_value(self) -> Result<Value> {
        match self {
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i.into_value()
                } else if let Some(u) = n.as_u64() {
                    u.into_value()
                } else {
                    n.as_f64().unwrap_or(f64::NAN).into_value()
                }
            }
            serde_json::Value::Null => Err(CloudEventError::InvalidValue("value is nil".to_string())),
            other => Err(CloudEventError::InvalidValue(format!("unsupported JSON value {}", other))),
        }
    }
}

// ─── Conversion to a specific kind ───────────────────────────────

/// Convert to Boolean; strings are parsed from canonical form
pub fn to_bool(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => parse_bool(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to Boolean", other.kind()))),
    }
}

pub fn to_integer(v: &Value) -> Result<i32> {
    match v {
        Value::Integer(i) => Ok(*i),
        Value::String(s) => parse_integer(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to Integer", other.kind()))),
    }
}

/// Any value converts to its canonical string
pub fn to_string(v: &Value) -> String {
    v.to_canonical()
}

pub fn to_binary(v: &Value) -> Result<Bytes> {
    match v {
        Value::Binary(b) => Ok(b.clone()),
        Value::String(s) => parse_binary(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to Binary", other.kind()))),
    }
}

pub fn to_uri(v: &Value) -> Result<Uri> {
    match v {
        Value::Uri(u) => Ok(u.clone()),
        Value::UriRef(r) => Uri::parse(r.as_str()),
        Value::String(s) => Uri::parse(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to URI", other.kind()))),
    }
}

pub fn to_uri_ref(v: &Value) -> Result<UriRef> {
    match v {
        Value::UriRef(r) => Ok(r.clone()),
        Value::Uri(u) => Ok(u.as_uri_ref().clone()),
        Value::String(s) => UriRef::parse(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to URI-reference", other.kind()))),
    }
}

pub fn to_time(v: &Value) -> Result<DateTime<Utc>> {
    match v {
        Value::Timestamp(t) => Ok(*t),
        Value::String(s) => parse_time(s),
        other => Err(CloudEventError::InvalidValue(format!("cannot convert {} to Timestamp", other.kind()))),
    }
}
