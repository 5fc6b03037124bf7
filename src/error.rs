//! Error types for a3s-cloudevents

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Boxed native client error preserved inside [`CloudEventError::Transport`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while encoding, forwarding, or decoding events
#[derive(Debug, Error)]
pub enum CloudEventError {
    /// Event failed validation against its spec version
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Message is neither structured, binary, nor an in-memory event
    #[error("Unknown message encoding")]
    EncodingUnknown,

    /// Message cannot be read in structured mode; the pipeline tries another path
    #[error("Message is not in structured mode")]
    NotStructured,

    /// Message cannot be read in binary mode; the pipeline tries another path
    #[error("Message is not in binary mode")]
    NotBinary,

    /// Value is missing or of a kind outside the attribute type system
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Numeric conversion would lose information
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// String could not be decoded into its canonical type
    #[error("Cannot parse {kind} from '{value}': {reason}")]
    Parse {
        kind: &'static str,
        value: String,
        reason: String,
    },

    /// Attribute value cannot be formatted or parsed in its canonical form
    #[error("Cannot convert attribute '{attribute}': {reason}")]
    Conversion { attribute: String, reason: String },

    /// Spec version string is not registered
    #[error("Unknown spec version: {0}")]
    UnknownVersion(String),

    /// Structured format missing or payload malformed for the format
    #[error("Format error: {0}")]
    Format(String),

    /// Underlying native client returned a failure
    #[error("{transport} transport error: {source}")]
    Transport {
        transport: &'static str,
        #[source]
        source: BoxError,
    },

    /// Request/response transport answered with a non-2xx status
    #[error("{code} {reason}")]
    Status {
        code: u16,
        reason: String,
        body: bytes::Bytes,
    },

    /// Context cancelled or deadline expired
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A consumer finished a message with a failure
    #[error("Message processing failed: {0}")]
    Nack(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CloudEventError {
    /// Wrap a native client error, keeping it reachable through `source()`
    pub fn transport(transport: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            transport,
            source: source.into(),
        }
    }

    pub(crate) fn parse(kind: &'static str, value: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Parse {
            kind,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the signals a message uses to ask the pipeline for another path
    pub fn is_fallback_signal(&self) -> bool {
        matches!(self, Self::NotStructured | Self::NotBinary)
    }
}

/// Aggregated validation failures keyed by attribute name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    fields: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for an attribute; the first failure per field wins
    pub fn add(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.fields.entry(field.into()).or_insert_with(|| reason.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// `Ok(())` when nothing was recorded, otherwise the error itself
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CloudEventError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed:")?;
        for (i, (field, reason)) in self.fields.iter().enumerate() {
            let sep = if i == 0 { " " } else { "; " };
            write!(f, "{}{}: {}", sep, field, reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Result type alias for CloudEvents operations
pub type Result<T> = std::result::Result<T, CloudEventError>;
