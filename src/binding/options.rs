//! Pipeline options

use super::message::Encoding;
use serde::{Deserialize, Serialize};

/// Mode hints for one pipeline invocation
///
/// Built with the helper constructors and combined by chaining:
///
/// ```
/// use a3s_cloudevents::binding::{Encoding, PipelineOptions};
///
/// let opts = PipelineOptions::default()
///     .skip_direct_binary()
///     .with_preferred_encoding(Encoding::Structured);
/// assert!(opts.skip_direct_binary);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineOptions {
    /// Never hand the source to the structured writer directly
    pub skip_direct_structured: bool,

    /// Never hand the source to the binary writer directly
    pub skip_direct_binary: bool,

    /// Mode used when falling back through the event form with both writers present
    #[serde(with = "encoding_name")]
    pub preferred_encoding: Encoding,

    /// Kafka: leave the `key` extension as a header and ignore record keys
    pub skip_key_extension: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_direct_structured: false,
            skip_direct_binary: false,
            preferred_encoding: Encoding::Binary,
            skip_key_extension: false,
        }
    }
}

impl PipelineOptions {
    /// Skip direct structured and prefer binary
    pub fn force_binary() -> Self {
        Self::default()
            .skip_direct_structured()
            .with_preferred_encoding(Encoding::Binary)
    }

    /// Skip direct binary and prefer structured
    pub fn force_structured() -> Self {
        Self::default()
            .skip_direct_binary()
            .with_preferred_encoding(Encoding::Structured)
    }

    pub fn skip_direct_structured(mut self) -> Self {
        self.skip_direct_structured = true;
        self
    }

    pub fn skip_direct_binary(mut self) -> Self {
        self.skip_direct_binary = true;
        self
    }

    pub fn with_preferred_encoding(mut self, encoding: Encoding) -> Self {
        self.preferred_encoding = encoding;
        self
    }

    pub fn skip_key_extension(mut self) -> Self {
        self.skip_key_extension = true;
        self
    }
}

mod encoding_name {
    use super::Encoding;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(encoding: &Encoding, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encoding.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Encoding, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "binary" => Ok(Encoding::Binary),
            "structured" => Ok(Encoding::Structured),
            other => Err(serde::de::Error::custom(format!(
                "preferred encoding must be 'binary' or 'structured', got '{}'",
                other
            ))),
        }
    }
}
