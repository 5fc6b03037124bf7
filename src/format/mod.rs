//! Structured-mode formats keyed by media type
//!
//! JSON and JSON batch are always registered. Additional formats may be
//! registered at startup; the registry seals itself on the first lookup,
//! after which it is read-only for the life of the process.

mod batch;
mod json;

pub use batch::JsonBatchFormat;
pub use json::JsonFormat;

use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::types::media_type_essence;
use std::fmt;
use std::sync::{Mutex, OnceLock};

/// Media type of the JSON event format
pub const JSON_MEDIA_TYPE: &str = "application/cloudevents+json";

/// Media type of the JSON batch format
pub const JSON_BATCH_MEDIA_TYPE: &str = "application/cloudevents-batch+json";

/// A structured serialisation of whole events
pub trait Format: Send + Sync + fmt::Debug {
    /// Media type identifying this format on the wire
    fn media_type(&self) -> &'static str;

    fn marshal(&self, event: &Event) -> Result<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Event>;

    /// Serialise several events into one document
    fn marshal_batch(&self, _events: &[Event]) -> Result<Vec<u8>> {
        Err(CloudEventError::Format(format!(
            "{} does not support batches",
            self.media_type()
        )))
    }

    fn unmarshal_batch(&self, _bytes: &[u8]) -> Result<Vec<Event>> {
        Err(CloudEventError::Format(format!(
            "{} does not support batches",
            self.media_type()
        )))
    }
}

static JSON: JsonFormat = JsonFormat;
static JSON_BATCH: JsonBatchFormat = JsonBatchFormat;

struct Pending {
    formats: Vec<&'static dyn Format>,
    sealed: bool,
}

static PENDING: Mutex<Pending> = Mutex::new(Pending {
    formats: Vec::new(),
    sealed: false,
});

static REGISTRY: OnceLock<Vec<&'static dyn Format>> = OnceLock::new();

fn registry() -> &'static [&'static dyn Format] {
    REGISTRY.get_or_init(|| {
        let mut formats: Vec<&'static dyn Format> = vec![&JSON, &JSON_BATCH];
        let mut pending = PENDING.lock().unwrap_or_else(|e| e.into_inner());
        pending.sealed = true;
        formats.append(&mut pending.formats);
        tracing::debug!(count = formats.len(), "Format registry sealed");
        formats
    })
}

/// Register an additional format; fails once any lookup has happened
pub fn register(format: &'static dyn Format) -> Result<()> {
    let mut pending = PENDING
        .lock()
        .map_err(|e| CloudEventError::Config(format!("Format registry lock poisoned: {}", e)))?;
    if pending.sealed {
        return Err(CloudEventError::Config(format!(
            "cannot register '{}': format registry is sealed after first use",
            format.media_type()
        )));
    }
    pending.formats.push(format);
    Ok(())
}

/// Find the format for a content type
///
/// Case-insensitive, ignores `; parameter=…` suffixes, `None` for unknown types.
pub fn lookup(content_type: &str) -> Option<&'static dyn Format> {
    let essence = media_type_essence(content_type);
    registry()
        .iter()
        .rev()
        .find(|f| f.media_type().eq_ignore_ascii_case(&essence))
        .copied()
}

/// The built-in JSON format
pub fn json() -> &'static dyn Format {
    &JSON
}

/// The built-in JSON batch format
pub fn json_batch() -> &'static dyn Format {
    &JSON_BATCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_builtin_formats() {
        assert_eq!(lookup(JSON_MEDIA_TYPE).unwrap().media_type(), JSON_MEDIA_TYPE);
        assert_eq!(
            lookup("Application/CloudEvents-Batch+JSON").unwrap().media_type(),
            JSON_BATCH_MEDIA_TYPE
        );
    }

    #[test]
    fn test_lookup_tolerates_parameters() {
        let f = lookup("application/cloudevents+json; charset=utf-8").unwrap();
        assert_eq!(f.media_type(), JSON_MEDIA_TYPE);
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        assert!(lookup("application/json").is_none());
        assert!(lookup("").is_none());
    }

    #[derive(Debug)]
    struct LateFormat;

    impl Format for LateFormat {
        fn media_type(&self) -> &'static str {
            "application/x-late"
        }

        fn marshal(&self, _event: &Event) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn unmarshal(&self, _bytes: &[u8]) -> Result<Event> {
            Ok(Event::new())
        }
    }

    static LATE: LateFormat = LateFormat;

    #[test]
    fn test_register_after_first_use_is_rejected() {
        let _ = lookup(JSON_MEDIA_TYPE);
        assert!(matches!(register(&LATE), Err(CloudEventError::Config(_))));
        assert!(lookup("application/x-late").is_none());
    }
}
