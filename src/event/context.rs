//! Version-neutral event context
//!
//! A single context struct holds the attributes of every registered
//! version. Converting between versions renames nothing in memory (names
//! only matter on the wire); it moves attributes the target version lacks
//! into same-named extensions, and lifts them back when converting up.

use crate::types::{Uri, UriRef, Value};
use crate::version::{AttributeKind, SpecVersion};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Extension names that shadow attributes missing from older versions
const SUBJECT_EXTENSION: &str = "subject";
const ENCODING_EXTENSION: &str = "datacontentencoding";

/// Context attributes plus extensions of a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub(crate) spec_version: SpecVersion,
    pub(crate) id: String,
    pub(crate) source: Option<UriRef>,
    pub(crate) ty: String,
    pub(crate) subject: Option<String>,
    pub(crate) time: Option<DateTime<Utc>>,
    pub(crate) data_content_type: Option<String>,
    pub(crate) data_schema: Option<Uri>,
    pub(crate) data_content_encoding: Option<String>,
    pub(crate) extensions: BTreeMap<String, Value>,
}

impl EventContext {
    pub fn new(spec_version: SpecVersion) -> Self {
        Self {
            spec_version,
            id: String::new(),
            source: None,
            ty: String::new(),
            subject: None,
            time: None,
            data_content_type: None,
            data_schema: None,
            data_content_encoding: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn spec_version(&self) -> SpecVersion {
        self.spec_version
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> Option<&UriRef> {
        self.source.as_ref()
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn time(&self) -> Option<&DateTime<Utc>> {
        self.time.as_ref()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    pub fn data_schema(&self) -> Option<&Uri> {
        self.data_schema.as_ref()
    }

    pub fn data_content_encoding(&self) -> Option<&str> {
        self.data_content_encoding.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, Value> {
        &self.extensions
    }

    /// Case-insensitive extension lookup
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(&name.to_ascii_lowercase())
    }

    /// Attribute values present on this context, in table order
    pub fn attribute_values(&self) -> Vec<(&'static crate::version::Attribute, Value)> {
        self.spec_version
            .attributes()
            .iter()
            .filter_map(|attr| attr.get(self).map(|v| (attr, v)))
            .collect()
    }

    /// Convert in place to another version
    pub(crate) fn convert_to(&mut self, target: SpecVersion) {
        if self.spec_version == target {
            return;
        }
        let has = |kind| target.attribute(kind).is_some();

        if has(AttributeKind::Subject) {
            if self.subject.is_none() {
                if let Some(v) = self.extensions.remove(SUBJECT_EXTENSION) {
                    self.subject = Some(v.to_canonical());
                }
            }
        } else if let Some(subject) = self.subject.take() {
            self.extensions
                .insert(SUBJECT_EXTENSION.to_string(), Value::String(subject));
        }

        if has(AttributeKind::DataContentEncoding) {
            if self.data_content_encoding.is_none() {
                if let Some(v) = self.extensions.remove(ENCODING_EXTENSION) {
                    self.data_content_encoding = Some(v.to_canonical().to_ascii_lowercase());
                }
            }
        } else if let Some(encoding) = self.data_content_encoding.take() {
            self.extensions
                .insert(ENCODING_EXTENSION.to_string(), Value::String(encoding));
        }

        tracing::trace!(from = %self.spec_version, to = %target, "Context converted");
        self.spec_version = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v03_context() -> EventContext {
        let mut ctx = EventContext::new(SpecVersion::V03);
        ctx.id = "ABC-123".to_string();
        ctx.ty = "com.example.test".to_string();
        ctx.source = Some(UriRef::parse("/unit/test").unwrap());
        ctx.subject = Some("resource".to_string());
        ctx.extensions
            .insert("exta".to_string(), Value::String("a".to_string()));
        ctx
    }

    #[test]
    fn test_convert_keeps_common_attributes_and_extensions() {
        let mut ctx = v03_context();
        ctx.convert_to(SpecVersion::V10);

        assert_eq!(ctx.spec_version(), SpecVersion::V10);
        assert_eq!(ctx.id(), "ABC-123");
        assert_eq!(ctx.subject(), Some("resource"));
        assert_eq!(ctx.extension("EXTA"), Some(&Value::String("a".to_string())));
    }

    #[test]
    fn test_downgrade_moves_subject_to_extension_and_back() {
        let mut ctx = v03_context();
        ctx.convert_to(SpecVersion::V02);
        assert!(ctx.subject().is_none());
        assert_eq!(
            ctx.extension("subject"),
            Some(&Value::String("resource".to_string()))
        );

        ctx.convert_to(SpecVersion::V03);
        assert_eq!(ctx.subject(), Some("resource"));
        assert!(ctx.extension("subject").is_none());
    }

    #[test]
    fn test_encoding_demoted_outside_v03() {
        let mut ctx = v03_context();
        ctx.data_content_encoding = Some("7bit".to_string());
        ctx.convert_to(SpecVersion::V10);
        assert!(ctx.data_content_encoding().is_none());
        assert_eq!(
            ctx.extension("datacontentencoding"),
            Some(&Value::String("7bit".to_string()))
        );
    }

    #[test]
    fn test_attribute_values_in_table_order() {
        let ctx = v03_context();
        let names: Vec<&str> = ctx
            .attribute_values()
            .iter()
            .map(|(attr, _)| attr.name())
            .collect();
        assert_eq!(names, vec!["specversion", "type", "source", "id", "subject"]);
    }
}
