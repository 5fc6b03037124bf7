//! Transformers applied while a message is written
//!
//! A transformer factory realises one logical change in up to three shapes:
//! a structured wrapper, a binary wrapper and an event mutator. A factory
//! that cannot act in a mode returns `None` for it, which makes the
//! pipeline fall back through the event form. None of the transformers
//! here act structurally, since that would mean decoding and re-encoding
//! the document.

use super::message::{BinaryWriter, StructuredWriter};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::types::{self, Value};
use crate::version::{Attribute, AttributeKind, SpecVersion};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Mutates an in-memory event once
pub type EventTransformer<'a> = Box<dyn FnOnce(&mut Event) -> Result<()> + 'a>;

/// Produces the per-mode shapes of one transformation
pub trait TransformerFactory: Send + Sync {
    /// Wrap a structured writer; `None` declines the structured path
    fn structured_transformer<'a>(
        &self,
        _writer: Box<dyn StructuredWriter + 'a>,
    ) -> Option<Box<dyn StructuredWriter + 'a>> {
        None
    }

    /// Wrap a binary writer; `None` declines the binary path
    fn binary_transformer<'a>(
        &self,
        _writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        None
    }

    /// Mutator applied when the pipeline goes through the event form
    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        None
    }
}

/// Replacement function for the update transformers; `None` deletes
pub type UpdateFn = Arc<dyn Fn(&Value) -> Result<Option<Value>> + Send + Sync>;

fn version_of(attribute: &'static Attribute, value: &Value) -> SpecVersion {
    value
        .to_canonical()
        .parse()
        .unwrap_or_else(|_| attribute.version())
}

fn attribute_in(version: SpecVersion, kind: AttributeKind) -> Result<&'static Attribute> {
    version.attribute(kind).ok_or_else(|| {
        CloudEventError::InvalidValue(format!("{:?} is not an attribute of {}", kind, version))
    })
}

// ─── AddAttribute ────────────────────────────────────────────────

/// Set an attribute when the source does not carry it
#[derive(Debug, Clone)]
pub struct AddAttribute {
    kind: AttributeKind,
    value: Value,
}

impl AddAttribute {
    pub fn new(kind: AttributeKind, value: Value) -> Self {
        Self { kind, value }
    }
}

struct AddAttributeWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    kind: AttributeKind,
    value: Value,
    version: SpecVersion,
    seen: bool,
}

impl BinaryWriter for AddAttributeWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        if attribute.kind() == AttributeKind::SpecVersion {
            self.version = version_of(attribute, &value);
        }
        if attribute.kind() == self.kind {
            self.seen = true;
        }
        self.inner.set_attribute(attribute, value)
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        if !self.seen {
            if let Some(attr) = self.version.attribute(self.kind) {
                let value = attr.coerce(&self.value)?;
                self.inner.set_attribute(attr, value)?;
            }
        }
        self.inner.end()
    }
}

impl TransformerFactory for AddAttribute {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(AddAttributeWriter {
            inner: writer,
            kind: self.kind,
            value: self.value.clone(),
            version: SpecVersion::latest(),
            seen: false,
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            let Some(attr) = event.spec_version().attribute(self.kind) else {
                return Ok(());
            };
            if attr.get(&event.context).is_none() {
                attr.set(&mut event.context, Some(self.value.clone()))?;
            }
            Ok(())
        }))
    }
}

// ─── AddExtension ────────────────────────────────────────────────

/// Set an extension when the source does not carry it
#[derive(Debug, Clone)]
pub struct AddExtension {
    name: String,
    value: Value,
}

impl AddExtension {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value,
        }
    }
}

struct AddExtensionWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    name: String,
    value: Value,
    seen: bool,
}

impl BinaryWriter for AddExtensionWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        self.inner.set_attribute(attribute, value)
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        if name.eq_ignore_ascii_case(&self.name) {
            self.seen = true;
        }
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        if !self.seen {
            self.inner.set_extension(&self.name, self.value.clone())?;
        }
        self.inner.end()
    }
}

impl TransformerFactory for AddExtension {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(AddExtensionWriter {
            inner: writer,
            name: self.name.clone(),
            value: self.value.clone(),
            seen: false,
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            if event.extension(&self.name).is_none() {
                event.set_extension(&self.name, self.value.clone())?;
            }
            Ok(())
        }))
    }
}

// ─── DeleteAttribute ─────────────────────────────────────────────

/// Drop an attribute
#[derive(Debug, Clone, Copy)]
pub struct DeleteAttribute {
    kind: AttributeKind,
}

impl DeleteAttribute {
    pub fn new(kind: AttributeKind) -> Self {
        Self { kind }
    }
}

struct DeleteAttributeWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    kind: AttributeKind,
}

impl BinaryWriter for DeleteAttributeWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        if attribute.kind() != self.kind {
            return self.inner.set_attribute(attribute, value);
        }
        if self.kind == AttributeKind::SpecVersion {
            return Err(CloudEventError::InvalidValue(
                "specversion cannot be deleted".to_string(),
            ));
        }
        Ok(())
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.end()
    }
}

impl TransformerFactory for DeleteAttribute {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(DeleteAttributeWriter {
            inner: writer,
            kind: self.kind,
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            match event.spec_version().attribute(self.kind) {
                Some(attr) => attr.set(&mut event.context, None),
                None => Ok(()),
            }
        }))
    }
}

// ─── DeleteExtension ─────────────────────────────────────────────

/// Drop an extension
#[derive(Debug, Clone)]
pub struct DeleteExtension {
    name: String,
}

impl DeleteExtension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
        }
    }
}

struct DeleteExtensionWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    name: String,
}

impl BinaryWriter for DeleteExtensionWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        self.inner.set_attribute(attribute, value)
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        if name.eq_ignore_ascii_case(&self.name) {
            return Ok(());
        }
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.end()
    }
}

impl TransformerFactory for DeleteExtension {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(DeleteExtensionWriter {
            inner: writer,
            name: self.name.clone(),
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            event.remove_extension(&self.name);
            Ok(())
        }))
    }
}

// ─── UpdateAttribute ─────────────────────────────────────────────

/// Replace an attribute that is present; a `None` result deletes it
#[derive(Clone)]
pub struct UpdateAttribute {
    kind: AttributeKind,
    update: UpdateFn,
}

impl UpdateAttribute {
    pub fn new(
        kind: AttributeKind,
        update: impl Fn(&Value) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            update: Arc::new(update),
        }
    }
}

impl fmt::Debug for UpdateAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateAttribute").field("kind", &self.kind).finish()
    }
}

fn spec_version_update() -> CloudEventError {
    CloudEventError::InvalidValue("use the version transformer to change specversion".to_string())
}

struct UpdateAttributeWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    kind: AttributeKind,
    update: UpdateFn,
}

impl BinaryWriter for UpdateAttributeWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        if attribute.kind() != self.kind {
            return self.inner.set_attribute(attribute, value);
        }
        if self.kind == AttributeKind::SpecVersion {
            return Err(spec_version_update());
        }
        match (self.update)(&value)? {
            Some(updated) => {
                let updated = attribute.coerce(&updated)?;
                self.inner.set_attribute(attribute, updated)
            }
            None => Ok(()),
        }
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.end()
    }
}

impl TransformerFactory for UpdateAttribute {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(UpdateAttributeWriter {
            inner: writer,
            kind: self.kind,
            update: self.update.clone(),
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            if self.kind == AttributeKind::SpecVersion {
                return Err(spec_version_update());
            }
            let Some(attr) = event.spec_version().attribute(self.kind) else {
                return Ok(());
            };
            let Some(current) = attr.get(&event.context) else {
                return Ok(());
            };
            let updated = (self.update)(&current)?;
            attr.set(&mut event.context, updated)
        }))
    }
}

// ─── UpdateExtension ─────────────────────────────────────────────

/// Replace an extension that is present; a `None` result deletes it
#[derive(Clone)]
pub struct UpdateExtension {
    name: String,
    update: UpdateFn,
}

impl UpdateExtension {
    pub fn new(
        name: impl Into<String>,
        update: impl Fn(&Value) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            update: Arc::new(update),
        }
    }
}

impl fmt::Debug for UpdateExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateExtension").field("name", &self.name).finish()
    }
}

struct UpdateExtensionWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    name: String,
    update: UpdateFn,
}

impl BinaryWriter for UpdateExtensionWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        self.inner.set_attribute(attribute, value)
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        if !name.eq_ignore_ascii_case(&self.name) {
            return self.inner.set_extension(name, value);
        }
        match (self.update)(&value)? {
            Some(updated) => self.inner.set_extension(name, updated),
            None => Ok(()),
        }
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.end()
    }
}

impl TransformerFactory for UpdateExtension {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(UpdateExtensionWriter {
            inner: writer,
            name: self.name.clone(),
            update: self.update.clone(),
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            let Some(current) = event.extension(&self.name).cloned() else {
                return Ok(());
            };
            match (self.update)(&current)? {
                Some(updated) => event.set_extension(&self.name, updated),
                None => {
                    event.remove_extension(&self.name);
                    Ok(())
                }
            }
        }))
    }
}

// ─── Version ─────────────────────────────────────────────────────

/// Convert to another spec version
///
/// The binary wrapper renames attributes to the target table. Attributes
/// the target lacks travel as same-named extensions, and such extensions
/// are lifted back when the target has the attribute. Leaving 0.3 with
/// `datacontentencoding: base64` decodes the payload.
#[derive(Debug, Clone, Copy)]
pub struct Version {
    target: SpecVersion,
}

impl Version {
    pub fn new(target: SpecVersion) -> Self {
        Self { target }
    }
}

const LIFTABLE: [(&str, AttributeKind); 2] = [
    ("subject", AttributeKind::Subject),
    ("datacontentencoding", AttributeKind::DataContentEncoding),
];

struct VersionWriter<'a> {
    inner: Box<dyn BinaryWriter + 'a>,
    target: SpecVersion,
    source: Option<SpecVersion>,
    decode_base64: bool,
}

impl BinaryWriter for VersionWriter<'_> {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        let kind = attribute.kind();
        if kind == AttributeKind::SpecVersion {
            self.source = Some(version_of(attribute, &value));
            let attr = attribute_in(self.target, kind)?;
            return self
                .inner
                .set_attribute(attr, Value::String(self.target.as_str().to_string()));
        }
        if attribute.version() == self.target {
            return self.inner.set_attribute(attribute, value);
        }
        if kind == AttributeKind::DataContentEncoding
            && self.target.attribute(kind).is_none()
            && value.to_canonical().eq_ignore_ascii_case("base64")
        {
            self.decode_base64 = true;
            return Ok(());
        }
        match self.target.attribute(kind) {
            Some(attr) => self.inner.set_attribute(attr, value),
            None => self
                .inner
                .set_extension(&attribute.name().to_ascii_lowercase(), value),
        }
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        if self.source != Some(self.target) {
            let lifted = LIFTABLE
                .iter()
                .find(|(ext, _)| name.eq_ignore_ascii_case(ext))
                .and_then(|(_, kind)| self.target.attribute(*kind));
            if let Some(attr) = lifted {
                let value = attr.coerce(&value)?;
                return self.inner.set_attribute(attr, value);
            }
        }
        self.inner.set_extension(name, value)
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        if self.decode_base64 {
            let decoded = types::parse_binary_unquoted(&data)?;
            return self.inner.set_binary_data(decoded);
        }
        self.inner.set_data(data)
    }

    fn set_binary_data(&mut self, data: Bytes) -> Result<()> {
        if self.decode_base64 {
            let decoded = types::parse_binary_unquoted(&data)?;
            return self.inner.set_binary_data(decoded);
        }
        self.inner.set_binary_data(data)
    }

    fn end(&mut self) -> Result<()> {
        self.inner.end()
    }
}

impl TransformerFactory for Version {
    fn binary_transformer<'a>(
        &self,
        writer: Box<dyn BinaryWriter + 'a>,
    ) -> Option<Box<dyn BinaryWriter + 'a>> {
        Some(Box::new(VersionWriter {
            inner: writer,
            target: self.target,
            source: None,
            decode_base64: false,
        }))
    }

    fn event_transformer(&self) -> Option<EventTransformer<'_>> {
        Some(Box::new(move |event: &mut Event| {
            event.set_spec_version(self.target);
            Ok(())
        }))
    }
}
