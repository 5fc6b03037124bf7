//! Kafka transport
//!
//! Attributes travel as `ce_` record headers with the data content type in
//! an unprefixed `content-type` header. The `key` extension maps to the
//! record key in both directions unless
//! [`PipelineOptions::skip_key_extension`] is set.
//!
//! The broker client itself is abstracted behind [`KafkaProducer`] and
//! [`KafkaConsumer`]; a consumer-group client implements them.

use super::{settle, Context, Receiver, Sender};
use crate::binding::{
    self, write_event_binary, BinaryWriter, BoxMessage, Encoding, Finisher, Message,
    PipelineOptions, StructuredWriter, TransformerFactory,
};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::format::{self, Format};
use crate::types::Value;
use crate::version::{prefixed, version_from_header, Attribute, AttributeKind, SpecVersion};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Header prefix for attributes and extensions
pub const PREFIX: &str = "ce_";

/// Extension mirrored into the record key
pub const KEY_EXTENSION: &str = "key";

const CONTENT_TYPE: &str = "content-type";

/// A Kafka record as produced or consumed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
}

impl KafkaRecord {
    /// First header with `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    fn header_str(&self, name: &str) -> Option<String> {
        self.header(name)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
    }

    fn set_header(&mut self, name: String, value: Bytes) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value));
    }
}

/// Publishes records to a broker
#[async_trait]
pub trait KafkaProducer: Send + Sync {
    async fn send(&self, record: KafkaRecord) -> Result<()>;
}

/// Reads records from a consumer-group session
#[async_trait]
pub trait KafkaConsumer: Send + Sync + 'static {
    /// Next record; `Ok(None)` once the session has ended
    async fn poll(&self) -> Result<Option<KafkaRecord>>;

    /// Mark a record consumed; must not block
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// Kafka transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaConfig {
    /// Topic records are produced to
    pub topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            topic: "cloudevents".to_string(),
        }
    }
}

/// An inbound Kafka record as a message
///
/// A structured record with a key is promoted to an event so the key can be
/// exposed as the `key` extension.
pub struct KafkaMessage {
    record: KafkaRecord,
    format: Option<&'static dyn Format>,
    version: Option<SpecVersion>,
    lift_key: bool,
    promoted: Option<Event>,
    finisher: Finisher,
}

impl KafkaMessage {
    pub fn new(record: KafkaRecord) -> Self {
        Self::with_options(record, &PipelineOptions::default())
    }

    pub fn with_options(record: KafkaRecord, options: &PipelineOptions) -> Self {
        let format = record.header_str(CONTENT_TYPE).and_then(|ct| format::lookup(&ct));
        let version = match format {
            Some(_) => None,
            None => version_from_header(PREFIX, |name| record.header_str(name)),
        };
        let lift_key = !options.skip_key_extension && record.key.is_some();

        let promoted = match (format, lift_key) {
            (Some(format), true) => promote(format, &record),
            _ => None,
        };

        Self {
            record,
            format,
            version,
            lift_key,
            promoted,
            finisher: Finisher::default(),
        }
    }

    pub fn with_finisher(mut self, finisher: Finisher) -> Self {
        self.finisher = finisher;
        self
    }

    pub fn record(&self) -> &KafkaRecord {
        &self.record
    }

    fn key_string(&self) -> Option<String> {
        self.record
            .key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

fn promote(format: &'static dyn Format, record: &KafkaRecord) -> Option<Event> {
    let mut event = match format.unmarshal(&record.value) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(topic = %record.topic, offset = record.offset, "Structured record is not a valid event: {e}");
            return None;
        }
    };
    if event.extension(KEY_EXTENSION).is_none() {
        let key = record
            .key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        if let Err(e) = event.set_extension(KEY_EXTENSION, key) {
            tracing::warn!("Record key rejected as extension: {e}");
        }
    }
    Some(event)
}

impl fmt::Debug for KafkaMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaMessage")
            .field("encoding", &self.encoding())
            .field("topic", &self.record.topic)
            .field("partition", &self.record.partition)
            .field("offset", &self.record.offset)
            .finish()
    }
}

impl Message for KafkaMessage {
    fn encoding(&self) -> Encoding {
        if self.promoted.is_some() {
            Encoding::Event
        } else if self.format.is_some() {
            Encoding::Structured
        } else if self.version.is_some() {
            Encoding::Binary
        } else {
            Encoding::Unknown
        }
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        let format = self.format.ok_or(CloudEventError::NotStructured)?;
        match &self.promoted {
            Some(event) => writer.set_structured_event(format, Bytes::from(format.marshal(event)?)),
            None => writer.set_structured_event(format, self.record.value.clone()),
        }
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        if let Some(event) = &self.promoted {
            return write_event_binary(event, writer);
        }
        let version = self.version.ok_or(CloudEventError::NotBinary)?;
        writer.start()?;
        if let Some(attr) = version.attribute(AttributeKind::SpecVersion) {
            writer.set_attribute(attr, Value::String(version.as_str().to_string()))?;
        }

        let mut saw_key = false;
        for (name, value) in &self.record.headers {
            let name = name.to_ascii_lowercase();
            let value = String::from_utf8_lossy(value).trim().to_string();
            if name == CONTENT_TYPE {
                if let Some(attr) = version.attribute(AttributeKind::DataContentType) {
                    writer.set_attribute(attr, Value::String(value))?;
                }
                continue;
            }
            let Some(short) = name.strip_prefix(PREFIX) else {
                continue;
            };
            match version.attribute_by_name(short) {
                Some(attr) if attr.kind() == AttributeKind::SpecVersion => {}
                Some(attr) => writer.set_attribute(attr, attr.parse(&value)?)?,
                None => {
                    saw_key |= short == KEY_EXTENSION;
                    writer.set_extension(short, Value::String(value))?;
                }
            }
        }

        if self.lift_key && !saw_key {
            if let Some(key) = self.key_string() {
                writer.set_extension(KEY_EXTENSION, Value::String(key))?;
            }
        }

        if !self.record.value.is_empty() {
            writer.set_data(self.record.value.clone())?;
        }
        writer.end()
    }

    fn as_event(&self) -> Option<&Event> {
        self.promoted.as_ref()
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

/// Fills a [`KafkaRecord`]
#[derive(Debug, Default)]
pub struct KafkaWriter {
    record: KafkaRecord,
    skip_key: bool,
}

impl KafkaWriter {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            record: KafkaRecord {
                topic: topic.into(),
                ..Default::default()
            },
            skip_key: false,
        }
    }

    /// Emit `key` as an ordinary header instead of the record key
    pub fn skip_key_extension(mut self) -> Self {
        self.skip_key = true;
        self
    }

    pub fn into_record(self) -> KafkaRecord {
        self.record
    }
}

impl StructuredWriter for KafkaWriter {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.record
            .set_header(CONTENT_TYPE.to_string(), Bytes::from_static(format.media_type().as_bytes()));
        self.record.value = event;
        Ok(())
    }
}

impl BinaryWriter for KafkaWriter {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        let canonical = attribute.format(&value)?;
        let name = match attribute.kind() {
            AttributeKind::DataContentType => CONTENT_TYPE.to_string(),
            _ => attribute.prefixed_name(PREFIX),
        };
        self.record.set_header(name, Bytes::from(canonical));
        Ok(())
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.skip_key && name == KEY_EXTENSION {
            self.record.key = Some(Bytes::from(value.to_canonical()));
            return Ok(());
        }
        self.record
            .set_header(prefixed(PREFIX, name), Bytes::from(value.to_canonical()));
        Ok(())
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.record.value = data;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write a message into a record for `topic`
///
/// A structured record built from an event still gets its key from the
/// event's `key` extension, read back out of the serialized body. A
/// structured source is forwarded as is and its body is never parsed.
pub fn write_record(
    message: &mut dyn Message,
    topic: &str,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<(Encoding, KafkaRecord)> {
    let writer = || {
        let w = KafkaWriter::new(topic);
        if options.skip_key_extension {
            w.skip_key_extension()
        } else {
            w
        }
    };
    let source = message.encoding();
    let mut structured = writer();
    let mut binary = writer();
    let encoding = binding::write(message, Some(&mut structured), Some(&mut binary), transformers, options)?;

    let mut record = match encoding {
        Encoding::Structured => structured.into_record(),
        _ => binary.into_record(),
    };
    if encoding == Encoding::Structured
        && source != Encoding::Structured
        && !options.skip_key_extension
        && record.key.is_none()
    {
        record.key = structured_key(&record);
    }
    Ok((encoding, record))
}

fn structured_key(record: &KafkaRecord) -> Option<Bytes> {
    let format = record.header_str(CONTENT_TYPE).and_then(|ct| format::lookup(&ct))?;
    match format.unmarshal(&record.value) {
        Ok(event) => event
            .extension(KEY_EXTENSION)
            .map(|v| Bytes::from(v.to_canonical())),
        Err(e) => {
            tracing::debug!(topic = %record.topic, error = %e, "No record key from structured body");
            None
        }
    }
}

/// Produces one record per message
#[derive(Clone)]
pub struct KafkaSender {
    producer: Arc<dyn KafkaProducer>,
    config: KafkaConfig,
}

impl fmt::Debug for KafkaSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSender")
            .field("config", &self.config)
            .finish()
    }
}

impl KafkaSender {
    pub fn new(producer: Arc<dyn KafkaProducer>, config: KafkaConfig) -> Self {
        Self { producer, config }
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }
}

#[async_trait]
impl Sender for KafkaSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match write_record(message.as_mut(), &self.config.topic, transformers, cx.options()) {
            Ok((encoding, record)) => {
                tracing::debug!(topic = %record.topic, %encoding, "Producing Kafka record");
                cx.run(self.producer.send(record)).await
            }
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

/// Receives records through a background poller
///
/// The poller hands records over a channel of capacity one, so the consumer
/// only runs ahead of the application by a single record. Finishing a
/// message without an error commits its offset.
pub struct KafkaReceiver {
    consumer: Arc<dyn KafkaConsumer>,
    records: Mutex<mpsc::Receiver<Result<KafkaRecord>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for KafkaReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaReceiver").finish_non_exhaustive()
    }
}

impl KafkaReceiver {
    /// Start polling `consumer` in the background
    pub fn new(consumer: Arc<dyn KafkaConsumer>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        tokio::spawn(poll_loop(consumer.clone(), tx, shutdown.clone()));
        Self {
            consumer,
            records: Mutex::new(rx),
            shutdown,
        }
    }

    /// Stop the poller; pending receives drain and then see end of stream
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for KafkaReceiver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop(
    consumer: Arc<dyn KafkaConsumer>,
    tx: mpsc::Sender<Result<KafkaRecord>>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = consumer.poll() => polled,
        };
        let stop = !matches!(polled, Ok(Some(_)));
        let item = match polled {
            Ok(Some(record)) => Ok(record),
            Ok(None) => break,
            Err(e) => Err(e),
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(item) => if sent.is_err() { break },
        }
        if stop {
            break;
        }
    }
    tracing::debug!("Kafka poller stopped");
}

#[async_trait]
impl Receiver for KafkaReceiver {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let mut records = cx.run(async { Ok(self.records.lock().await) }).await?;
        let record = match cx.run(async { Ok(records.recv().await) }).await? {
            Some(record) => record?,
            None => return Ok(None),
        };

        let consumer = self.consumer.clone();
        let (topic, partition, offset) = (record.topic.clone(), record.partition, record.offset);
        let finisher = Finisher::new(move |error| match error {
            None => consumer.commit(&topic, partition, offset),
            Some(e) => {
                tracing::warn!(%topic, partition, offset, error = %e, "Kafka record not committed");
                Ok(())
            }
        });
        Ok(Some(Box::new(
            KafkaMessage::with_options(record, cx.options()).with_finisher(finisher),
        )))
    }
}
