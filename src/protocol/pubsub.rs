//! Google Cloud Pub/Sub transport
//!
//! Binary mode carries attributes as `ce-` message attributes and the data
//! content type in a `Content-Type` attribute; structured mode sets
//! `Content-Type` to the format media type. The client is abstracted behind
//! [`PubsubPublisher`] and [`PubsubSubscriber`].

use super::{settle, Context, Receiver, Sender};
use crate::binding::{
    self, BinaryWriter, BoxMessage, Encoding, Finisher, Message, PipelineOptions,
    StructuredWriter, TransformerFactory,
};
use crate::error::{CloudEventError, Result};
use crate::format::{self, Format};
use crate::types::Value;
use crate::version::{prefixed, version_from_header, Attribute, AttributeKind, SpecVersion};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Attribute prefix for attributes and extensions
pub const PREFIX: &str = "ce-";

/// Attribute holding the data or format content type
pub const CONTENT_TYPE: &str = "Content-Type";

/// A Pub/Sub message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubsubMessage {
    pub data: Bytes,
    pub attributes: BTreeMap<String, String>,
    /// Server-assigned id, for received messages
    pub id: Option<String>,
    /// Acknowledgement handle, for pulled messages
    pub ack_id: Option<String>,
}

/// Publishes to a topic
#[async_trait]
pub trait PubsubPublisher: Send + Sync {
    /// Publish and return the server-assigned message id
    async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String>;
}

/// Pulls from a subscription
#[async_trait]
pub trait PubsubSubscriber: Send + Sync {
    /// Next message; `Ok(None)` once the subscription is closed
    async fn pull(&self, subscription: &str) -> Result<Option<PubsubMessage>>;

    /// Must not block
    fn ack(&self, ack_id: &str) -> Result<()>;

    /// Must not block
    fn nack(&self, ack_id: &str) -> Result<()>;
}

/// Pub/Sub transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PubsubConfig {
    /// Topic messages are published to
    pub topic: String,

    /// Subscription messages are pulled from
    pub subscription: String,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            topic: "cloudevents".to_string(),
            subscription: "cloudevents-sub".to_string(),
        }
    }
}

fn content_type(attributes: &BTreeMap<String, String>) -> Option<&str> {
    attributes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE))
        .map(|(_, v)| v.as_str())
}

/// An inbound Pub/Sub message
pub struct PubsubInbound {
    message: PubsubMessage,
    format: Option<&'static dyn Format>,
    version: Option<SpecVersion>,
    finisher: Finisher,
}

impl PubsubInbound {
    pub fn new(message: PubsubMessage) -> Self {
        let format = content_type(&message.attributes).and_then(format::lookup);
        let version = match format {
            Some(_) => None,
            None => version_from_header(PREFIX, |name| message.attributes.get(name).cloned()),
        };
        Self {
            message,
            format,
            version,
            finisher: Finisher::default(),
        }
    }

    pub fn with_finisher(mut self, finisher: Finisher) -> Self {
        self.finisher = finisher;
        self
    }

    pub fn message(&self) -> &PubsubMessage {
        &self.message
    }
}

impl fmt::Debug for PubsubInbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubInbound")
            .field("encoding", &self.encoding())
            .field("id", &self.message.id)
            .finish()
    }
}

impl Message for PubsubInbound {
    fn encoding(&self) -> Encoding {
        if self.format.is_some() {
            Encoding::Structured
        } else if self.version.is_some() {
            Encoding::Binary
        } else {
            Encoding::Unknown
        }
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        let format = self.format.ok_or(CloudEventError::NotStructured)?;
        writer.set_structured_event(format, self.message.data.clone())
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        let version = self.version.ok_or(CloudEventError::NotBinary)?;
        writer.start()?;
        if let Some(attr) = version.attribute(AttributeKind::SpecVersion) {
            writer.set_attribute(attr, Value::String(version.as_str().to_string()))?;
        }
        if let (Some(ct), Some(attr)) = (
            content_type(&self.message.attributes),
            version.attribute(AttributeKind::DataContentType),
        ) {
            writer.set_attribute(attr, Value::String(ct.to_string()))?;
        }

        for (name, value) in &self.message.attributes {
            let Some(short) = name.strip_prefix(PREFIX) else {
                continue;
            };
            match version.attribute_by_name(short) {
                Some(attr) if attr.kind() == AttributeKind::SpecVersion => {}
                Some(attr) => writer.set_attribute(attr, attr.parse(value)?)?,
                None => writer.set_extension(short, Value::String(value.clone()))?,
            }
        }

        if !self.message.data.is_empty() {
            writer.set_data(self.message.data.clone())?;
        }
        writer.end()
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

/// Fills a [`PubsubMessage`]
#[derive(Debug, Default)]
pub struct PubsubWriter {
    message: PubsubMessage,
}

impl PubsubWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_message(self) -> PubsubMessage {
        self.message
    }
}

impl StructuredWriter for PubsubWriter {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.message
            .attributes
            .insert(CONTENT_TYPE.to_string(), format.media_type().to_string());
        self.message.data = event;
        Ok(())
    }
}

impl BinaryWriter for PubsubWriter {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        let canonical = attribute.format(&value)?;
        let name = match attribute.kind() {
            AttributeKind::DataContentType => CONTENT_TYPE.to_string(),
            _ => attribute.prefixed_name(PREFIX),
        };
        self.message.attributes.insert(name, canonical);
        Ok(())
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.message
            .attributes
            .insert(prefixed(PREFIX, name), value.to_canonical());
        Ok(())
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.message.data = data;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write a message into a new Pub/Sub message
pub fn write_message(
    message: &mut dyn Message,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<(Encoding, PubsubMessage)> {
    let mut structured = PubsubWriter::new();
    let mut binary = PubsubWriter::new();
    let encoding = binding::write(message, Some(&mut structured), Some(&mut binary), transformers, options)?;
    let out = match encoding {
        Encoding::Structured => structured.into_message(),
        _ => binary.into_message(),
    };
    Ok((encoding, out))
}

/// Publishes to the configured topic
#[derive(Clone)]
pub struct PubsubSender {
    publisher: Arc<dyn PubsubPublisher>,
    config: PubsubConfig,
}

impl fmt::Debug for PubsubSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubSender")
            .field("config", &self.config)
            .finish()
    }
}

impl PubsubSender {
    pub fn new(publisher: Arc<dyn PubsubPublisher>, config: PubsubConfig) -> Self {
        Self { publisher, config }
    }
}

#[async_trait]
impl Sender for PubsubSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match write_message(message.as_mut(), transformers, cx.options()) {
            Ok((encoding, out)) => cx
                .run(self.publisher.publish(&self.config.topic, out))
                .await
                .map(|id| {
                    tracing::debug!(topic = %self.config.topic, %encoding, message_id = %id, "Published to Pub/Sub");
                }),
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

/// Pulls from the configured subscription
///
/// Finishing without an error acks; finishing with one nacks for redelivery.
pub struct PubsubReceiver {
    subscriber: Arc<dyn PubsubSubscriber>,
    config: PubsubConfig,
    lock: Mutex<()>,
}

impl fmt::Debug for PubsubReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubsubReceiver")
            .field("config", &self.config)
            .finish()
    }
}

impl PubsubReceiver {
    pub fn new(subscriber: Arc<dyn PubsubSubscriber>, config: PubsubConfig) -> Self {
        Self {
            subscriber,
            config,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Receiver for PubsubReceiver {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let _guard = cx.run(async { Ok(self.lock.lock().await) }).await?;
        let Some(message) = cx.run(self.subscriber.pull(&self.config.subscription)).await? else {
            return Ok(None);
        };

        let finisher = match message.ack_id.clone() {
            Some(ack_id) => {
                let subscriber = self.subscriber.clone();
                Finisher::new(move |error| match error {
                    None => subscriber.ack(&ack_id),
                    Some(e) => {
                        tracing::debug!(error = %e, "Nacking Pub/Sub message");
                        subscriber.nack(&ack_id)
                    }
                })
            }
            None => Finisher::default(),
        };
        Ok(Some(Box::new(PubsubInbound::new(message).with_finisher(finisher))))
    }
}
