//! AMQP 1.0 transport
//!
//! Binary mode puts attributes in application properties named
//! `cloudEvents:<attribute>` and the data content type in the
//! `content-type` message property. Property values keep their AMQP type:
//! booleans, integers, timestamps and binary are not stringified.
//!
//! Links are abstracted behind [`AmqpSenderLink`] and [`AmqpReceiverLink`];
//! an AMQP client implements them for one sender or receiver link.

use super::{finish_logged, settle, Context, Receiver, Requester, Sender};
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
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Application property prefix
pub const PREFIX: &str = "cloudEvents:";

/// A typed AMQP application property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmqpValue {
    Bool(bool),
    Int(i32),
    String(String),
    Binary(Bytes),
    Timestamp(DateTime<Utc>),
}

impl From<Value> for AmqpValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => AmqpValue::Bool(b),
            Value::Integer(i) => AmqpValue::Int(i),
            Value::String(s) => AmqpValue::String(s),
            Value::Binary(b) => AmqpValue::Binary(b),
            Value::Timestamp(t) => AmqpValue::Timestamp(t),
            Value::Uri(u) => AmqpValue::String(u.to_string()),
            Value::UriRef(u) => AmqpValue::String(u.to_string()),
        }
    }
}

impl From<&AmqpValue> for Value {
    fn from(value: &AmqpValue) -> Self {
        match value {
            AmqpValue::Bool(b) => Value::Bool(*b),
            AmqpValue::Int(i) => Value::Integer(*i),
            AmqpValue::String(s) => Value::String(s.clone()),
            AmqpValue::Binary(b) => Value::Binary(b.clone()),
            AmqpValue::Timestamp(t) => Value::Timestamp(*t),
        }
    }
}

/// The parts of an AMQP message the binding reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpMessage {
    pub to: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub application_properties: BTreeMap<String, AmqpValue>,
    /// Single data section
    pub body: Bytes,
}

/// A message received on a link, with the id used to settle it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpDelivery {
    pub delivery_id: u64,
    pub message: AmqpMessage,
}

/// Final state of a received delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Rejected(String),
}

/// An attached sender link
#[async_trait]
pub trait AmqpSenderLink: Send + Sync {
    /// Send and wait for the peer's disposition
    async fn send(&self, message: AmqpMessage) -> Result<()>;
}

/// An attached receiver link
#[async_trait]
pub trait AmqpReceiverLink: Send + Sync {
    /// Next delivery; `Ok(None)` once the link is detached
    async fn receive(&self) -> Result<Option<AmqpDelivery>>;

    /// Settle a delivery; must not block
    fn settle(&self, delivery_id: u64, disposition: Disposition) -> Result<()>;
}

/// AMQP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmqpConfig {
    /// Target node address
    pub address: String,

    /// Address replies are sent to, for requests
    pub reply_address: Option<String>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            address: "cloudevents".to_string(),
            reply_address: None,
        }
    }
}

/// An inbound AMQP message
pub struct AmqpInbound {
    message: AmqpMessage,
    format: Option<&'static dyn Format>,
    version: Option<SpecVersion>,
    finisher: Finisher,
}

impl AmqpInbound {
    pub fn new(message: AmqpMessage) -> Self {
        let format = message.content_type.as_deref().and_then(format::lookup);
        let version = match format {
            Some(_) => None,
            None => version_from_header(PREFIX, |name| {
                message
                    .application_properties
                    .get(name)
                    .map(|v| Value::from(v).to_canonical())
            }),
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

    pub fn message(&self) -> &AmqpMessage {
        &self.message
    }
}

impl fmt::Debug for AmqpInbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpInbound")
            .field("encoding", &self.encoding())
            .field("message_id", &self.message.message_id)
            .finish()
    }
}

impl Message for AmqpInbound {
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
        writer.set_structured_event(format, self.message.body.clone())
    }

    fn write_binary(&mut self, writer: &mut dyn BinaryWriter) -> Result<()> {
        let version = self.version.ok_or(CloudEventError::NotBinary)?;
        writer.start()?;
        if let Some(attr) = version.attribute(AttributeKind::SpecVersion) {
            writer.set_attribute(attr, Value::String(version.as_str().to_string()))?;
        }
        if let (Some(ct), Some(attr)) = (
            self.message.content_type.as_deref(),
            version.attribute(AttributeKind::DataContentType),
        ) {
            writer.set_attribute(attr, Value::String(ct.to_string()))?;
        }

        for (name, value) in &self.message.application_properties {
            let Some(short) = name.strip_prefix(PREFIX) else {
                continue;
            };
            let short = short.to_ascii_lowercase();
            let value = Value::from(value);
            match version.attribute_by_name(&short) {
                Some(attr) if attr.kind() == AttributeKind::SpecVersion => {}
                Some(attr) => writer.set_attribute(attr, attr.coerce(&value)?)?,
                None => writer.set_extension(&short, value)?,
            }
        }

        if !self.message.body.is_empty() {
            writer.set_data(self.message.body.clone())?;
        }
        writer.end()
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

/// Fills an [`AmqpMessage`]
#[derive(Debug, Default)]
pub struct AmqpWriter {
    message: AmqpMessage,
}

impl AmqpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_message(self) -> AmqpMessage {
        self.message
    }
}

impl StructuredWriter for AmqpWriter {
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        self.message.content_type = Some(format.media_type().to_string());
        self.message.body = event;
        Ok(())
    }
}

impl BinaryWriter for AmqpWriter {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_attribute(&mut self, attribute: &'static Attribute, value: Value) -> Result<()> {
        let value = attribute.coerce(&value)?;
        if attribute.kind() == AttributeKind::DataContentType {
            self.message.content_type = Some(value.to_canonical());
            return Ok(());
        }
        self.message
            .application_properties
            .insert(attribute.prefixed_name(PREFIX), value.into());
        Ok(())
    }

    fn set_extension(&mut self, name: &str, value: Value) -> Result<()> {
        self.message
            .application_properties
            .insert(prefixed(PREFIX, name), value.into());
        Ok(())
    }

    fn set_data(&mut self, data: Bytes) -> Result<()> {
        self.message.body = data;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Write a message into a new AMQP message
pub fn write_message(
    message: &mut dyn Message,
    transformers: &[&dyn TransformerFactory],
    options: &PipelineOptions,
) -> Result<(Encoding, AmqpMessage)> {
    let mut structured = AmqpWriter::new();
    let mut binary = AmqpWriter::new();
    let encoding = binding::write(message, Some(&mut structured), Some(&mut binary), transformers, options)?;
    let out = match encoding {
        Encoding::Structured => structured.into_message(),
        _ => binary.into_message(),
    };
    Ok((encoding, out))
}

fn inbound(link: &Arc<dyn AmqpReceiverLink>, delivery: AmqpDelivery) -> AmqpInbound {
    let link = link.clone();
    let id = delivery.delivery_id;
    let finisher = Finisher::new(move |error| {
        let disposition = match error {
            None => Disposition::Accepted,
            Some(e) => Disposition::Rejected(e.to_string()),
        };
        link.settle(id, disposition)
    });
    AmqpInbound::new(delivery.message).with_finisher(finisher)
}

/// Sends on one link; with a reply link it can also make requests
#[derive(Clone)]
pub struct AmqpSender {
    link: Arc<dyn AmqpSenderLink>,
    replies: Option<Arc<Mutex<Arc<dyn AmqpReceiverLink>>>>,
    config: AmqpConfig,
}

impl fmt::Debug for AmqpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpSender")
            .field("config", &self.config)
            .field("requests", &self.replies.is_some())
            .finish()
    }
}

impl AmqpSender {
    pub fn new(link: Arc<dyn AmqpSenderLink>, config: AmqpConfig) -> Self {
        Self {
            link,
            replies: None,
            config,
        }
    }

    /// Enable [`Requester`]; replies are read from `link`
    pub fn with_reply_link(mut self, link: Arc<dyn AmqpReceiverLink>) -> Self {
        self.replies = Some(Arc::new(Mutex::new(link)));
        self
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    fn outbound(
        &self,
        cx: &Context,
        message: &mut BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<AmqpMessage> {
        let (encoding, mut out) = write_message(message.as_mut(), transformers, cx.options())?;
        out.to = Some(self.config.address.clone());
        tracing::debug!(address = %self.config.address, %encoding, "Sending AMQP message");
        Ok(out)
    }
}

#[async_trait]
impl Sender for AmqpSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match self.outbound(cx, &mut message, transformers) {
            Ok(out) => cx.run(self.link.send(out)).await,
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

#[async_trait]
impl Requester for AmqpSender {
    /// Send with `reply-to` and a fresh correlation id, then wait for the
    /// matching reply
    ///
    /// Replies with another correlation id are rejected.
    async fn request(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<BoxMessage> {
        let Some(replies) = &self.replies else {
            let e = CloudEventError::Config("AMQP sender has no reply link".to_string());
            finish_logged(&mut message, Some(&e));
            return Err(e);
        };

        let mut out = match self.outbound(cx, &mut message, transformers) {
            Ok(out) => out,
            Err(e) => {
                finish_logged(&mut message, Some(&e));
                return Err(e);
            }
        };
        let correlation_id = uuid::Uuid::new_v4().to_string();
        out.message_id = Some(correlation_id.clone());
        out.correlation_id = Some(correlation_id.clone());
        out.reply_to = self.config.reply_address.clone();

        // Hold the reply link for the whole exchange so replies are not
        // taken by a concurrent request.
        let link = replies.lock().await;
        let sent = cx.run(self.link.send(out)).await;
        settle(&mut message, sent)?;

        loop {
            let delivery = cx
                .run(link.receive())
                .await?
                .ok_or_else(|| CloudEventError::transport("amqp", "reply link detached"))?;
            if delivery.message.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                return Ok(Box::new(inbound(&link, delivery)));
            }
            tracing::warn!(
                expected = %correlation_id,
                got = ?delivery.message.correlation_id,
                "Rejecting AMQP reply with unexpected correlation id"
            );
            link.settle(
                delivery.delivery_id,
                Disposition::Rejected("unexpected correlation id".to_string()),
            )?;
        }
    }
}

/// Receives from one link; finishing a message settles its delivery
pub struct AmqpReceiver {
    link: Arc<dyn AmqpReceiverLink>,
    lock: Mutex<()>,
}

impl fmt::Debug for AmqpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpReceiver").finish_non_exhaustive()
    }
}

impl AmqpReceiver {
    pub fn new(link: Arc<dyn AmqpReceiverLink>) -> Self {
        Self {
            link,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Receiver for AmqpReceiver {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let _guard = cx.run(async { Ok(self.lock.lock().await) }).await?;
        match cx.run(self.link.receive()).await? {
            Some(delivery) => Ok(Some(Box::new(inbound(&self.link, delivery)))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{to_event, EventMessage};
    use crate::event::Event;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn event() -> Event {
        let mut e = Event::new();
        e.set_id("ABC-123");
        e.set_type("com.example.test");
        e.set_source("/unit/test/client");
        e.set_time_str("2020-03-21T12:34:56.780Z");
        e.set_extension("exti", 10).unwrap();
        e.set_data("text/plain", "hello").unwrap();
        e
    }

    #[test]
    fn test_binary_properties_are_typed() {
        let (enc, out) = write_message(&mut EventMessage::new(event()), &[], &PipelineOptions::default()).unwrap();
        assert_eq!(enc, Encoding::Binary);
        assert_eq!(out.content_type.as_deref(), Some("text/plain"));
        let props = &out.application_properties;
        assert_eq!(props["cloudEvents:id"], AmqpValue::String("ABC-123".into()));
        assert_eq!(props["cloudEvents:exti"], AmqpValue::Int(10));
        assert!(matches!(props["cloudEvents:time"], AmqpValue::Timestamp(_)));
        assert!(!props.contains_key("cloudEvents:datacontenttype"));

        let mut back = AmqpInbound::new(out);
        assert_eq!(back.encoding(), Encoding::Binary);
        assert_eq!(to_event(&mut back).unwrap(), event());
    }

    #[test]
    fn test_structured_uses_content_type() {
        let (enc, out) = write_message(
            &mut EventMessage::new(event()),
            &[],
            &PipelineOptions::force_structured(),
        )
        .unwrap();
        assert_eq!(enc, Encoding::Structured);
        assert_eq!(out.content_type.as_deref(), Some("application/cloudevents+json"));
        assert!(out.application_properties.is_empty());
        assert_eq!(AmqpInbound::new(out).encoding(), Encoding::Structured);
    }

    /// Echoes every sent message back on the reply link
    struct Loopback {
        queue: Mutex<VecDeque<AmqpDelivery>>,
        settled: StdMutex<Vec<(u64, Disposition)>>,
    }

    #[async_trait]
    impl AmqpSenderLink for Loopback {
        async fn send(&self, message: AmqpMessage) -> Result<()> {
            let mut queue = self.queue.lock().await;
            let stray = AmqpMessage {
                correlation_id: Some("someone-else".into()),
                ..message.clone()
            };
            queue.push_back(AmqpDelivery { delivery_id: 1, message: stray });
            queue.push_back(AmqpDelivery { delivery_id: 2, message });
            Ok(())
        }
    }

    #[async_trait]
    impl AmqpReceiverLink for Loopback {
        async fn receive(&self) -> Result<Option<AmqpDelivery>> {
            Ok(self.queue.lock().await.pop_front())
        }

        fn settle(&self, delivery_id: u64, disposition: Disposition) -> Result<()> {
            self.settled.lock().unwrap().push((delivery_id, disposition));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_request_matches_correlation_id() {
        let link = Arc::new(Loopback {
            queue: Mutex::new(VecDeque::new()),
            settled: StdMutex::new(Vec::new()),
        });
        let config = AmqpConfig {
            reply_address: Some("replies".into()),
            ..Default::default()
        };
        let sender = AmqpSender::new(link.clone(), config).with_reply_link(link.clone());

        let cx = Context::new();
        let mut reply = sender
            .request(&cx, Box::new(EventMessage::new(event())), &[])
            .await
            .unwrap();
        assert_eq!(to_event(reply.as_mut()).unwrap().id(), "ABC-123");
        reply.finish(None).unwrap();

        let settled = link.settled.lock().unwrap().clone();
        assert_eq!(settled.len(), 2);
        assert!(matches!(settled[0], (1, Disposition::Rejected(_))));
        assert_eq!(settled[1], (2, Disposition::Accepted));
    }

    #[tokio::test]
    async fn test_request_without_reply_link_fails() {
        let link = Arc::new(Loopback {
            queue: Mutex::new(VecDeque::new()),
            settled: StdMutex::new(Vec::new()),
        });
        let sender = AmqpSender::new(link, AmqpConfig::default());
        let err = sender
            .request(&Context::new(), Box::new(EventMessage::new(event())), &[])
            .await
            .err().unwrap();
        assert!(matches!(err, CloudEventError::Config(_)));
    }
}
