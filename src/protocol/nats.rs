//! NATS transport
//!
//! NATS carries no headers here, so only structured mode is supported: the
//! payload is the event serialized with the JSON format.

use super::{settle, Context, Receiver, Sender};
use crate::binding::{self, BoxMessage, Encoding, Finisher, Message, StructuredWriter, TransformerFactory};
use crate::error::{CloudEventError, Result};
use crate::format::{self, Format};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Subject events are published to and received from
    pub subject: String,

    /// Queue group for load-balanced receivers
    pub queue_group: Option<String>,

    /// Authentication token
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            subject: "cloudevents".to_string(),
            queue_group: None,
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

async fn connect(config: &NatsConfig) -> Result<async_nats::Client> {
    let client = build_connect_options(config)
        .connect(&config.url)
        .await
        .map_err(|e| CloudEventError::transport("nats", format!("{}: {}", config.url, e)))?;
    tracing::info!(url = %config.url, "Connected to NATS");
    Ok(client)
}

/// An inbound NATS message; always structured JSON
pub struct NatsMessage {
    subject: String,
    payload: Bytes,
    finisher: Finisher,
}

impl NatsMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            finisher: Finisher::default(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl From<async_nats::Message> for NatsMessage {
    fn from(message: async_nats::Message) -> Self {
        Self::new(message.subject.to_string(), message.payload)
    }
}

impl fmt::Debug for NatsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Message for NatsMessage {
    fn encoding(&self) -> Encoding {
        Encoding::Structured
    }

    fn write_structured(&mut self, writer: &mut dyn StructuredWriter) -> Result<()> {
        writer.set_structured_event(format::json(), self.payload.clone())
    }

    fn finish(&mut self, error: Option<&CloudEventError>) -> Result<()> {
        self.finisher.finish(error)
    }
}

/// Captures the serialized event for a NATS payload
#[derive(Debug, Default)]
pub struct NatsWriter {
    payload: Option<Bytes>,
}

impl NatsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_payload(self) -> Option<Bytes> {
        self.payload
    }
}

impl StructuredWriter for NatsWriter {
    /// Only the JSON format is accepted, since receivers read payloads as JSON
    fn set_structured_event(&mut self, format: &'static dyn Format, event: Bytes) -> Result<()> {
        if format.media_type() != format::JSON_MEDIA_TYPE {
            return Err(CloudEventError::Config(format!(
                "NATS payloads must use {}, got {}",
                format::JSON_MEDIA_TYPE,
                format.media_type()
            )));
        }
        self.payload = Some(event);
        Ok(())
    }
}

/// Write a message as a NATS payload
pub fn write_payload(
    message: &mut dyn Message,
    transformers: &[&dyn TransformerFactory],
    options: &binding::PipelineOptions,
) -> Result<Bytes> {
    let mut writer = NatsWriter::new();
    binding::write(message, Some(&mut writer), None, transformers, options)?;
    writer
        .into_payload()
        .ok_or_else(|| CloudEventError::Format("no structured event was written".to_string()))
}

/// Publishes events to the configured subject
#[derive(Clone)]
pub struct NatsSender {
    client: async_nats::Client,
    config: NatsConfig,
}

impl fmt::Debug for NatsSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsSender")
            .field("url", &self.config.url)
            .field("subject", &self.config.subject)
            .finish()
    }
}

impl NatsSender {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = connect(&config).await?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: async_nats::Client, config: NatsConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn publish(&self, payload: Bytes) -> Result<()> {
        self.client
            .publish(self.config.subject.clone(), payload)
            .await
            .map_err(|e| CloudEventError::transport("nats", e))?;
        self.client
            .flush()
            .await
            .map_err(|e| CloudEventError::transport("nats", e))
    }
}

#[async_trait]
impl Sender for NatsSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match write_payload(message.as_mut(), transformers, cx.options()) {
            Ok(payload) => {
                tracing::debug!(subject = %self.config.subject, "Publishing to NATS");
                cx.run(self.publish(payload)).await
            }
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

/// Receives events from a subject subscription
///
/// The subscription is not shareable, so receives are serialized.
pub struct NatsReceiver {
    subscriber: Mutex<async_nats::Subscriber>,
    subject: String,
}

impl fmt::Debug for NatsReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsReceiver")
            .field("subject", &self.subject)
            .finish()
    }
}

impl NatsReceiver {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = connect(&config).await?;
        Self::with_client(client, &config).await
    }

    /// Subscribe on an existing connection
    pub async fn with_client(client: async_nats::Client, config: &NatsConfig) -> Result<Self> {
        let subscriber = match &config.queue_group {
            Some(group) => client
                .queue_subscribe(config.subject.clone(), group.clone())
                .await,
            None => client.subscribe(config.subject.clone()).await,
        }
        .map_err(|e| CloudEventError::transport("nats", e))?;

        tracing::info!(
            subject = %config.subject,
            queue_group = ?config.queue_group,
            "NATS subscription created"
        );

        Ok(Self {
            subscriber: Mutex::new(subscriber),
            subject: config.subject.clone(),
        })
    }

    /// Unsubscribe; pending receives then see end of stream
    pub async fn close(&self) -> Result<()> {
        self.subscriber
            .lock()
            .await
            .unsubscribe()
            .await
            .map_err(|e| CloudEventError::transport("nats", e))
    }
}

#[async_trait]
impl Receiver for NatsReceiver {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let mut subscriber = cx.run(async { Ok(self.subscriber.lock().await) }).await?;
        let next = cx.run(async { Ok(subscriber.next().await) }).await?;
        Ok(next.map(|m| Box::new(NatsMessage::from(m)) as BoxMessage))
    }
}
