//! Transport roles and adapters
//!
//! Every transport implements some of [`Sender`], [`Requester`],
//! [`Receiver`] and [`Responder`] over its native unit. Calls take a
//! [`Context`] carrying a cancellation token and the pipeline options for
//! that call.

pub mod amqp;
pub mod http;
pub mod kafka;
pub mod memory;
pub mod nats;
pub mod pubsub;

use crate::binding::{BoxMessage, Encoding, Message, PipelineOptions, TransformerFactory};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Per-call cancellation and pipeline options
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    options: PipelineOptions,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A context cancelled when this one is, but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            options: self.options,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve `fut`, or fail with [`CloudEventError::Cancelled`] first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CloudEventError::Cancelled),
            out = fut => out,
        }
    }
}

/// Transmits messages
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send once; the message is finished with the outcome before returning
    async fn send(
        &self,
        cx: &Context,
        message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()>;
}

/// Sends a message and waits for the reply
#[async_trait]
pub trait Requester: Send + Sync {
    /// The request message is finished before returning; the caller
    /// finishes the response
    async fn request(
        &self,
        cx: &Context,
        message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<BoxMessage>;
}

/// Yields inbound messages
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Next message; `Ok(None)` once the transport has closed cleanly
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>>;
}

/// Yields inbound messages that expect a reply
#[async_trait]
pub trait Responder: Send + Sync {
    /// Next message and its reply slot; `Ok(None)` on clean close
    async fn respond(&self, cx: &Context) -> Result<Option<(BoxMessage, ResponseFn)>>;
}

type ReplyFn = Box<dyn FnOnce(Option<BoxMessage>, Result<()>) -> BoxFuture<'static, Result<()>> + Send>;

/// Reply slot handed out by a [`Responder`]; must be used exactly once
pub struct ResponseFn {
    reply: ReplyFn,
}

impl ResponseFn {
    pub fn new(
        reply: impl FnOnce(Option<BoxMessage>, Result<()>) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            reply: Box::new(reply),
        }
    }

    /// Reply with a message, or with only the processing outcome
    pub async fn respond(self, message: Option<BoxMessage>, result: Result<()>) -> Result<()> {
        (self.reply)(message, result).await
    }
}

impl fmt::Debug for ResponseFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFn").finish_non_exhaustive()
    }
}

/// Finishes the wrapped message on drop unless it was finished already
///
/// Use it around request/response replies so they are released even on
/// early returns.
pub struct FinishGuard {
    message: Option<BoxMessage>,
}

impl FinishGuard {
    pub fn new(message: BoxMessage) -> Self {
        Self {
            message: Some(message),
        }
    }

    /// Finish now with the given outcome
    pub fn finish(mut self, error: Option<&CloudEventError>) -> Result<()> {
        match self.message.take() {
            Some(mut m) => m.finish(error),
            None => Ok(()),
        }
    }

    /// Read the reply into an event
    pub fn to_event(&mut self) -> Result<Event> {
        match self.message.as_mut() {
            Some(m) => crate::binding::to_event(m.as_mut()),
            None => Err(CloudEventError::EncodingUnknown),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.message
            .as_ref()
            .map(|m| m.encoding())
            .unwrap_or(Encoding::Unknown)
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(mut m) = self.message.take() {
            if let Err(e) = m.finish(None) {
                tracing::warn!(error = %e, "Failed to finish message on drop");
            }
        }
    }
}

/// Finish a message, logging a failure of the finish itself
pub(crate) fn finish_logged(message: &mut BoxMessage, error: Option<&CloudEventError>) {
    if let Err(e) = message.finish(error) {
        tracing::warn!(error = %e, "Failed to finish message");
    }
}

/// Finish with the outcome of a send and hand the outcome back
pub(crate) fn settle(message: &mut BoxMessage, outcome: Result<()>) -> Result<()> {
    finish_logged(message, outcome.as_ref().err());
    outcome
}
