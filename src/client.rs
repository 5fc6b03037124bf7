//! Client facade over the transport roles
//!
//! [`Client`] sends and requests [`Event`]s, applying defaulters and
//! validation first, and drives an [`EventHandler`] from a [`Receiver`] or
//! [`Responder`].

use crate::binding::{to_event, BoxMessage, EventMessage, TransformerFactory};
use crate::error::{CloudEventError, Result};
use crate::event::Event;
use crate::protocol::{
    finish_logged, Context, FinishGuard, Receiver, Requester, Responder, ResponseFn, Sender,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Upper bound for [`Client::with_concurrency`]
pub const MAX_CONCURRENCY: usize = 65_536;

/// Handles one inbound event, optionally producing a reply
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, cx: &Context, event: Event) -> Result<Option<Event>>;
}

/// [`EventHandler`] backed by an async closure
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into an [`EventHandler`]
///
/// ```
/// use a3s_cloudevents::client::handler_fn;
///
/// let handler = handler_fn(|_cx, event| async move {
///     tracing::info!(event_id = %event.id(), "got event");
///     Ok::<_, a3s_cloudevents::CloudEventError>(None)
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Event>>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Event>>> + Send,
{
    async fn handle(&self, cx: &Context, event: Event) -> Result<Option<Event>> {
        (self.f)(cx.clone(), event).await
    }
}

/// Fills in attributes before an event is validated and sent
pub type EventDefaulter = Arc<dyn Fn(&mut Event) + Send + Sync>;

/// Give events without an id a random UUID
pub fn default_id_to_uuid(event: &mut Event) {
    if event.id().is_empty() {
        event.set_id(uuid::Uuid::new_v4().to_string());
    }
}

/// Give events without a time the current time
pub fn default_time_to_now(event: &mut Event) {
    if event.time().is_none() {
        event.set_time(chrono::Utc::now());
    }
}

/// Where [`Client::start_receiver`] reads messages from
#[derive(Clone)]
pub enum Inbound {
    /// Messages are finished with the handler's outcome
    Receiver(Arc<dyn Receiver>),
    /// The handler's reply event is written back
    Responder(Arc<dyn Responder>),
}

impl Inbound {
    pub fn receiver(receiver: impl Receiver + 'static) -> Self {
        Self::Receiver(Arc::new(receiver))
    }

    pub fn responder(responder: impl Responder + 'static) -> Self {
        Self::Responder(Arc::new(responder))
    }

    async fn next(&self, cx: &Context) -> Result<Option<(BoxMessage, Option<ResponseFn>)>> {
        match self {
            Inbound::Receiver(r) => Ok(r.receive(cx).await?.map(|m| (m, None))),
            Inbound::Responder(r) => Ok(r.respond(cx).await?.map(|(m, reply)| (m, Some(reply)))),
        }
    }
}

/// High-level event client
///
/// ```
/// use a3s_cloudevents::client::Client;
/// use a3s_cloudevents::protocol::{memory, Context};
/// use a3s_cloudevents::Event;
///
/// # async fn example() -> a3s_cloudevents::Result<()> {
/// let (tx, _rx) = memory::channel(8);
/// let client = Client::new().with_sender(tx).with_default_defaulters();
///
/// let mut event = Event::new();
/// event.set_type("com.example.created");
/// event.set_source("/example");
/// client.send(&Context::new(), event).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    sender: Option<Arc<dyn Sender>>,
    requester: Option<Arc<dyn Requester>>,
    defaulters: Vec<EventDefaulter>,
    transformers: Vec<Arc<dyn TransformerFactory>>,
    concurrency: usize,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sender", &self.sender.is_some())
            .field("requester", &self.requester.is_some())
            .field("defaulters", &self.defaulters.len())
            .field("transformers", &self.transformers.len())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            sender: None,
            requester: None,
            defaulters: Vec::new(),
            transformers: Vec::new(),
            concurrency: 1,
        }
    }

    pub fn with_sender(mut self, sender: impl Sender + 'static) -> Self {
        self.sender = Some(Arc::new(sender));
        self
    }

    pub fn with_requester(mut self, requester: impl Requester + 'static) -> Self {
        self.requester = Some(Arc::new(requester));
        self
    }

    pub fn with_defaulter(mut self, defaulter: impl Fn(&mut Event) + Send + Sync + 'static) -> Self {
        self.defaulters.push(Arc::new(defaulter));
        self
    }

    /// Add [`default_id_to_uuid`] and [`default_time_to_now`]
    pub fn with_default_defaulters(self) -> Self {
        self.with_defaulter(default_id_to_uuid)
            .with_defaulter(default_time_to_now)
    }

    /// Apply a transformer to every outgoing event
    pub fn with_transformer(mut self, transformer: impl TransformerFactory + 'static) -> Self {
        self.transformers.push(Arc::new(transformer));
        self
    }

    /// Handle up to `n` inbound messages at once (default 1, in order)
    ///
    /// Clamped to [`MAX_CONCURRENCY`].
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    fn prepare(&self, mut event: Event) -> Result<Event> {
        for defaulter in &self.defaulters {
            defaulter(&mut event);
        }
        event.validate()?;
        Ok(event)
    }

    fn transformer_refs(&self) -> Vec<&dyn TransformerFactory> {
        self.transformers.iter().map(|t| t.as_ref()).collect()
    }

    /// Default, validate and send an event
    pub async fn send(&self, cx: &Context, event: Event) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CloudEventError::Config("client has no sender".to_string()))?;
        let event = self.prepare(event)?;
        tracing::debug!(event_id = %event.id(), ty = %event.ty(), "Sending event");
        sender
            .send(cx, Box::new(EventMessage::new(event)), &self.transformer_refs())
            .await
    }

    /// Send an event and read the reply
    ///
    /// `Ok(None)` when the peer accepted the event without replying with one.
    pub async fn request(&self, cx: &Context, event: Event) -> Result<Option<Event>> {
        let requester = self
            .requester
            .as_ref()
            .ok_or_else(|| CloudEventError::Config("client has no requester".to_string()))?;
        let event = self.prepare(event)?;
        tracing::debug!(event_id = %event.id(), ty = %event.ty(), "Requesting");
        let reply = requester
            .request(cx, Box::new(EventMessage::new(event)), &self.transformer_refs())
            .await?;

        let mut guard = FinishGuard::new(reply);
        if guard.encoding() == crate::binding::Encoding::Unknown {
            guard.finish(None)?;
            return Ok(None);
        }
        match guard.to_event() {
            Ok(event) => {
                guard.finish(None)?;
                Ok(Some(event))
            }
            Err(e) => {
                guard.finish(Some(&e))?;
                Err(e)
            }
        }
    }

    /// Run `handler` over inbound messages until the source closes or `cx`
    /// is cancelled
    ///
    /// Returns the first receive error. In-flight handlers are awaited
    /// before returning.
    pub async fn start_receiver(
        &self,
        cx: &Context,
        inbound: Inbound,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let dispatch = Dispatch {
            handler,
            defaulters: Arc::new(self.defaulters.clone()),
        };
        let permits = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(concurrency = self.concurrency, "Receiver started");

        let outcome = loop {
            let (message, reply) = match inbound.next(cx).await {
                Ok(Some(next)) => next,
                Ok(None) => break Ok(()),
                Err(CloudEventError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            };

            if self.concurrency == 1 {
                dispatch.run(cx, message, reply).await;
                continue;
            }
            let permit = match cx
                .run(async {
                    permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| CloudEventError::Config(e.to_string()))
                })
                .await
            {
                Ok(permit) => permit,
                Err(e) => {
                    let mut message = message;
                    finish_logged(&mut message, Some(&e));
                    break Ok(());
                }
            };
            let dispatch = dispatch.clone();
            let cx = cx.clone();
            tokio::spawn(async move {
                dispatch.run(&cx, message, reply).await;
                drop(permit);
            });
        };

        if self.concurrency > 1 {
            drain(&permits, self.concurrency).await;
        }
        tracing::info!("Receiver stopped");
        outcome
    }
}

/// Wait until every spawned handler has given its permit back
async fn drain(permits: &Semaphore, concurrency: usize) {
    let n = match u32::try_from(concurrency) {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(concurrency, "Concurrency exceeds the permit range; not waiting for handlers");
            return;
        }
    };
    if let Err(e) = permits.acquire_many(n).await {
        tracing::warn!(error = %e, "Could not wait for in-flight handlers");
    }
}

#[derive(Clone)]
struct Dispatch {
    handler: Arc<dyn EventHandler>,
    defaulters: Arc<Vec<EventDefaulter>>,
}

impl Dispatch {
    async fn run(&self, cx: &Context, mut message: BoxMessage, reply: Option<ResponseFn>) {
        let decoded = to_event(message.as_mut()).and_then(|event| {
            event.validate()?;
            Ok(event)
        });
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable message");
                finish_logged(&mut message, Some(&e));
                if let Some(reply) = reply {
                    if let Err(e) = reply.respond(None, Err(e)).await {
                        tracing::warn!(error = %e, "Failed to send response");
                    }
                }
                return;
            }
        };

        let event_id = event.id().to_string();
        let result = self.handler.handle(cx, event).await;
        if let Err(e) = &result {
            tracing::warn!(%event_id, error = %e, "Handler failed");
        }

        let Some(reply) = reply else {
            if let Ok(Some(_)) = &result {
                tracing::debug!(%event_id, "Handler reply dropped; transport cannot respond");
            }
            finish_logged(&mut message, result.as_ref().err());
            return;
        };

        let (response, outcome) = match result {
            Ok(Some(mut out)) => {
                for defaulter in self.defaulters.iter() {
                    defaulter(&mut out);
                }
                match out.validate() {
                    Ok(()) => (Some(Box::new(EventMessage::new(out)) as BoxMessage), Ok(())),
                    Err(e) => (None, Err(e)),
                }
            }
            Ok(None) => (None, Ok(())),
            Err(e) => (None, Err(e)),
        };
        finish_logged(&mut message, outcome.as_ref().err());
        if let Err(e) = reply.respond(response, outcome).await {
            tracing::warn!(%event_id, error = %e, "Failed to send response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::memory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(ty: &str) -> Event {
        let mut e = Event::new();
        e.set_type(ty);
        e.set_source("/client/test");
        e
    }

    #[tokio::test]
    async fn test_send_applies_defaulters_and_validates() {
        let (tx, rx) = memory::channel(4);
        let client = Client::new().with_sender(tx).with_default_defaulters();
        let cx = Context::new();

        client.send(&cx, event("created")).await.unwrap();
        let mut m = rx.receive(&cx).await.unwrap().unwrap();
        let got = to_event(m.as_mut()).unwrap();
        assert!(!got.id().is_empty());
        assert!(got.time().is_some());

        // no id defaulter: validation fails before sending
        let bare = Client::new().with_sender(memory::channel(1).0);
        assert!(matches!(
            bare.send(&cx, event("created")).await,
            Err(CloudEventError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_sender() {
        let client = Client::new();
        let err = client.send(&Context::new(), event("t")).await.unwrap_err();
        assert!(matches!(err, CloudEventError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_receiver_runs_handler_until_close() {
        let (tx, rx) = memory::channel(4);
        let sender = Client::new().with_sender(tx).with_default_defaulters();
        let cx = Context::new();
        for ty in ["a", "b", "c"] {
            sender.send(&cx, event(ty)).await.unwrap();
        }
        drop(sender);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let handler = handler_fn(move |_cx, event: Event| {
            let record = record.clone();
            async move {
                record.lock().unwrap().push(event.ty().to_string());
                Ok::<_, CloudEventError>(None)
            }
        });

        Client::new()
            .start_receiver(&cx, Inbound::receiver(rx), Arc::new(handler))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_start_receiver_stops_on_cancel() {
        let (_tx, rx) = memory::channel(1);
        let cx = Context::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handler = handler_fn(move |_cx, _event| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CloudEventError>(None) }
        });

        let stopper = cx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stopper.cancel();
        });
        Client::new()
            .with_concurrency(4)
            .start_receiver(&cx, Inbound::receiver(rx), Arc::new(handler))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrency_is_clamped() {
        assert_eq!(Client::new().with_concurrency(0).concurrency, 1);
        assert_eq!(Client::new().with_concurrency(usize::MAX).concurrency, MAX_CONCURRENCY);
    }

    #[tokio::test]
    async fn test_concurrent_receiver_waits_for_handlers() {
        let (tx, rx) = memory::channel(8);
        let sender = Client::new().with_sender(tx).with_default_defaulters();
        let cx = Context::new();
        for _ in 0..6 {
            sender.send(&cx, event("slow")).await.unwrap();
        }
        drop(sender);

        let done = Arc::new(AtomicUsize::new(0));
        let counted = done.clone();
        let handler = handler_fn(move |_cx, _event| {
            let counted = counted.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CloudEventError>(None)
            }
        });

        Client::new()
            .with_concurrency(3)
            .start_receiver(&cx, Inbound::receiver(rx), Arc::new(handler))
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }
}
