//! In-process channel transport
//!
//! Messages are buffered on send, so the sender finishes its input
//! immediately and the receiver gets an independent copy. Order is
//! preserved.

use super::{settle, Context, Receiver, Sender};
use crate::binding::{self, copy_message, BoxMessage, EventBuilder, EventMessage, TransformerFactory};
use crate::error::{CloudEventError, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Create a connected sender/receiver pair
pub fn channel(capacity: usize) -> (ChanSender, ChanReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChanSender { tx }, ChanReceiver { rx: Mutex::new(rx) })
}

/// Sending half; cloneable
#[derive(Debug, Clone)]
pub struct ChanSender {
    tx: mpsc::Sender<BoxMessage>,
}

/// Receiving half; yields `None` once every sender is dropped
#[derive(Debug)]
pub struct ChanReceiver {
    rx: Mutex<mpsc::Receiver<BoxMessage>>,
}

fn buffer(
    cx: &Context,
    message: &mut BoxMessage,
    transformers: &[&dyn TransformerFactory],
) -> Result<BoxMessage> {
    if transformers.is_empty() {
        return Ok(Box::new(copy_message(message.as_mut())?));
    }
    let mut builder = EventBuilder::new();
    binding::write(message.as_mut(), None, Some(&mut builder), transformers, cx.options())?;
    Ok(Box::new(EventMessage::new(builder.into_event())))
}

#[async_trait]
impl Sender for ChanSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match buffer(cx, &mut message, transformers) {
            Ok(copy) => {
                cx.run(async {
                    self.tx
                        .send(copy)
                        .await
                        .map_err(|_| CloudEventError::transport("memory", "channel closed"))
                })
                .await
            }
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

#[async_trait]
impl Receiver for ChanReceiver {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let mut rx = cx.run(async { Ok(self.rx.lock().await) }).await?;
        cx.run(async { Ok(rx.recv().await) }).await
    }
}
