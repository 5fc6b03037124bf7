//! HTTP server: receiver and responder over `hyper`
//!
//! Every request is served on its own task, which parks until the
//! application finishes the message (receiver) or uses the reply slot
//! (responder). Only then is the HTTP response written, so the client sees
//! the processing outcome.

use super::message::HttpMessage;
use super::write::write_parts;
use crate::binding::{BoxMessage, Finisher, PipelineOptions};
use crate::error::{CloudEventError, Result};
use crate::protocol::{finish_logged, Context, Receiver, Responder, ResponseFn};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpServerConfig {
    /// Listen address; port 0 picks a free port
    pub bind_addr: String,

    /// Only accept requests on this path (None = any path)
    pub path: Option<String>,

    /// Grace period for in-flight requests on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path: None,
            shutdown_timeout_secs: 5,
        }
    }
}

/// What the application decided for one request
#[derive(Debug)]
enum Outcome {
    Finished(Option<String>),
    Reply {
        parts: Option<(HeaderMap, Bytes)>,
        error: Option<String>,
    },
}

struct Inbound {
    message: HttpMessage,
    reply: oneshot::Sender<Outcome>,
}

/// Receives events from HTTP requests
pub struct HttpServer {
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<Inbound>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl HttpServer {
    /// Bind the listener and start accepting connections
    pub async fn bind(config: HttpServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| CloudEventError::transport("http", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CloudEventError::transport("http", e))?;

        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(listener, tx, config, shutdown.clone()));

        tracing::info!(addr = %local_addr, "HTTP server listening");

        Ok(Self {
            local_addr,
            incoming: Mutex::new(rx),
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drain in-flight requests, then close
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| CloudEventError::transport("http", e))?;
        }
        Ok(())
    }

    async fn next(&self, cx: &Context) -> Result<Option<Inbound>> {
        let mut incoming = cx.run(async { Ok(self.incoming.lock().await) }).await?;
        cx.run(async { Ok(incoming.recv().await) }).await
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Receiver for HttpServer {
    async fn receive(&self, cx: &Context) -> Result<Option<BoxMessage>> {
        let Some(Inbound { message, reply }) = self.next(cx).await? else {
            return Ok(None);
        };
        let finisher = Finisher::new(move |error| {
            if reply.send(Outcome::Finished(error.map(|e| e.to_string()))).is_err() {
                tracing::debug!("HTTP client went away before the message was finished");
            }
            Ok(())
        });
        Ok(Some(Box::new(message.with_finisher(finisher))))
    }
}

#[async_trait]
impl Responder for HttpServer {
    async fn respond(&self, cx: &Context) -> Result<Option<(BoxMessage, ResponseFn)>> {
        let Some(Inbound { message, reply }) = self.next(cx).await? else {
            return Ok(None);
        };
        let options = *cx.options();
        let respond = ResponseFn::new(move |response, result| {
            Box::pin(async move {
                let outcome = reply_outcome(response, result, &options);
                reply
                    .send(outcome)
                    .map_err(|_| CloudEventError::transport("http", "client went away before the reply"))
            })
        });
        Ok(Some((Box::new(message), respond)))
    }
}

fn reply_outcome(response: Option<BoxMessage>, result: Result<()>, options: &PipelineOptions) -> Outcome {
    if let Err(e) = result {
        return Outcome::Reply {
            parts: None,
            error: Some(e.to_string()),
        };
    }
    let Some(mut message) = response else {
        return Outcome::Reply {
            parts: None,
            error: None,
        };
    };
    match write_parts(message.as_mut(), &[], options) {
        Ok((_, headers, body)) => {
            finish_logged(&mut message, None);
            Outcome::Reply {
                parts: Some((headers, body)),
                error: None,
            }
        }
        Err(e) => {
            finish_logged(&mut message, Some(&e));
            Outcome::Reply {
                parts: None,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn serve(
    listener: TcpListener,
    tx: mpsc::Sender<Inbound>,
    config: HttpServerConfig,
    shutdown: CancellationToken,
) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("HTTP accept error: {e}");
                        continue;
                    }
                };
                let tx = tx.clone();
                let path = config.path.clone();
                let svc = hyper::service::service_fn(move |req| handle(req, tx.clone(), path.clone()));
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(%peer, "HTTP connection error: {e}");
                    }
                });
            }
        }
    }

    drop(listener);
    drop(tx);
    let timeout = Duration::from_secs(config.shutdown_timeout_secs);
    tokio::select! {
        _ = graceful.shutdown() => tracing::info!("HTTP server stopped"),
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(timeout_secs = config.shutdown_timeout_secs, "HTTP server shutdown timed out; closing");
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .unwrap_or_default()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap_or_default()
}

async fn handle(
    req: Request<Incoming>,
    tx: mpsc::Sender<Inbound>,
    path: Option<String>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if let Some(path) = path.as_deref() {
        if req.uri().path() != path {
            return Ok(empty(StatusCode::NOT_FOUND));
        }
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(b) => b.to_bytes(),
        Err(e) => return Ok(text(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}"))),
    };

    let message = HttpMessage::new(parts.headers, body);
    tracing::debug!(encoding = %crate::binding::Message::encoding(&message), "HTTP request received");

    let (reply, outcome) = oneshot::channel();
    if tx.send(Inbound { message, reply }).await.is_err() {
        return Ok(text(StatusCode::SERVICE_UNAVAILABLE, "receiver is closed"));
    }

    let response = match outcome.await {
        Ok(Outcome::Finished(None)) => empty(StatusCode::OK),
        Ok(Outcome::Finished(Some(reason))) => text(StatusCode::INTERNAL_SERVER_ERROR, reason),
        Ok(Outcome::Reply { error: Some(reason), .. }) => text(StatusCode::INTERNAL_SERVER_ERROR, reason),
        Ok(Outcome::Reply { parts: Some((headers, body)), .. }) => {
            let mut response = Response::new(Full::new(body));
            *response.headers_mut() = headers;
            response
        }
        Ok(Outcome::Reply { parts: None, .. }) => empty(StatusCode::ACCEPTED),
        Err(_) => {
            tracing::warn!("HTTP message dropped without being finished");
            text(StatusCode::INTERNAL_SERVER_ERROR, "message dropped without being finished")
        }
    };
    Ok(response)
}
