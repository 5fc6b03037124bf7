//! HTTP client: sender and requester over `reqwest`

use super::message::HttpMessage;
use super::status_error;
use super::write::write_parts;
use crate::binding::{BoxMessage, TransformerFactory};
use crate::error::{CloudEventError, Result};
use crate::protocol::{finish_logged, settle, Context, Requester, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpClientConfig {
    /// Target URL for every request
    pub url: String,

    /// Whole-request timeout in seconds (0 = none)
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/".to_string(),
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

/// Sends events as HTTP POST requests
///
/// A non-2xx response is reported as [`CloudEventError::Status`] carrying
/// the response body.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    target: http::Uri,
    config: HttpClientConfig,
}

impl HttpSender {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        let client = builder
            .build()
            .map_err(|e| CloudEventError::transport("http", e))?;
        Self::with_client(client, config)
    }

    /// Use an existing `reqwest` client (shared pool, custom TLS, …)
    pub fn with_client(client: reqwest::Client, config: HttpClientConfig) -> Result<Self> {
        let target: http::Uri = config
            .url
            .parse()
            .map_err(|e| CloudEventError::Config(format!("invalid target url '{}': {}", config.url, e)))?;
        Ok(Self {
            client,
            target,
            config,
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Encode, post and collect the response; the caller finishes `message`
    async fn round_trip(
        &self,
        cx: &Context,
        message: &mut BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<http::Response<Bytes>> {
        let (encoding, headers, body) = write_parts(message.as_mut(), transformers, cx.options())?;

        let mut request = http::Request::post(self.target.clone())
            .body(body)
            .map_err(|e| CloudEventError::transport("http", e))?;
        *request.headers_mut() = headers;
        let request = reqwest::Request::try_from(request).map_err(|e| CloudEventError::transport("http", e))?;

        tracing::debug!(%encoding, url = %self.target, "Sending HTTP request");

        cx.run(async {
            let response = self
                .client
                .execute(request)
                .await
                .map_err(|e| CloudEventError::transport("http", e))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| CloudEventError::transport("http", e))?;
            let mut out = http::Response::new(body);
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<()> {
        let outcome = match self.round_trip(cx, &mut message, transformers).await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status();
                tracing::debug!(status = status.as_u16(), "HTTP request rejected");
                Err(status_error(status, response.into_body()))
            }
            Err(e) => Err(e),
        };
        settle(&mut message, outcome)
    }
}

#[async_trait]
impl Requester for HttpSender {
    async fn request(
        &self,
        cx: &Context,
        mut message: BoxMessage,
        transformers: &[&dyn TransformerFactory],
    ) -> Result<BoxMessage> {
        match self.round_trip(cx, &mut message, transformers).await {
            Ok(response) if response.status().is_success() => {
                finish_logged(&mut message, None);
                Ok(Box::new(HttpMessage::from_response(response)))
            }
            Ok(response) => {
                let e = status_error(response.status(), response.into_body());
                finish_logged(&mut message, Some(&e));
                Err(e)
            }
            Err(e) => {
                finish_logged(&mut message, Some(&e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_camel_case() {
        let config: HttpClientConfig =
            serde_json::from_str(r#"{"url":"http://example.com/events","requestTimeoutSecs":0}"#).unwrap();
        assert_eq!(config.url, "http://example.com/events");
        assert_eq!(config.request_timeout_secs, 0);
        assert_eq!(config.connect_timeout_secs, 5);
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let config = HttpClientConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(HttpSender::new(config), Err(CloudEventError::Config(_))));
    }
}
