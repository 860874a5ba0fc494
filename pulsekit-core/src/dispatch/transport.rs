//! Transport: the single-request HTTP capability used by the drain loop

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::request::{Payload, Request};

/// Boxed future returned by [`Transport::send`]
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Sends one request to the collection endpoint.
///
/// Resolves to the response body on success and [`Error::Transport`]
/// otherwise. Delivery is at-least-once: the drain loop may send the same
/// request again after a failure the server actually processed.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a Request) -> SendFuture<'a>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let base_url = server.base_url()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(server.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// POST target for requests whose payload is a body
    pub fn endpoint(&self) -> String {
        format!("{}/i", self.base_url)
    }

    async fn deliver(&self, request: &Request) -> Result<String> {
        let builder = match &request.payload {
            Payload::Get { url } => self.http_client.get(url),
            Payload::Post { body } => self.http_client.post(self.endpoint()).body(body.clone()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        if status.is_success() {
            Ok(text)
        } else {
            Err(Error::Transport(format!("server error ({}): {}", status, text)))
        }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a Request) -> SendFuture<'a> {
        Box::pin(self.deliver(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let server = ServerConfig {
            url: Some("https://collect.example.com/".to_string()),
            app_key: Some("key".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&server).unwrap();
        assert_eq!(transport.endpoint(), "https://collect.example.com/i");
    }

    #[test]
    fn test_requires_server_url() {
        assert!(matches!(
            HttpTransport::new(&ServerConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
