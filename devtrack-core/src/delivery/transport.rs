//! One delivery attempt against the collector endpoint

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Classified result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The collector accepted the payload
    Delivered,
    /// Anything else; the payload should be retried later
    TransientFailure(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Delivers one serialized payload and classifies the result.
///
/// Implementations never fail: every error is folded into
/// [`DeliveryOutcome::TransientFailure`].
pub trait Transport: Send + Sync {
    fn attempt(&self, body: &[u8]) -> impl Future<Output = DeliveryOutcome> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn attempt(&self, body: &[u8]) -> impl Future<Output = DeliveryOutcome> + Send {
        (**self).attempt(body)
    }
}

/// HTTP POST transport for the collector
pub struct HttpTransport {
    uri: String,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport posting to `uri` with a per-request timeout
    pub fn new(uri: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            uri: uri.into(),
            http_client,
        })
    }

    /// Build a transport from the server section.
    ///
    /// Returns `None` when no endpoint url is configured.
    pub fn from_config(config: &ServerConfig) -> Result<Option<Self>> {
        match config.uri() {
            Some(uri) => Ok(Some(Self::new(uri, config.timeout())?)),
            None => Ok(None),
        }
    }

    /// Endpoint this transport posts to
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Transport for HttpTransport {
    fn attempt(&self, body: &[u8]) -> impl Future<Output = DeliveryOutcome> + Send {
        // A malformed uri surfaces as an error from `send`.
        let request = self.http_client.post(&self.uri).body(body.to_vec());

        async move {
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        DeliveryOutcome::Delivered
                    } else {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "unknown".to_string());
                        DeliveryOutcome::TransientFailure(format!(
                            "API error ({}): {}",
                            status, error_text
                        ))
                    }
                }
                Err(e) => {
                    DeliveryOutcome::TransientFailure(format!("HTTP request failed: {}", e))
                }
            }
        }
    }
}
