use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, ServerError};
use crate::types::{HttpRequest, HttpResponse};

/// Transport-level delivery failure. Non-2xx responses are *not* errors;
/// they come back as an `HttpResponse` and are classified by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request exceeded the configured timeout.
    Timeout,

    /// Connection or IO failure before a response arrived.
    Network(String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Timeout => write!(f, "request timed out"),
            HttpError::Network(message) => write!(f, "network error: {}", message),
        }
    }
}

impl std::error::Error for HttpError {}

/// Capability for submitting delivery requests.
///
/// Implementations must not retry; retry policy belongs to the dispatch
/// engine.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError>;
}

/// Configuration for the default reqwest-backed client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum time allowed for a single delivery attempt.
    pub timeout: Duration,

    /// User agent string for outgoing requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "webhook-server/0.1".to_string(),
        }
    }
}

/// Default `HttpClient` implementation over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ServerError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let mut builder = self.client.post(&request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => Ok(HttpResponse { status: response.status().as_u16() }),
            Err(e) if e.is_timeout() => Err(HttpError::Timeout),
            Err(e) => Err(HttpError::Network(e.to_string())),
        }
    }
}
