use std::fmt;

use thiserror::Error;

use crate::types::{EventKey, EventStatus, WebhookId};

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Structural errors surfaced on the server's error channel.
///
/// None of these terminate the engine; they are published to observers and
/// delivery continues. Only an explicit `shutdown()` stops the server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServerError {
    /// An event referenced a webhook that does not exist. The event is
    /// dropped.
    #[error("webhook {0} does not exist")]
    MissingWebhook(WebhookId),

    /// A webhook exhausted its failure horizon and was transitioned to
    /// unavailable. Its retry queue has been discarded.
    #[error("webhook {0} has become unavailable")]
    WebhookUnavailable(WebhookId),

    /// A repository refused a status transition, or the configuration
    /// cannot support the webhook's delivery mode.
    #[error("refused status change for event {key}: {from} -> {to}")]
    InvalidStateChange {
        key: EventKey,
        from: EventStatus,
        to: EventStatus,
    },

    /// An underlying repository operation failed.
    #[error("repository error: {0}")]
    Repo(String),

    /// An HTTP delivery failed below the protocol level (connect, timeout,
    /// IO). Non-2xx responses are delivery outcomes, not errors.
    #[error("http error: {0}")]
    Http(String),

    /// An invariant inside the dispatch engine was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Creates a repository error from a message.
    pub fn repo(message: impl Into<String>) -> Self {
        Self::Repo(message.into())
    }

    /// Creates an HTTP transport error from a message.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http(message.into())
    }

    /// Creates an internal invariant error from a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the operation that produced this error is worth repeating.
    ///
    /// Only repository failures are; refused transitions and missing
    /// webhooks will refuse again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Repo(_))
    }
}

/// Final outcome of a single dispatch attempt (one request, covering one
/// event or one batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The endpoint acknowledged with a 2xx status.
    Delivered,

    /// The attempt failed; events were marked `Failed`.
    Failed(FailureKind),
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered)
    }
}

/// Reasons why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The request timed out.
    Timeout,

    /// Connection or IO failure before a response arrived.
    Network,

    /// The endpoint responded outside [200, 299].
    ErrorStatus(u16),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "request timed out"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::ErrorStatus(status) => write!(f, "endpoint returned {}", status),
        }
    }
}

/// Publishing side of the server's error channel.
///
/// Sends never block and never fail: with no subscribers the error is
/// dropped, and lagging subscribers lose the oldest entries.
#[derive(Clone)]
pub(crate) struct ErrorSink {
    tx: tokio::sync::broadcast::Sender<ServerError>,
}

impl ErrorSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(buffer);
        Self { tx }
    }

    pub fn publish(&self, error: ServerError) {
        tracing::warn!(error = %error, "structural error");
        let _ = self.tx.send(error);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ServerError> {
        self.tx.subscribe()
    }
}
