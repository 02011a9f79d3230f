use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook ids with other numeric identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub u64);

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an event, unique within its webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique key for an event: the event id paired with its webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub event_id: EventId,
    pub webhook_id: WebhookId,
}

impl EventKey {
    pub fn new(event_id: u64, webhook_id: u64) -> Self {
        Self {
            event_id: EventId(event_id),
            webhook_id: WebhookId(webhook_id),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.event_id, self.webhook_id)
    }
}

/// Whether events for a webhook are sent one request per event or
/// accumulated into batched requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Batching {
    Single,
    Batched,
}

/// Delivery guarantee chosen for a webhook.
///
/// `AtMostOnce` sends each event once and never retries; `AtLeastOnce`
/// retries failed deliveries until they succeed or the webhook is given up
/// on, so receivers may observe duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantics {
    AtMostOnce,
    AtLeastOnce,
}

/// The delivery contract for a webhook: batching crossed with semantics.
///
/// The mode is immutable for the webhook's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMode {
    pub batching: Batching,
    pub semantics: Semantics,
}

impl DeliveryMode {
    pub fn single_at_most_once() -> Self {
        Self { batching: Batching::Single, semantics: Semantics::AtMostOnce }
    }

    pub fn single_at_least_once() -> Self {
        Self { batching: Batching::Single, semantics: Semantics::AtLeastOnce }
    }

    pub fn batched_at_most_once() -> Self {
        Self { batching: Batching::Batched, semantics: Semantics::AtMostOnce }
    }

    pub fn batched_at_least_once() -> Self {
        Self { batching: Batching::Batched, semantics: Semantics::AtLeastOnce }
    }

    pub fn is_batched(&self) -> bool {
        self.batching == Batching::Batched
    }

    pub fn is_at_least_once(&self) -> bool {
        self.semantics == Semantics::AtLeastOnce
    }
}

/// Current status of a webhook.
///
/// `Retrying` and `Unavailable` carry the time the webhook entered the
/// state. Exactly one variant is active at a time; transitions into
/// `Retrying` and `Unavailable` are driven by the retry controller, while
/// `Enabled` and `Disabled` are operator-controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookStatus {
    /// Deliveries flow normally.
    Enabled,

    /// Operator has paused the webhook. Events are not delivered and not
    /// queued.
    Disabled,

    /// At least one delivery has failed and the retry controller is
    /// working through the backlog.
    Retrying { since: SystemTime },

    /// The webhook failed continuously past the failure horizon and has
    /// been given up on until an operator re-enables it.
    Unavailable { since: SystemTime },
}

impl WebhookStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, WebhookStatus::Enabled)
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, WebhookStatus::Retrying { .. })
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookStatus::Enabled => write!(f, "enabled"),
            WebhookStatus::Disabled => write!(f, "disabled"),
            WebhookStatus::Retrying { .. } => write!(f, "retrying"),
            WebhookStatus::Unavailable { .. } => write!(f, "unavailable"),
        }
    }
}

/// Destination for event delivery.
///
/// A `Webhook` describes *where* and *under which contract* events should
/// be delivered. It is a pure configuration object; mutable state (status)
/// lives in the repositories and the server's state cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Logical identifier for the webhook.
    pub id: WebhookId,

    /// Target URL for deliveries. Must be non-empty.
    pub url: String,

    /// Human-readable label.
    pub label: String,

    /// Status at registration time. The live status is tracked by the
    /// server's state cache once delivery starts.
    pub status: WebhookStatus,

    /// Delivery contract. Immutable for the webhook's lifetime.
    pub delivery_mode: DeliveryMode,

    /// Optional secret for HMAC signing of outgoing requests.
    pub secret: Option<Vec<u8>>,

    /// Signature header name.
    pub signature_header: String,

    /// Timestamp header name.
    pub timestamp_header: String,
}

impl Webhook {
    /// Create an enabled webhook with default signing settings.
    pub fn new(id: u64, url: impl Into<String>, delivery_mode: DeliveryMode) -> Self {
        Self {
            id: WebhookId(id),
            url: url.into(),
            label: String::new(),
            status: WebhookStatus::Enabled,
            delivery_mode,
            secret: None,
            signature_header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
        }
    }

    /// Set a human-readable label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the registration-time status.
    pub fn with_status(mut self, status: WebhookStatus) -> Self {
        self.status = status;
        self
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Customize the signature header name.
    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    /// Customize the timestamp header name.
    pub fn with_timestamp_header(mut self, header: impl Into<String>) -> Self {
        self.timestamp_header = header.into();
        self
    }
}

/// Delivery lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    New,
    Delivering,
    Delivered,
    Failed,
}

impl EventStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// The lifecycle is `New → Delivering → {Delivered, Failed}` with
    /// `Failed → Delivering` allowed for retries. Repeats are illegal;
    /// `Delivered` is terminal.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::New, EventStatus::Delivering)
                | (EventStatus::Delivering, EventStatus::Delivered)
                | (EventStatus::Delivering, EventStatus::Failed)
                | (EventStatus::Failed, EventStatus::Delivering)
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::New => write!(f, "new"),
            EventStatus::Delivering => write!(f, "delivering"),
            EventStatus::Delivered => write!(f, "delivered"),
            EventStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An event addressed to a webhook.
///
/// The server treats the content as an opaque string. Headers are an
/// ordered multimap; names may repeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Globally unique key.
    pub key: EventKey,

    /// Delivery lifecycle status.
    pub status: EventStatus,

    /// Opaque payload. Immutable once created.
    pub content: String,

    /// Ordered headers, sent verbatim on single dispatches.
    pub headers: Vec<(String, String)>,
}

impl WebhookEvent {
    /// Create a new event with status `New` and no headers.
    pub fn new(key: EventKey, content: impl Into<String>) -> Self {
        Self {
            key,
            status: EventStatus::New,
            content: content.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn webhook_id(&self) -> WebhookId {
        self.key.webhook_id
    }

    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("Accept")
    }
}

/// An outgoing HTTP request built by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Response to a delivery request. Only the status code matters to the
/// dispatch engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }
}
