use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, ServerError};
use crate::types::{EventKey, EventStatus, Webhook, WebhookEvent, WebhookId, WebhookStatus};

/// Repository of registered webhooks.
///
/// The server reads webhook records, writes status transitions for
/// operator visibility, and observes operator-driven status updates
/// (re-enables in particular).
#[async_trait]
pub trait WebhookRepo: Send + Sync {
    async fn webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()>;

    /// Stream of `(id, new status)` pairs for every status write.
    async fn subscribe_to_status_updates(&self)
        -> mpsc::UnboundedReceiver<(WebhookId, WebhookStatus)>;
}

/// Repository of webhook events.
///
/// Owns event records and their status lifecycle; the dispatch engine
/// holds events by key and never persists them itself.
#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn create_event(&self, event: WebhookEvent) -> Result<()>;

    /// Records a lifecycle step. Implementations must refuse illegal
    /// transitions with `ServerError::InvalidStateChange`.
    async fn set_event_status(&self, key: EventKey, status: EventStatus) -> Result<()>;

    async fn event(&self, key: EventKey) -> Result<Option<WebhookEvent>>;

    async fn events_with_statuses(&self, statuses: &[EventStatus]) -> Result<Vec<WebhookEvent>>;

    /// Stream of events, starting with a replay of every event currently
    /// in status `New`, followed by all future creations.
    async fn subscribe_to_new_events(&self) -> mpsc::UnboundedReceiver<WebhookEvent>;
}

/// Durable `webhook id → status` store backing the state cache.
/// Key/value semantics, last write wins.
#[async_trait]
pub trait StateRepo: Send + Sync {
    async fn status(&self, id: WebhookId) -> Result<Option<WebhookStatus>>;

    async fn put_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()>;
}

/// In-memory webhook repository for embedded deployments and tests.
#[derive(Default)]
pub struct InMemoryWebhookRepo {
    inner: Mutex<WebhookRepoInner>,
}

#[derive(Default)]
struct WebhookRepoInner {
    webhooks: HashMap<WebhookId, Webhook>,
    subscribers: Vec<mpsc::UnboundedSender<(WebhookId, WebhookStatus)>>,
}

impl InMemoryWebhookRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a webhook. Replaces any previous registration with the
    /// same id.
    pub async fn insert(&self, webhook: Webhook) {
        let mut inner = self.inner.lock().await;
        inner.webhooks.insert(webhook.id, webhook);
    }
}

#[async_trait]
impl WebhookRepo for InMemoryWebhookRepo {
    async fn webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let inner = self.inner.lock().await;
        Ok(inner.webhooks.get(&id).cloned())
    }

    async fn set_webhook_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.webhooks.get_mut(&id) {
            Some(webhook) => webhook.status = status,
            None => return Err(ServerError::repo(format!("unknown webhook {id}"))),
        }
        inner.subscribers.retain(|tx| tx.send((id, status)).is_ok());
        Ok(())
    }

    async fn subscribe_to_status_updates(
        &self,
    ) -> mpsc::UnboundedReceiver<(WebhookId, WebhookStatus)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.subscribers.push(tx);
        rx
    }
}

/// In-memory event repository for embedded deployments and tests.
///
/// Enforces the event lifecycle on every status write and fans new events
/// out to subscribers.
#[derive(Default)]
pub struct InMemoryEventRepo {
    inner: Mutex<EventRepoInner>,
}

#[derive(Default)]
struct EventRepoInner {
    events: HashMap<EventKey, WebhookEvent>,
    order: Vec<EventKey>,
    subscribers: Vec<mpsc::UnboundedSender<WebhookEvent>>,
}

impl InMemoryEventRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepo for InMemoryEventRepo {
    async fn create_event(&self, event: WebhookEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.events.contains_key(&event.key) {
            return Err(ServerError::repo(format!("duplicate event key {}", event.key)));
        }
        inner.order.push(event.key);
        inner.events.insert(event.key, event.clone());
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn set_event_status(&self, key: EventKey, status: EventStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .get_mut(&key)
            .ok_or_else(|| ServerError::repo(format!("unknown event {key}")))?;

        if !event.status.can_transition_to(status) {
            return Err(ServerError::InvalidStateChange {
                key,
                from: event.status,
                to: status,
            });
        }
        event.status = status;
        Ok(())
    }

    async fn event(&self, key: EventKey) -> Result<Option<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(&key).cloned())
    }

    async fn events_with_statuses(&self, statuses: &[EventStatus]) -> Result<Vec<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|key| inner.events.get(key))
            .filter(|event| statuses.contains(&event.status))
            .cloned()
            .collect())
    }

    async fn subscribe_to_new_events(&self) -> mpsc::UnboundedReceiver<WebhookEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        // Replay current New events before any future creation can be
        // observed, under the same lock that guards create_event.
        for key in &inner.order {
            if let Some(event) = inner.events.get(key) {
                if event.status == EventStatus::New {
                    let _ = tx.send(event.clone());
                }
            }
        }
        inner.subscribers.push(tx);
        rx
    }
}

/// In-memory state store for embedded deployments and tests.
#[derive(Default)]
pub struct InMemoryStateRepo {
    statuses: Mutex<HashMap<WebhookId, WebhookStatus>>,
}

impl InMemoryStateRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepo for InMemoryStateRepo {
    async fn status(&self, id: WebhookId) -> Result<Option<WebhookStatus>> {
        Ok(self.statuses.lock().await.get(&id).copied())
    }

    async fn put_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        self.statuses.lock().await.insert(id, status);
        Ok(())
    }
}
