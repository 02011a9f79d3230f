use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{StateRepo, WebhookRepo};
use crate::types::{Webhook, WebhookId, WebhookStatus};

/// Write-through cache of per-webhook status.
///
/// Reads prefer the cache, then the state repo, then the webhook record
/// itself. Writes land in the state repo first; the cache is only updated
/// once the repo write succeeds, and the webhook repo is mirrored last so
/// operators see transitions.
pub(crate) struct WebhookStateCache {
    webhooks: Arc<dyn WebhookRepo>,
    states: Arc<dyn StateRepo>,
    cache: RwLock<HashMap<WebhookId, WebhookStatus>>,
}

impl WebhookStateCache {
    pub fn new(webhooks: Arc<dyn WebhookRepo>, states: Arc<dyn StateRepo>) -> Self {
        Self {
            webhooks,
            states,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the live status of a webhook.
    pub async fn status_of(&self, webhook: &Webhook) -> Result<WebhookStatus> {
        {
            let cache = self.cache.read().await;
            if let Some(status) = cache.get(&webhook.id) {
                return Ok(*status);
            }
        }

        let status = match self.states.status(webhook.id).await? {
            Some(status) => status,
            None => webhook.status,
        };

        self.cache.write().await.insert(webhook.id, status);
        Ok(status)
    }

    /// Persist and cache a status transition, then mirror it to the
    /// webhook repo for operator visibility.
    pub async fn set_status(&self, id: WebhookId, status: WebhookStatus) -> Result<()> {
        self.states.put_status(id, status).await?;
        self.cache.write().await.insert(id, status);
        self.webhooks.set_webhook_status(id, status).await
    }

    /// Update the cache only, for status changes observed from the
    /// webhook repo's own update stream. Returns the previously cached
    /// status, if any.
    pub async fn observe(&self, id: WebhookId, status: WebhookStatus) -> Option<WebhookStatus> {
        self.cache.write().await.insert(id, status)
    }
}
