use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::batcher::BatchKey;
use crate::config::RetryConfig;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{DispatchOutcome, ErrorSink, ServerError};
use crate::state::WebhookStateCache;
use crate::types::{Webhook, WebhookEvent, WebhookId, WebhookStatus};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Cap on the backoff exponent so the doubling never overflows before the
/// max-wait clamp applies.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Registry of per-webhook retry controllers.
///
/// A controller is created lazily on the first failed dispatch for a
/// webhook and owns that webhook's FIFO queue of events awaiting retry.
/// Because the controller awaits every attempt before scheduling the next
/// one, a retrying webhook never has more than one dispatch in flight.
#[derive(Clone)]
pub(crate) struct RetrySet {
    shared: Arc<RetryShared>,
}

struct RetryShared {
    config: RetryConfig,
    dispatcher: Arc<Dispatcher>,
    state: Arc<WebhookStateCache>,
    errors: ErrorSink,
    controllers: Mutex<HashMap<WebhookId, mpsc::UnboundedSender<WebhookEvent>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl RetryShared {
    async fn transition(&self, id: WebhookId, status: WebhookStatus) {
        if let Err(error) = self.state.set_status(id, status).await {
            self.errors.publish(error);
        }
    }
}

impl RetrySet {
    pub fn new(
        config: RetryConfig,
        dispatcher: Arc<Dispatcher>,
        state: Arc<WebhookStateCache>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            shared: Arc::new(RetryShared {
                config,
                dispatcher,
                state,
                errors,
                controllers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Hand failed (or newly arrived, if the webhook is already retrying)
    /// events to the webhook's controller, creating it if needed.
    ///
    /// Events join the tail of the existing queue; they never spawn a
    /// parallel attempt.
    pub async fn enqueue(&self, webhook: Arc<Webhook>, events: Vec<WebhookEvent>) {
        let mut controllers = self.shared.controllers.lock().await;
        if let Some(tx) = controllers.get(&webhook.id) {
            for event in events {
                let _ = tx.send(event);
            }
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        controllers.insert(webhook.id, tx);
        drop(controllers);

        metric_inc("webhook.retry.controller_started");
        let shared = self.shared.clone();
        let queue: VecDeque<WebhookEvent> = events.into();
        self.shared
            .tasks
            .lock()
            .await
            .spawn(run_controller(shared, webhook, rx, queue));
    }

    /// Discard a webhook's retry queue, typically because the operator
    /// re-enabled it. The queued events keep their `Failed` status in the
    /// event repo.
    pub async fn cancel(&self, id: WebhookId) {
        if self.shared.controllers.lock().await.remove(&id).is_some() {
            debug!(webhook = %id, "retry queue discarded");
        }
    }

    /// Stop every controller. Controllers wind down at their next await
    /// point; whatever has not finished by the deadline is aborted.
    pub async fn shutdown(&self, drain: Duration) {
        self.shared.controllers.lock().await.clear();

        let mut tasks = self.shared.tasks.lock().await;
        let deadline = Instant::now() + drain;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tasks.shutdown().await;
                break;
            }
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tasks.shutdown().await;
                    break;
                }
            }
        }
    }
}

async fn run_controller(
    shared: Arc<RetryShared>,
    webhook: Arc<Webhook>,
    mut rx: mpsc::UnboundedReceiver<WebhookEvent>,
    mut queue: VecDeque<WebhookEvent>,
) {
    let started = Instant::now();
    shared
        .transition(webhook.id, WebhookStatus::Retrying { since: SystemTime::now() })
        .await;
    info!(webhook = %webhook.id, queued = queue.len(), "webhook entered retry");

    let mut attempts: u32 = 0;
    let mut skip_wait = false;

    loop {
        if !skip_wait {
            let wait = next_wait(&shared.config, attempts);
            debug!(
                webhook = %webhook.id,
                wait_ms = wait.as_millis() as u64,
                attempts,
                "backing off"
            );
            let backoff = sleep(wait);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    () = &mut backoff => break,
                    item = rx.recv() => match item {
                        Some(event) => queue.push_back(event),
                        // Channel closed: cancelled by operator re-enable
                        // or server shutdown. Events keep their Failed
                        // status in the repo.
                        None => return,
                    },
                }
            }
        }
        skip_wait = false;

        while let Ok(event) = rx.try_recv() {
            queue.push_back(event);
        }

        // Batched modes re-dispatch the backlog as one batch, but only as
        // far as the events still share the head's batch key; later
        // arrivals with other keys wait their turn.
        let taken: Vec<WebhookEvent> = if webhook.delivery_mode.is_batched() {
            let mut taken = Vec::new();
            let head_key = queue.front().map(BatchKey::for_event);
            while queue
                .front()
                .is_some_and(|event| Some(BatchKey::for_event(event)) == head_key)
            {
                if let Some(event) = queue.pop_front() {
                    taken.push(event);
                }
            }
            taken
        } else {
            queue.pop_front().into_iter().collect()
        };

        if taken.is_empty() {
            if try_quiesce(&shared, &webhook, &mut rx, &mut queue).await {
                return;
            }
            skip_wait = true;
            continue;
        }

        let mut dispatch = Dispatch {
            webhook: webhook.clone(),
            events: taken,
            batched: webhook.delivery_mode.is_batched(),
        };

        match shared.dispatcher.execute(&mut dispatch).await {
            DispatchOutcome::Delivered => {
                attempts = 0;
                metric_inc("webhook.retry.delivered");
                while let Ok(event) = rx.try_recv() {
                    queue.push_back(event);
                }
                if queue.is_empty() && try_quiesce(&shared, &webhook, &mut rx, &mut queue).await {
                    return;
                }
                // Backlog remains: keep draining without backoff.
                skip_wait = true;
            }
            DispatchOutcome::Failed(kind) => {
                attempts = attempts.saturating_add(1);
                metric_inc("webhook.retry.attempt_failed");
                debug!(webhook = %webhook.id, attempts, error = %kind, "retry attempt failed");

                // Failed events go back to the head, in their original order.
                for event in dispatch.events.into_iter().rev() {
                    queue.push_front(event);
                }

                if started.elapsed() >= shared.config.failure_horizon && !queue.is_empty() {
                    shared.controllers.lock().await.remove(&webhook.id);
                    shared
                        .transition(
                            webhook.id,
                            WebhookStatus::Unavailable { since: SystemTime::now() },
                        )
                        .await;
                    shared.errors.publish(ServerError::WebhookUnavailable(webhook.id));
                    metric_inc("webhook.retry.unavailable");
                    warn!(
                        webhook = %webhook.id,
                        dropped = queue.len(),
                        "failure horizon crossed, webhook unavailable"
                    );
                    return;
                }
            }
        }
    }
}

/// Remove the controller and return the webhook to `Enabled`, unless a
/// last-instant arrival keeps the queue alive.
///
/// Holds the registry lock across the final drain so an `enqueue` cannot
/// slip an event into a channel nobody will read.
async fn try_quiesce(
    shared: &Arc<RetryShared>,
    webhook: &Arc<Webhook>,
    rx: &mut mpsc::UnboundedReceiver<WebhookEvent>,
    queue: &mut VecDeque<WebhookEvent>,
) -> bool {
    let mut controllers = shared.controllers.lock().await;
    while let Ok(event) = rx.try_recv() {
        queue.push_back(event);
    }
    if !queue.is_empty() {
        return false;
    }
    controllers.remove(&webhook.id);
    drop(controllers);

    shared.transition(webhook.id, WebhookStatus::Enabled).await;
    info!(webhook = %webhook.id, "retry queue drained");
    true
}

/// Exponential backoff: `min(base · 2^attempts, max)` plus optional
/// additive jitter.
fn next_wait(config: &RetryConfig, attempts: u32) -> Duration {
    let exponent = attempts.min(MAX_BACKOFF_EXPONENT);
    let wait = config
        .base
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max)
        .min(config.max);
    wait + jitter(config.jitter)
}

fn jitter(limit: Duration) -> Duration {
    if limit.is_zero() {
        return Duration::ZERO;
    }
    let limit_ms = limit.as_millis().min(u128::from(u64::MAX)) as u64;
    Duration::from_millis(fastrand::u64(0..=limit_ms))
}
