use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::BatchingConfig;
use crate::dispatcher::Dispatch;
use crate::types::{Webhook, WebhookEvent, WebhookId};

/// Grouping key for batching: the webhook plus the content-type and
/// accept header values every event in the batch shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub webhook_id: WebhookId,
    pub content_type: Option<String>,
    pub accept: Option<String>,
}

impl BatchKey {
    pub fn for_event(event: &WebhookEvent) -> Self {
        Self {
            webhook_id: event.webhook_id(),
            content_type: event.content_type().map(str::to_string),
            accept: event.accept().map(str::to_string),
        }
    }
}

/// Pending events for one batch key. The deadline is `max_wait` past the
/// arrival of the earliest still-pending event.
struct Accumulator {
    webhook: Arc<Webhook>,
    events: Vec<WebhookEvent>,
    deadline: Instant,
}

/// Heap entry for a batch window. Stale entries (the accumulator emitted
/// early by size, or was replaced) are skipped when they surface.
struct Window {
    deadline: Instant,
    key: BatchKey,
}

impl Eq for Window {}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Time- and size-windowed accumulator for batched delivery modes.
///
/// A single task owns every per-key accumulator. A batch is emitted when
/// it reaches `max_size` events or when `max_wait` elapses from the first
/// pending event's arrival, whichever happens first. Closing the intake
/// flushes all pending accumulators once.
pub(crate) struct Batcher {
    intake: mpsc::UnboundedSender<(Arc<Webhook>, WebhookEvent)>,
    handle: JoinHandle<()>,
}

impl Batcher {
    pub fn spawn(config: BatchingConfig, out: mpsc::UnboundedSender<Dispatch>) -> Self {
        let (intake, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_batcher(config, rx, out));
        Self { intake, handle }
    }

    pub fn submit(&self, webhook: Arc<Webhook>, event: WebhookEvent) {
        let _ = self.intake.send((webhook, event));
    }

    /// Stop intake, flush pending accumulators, and wait for the task.
    pub async fn close(self) {
        drop(self.intake);
        let _ = self.handle.await;
    }
}

async fn run_batcher(
    config: BatchingConfig,
    mut rx: mpsc::UnboundedReceiver<(Arc<Webhook>, WebhookEvent)>,
    out: mpsc::UnboundedSender<Dispatch>,
) {
    let mut accumulators: HashMap<BatchKey, Accumulator> = HashMap::new();
    let mut windows: BinaryHeap<Window> = BinaryHeap::new();

    loop {
        // Skip windows whose accumulator already emitted or was replaced.
        let next_deadline = loop {
            let Some(window) = windows.peek() else {
                break None;
            };
            let live = accumulators
                .get(&window.key)
                .is_some_and(|acc| acc.deadline == window.deadline);
            if live {
                break Some(window.deadline);
            }
            windows.pop();
        };
        let wake_at = next_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            item = rx.recv() => match item {
                Some((webhook, event)) => {
                    let key = BatchKey::for_event(&event);
                    let full = {
                        let acc = accumulators.entry(key.clone()).or_insert_with(|| {
                            let deadline = Instant::now() + config.max_wait;
                            windows.push(Window { deadline, key: key.clone() });
                            Accumulator { webhook, events: Vec::new(), deadline }
                        });
                        acc.events.push(event);
                        acc.events.len() >= config.max_size
                    };
                    if full {
                        if let Some(acc) = accumulators.remove(&key) {
                            emit(&out, acc, "size");
                        }
                    }
                }
                None => break,
            },
            _ = sleep_until(wake_at), if next_deadline.is_some() => {
                let now = Instant::now();
                let due: Vec<BatchKey> = accumulators
                    .iter()
                    .filter(|(_, acc)| acc.deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in due {
                    if let Some(acc) = accumulators.remove(&key) {
                        emit(&out, acc, "time");
                    }
                }
            }
        }
    }

    // Intake closed: best-effort final flush of everything pending.
    for (_, acc) in accumulators.drain() {
        emit(&out, acc, "flush");
    }
}

fn emit(out: &mpsc::UnboundedSender<Dispatch>, acc: Accumulator, trigger: &'static str) {
    debug!(
        webhook = %acc.webhook.id,
        events = acc.events.len(),
        trigger,
        "emitting batch"
    );
    let _ = out.send(Dispatch::batch(acc.webhook, acc.events));
}
