use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batcher::Batcher;
use crate::client::HttpClient;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{ErrorSink, Result, ServerError};
use crate::retry::RetrySet;
use crate::state::WebhookStateCache;
use crate::storage::{EventRepo, StateRepo, WebhookRepo};
use crate::types::{EventStatus, Webhook, WebhookEvent, WebhookId, WebhookStatus};

/// The webhook delivery server.
///
/// Consumes the event repo's new-event stream and delivers each event to
/// its webhook under the webhook's delivery mode. Construction wires the
/// consumed capabilities together; `start` spawns the pipeline and hands
/// back a [`ServerHandle`].
pub struct WebhookServer {
    config: ServerConfig,
    webhooks: Arc<dyn WebhookRepo>,
    events: Arc<dyn EventRepo>,
    states: Arc<dyn StateRepo>,
    client: Arc<dyn HttpClient>,
}

impl WebhookServer {
    pub fn new(
        config: ServerConfig,
        webhooks: Arc<dyn WebhookRepo>,
        events: Arc<dyn EventRepo>,
        states: Arc<dyn StateRepo>,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, webhooks, events, states, client })
    }

    /// Start the delivery pipeline.
    ///
    /// Recovers events left `Delivering` by a previous run, re-enters
    /// retry for `Failed` at-least-once events, then serves the live
    /// new-event stream until [`ServerHandle::shutdown`] is called.
    pub async fn start(self) -> ServerHandle {
        let errors = ErrorSink::new(self.config.error_buffer);
        let state = Arc::new(WebhookStateCache::new(self.webhooks.clone(), self.states.clone()));
        let dispatcher =
            Arc::new(Dispatcher::new(self.events.clone(), self.client.clone(), errors.clone()));
        let retry = RetrySet::new(
            self.config.retry.clone(),
            dispatcher.clone(),
            state.clone(),
            errors.clone(),
        );

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let batcher = self
            .config
            .batching
            .clone()
            .map(|batching| Batcher::spawn(batching, batch_tx));

        let new_events = self.events.subscribe_to_new_events().await;
        let updates = self.webhooks.subscribe_to_status_updates().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Engine {
            config: self.config,
            webhooks: self.webhooks,
            events: self.events,
            state,
            dispatcher,
            retry,
            batcher,
            errors: errors.clone(),
            in_flight: Arc::new(InFlight::default()),
        };

        let loop_handle =
            tokio::spawn(engine.run(new_events, updates, batch_rx, shutdown_rx));

        ServerHandle {
            errors,
            shutdown: shutdown_tx,
            loop_handle: Some(loop_handle),
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    errors: ErrorSink,
    shutdown: watch::Sender<bool>,
    loop_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Subscribe to the stream of structural errors.
    ///
    /// The stream is multi-consumer and never blocks the engine: a
    /// subscriber that falls more than `errors.buffer` entries behind
    /// loses the oldest ones.
    pub fn errors(&self) -> broadcast::Receiver<ServerError> {
        self.errors.subscribe()
    }

    /// Stop the server: intake closes, pending batch windows flush once,
    /// and in-flight deliveries are awaited up to the drain deadline.
    /// Whatever has not completed by then is abandoned; its events remain
    /// `Delivering` in the event repo and are recovered on the next start.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Count of spawned dispatch tasks, for drain-on-shutdown.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_empty(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

struct Engine {
    config: ServerConfig,
    webhooks: Arc<dyn WebhookRepo>,
    events: Arc<dyn EventRepo>,
    state: Arc<WebhookStateCache>,
    dispatcher: Arc<Dispatcher>,
    retry: RetrySet,
    batcher: Option<Batcher>,
    errors: ErrorSink,
    in_flight: Arc<InFlight>,
}

impl Engine {
    async fn run(
        self,
        mut new_events: mpsc::UnboundedReceiver<WebhookEvent>,
        mut updates: mpsc::UnboundedReceiver<(WebhookId, WebhookStatus)>,
        mut batch_rx: mpsc::UnboundedReceiver<Dispatch>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            batching = self.batcher.is_some(),
            drain_deadline_secs = self.config.drain_deadline.as_secs(),
            "webhook delivery server starting"
        );

        self.recover().await;

        let mut events_open = true;
        let mut updates_open = true;
        let mut batches_open = self.batcher.is_some();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                event = new_events.recv(), if events_open => match event {
                    Some(event) => self.route_event(event).await,
                    None => events_open = false,
                },
                dispatch = batch_rx.recv(), if batches_open => match dispatch {
                    Some(dispatch) => self.spawn_dispatch(dispatch),
                    None => batches_open = false,
                },
                update = updates.recv(), if updates_open => match update {
                    Some((id, status)) => self.handle_webhook_update(id, status).await,
                    None => updates_open = false,
                },
            }
        }

        self.drain(batch_rx).await;
    }

    /// Replay non-terminal events left over from a previous run.
    ///
    /// `Delivering` events were in flight when the process stopped; they
    /// go through normal routing again. `Failed` events are preserved
    /// retry backlogs; at-least-once webhooks take them back into retry.
    async fn recover(&self) {
        let pending = match self
            .events
            .events_with_statuses(&[EventStatus::Delivering, EventStatus::Failed])
            .await
        {
            Ok(events) => events,
            Err(error) => {
                self.errors.publish(error);
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "recovering non-terminal events");
        for event in pending {
            match event.status {
                EventStatus::Delivering => self.route_event(event).await,
                EventStatus::Failed => self.recover_failed(event).await,
                _ => {}
            }
        }
    }

    async fn recover_failed(&self, event: WebhookEvent) {
        let Some(webhook) = self.resolve(event.webhook_id()).await else {
            return;
        };
        let status = match self.state.status_of(&webhook).await {
            Ok(status) => status,
            Err(error) => {
                self.errors.publish(error);
                return;
            }
        };
        // A webhook given up on (or paused) keeps its failed events where
        // they are; an enabled or retrying at-least-once webhook resumes
        // working through them.
        if matches!(status, WebhookStatus::Disabled | WebhookStatus::Unavailable { .. }) {
            return;
        }
        if webhook.delivery_mode.is_at_least_once() {
            self.retry.enqueue(webhook, vec![event]).await;
        }
    }

    async fn route_event(&self, event: WebhookEvent) {
        let Some(webhook) = self.resolve(event.webhook_id()).await else {
            return;
        };
        let status = match self.state.status_of(&webhook).await {
            Ok(status) => status,
            Err(error) => {
                self.errors.publish(error);
                return;
            }
        };

        match status {
            WebhookStatus::Disabled | WebhookStatus::Unavailable { .. } => {
                debug!(webhook = %webhook.id, event = %event.key, status = %status, "dropping event");
            }
            // Events for a retrying webhook join the tail of its queue
            // instead of opening a parallel dispatch.
            WebhookStatus::Retrying { .. } => self.retry.enqueue(webhook, vec![event]).await,
            WebhookStatus::Enabled => self.route_enabled(webhook, event),
        }
    }

    fn route_enabled(&self, webhook: Arc<Webhook>, event: WebhookEvent) {
        if webhook.delivery_mode.is_batched() {
            match &self.batcher {
                Some(batcher) => batcher.submit(webhook, event),
                None => self.errors.publish(ServerError::InvalidStateChange {
                    key: event.key,
                    from: event.status,
                    to: EventStatus::Delivering,
                }),
            }
        } else {
            self.spawn_dispatch(Dispatch::single(webhook, event));
        }
    }

    fn spawn_dispatch(&self, mut dispatch: Dispatch) {
        let dispatcher = self.dispatcher.clone();
        let retry = self.retry.clone();
        let in_flight = self.in_flight.clone();
        in_flight.begin();

        tokio::spawn(async move {
            let outcome = dispatcher.execute(&mut dispatch).await;
            if !outcome.is_delivered() && dispatch.webhook.delivery_mode.is_at_least_once() {
                let Dispatch { webhook, events, .. } = dispatch;
                retry.enqueue(webhook, events).await;
            }
            in_flight.end();
        });
    }

    async fn handle_webhook_update(&self, id: WebhookId, status: WebhookStatus) {
        debug!(webhook = %id, status = %status, "webhook status update");
        let previous = self.state.observe(id, status).await;
        // Operator re-enable of an unavailable webhook; any remaining
        // retry queue is discarded.
        if status.is_enabled() && matches!(previous, Some(WebhookStatus::Unavailable { .. })) {
            self.retry.cancel(id).await;
        }
    }

    async fn resolve(&self, id: WebhookId) -> Option<Arc<Webhook>> {
        match self.webhooks.webhook(id).await {
            Ok(Some(webhook)) => Some(Arc::new(webhook)),
            Ok(None) => {
                self.errors.publish(ServerError::MissingWebhook(id));
                None
            }
            Err(error) => {
                self.errors.publish(error);
                None
            }
        }
    }

    async fn drain(mut self, mut batch_rx: mpsc::UnboundedReceiver<Dispatch>) {
        info!("draining webhook delivery server");
        let deadline = Instant::now() + self.config.drain_deadline;

        // Flush pending batch windows once, then pick up the final
        // emissions the loop is no longer consuming.
        if let Some(batcher) = self.batcher.take() {
            batcher.close().await;
        }
        while let Ok(dispatch) = batch_rx.try_recv() {
            self.spawn_dispatch(dispatch);
        }

        // Await in-flight dispatches until the deadline, then abandon
        // them; their events stay Delivering and recover on restart.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = tokio::time::timeout(remaining, self.in_flight.wait_empty()).await;
        if drained.is_err() {
            info!(
                abandoned = self.in_flight.count.load(Ordering::Acquire),
                "drain deadline reached"
            );
        }

        // Retry controllers stop scheduling; queued events keep their
        // Failed status in the event repo and re-enter retry on restart.
        self.retry
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;

        info!("webhook delivery server stopped");
    }
}
