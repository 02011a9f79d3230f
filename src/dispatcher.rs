use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{HttpClient, HttpError};
use crate::error::{DispatchOutcome, ErrorSink, FailureKind, Result, ServerError};
use crate::signing::build_signature_headers;
use crate::storage::EventRepo;
use crate::types::{EventStatus, HttpRequest, Webhook, WebhookEvent};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// How often a refused-by-IO status write is repeated before the failure
/// is surfaced on the error channel.
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// A unit of delivery work: one event, or one batch of events sharing a
/// batch key, addressed to a single webhook.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub webhook: Arc<Webhook>,
    pub events: Vec<WebhookEvent>,
    pub batched: bool,
}

impl Dispatch {
    pub fn single(webhook: Arc<Webhook>, event: WebhookEvent) -> Self {
        Self { webhook, events: vec![event], batched: false }
    }

    pub fn batch(webhook: Arc<Webhook>, events: Vec<WebhookEvent>) -> Self {
        Self { webhook, events, batched: true }
    }
}

/// Turns `Dispatch` units into HTTP requests and records the outcome on
/// every covered event.
///
/// The dispatcher knows nothing about retries; callers route failed
/// at-least-once outcomes into the retry controller.
pub(crate) struct Dispatcher {
    events: Arc<dyn EventRepo>,
    client: Arc<dyn HttpClient>,
    errors: ErrorSink,
}

impl Dispatcher {
    pub fn new(events: Arc<dyn EventRepo>, client: Arc<dyn HttpClient>, errors: ErrorSink) -> Self {
        Self { events, client, errors }
    }

    /// Run one delivery attempt to completion.
    ///
    /// Marks every event `Delivering`, posts the request, then marks the
    /// events `Delivered` or `Failed` according to the response. Repo
    /// failures on status writes are retried a bounded number of times and
    /// then surfaced; they never abort the attempt.
    pub async fn execute(&self, dispatch: &mut Dispatch) -> DispatchOutcome {
        self.mark_all(dispatch, EventStatus::Delivering).await;

        let request = build_request(dispatch);
        debug!(
            webhook = %dispatch.webhook.id,
            events = dispatch.events.len(),
            url = %request.url,
            "dispatching"
        );

        match self.client.post(request).await {
            Ok(response) if response.is_success() => {
                self.mark_all(dispatch, EventStatus::Delivered).await;
                metric_inc("webhook.dispatch.delivered");
                info!(
                    webhook = %dispatch.webhook.id,
                    events = dispatch.events.len(),
                    status = response.status,
                    "delivered"
                );
                DispatchOutcome::Delivered
            }
            Ok(response) => {
                self.mark_all(dispatch, EventStatus::Failed).await;
                metric_inc("webhook.dispatch.failed");
                warn!(
                    webhook = %dispatch.webhook.id,
                    status = response.status,
                    "endpoint rejected delivery"
                );
                DispatchOutcome::Failed(FailureKind::ErrorStatus(response.status))
            }
            Err(error) => {
                self.errors.publish(ServerError::http(error.to_string()));
                self.mark_all(dispatch, EventStatus::Failed).await;
                metric_inc("webhook.dispatch.failed");
                warn!(webhook = %dispatch.webhook.id, error = %error, "delivery failed");
                let kind = match error {
                    HttpError::Timeout => FailureKind::Timeout,
                    HttpError::Network(_) => FailureKind::Network,
                };
                DispatchOutcome::Failed(kind)
            }
        }
    }

    /// Record `status` for every event in the dispatch, keeping the local
    /// copies in sync with the repo. Events already in `status` (crash
    /// recovery re-dispatches) are left untouched.
    async fn mark_all(&self, dispatch: &mut Dispatch, status: EventStatus) {
        for event in &mut dispatch.events {
            if event.status == status {
                continue;
            }
            match self.set_status_with_retry(event, status).await {
                Ok(()) => event.status = status,
                Err(error) => self.errors.publish(error),
            }
        }
    }

    async fn set_status_with_retry(&self, event: &WebhookEvent, status: EventStatus) -> Result<()> {
        let mut last_error = None;
        for _ in 0..STATUS_WRITE_ATTEMPTS {
            match self.events.set_event_status(event.key, status).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() => last_error = Some(error),
                Err(error) => return Err(error),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ServerError::internal("status write failed without an error")))
    }
}

/// Build the wire request for a dispatch.
///
/// Single dispatches carry the event content and headers verbatim.
/// Batched dispatches carry a JSON array body and only the batch key's
/// `Content-Type` and `Accept` headers.
fn build_request(dispatch: &Dispatch) -> HttpRequest {
    let (body, mut headers) = if dispatch.batched {
        batch_parts(&dispatch.events)
    } else {
        let event = &dispatch.events[0];
        (event.content.clone(), event.headers.clone())
    };

    let signature = build_signature_headers(&dispatch.webhook, body.as_bytes());
    if let Some(header) = signature.signature {
        headers.push(header);
    }
    if let Some(header) = signature.timestamp {
        headers.push(header);
    }

    HttpRequest {
        url: dispatch.webhook.url.clone(),
        body,
        headers,
    }
}

fn batch_parts(events: &[WebhookEvent]) -> (String, Vec<(String, String)>) {
    let content_type = events.first().and_then(|e| e.content_type());
    let accept = events.first().and_then(|e| e.accept());

    let body = if content_type.is_some_and(is_json_content) {
        // JSON payloads are spliced into the array untouched.
        let mut body = String::from("[");
        for (index, event) in events.iter().enumerate() {
            if index > 0 {
                body.push(',');
            }
            body.push_str(&event.content);
        }
        body.push(']');
        body
    } else {
        let contents: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        serde_json::to_string(&contents).unwrap_or_else(|_| String::from("[]"))
    };

    let mut headers = Vec::new();
    if let Some(value) = content_type {
        headers.push(("Content-Type".to_string(), value.to_string()));
    }
    if let Some(value) = accept {
        headers.push(("Accept".to_string(), value.to_string()));
    }

    (body, headers)
}

fn is_json_content(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|mime| mime.eq_ignore_ascii_case("application/json"))
}
