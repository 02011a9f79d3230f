//! Retry, recovery and shutdown behaviour.

mod common;

use std::time::Duration;

use common::{eventually, fast_retry, StubClient, StubResponse, TestEnv};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use webhook_server::{
    BatchingConfig, DeliveryMode, EventKey, EventRepo, EventStatus, ServerConfig, ServerError,
    Webhook, WebhookEvent, WebhookId, WebhookRepo, WebhookStatus,
};

fn fast_config() -> ServerConfig {
    ServerConfig {
        retry: fast_retry(),
        ..Default::default()
    }
}

/// Drain the error stream until the webhook-unavailable notice arrives.
async fn expect_unavailable(errors: &mut broadcast::Receiver<ServerError>, id: u64) {
    loop {
        let error = timeout(Duration::from_secs(2), errors.recv())
            .await
            .expect("unavailable notice within 2s")
            .expect("channel open");
        if error == ServerError::WebhookUnavailable(WebhookId(id)) {
            return;
        }
    }
}

#[tokio::test]
async fn at_least_once_retries_until_acknowledged() {
    let env = TestEnv::new(StubClient::with_script(vec![
        StubResponse::Status(500),
        StubResponse::Status(500),
        StubResponse::Status(200),
    ]));
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_least_once()))
        .await;

    let handle = env.server(fast_config()).start().await;

    env.events
        .create_event(WebhookEvent::new(EventKey::new(0, 0), "persistent"))
        .await
        .unwrap();

    eventually(|| async {
        env.events.event(EventKey::new(0, 0)).await.unwrap().unwrap().status
            == EventStatus::Delivered
    })
    .await;
    assert_eq!(env.client.request_count().await, 3);

    // The webhook went through Retrying and came back.
    eventually(|| async {
        env.webhooks.webhook(WebhookId(0)).await.unwrap().unwrap().status
            == WebhookStatus::Enabled
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn at_most_once_failure_is_terminal() {
    let env = TestEnv::new(StubClient::with_script(vec![StubResponse::Status(500)]));
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_most_once()))
        .await;

    let handle = env.server(fast_config()).start().await;

    env.events
        .create_event(WebhookEvent::new(EventKey::new(0, 0), "one shot"))
        .await
        .unwrap();

    eventually(|| async {
        env.events.event(EventKey::new(0, 0)).await.unwrap().unwrap().status == EventStatus::Failed
    })
    .await;

    // No retry ever happens.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(env.client.request_count().await, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn new_events_join_the_retry_queue_in_order() {
    let env = TestEnv::new(StubClient::with_script(vec![StubResponse::NetworkError]));
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_least_once()))
        .await;

    let mut config = fast_config();
    config.retry.base = Duration::from_millis(150);

    let handle = env.server(config).start().await;

    env.events
        .create_event(WebhookEvent::new(EventKey::new(1, 0), "one"))
        .await
        .unwrap();

    // Wait for the webhook to enter retry, then send a follow-up event.
    eventually(|| async {
        env.webhooks
            .webhook(WebhookId(0))
            .await
            .unwrap()
            .unwrap()
            .status
            .is_retrying()
    })
    .await;

    env.events
        .create_event(WebhookEvent::new(EventKey::new(2, 0), "two"))
        .await
        .unwrap();

    eventually(|| async {
        let delivered = env
            .events
            .events_with_statuses(&[EventStatus::Delivered])
            .await
            .unwrap();
        delivered.len() == 2
    })
    .await;

    let bodies: Vec<String> = env.client.requests().await.into_iter().map(|r| r.body).collect();
    assert_eq!(bodies, vec!["one".to_string(), "one".to_string(), "two".to_string()]);

    handle.shutdown().await;
}

#[tokio::test]
async fn failed_batches_redispatch_as_a_batch() {
    let env = TestEnv::new(StubClient::with_script(vec![StubResponse::Status(503)]));
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::batched_at_least_once()))
        .await;

    let config = ServerConfig {
        batching: Some(BatchingConfig {
            max_size: 3,
            max_wait: Duration::from_secs(5),
        }),
        retry: fast_retry(),
        ..Default::default()
    };
    let handle = env.server(config).start().await;

    for i in 0..3u64 {
        let event = WebhookEvent::new(EventKey::new(i, 0), format!(r#"{{"n":{i}}}"#))
            .with_header("Content-Type", "application/json");
        env.events.create_event(event).await.unwrap();
    }

    eventually(|| async {
        let delivered = env
            .events
            .events_with_statuses(&[EventStatus::Delivered])
            .await
            .unwrap();
        delivered.len() == 3
    })
    .await;

    let requests = env.client.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body, "retried as the same batch");
    let body: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn continuous_failure_past_horizon_parks_the_webhook() {
    let env = TestEnv::new(StubClient::failing());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_least_once()))
        .await;

    let mut config = fast_config();
    config.retry.base = Duration::from_millis(30);
    config.retry.failure_horizon = Duration::from_millis(200);

    let handle = env.server(config).start().await;
    let mut errors = handle.errors();

    env.events
        .create_event(WebhookEvent::new(EventKey::new(0, 0), "doomed"))
        .await
        .unwrap();

    expect_unavailable(&mut errors, 0).await;

    eventually(|| async {
        matches!(
            env.webhooks.webhook(WebhookId(0)).await.unwrap().unwrap().status,
            WebhookStatus::Unavailable { .. }
        )
    })
    .await;

    // The discarded event keeps its failed status in the repo.
    assert_eq!(
        env.events.event(EventKey::new(0, 0)).await.unwrap().unwrap().status,
        EventStatus::Failed
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn operator_reenable_restores_delivery() {
    let env = TestEnv::new(StubClient::failing());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_least_once()))
        .await;

    let mut config = fast_config();
    config.retry.base = Duration::from_millis(30);
    config.retry.failure_horizon = Duration::from_millis(200);

    let handle = env.server(config).start().await;
    let mut errors = handle.errors();

    env.events
        .create_event(WebhookEvent::new(EventKey::new(0, 0), "doomed"))
        .await
        .unwrap();
    expect_unavailable(&mut errors, 0).await;

    // Endpoint comes back; operator re-enables the webhook.
    env.client.set_default(StubResponse::Status(200)).await;
    env.webhooks
        .set_webhook_status(WebhookId(0), WebhookStatus::Enabled)
        .await
        .unwrap();

    // Give the server a beat to observe the re-enable before new traffic.
    sleep(Duration::from_millis(150)).await;

    env.events
        .create_event(WebhookEvent::new(EventKey::new(1, 0), "back in business"))
        .await
        .unwrap();

    eventually(|| async {
        env.events.event(EventKey::new(1, 0)).await.unwrap().unwrap().status
            == EventStatus::Delivered
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_pending_batches() {
    let env = TestEnv::new(StubClient::ok());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::batched_at_most_once()))
        .await;

    let config = ServerConfig {
        batching: Some(BatchingConfig {
            max_size: 100,
            max_wait: Duration::from_secs(60),
        }),
        ..Default::default()
    };
    let handle = env.server(config).start().await;

    for i in 0..3u64 {
        let event = WebhookEvent::new(EventKey::new(i, 0), format!(r#"{{"n":{i}}}"#))
            .with_header("Content-Type", "application/json");
        env.events.create_event(event).await.unwrap();
    }

    // Let the events reach the accumulator, then stop the server with the
    // window still open.
    sleep(Duration::from_millis(200)).await;
    handle.shutdown().await;

    let requests = env.client.requests().await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 3);

    let delivered = env.events.events_with_statuses(&[EventStatus::Delivered]).await.unwrap();
    assert_eq!(delivered.len(), 3);
}

#[tokio::test]
async fn delivering_events_are_recovered_on_start() {
    let env = TestEnv::new(StubClient::ok());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_most_once()))
        .await;

    // Simulate a crash mid-delivery: the event was claimed but no outcome
    // was recorded.
    let key = EventKey::new(0, 0);
    env.events.create_event(WebhookEvent::new(key, "recovered")).await.unwrap();
    env.events.set_event_status(key, EventStatus::Delivering).await.unwrap();

    let handle = env.server(ServerConfig::default()).start().await;

    eventually(|| async {
        env.events.event(key).await.unwrap().unwrap().status == EventStatus::Delivered
    })
    .await;
    assert_eq!(env.client.request_count().await, 1);
    assert_eq!(env.client.requests().await[0].body, "recovered");

    handle.shutdown().await;
}

#[tokio::test]
async fn failed_events_reenter_retry_on_start() {
    let env = TestEnv::new(StubClient::ok());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_least_once()))
        .await;

    // A preserved retry backlog from a previous run.
    let key = EventKey::new(0, 0);
    env.events.create_event(WebhookEvent::new(key, "backlog")).await.unwrap();
    env.events.set_event_status(key, EventStatus::Delivering).await.unwrap();
    env.events.set_event_status(key, EventStatus::Failed).await.unwrap();

    let handle = env.server(fast_config()).start().await;

    eventually(|| async {
        env.events.event(key).await.unwrap().unwrap().status == EventStatus::Delivered
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test]
async fn failed_at_most_once_events_stay_failed_on_start() {
    let env = TestEnv::new(StubClient::ok());
    env.webhooks
        .insert(Webhook::new(0, "http://example.org/0", DeliveryMode::single_at_most_once()))
        .await;

    let key = EventKey::new(0, 0);
    env.events.create_event(WebhookEvent::new(key, "spent")).await.unwrap();
    env.events.set_event_status(key, EventStatus::Delivering).await.unwrap();
    env.events.set_event_status(key, EventStatus::Failed).await.unwrap();

    let handle = env.server(fast_config()).start().await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(env.client.request_count().await, 0);
    assert_eq!(env.events.event(key).await.unwrap().unwrap().status, EventStatus::Failed);

    handle.shutdown().await;
}
