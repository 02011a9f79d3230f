//! Shared test harness: scripted HTTP stub and repository wiring.
#![allow(dead_code)] // not every test file uses every helper

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use webhook_server::{
    HttpClient, HttpError, HttpRequest, HttpResponse, InMemoryEventRepo, InMemoryStateRepo,
    InMemoryWebhookRepo, RetryConfig, ServerConfig, WebhookServer,
};

/// One scripted reply from the stub endpoint.
#[derive(Debug, Clone)]
pub enum StubResponse {
    Status(u16),
    NetworkError,
}

/// Scripted HTTP client: records every request and replays canned
/// responses in order, falling back to a default once the script is
/// exhausted.
pub struct StubClient {
    requests: Mutex<Vec<HttpRequest>>,
    script: Mutex<VecDeque<StubResponse>>,
    default: Mutex<StubResponse>,
}

impl StubClient {
    /// Always answer 200.
    pub fn ok() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    /// Fail every request at the network level.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(StubResponse::NetworkError),
        })
    }

    /// Play `script` in order, then answer 200.
    pub fn with_script(script: Vec<StubResponse>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            default: Mutex::new(StubResponse::Status(200)),
        })
    }

    /// Change the reply used once the script is exhausted. Lets a test
    /// bring a "down" endpoint back up.
    pub async fn set_default(&self, reply: StubResponse) {
        *self.default.lock().await = reply;
    }

    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl HttpClient for StubClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().await.push(request);
        let scripted = self.script.lock().await.pop_front();
        let reply = match scripted {
            Some(reply) => reply,
            None => self.default.lock().await.clone(),
        };
        match reply {
            StubResponse::Status(status) => Ok(HttpResponse { status }),
            StubResponse::NetworkError => Err(HttpError::Network("connection refused".into())),
        }
    }
}

/// In-memory repositories plus a stub client, wired for one test.
pub struct TestEnv {
    pub webhooks: Arc<InMemoryWebhookRepo>,
    pub events: Arc<InMemoryEventRepo>,
    pub states: Arc<InMemoryStateRepo>,
    pub client: Arc<StubClient>,
}

impl TestEnv {
    pub fn new(client: Arc<StubClient>) -> Self {
        Self {
            webhooks: Arc::new(InMemoryWebhookRepo::new()),
            events: Arc::new(InMemoryEventRepo::new()),
            states: Arc::new(InMemoryStateRepo::new()),
            client,
        }
    }

    pub fn server(&self, config: ServerConfig) -> WebhookServer {
        WebhookServer::new(
            config,
            self.webhooks.clone(),
            self.events.clone(),
            self.states.clone(),
            self.client.clone(),
        )
        .expect("config is valid")
    }
}

/// Retry settings fast enough for tests.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base: Duration::from_millis(50),
        max: Duration::from_millis(400),
        jitter: Duration::ZERO,
        failure_horizon: Duration::from_secs(7 * 24 * 60 * 60),
    }
}

/// Poll `check` until it holds, or panic after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}
