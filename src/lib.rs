//! A multi-mode webhook delivery server.
//!
//! This crate consumes a stream of event records and delivers each event
//! to its webhook's URL under the delivery contract chosen for that
//! webhook: at-most-once or at-least-once, singly or batched.
//!
//! ## Guarantees
//! - Per-webhook delivery contracts, honoured across endpoint failures
//! - In-order delivery within a retry queue and within a batch
//! - At most one in-flight attempt per retrying webhook
//! - Recovery of non-terminal events across restarts, through the event
//!   repository
//! - Webhooks failing continuously past the failure horizon are parked as
//!   unavailable instead of retrying forever
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across webhooks, or across batch keys of one webhook
//! - Durability (storage is a pluggable capability, not part of the core)
//! - Distributed coordination
//!
//! Storage, HTTP transport and state persistence are consumed through
//! narrow traits ([`WebhookRepo`], [`EventRepo`], [`StateRepo`],
//! [`HttpClient`]); in-memory repositories and a reqwest-backed client are
//! provided for embedded use.

mod batcher;
mod client;
mod config;
mod dispatcher;
mod error;
mod retry;
mod server;
mod signing;
mod state;
mod storage;
mod types;

pub use batcher::BatchKey;
pub use client::{ClientConfig, HttpClient, HttpError, ReqwestClient};
pub use config::{BatchingConfig, RetryConfig, ServerConfig};
pub use error::{Result, ServerError};
pub use server::{ServerHandle, WebhookServer};
pub use signing::{
    build_signature_headers,
    compute_signature,
    is_timestamp_fresh,
    verify_signature,
    SignatureHeaders,
};
pub use storage::{
    EventRepo,
    InMemoryEventRepo,
    InMemoryStateRepo,
    InMemoryWebhookRepo,
    StateRepo,
    WebhookRepo,
};
pub use types::{
    Batching,
    DeliveryMode,
    EventId,
    EventKey,
    EventStatus,
    HttpRequest,
    HttpResponse,
    Semantics,
    Webhook,
    WebhookEvent,
    WebhookId,
    WebhookStatus,
};
