//! Development signaling relay speaking the node-dss mailbox protocol.
//!
//! `POST /data/:id` appends the request body to the mailbox of peer `id`;
//! `GET /data/:id` removes and returns the oldest entry, or answers 404 when
//! the mailbox is empty. Bodies are stored opaquely.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_LIMIT: usize = 256;
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Messages kept per mailbox; the oldest is dropped beyond this.
    pub queue_limit: usize,
    /// Maximum accepted request body in bytes.
    pub body_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_QUEUE_LIMIT,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

pub type Mailboxes = Arc<RwLock<HashMap<String, VecDeque<String>>>>;

#[derive(Clone)]
pub struct RelayState {
    mailboxes: Mailboxes,
    config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            config: RelayConfig {
                queue_limit: config.queue_limit.max(1),
                ..config
            },
        }
    }

    /// Number of messages waiting for `peer_id`.
    pub async fn pending(&self, peer_id: &str) -> usize {
        self.mailboxes
            .read()
            .await
            .get(peer_id)
            .map_or(0, VecDeque::len)
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    mailboxes: usize,
    queued: usize,
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    let mailboxes = state.mailboxes.read().await;
    let queued = mailboxes.values().map(VecDeque::len).sum();
    Json(HealthReport {
        status: "ok",
        mailboxes: mailboxes.len(),
        queued,
    })
}

async fn deliver(
    State(state): State<RelayState>,
    Path(peer_id): Path<String>,
    body: String,
) -> StatusCode {
    let mut mailboxes = state.mailboxes.write().await;
    let queue = mailboxes.entry(peer_id.clone()).or_default();
    if queue.len() >= state.config.queue_limit {
        queue.pop_front();
        warn!("mailbox {} full, dropped oldest message", peer_id);
    }
    queue.push_back(body);
    debug!("queued message for {} ({} pending)", peer_id, queue.len());
    StatusCode::OK
}

async fn collect(State(state): State<RelayState>, Path(peer_id): Path<String>) -> Response {
    let mut mailboxes = state.mailboxes.write().await;
    let Some(queue) = mailboxes.get_mut(&peer_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(body) = queue.pop_front() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if queue.is_empty() {
        mailboxes.remove(&peer_id);
    }
    debug!("delivered message to {}", peer_id);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

pub fn router(state: RelayState) -> Router {
    let body_limit = state.config.body_limit;
    Router::new()
        .route("/", get(|| async { "Tandem relay online" }))
        .route("/health", get(health))
        .route("/data/:id", post(deliver).get(collect))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    config: RelayConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("relay listening on {}", addr);
    axum::serve(listener, router(RelayState::new(config)))
        .with_graceful_shutdown(shutdown)
        .await
}
