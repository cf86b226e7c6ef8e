//! Relay signaling transport.
//!
//! The transport only frames messages; it has no idea what an offer is. The
//! [`Poller`] drives inbound polling on a fixed interval and the outbound
//! sender delivers messages one at a time, in the order they were queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tandem_common::SessionConfig;
use tandem_core::{CodecError, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

/// Base delay between send attempts; attempt `n` waits `n` times this.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("message could not be encoded: {0}")]
    Encode(#[from] CodecError),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether a later attempt with the same message can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Encode(_) | TransportError::Closed)
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Fetch the messages currently waiting for the local peer.
    async fn poll(&self) -> Result<Vec<SignalingMessage>, TransportError>;

    /// Deliver one message to the remote peer.
    async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError>;
}

/// Client for node-dss style relays: one mailbox per peer id under `/data/`.
pub struct NodeDssSignaler {
    client: reqwest::Client,
    inbox_url: String,
    outbox_url: String,
    batch_limit: usize,
}

impl NodeDssSignaler {
    pub fn new(config: &SessionConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            inbox_url: config.mailbox_url(&config.local_peer_id),
            outbox_url: config.mailbox_url(&config.remote_peer_id),
            batch_limit: config.poll_batch_limit.max(1),
        })
    }

    pub fn inbox_url(&self) -> &str {
        &self.inbox_url
    }

    pub fn outbox_url(&self) -> &str {
        &self.outbox_url
    }
}

#[async_trait]
impl SignalingTransport for NodeDssSignaler {
    async fn poll(&self) -> Result<Vec<SignalingMessage>, TransportError> {
        let mut messages = Vec::new();
        for _ in 0..self.batch_limit {
            let response = match self.client.get(&self.inbox_url).send().await {
                Ok(response) => response,
                Err(err) if messages.is_empty() => return Err(err.into()),
                Err(err) => {
                    warn!("poll interrupted after {} messages: {}", messages.len(), err);
                    break;
                }
            };

            match response.status() {
                StatusCode::NOT_FOUND => break,
                status if status.is_success() => {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(err) if messages.is_empty() => return Err(err.into()),
                        Err(err) => {
                            warn!("poll interrupted after {} messages: {}", messages.len(), err);
                            break;
                        }
                    };
                    match SignalingMessage::from_json(&body) {
                        Ok(message) => {
                            debug!("received {} from relay", message.kind);
                            messages.push(message);
                        }
                        Err(err) => warn!("dropping malformed relay frame: {}", err),
                    }
                }
                status => {
                    let err = TransportError::Status {
                        status: status.as_u16(),
                        url: self.inbox_url.clone(),
                    };
                    if messages.is_empty() {
                        return Err(err);
                    }
                    warn!("{}", err);
                    break;
                }
            }
        }
        Ok(messages)
    }

    async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        let body = message.to_json()?;
        let response = self
            .client
            .post(&self.outbox_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                status: response.status().as_u16(),
                url: self.outbox_url.clone(),
            });
        }
        Ok(())
    }
}

/// Periodic inbound polling task.
///
/// `stop` never waits for a request that is already running; whatever it
/// returns after the stop is discarded.
pub struct Poller {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        interval: Duration,
        sink: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let result = transport.poll().await;
                if *stop_rx.borrow() {
                    debug!("discarding poll result after stop");
                    break;
                }
                match result {
                    Ok(messages) => {
                        for message in messages {
                            if sink.send(message).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => warn!("signaling poll failed: {}", err),
                }
            }
            debug!("signaling poller stopped");
        });
        Self { stop_tx, task }
    }

    /// Cancel future polls. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the ordered outbound sender. Dropping the returned sender ends the
/// task once the already queued messages have been handled.
pub fn spawn_outbound(
    transport: Arc<dyn SignalingTransport>,
    retry_limit: u32,
    retry_delay: Duration,
) -> (mpsc::UnboundedSender<SignalingMessage>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            send_with_retry(transport.as_ref(), &message, retry_limit, retry_delay).await;
        }
        debug!("outbound sender stopped");
    });
    (tx, task)
}

async fn send_with_retry(
    transport: &dyn SignalingTransport,
    message: &SignalingMessage,
    retry_limit: u32,
    retry_delay: Duration,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match transport.send(message).await {
            Ok(()) => {
                debug!("sent {} to relay", message.kind);
                return true;
            }
            Err(err) if err.is_retryable() && attempt < retry_limit => {
                attempt += 1;
                warn!(
                    "sending {} failed (attempt {}/{}): {}",
                    message.kind,
                    attempt,
                    retry_limit + 1,
                    err
                );
                time::sleep(retry_delay * attempt).await;
            }
            Err(err) => {
                warn!("dropping outbound {}: {}", message.kind, err);
                return false;
            }
        }
    }
}
