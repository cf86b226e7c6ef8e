//! Session configuration shared by the client and its tooling.
//!
//! The relay address and the two peer identifiers are opaque start-up
//! parameters. Everything else is a tunable with a default that matches the
//! behaviour of a plain node-dss deployment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_RELAY_ADDRESS: &str = "http://127.0.0.1:3000/";
pub const DEFAULT_LOCAL_PEER_ID: &str = "tandem-01";
pub const DEFAULT_REMOTE_PEER_ID: &str = "tandem-02";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_POLL_BATCH_LIMIT: usize = 16;
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 3;
/// The engine does not report a frame rate, so render pipelines assume this one.
pub const DEFAULT_FRAMERATE: u32 = 30;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub relay_address: String,
    pub local_peer_id: String,
    pub remote_peer_id: String,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub poll_batch_limit: usize,
    pub send_retry_limit: u32,
    pub framerate: u32,
    pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_address: DEFAULT_RELAY_ADDRESS.to_string(),
            local_peer_id: DEFAULT_LOCAL_PEER_ID.to_string(),
            remote_peer_id: DEFAULT_REMOTE_PEER_ID.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_batch_limit: DEFAULT_POLL_BATCH_LIMIT,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            framerate: DEFAULT_FRAMERATE,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl SessionConfig {
    /// Build a config for the given relay and peer pair, keeping default tunables.
    pub fn new(
        relay_address: impl Into<String>,
        local_peer_id: impl Into<String>,
        remote_peer_id: impl Into<String>,
    ) -> Self {
        Self {
            relay_address: relay_address.into(),
            local_peer_id: local_peer_id.into(),
            remote_peer_id: remote_peer_id.into(),
            ..Self::default()
        }
    }

    /// Check the config and normalize the relay address to end with `/`.
    pub fn validate(mut self) -> Result<Self> {
        let relay = self.relay_address.trim();
        let lower = relay.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(Error::config(format!(
                "relay address must be an http(s) URL, got {:?}",
                self.relay_address
            )));
        }
        self.relay_address = if relay.ends_with('/') {
            relay.to_string()
        } else {
            format!("{relay}/")
        };

        validate_peer_id("local peer id", &self.local_peer_id)?;
        validate_peer_id("remote peer id", &self.remote_peer_id)?;
        if self.local_peer_id == self.remote_peer_id {
            return Err(Error::config("local and remote peer ids must differ"));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.poll_batch_limit == 0 {
            return Err(Error::config("poll batch limit must be at least 1"));
        }
        if self.framerate == 0 {
            return Err(Error::config("framerate must be greater than zero"));
        }
        Ok(self)
    }

    /// Read a JSON config file. Missing fields take their defaults; the result
    /// is validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&raw)?;
        debug!("loaded session config from {}", path.display());
        config.validate()
    }

    /// URL of the relay mailbox for `peer_id`.
    pub fn mailbox_url(&self, peer_id: &str) -> String {
        format!("{}data/{}", self.relay_address, peer_id)
    }
}

fn validate_peer_id(label: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::config(format!("{label} must not be empty")));
    }
    if id.contains('/') || id.chars().any(char::is_whitespace) {
        return Err(Error::config(format!(
            "{label} {id:?} must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
