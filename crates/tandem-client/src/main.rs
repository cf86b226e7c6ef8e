use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tandem_client::{NodeDssSignaler, Orchestrator};
use tandem_common::config::{
    DEFAULT_FRAMERATE, DEFAULT_LOCAL_PEER_ID, DEFAULT_POLL_BATCH_LIMIT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_RELAY_ADDRESS, DEFAULT_REMOTE_PEER_ID, DEFAULT_SEND_RETRY_LIMIT, DEFAULT_STUN_SERVER,
};
use tandem_common::SessionConfig;
use tandem_media::{RenderLoopHost, RenderSink, StatsSink, SyntheticEngine};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tandem-client", about = "Peer-to-peer video call over a node-dss relay")]
struct Args {
    /// JSON session config; replaces the session flags below
    #[arg(long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Relay base URL
    #[arg(long, env = "TANDEM_RELAY_URL", default_value = DEFAULT_RELAY_ADDRESS)]
    relay: String,

    /// Mailbox id of this peer
    #[arg(long, env = "TANDEM_LOCAL_ID", default_value = DEFAULT_LOCAL_PEER_ID)]
    local_id: String,

    /// Mailbox id of the other peer
    #[arg(long, env = "TANDEM_REMOTE_ID", default_value = DEFAULT_REMOTE_PEER_ID)]
    remote_id: String,

    /// Relay poll interval in milliseconds
    #[arg(long, env = "TANDEM_POLL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_ms: u64,

    /// Messages fetched per poll tick at most
    #[arg(long, default_value_t = DEFAULT_POLL_BATCH_LIMIT)]
    poll_batch: usize,

    /// Extra attempts for a failed send
    #[arg(long, default_value_t = DEFAULT_SEND_RETRY_LIMIT)]
    send_retries: u32,

    /// Frame rate assumed for render pipelines
    #[arg(long, env = "TANDEM_FRAMERATE", default_value_t = DEFAULT_FRAMERATE)]
    framerate: u32,

    /// ICE server URL (repeatable)
    #[arg(long = "ice-server", default_value = DEFAULT_STUN_SERVER)]
    ice_servers: Vec<String>,

    /// Start the call instead of waiting for an offer
    #[arg(long, default_value_t = false)]
    offer: bool,

    /// Seconds between render statistics lines
    #[arg(long, default_value_t = 5)]
    stats_secs: u64,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn session_config(&self) -> Result<SessionConfig> {
        if let Some(path) = &self.config {
            return Ok(SessionConfig::load(path)?);
        }
        let config = SessionConfig {
            relay_address: self.relay.clone(),
            local_peer_id: self.local_id.clone(),
            remote_peer_id: self.remote_id.clone(),
            poll_interval: Duration::from_millis(self.poll_ms),
            poll_batch_limit: self.poll_batch,
            send_retry_limit: self.send_retries,
            framerate: self.framerate,
            ice_servers: self.ice_servers.clone(),
        };
        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tandem_common::init_tracing_with_default(&args.log_level);

    let config = args.session_config()?;
    let transport = Arc::new(NodeDssSignaler::new(&config)?);
    let stats_every = Duration::from_secs(args.stats_secs.max(1));
    let host = RenderLoopHost::new(move |kind, _format| {
        Box::new(StatsSink::new(kind, stats_every)) as Box<dyn RenderSink>
    });

    let (orchestrator, handle) =
        Orchestrator::new(config, transport, SyntheticEngine::new, host)?;
    let mut session = tokio::spawn(orchestrator.run());

    if args.offer {
        info!("starting call");
        handle.create_offer();
    } else {
        info!("waiting for an offer");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            handle.close();
            session.await?;
        }
        result = &mut session => {
            result?;
            info!("session ended");
        }
    }

    Ok(())
}
