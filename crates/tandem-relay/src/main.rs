use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tandem_relay::{RelayConfig, DEFAULT_BODY_LIMIT, DEFAULT_QUEUE_LIMIT};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tandem-relay", about = "node-dss compatible signaling relay")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TANDEM_RELAY_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Messages kept per peer before the oldest is dropped
    #[arg(long, default_value_t = DEFAULT_QUEUE_LIMIT)]
    queue_limit: usize,

    /// Maximum request body in bytes
    #[arg(long, default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: usize,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tandem_common::init_tracing_with_default(&args.log_level);

    let listener = TcpListener::bind(args.listen).await?;
    let config = RelayConfig {
        queue_limit: args.queue_limit,
        body_limit: args.body_limit,
    };

    tandem_relay::serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("relay shutdown requested");
    })
    .await?;

    Ok(())
}
