//! `Polychat` broker: an in-memory publish/subscribe server.
//!
//! ```bash
//! # Listen on 0.0.0.0:9092 with default limits
//! cargo run --bin polychat-broker
//!
//! # Smaller logs and a tighter fetch hold
//! cargo run --bin polychat-broker -- --retention 100 --max-fetch-wait-ms 5000
//!
//! # Settings from a file (see `polychat_broker::config` for the format)
//! cargo run --bin polychat-broker -- --config broker.toml
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use polychat_broker::config::{BrokerCliArgs, BrokerConfig};
use polychat_broker::server;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("polychat-broker: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_payload_size = config.limits.max_payload_size,
        max_fetch_wait = ?config.limits.max_fetch_wait,
        retention = config.retention,
        "starting polychat broker"
    );

    let state = Arc::new(config.state());
    let handle = match server::start_server_with_state(config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            handle
        }
        Err(e) => {
            tracing::error!(error = %e, addr = %config.bind_addr, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    match handle.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "broker server task failed");
            ExitCode::FAILURE
        }
    }
}
