//! Configuration for the `Polychat` client.
//!
//! Priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. Compiled defaults
//!
//! The client has no config file and persists nothing between runs. The
//! three positionals (host, port, nickname) are the whole required surface;
//! everything else is an optional tunable.

use std::path::PathBuf;
use std::time::Duration;

use polychat_proto::OffsetPolicy;

use crate::fetch::FetchConfig;
use crate::identity;
use crate::session::SessionParams;

/// Broker host used when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// Broker port used when none (or an invalid one) is given.
pub const DEFAULT_PORT: u16 = 9092;

/// Longest accepted poll interval or fetch wait: one hour.
const MAX_TUNABLE_MS: u64 = 60 * 60 * 1000;

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Initial nickname.
    pub nickname: String,
    /// Where new cursors start reading.
    pub offset_policy: OffsetPolicy,
    /// Time between fetch cycles.
    pub poll_interval: Duration,
    /// Extra sleep when no channel is joined.
    pub idle_backoff: Duration,
    /// Bounded wait of a single fetch.
    pub fetch_wait: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            nickname: identity::random_nickname(),
            offset_policy: OffsetPolicy::default(),
            poll_interval: fetch.poll_interval,
            idle_backoff: fetch.idle_backoff,
            fetch_wait: fetch.max_wait,
        }
    }
}

impl ClientConfig {
    /// Resolve a `ClientConfig` from parsed CLI args (env already applied
    /// by clap).
    ///
    /// A port that is not a number in `1..=65535` falls back to
    /// [`DEFAULT_PORT`]. A missing nickname is replaced by a random one.
    #[must_use]
    pub fn resolve(cli: &CliArgs) -> Self {
        let defaults = Self::default();

        Self {
            host: cli.host.clone().unwrap_or(defaults.host),
            port: cli.port.as_deref().map_or(defaults.port, parse_port),
            nickname: cli.nick.clone().unwrap_or(defaults.nickname),
            offset_policy: cli.offset_policy.unwrap_or(defaults.offset_policy),
            poll_interval: cli
                .poll_interval_ms
                .map_or(defaults.poll_interval, |ms| Duration::from_millis(ms.max(1))),
            idle_backoff: cli
                .idle_backoff_ms
                .map_or(defaults.idle_backoff, Duration::from_millis),
            fetch_wait: cli
                .fetch_wait_ms
                .map_or(defaults.fetch_wait, Duration::from_millis),
        }
    }

    /// Parameters for [`crate::session::Session::connect`].
    #[must_use]
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            host: self.host.clone(),
            port: self.port,
            nickname: self.nickname.clone(),
            offset_policy: self.offset_policy,
        }
    }

    /// Timing for the fetch loop.
    #[must_use]
    pub const fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            poll_interval: self.poll_interval,
            idle_backoff: self.idle_backoff,
            max_wait: self.fetch_wait,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Multi-channel chat over a publish/subscribe broker")]
pub struct CliArgs {
    /// Broker host (default: localhost).
    pub host: Option<String>,

    /// Broker port (default: 9092; invalid values fall back to it).
    pub port: Option<String>,

    /// Nickname (default: 8 random lowercase letters).
    pub nick: Option<String>,

    /// Where new cursors start reading: latest or earliest.
    #[arg(long, env = "POLYCHAT_OFFSET_POLICY")]
    pub offset_policy: Option<OffsetPolicy>,

    /// Milliseconds between fetch cycles (1 to 3600000).
    #[arg(
        long,
        env = "POLYCHAT_POLL_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TUNABLE_MS)
    )]
    pub poll_interval_ms: Option<u64>,

    /// Extra milliseconds to sleep when no channel is joined.
    #[arg(long, env = "POLYCHAT_IDLE_BACKOFF_MS")]
    pub idle_backoff_ms: Option<u64>,

    /// Maximum milliseconds a single fetch waits for records (0 to 3600000).
    #[arg(
        long,
        env = "POLYCHAT_FETCH_WAIT_MS",
        value_parser = clap::value_parser!(u64).range(..=MAX_TUNABLE_MS)
    )]
    pub fetch_wait_ms: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "POLYCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/polychat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn parse_port(raw: &str) -> u16 {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => {
            tracing::warn!(port = %raw, fallback = DEFAULT_PORT, "invalid port, using default");
            DEFAULT_PORT
        }
    }
}
