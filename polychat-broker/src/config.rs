//! Broker settings.
//!
//! Each setting is taken from the command line (or its `BROKER_*`
//! environment variable) first, then from the TOML file, then from the
//! built-in default. Values are checked once here, so the server never
//! starts with a limit it cannot honour.
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:9092"
//!
//! [limits]
//! max_payload_size = 65536
//! max_fetch_wait_ms = 30000
//!
//! [channels]
//! retention = 1000
//! ```

use std::fmt::Display;
use std::net::{AddrParseError, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::{BrokerLimits, BrokerState};
use crate::topics::Topics;

/// Address used when neither the command line nor the file names one.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9092";

/// Records kept per channel when nothing else is configured.
pub const DEFAULT_RETENTION: usize = 1000;

/// Accepted payload limits: at least one byte, at most 16 MiB.
const PAYLOAD_LIMIT_RANGE: RangeInclusive<usize> = 1..=16 * 1024 * 1024;

/// Accepted per-channel retention.
const RETENTION_RANGE: RangeInclusive<usize> = 1..=1_000_000;

/// Accepted fetch hold caps in milliseconds: up to five minutes.
const FETCH_WAIT_MS_RANGE: RangeInclusive<u64> = 1..=300_000;

/// Errors that can occur when loading broker configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML or carries an unknown key.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The bind address is not a literal `ip:port` pair.
    #[error("bind address {value:?} is not an ip:port pair: {source}")]
    InvalidBindAddr {
        /// Value as given.
        value: String,
        /// Parser error.
        source: AddrParseError,
    },

    /// A numeric setting falls outside what the broker accepts.
    #[error("{setting} = {value} is outside the allowed range {allowed}")]
    OutOfRange {
        /// Setting name as it appears on the command line.
        setting: &'static str,
        /// Value as given.
        value: String,
        /// Accepted range.
        allowed: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BrokerConfigFile {
    server: ServerSection,
    limits: LimitsSection,
    channels: ChannelsSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind_addr: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LimitsSection {
    max_payload_size: Option<usize>,
    max_fetch_wait_ms: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ChannelsSection {
    retention: Option<usize>,
}

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Polychat publish/subscribe broker")]
pub struct BrokerCliArgs {
    /// Socket address to listen on, e.g. `127.0.0.1:9092`.
    #[arg(short, long, env = "BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/polychat-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted payload in bytes.
    #[arg(long, env = "BROKER_MAX_PAYLOAD_SIZE")]
    pub max_payload_size: Option<usize>,

    /// Longest time a single fetch is held open, in milliseconds.
    #[arg(long, env = "BROKER_MAX_FETCH_WAIT_MS")]
    pub max_fetch_wait_ms: Option<u64>,

    /// Records retained per channel before the oldest is evicted.
    #[arg(long, env = "BROKER_RETENTION")]
    pub retention: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BROKER_LOG")]
    pub log_level: String,
}

/// Checked broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listening socket.
    pub bind_addr: SocketAddr,
    /// Limits handed to every connection.
    pub limits: BrokerLimits,
    /// Records kept per channel.
    pub retention: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl BrokerConfig {
    /// Reads the config file and merges it under the command line.
    ///
    /// An explicit `--config` path must exist. The default path is optional.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// any resolved value is rejected.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = read_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Builds the server state these settings describe.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        BrokerState::with_limits(self.limits, Topics::with_retention(self.retention))
    }

    fn resolve(cli: &BrokerCliArgs, file: &BrokerConfigFile) -> Result<Self, ConfigError> {
        let bind = cli
            .bind
            .as_deref()
            .or(file.server.bind_addr.as_deref())
            .unwrap_or(DEFAULT_BIND_ADDR);
        let bind_addr = bind
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind.to_string(),
                source,
            })?;

        let defaults = BrokerLimits::default();
        let max_payload_size = within(
            "max-payload-size",
            cli.max_payload_size
                .or(file.limits.max_payload_size)
                .unwrap_or(defaults.max_payload_size),
            &PAYLOAD_LIMIT_RANGE,
        )?;
        let fetch_wait_ms = cli
            .max_fetch_wait_ms
            .or(file.limits.max_fetch_wait_ms)
            .unwrap_or_else(|| {
                u64::try_from(defaults.max_fetch_wait.as_millis()).unwrap_or(u64::MAX)
            });
        let max_fetch_wait_ms = within("max-fetch-wait-ms", fetch_wait_ms, &FETCH_WAIT_MS_RANGE)?;
        let retention = within(
            "retention",
            cli.retention
                .or(file.channels.retention)
                .unwrap_or(DEFAULT_RETENTION),
            &RETENTION_RANGE,
        )?;

        Ok(Self {
            bind_addr,
            limits: BrokerLimits {
                max_payload_size,
                max_fetch_wait: Duration::from_millis(max_fetch_wait_ms),
            },
            retention,
            log_level: cli.log_level.clone(),
        })
    }
}

/// Where the broker looks for its file when `--config` is not given.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("polychat-broker").join("config.toml"))
}

fn within<T>(
    setting: &'static str,
    value: T,
    allowed: &RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: PartialOrd + Display,
{
    if allowed.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            setting,
            value: value.to_string(),
            allowed: format!("{}..={}", allowed.start(), allowed.end()),
        })
    }
}

fn read_file(explicit: Option<&Path>) -> Result<BrokerConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match default_path() {
            Some(path) => (path, false),
            None => return Ok(BrokerConfigFile::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(BrokerConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
