//! Background fetch loop.
//!
//! Drains every joined channel into the session's message buffer on a fixed
//! cadence. The loop shares the session lock with the foreground: it takes a
//! snapshot of the channel names, then re-acquires the lock once per channel
//! so commands can interleave between fetches.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broker::{Broker, BrokerError};
use crate::session::{SessionState, SharedState};

/// Default time between cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default extra sleep when no channel is joined.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_secs(3);

/// Default bounded wait of a single fetch.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Shortest cadence the loop runs at, whatever it is configured with.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fetch loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    /// Time between cycles.
    pub poll_interval: Duration,
    /// Extra sleep after a cycle that found no joined channel.
    pub idle_backoff: Duration,
    /// How long one fetch may wait for records.
    pub max_wait: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Counters for one cycle that had channels to poll.
#[derive(Debug, Default)]
pub struct CycleStats {
    /// Channels fetched from (successfully or not).
    pub polled: usize,
    /// Records pushed into the buffer.
    pub fetched: usize,
    /// Channels skipped because they were detached.
    pub skipped: usize,
    /// Channels whose fetch failed.
    pub failed: Vec<(String, BrokerError)>,
}

/// What one call to [`FetchLoop::poll_once`] did.
#[derive(Debug)]
pub enum CycleReport {
    /// No channel was joined.
    Idle,
    /// At least one channel was considered.
    Polled(CycleStats),
}

/// Periodically drains joined channels into the message buffer.
pub struct FetchLoop<B: Broker> {
    shared: SharedState<B>,
    config: FetchConfig,
}

impl<B: Broker> FetchLoop<B> {
    /// Creates a loop over the given session state.
    #[must_use]
    pub const fn new(shared: SharedState<B>, config: FetchConfig) -> Self {
        Self { shared, config }
    }

    /// Runs a single cycle.
    ///
    /// Channels left or detached since the snapshot are skipped. A failing
    /// channel is logged and recorded; the others are still fetched.
    pub async fn poll_once(&self) -> CycleReport {
        let names = self.shared.lock().await.registry.names();
        if names.is_empty() {
            return CycleReport::Idle;
        }

        let mut stats = CycleStats::default();
        for name in names {
            let mut state = self.shared.lock().await;
            let SessionState {
                registry, buffer, ..
            } = &mut *state;

            let Some(handle) = registry.get_mut(&name) else {
                continue;
            };
            if handle.is_detached() {
                stats.skipped += 1;
                continue;
            }

            stats.polled += 1;
            match handle.fetch(self.config.max_wait).await {
                Ok(records) => {
                    stats.fetched += records.len();
                    for record in records {
                        buffer.push(&name, String::from_utf8_lossy(&record.payload));
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "fetch failed, skipping channel this cycle");
                    stats.failed.push((name, e));
                }
            }
        }

        CycleReport::Polled(stats)
    }

    /// Spawns the loop onto the runtime. It runs until the handle is
    /// aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_wait_ms = self.config.max_wait.as_millis(),
            "fetch loop started"
        );

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                CycleReport::Idle => tokio::time::sleep(self.config.idle_backoff).await,
                CycleReport::Polled(stats) => {
                    tracing::trace!(
                        polled = stats.polled,
                        fetched = stats.fetched,
                        skipped = stats.skipped,
                        failed = stats.failed.len(),
                        "fetch cycle"
                    );
                }
            }
        }
    }
}
