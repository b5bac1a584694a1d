//! In-memory channel logs.
//!
//! [`Topics`] holds one append-only log per channel. Offsets grow forever;
//! when a log exceeds its retention cap the oldest record is evicted and the
//! log's first offset moves forward. Readers blocked in [`Topics::fetch`] are
//! woken through a per-channel [`Notify`] whenever something is appended.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use polychat_proto::OffsetPolicy;
use polychat_proto::broker::Record;
use tokio::sync::{Notify, RwLock};

/// Default number of records retained per channel.
const DEFAULT_RETENTION: usize = 1000;

/// Maximum number of records returned by a single read.
pub const MAX_BATCH: usize = 256;

/// One channel's retained records.
#[derive(Debug, Default)]
struct ChannelLog {
    /// Offset of `records[0]`.
    first_offset: u64,
    records: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

impl ChannelLog {
    /// Offset that the next appended record will receive.
    fn next_offset(&self) -> u64 {
        self.first_offset + self.records.len() as u64
    }
}

/// Thread-safe set of channel logs with FIFO eviction.
pub struct Topics {
    logs: RwLock<HashMap<String, ChannelLog>>,
    retention: usize,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new()
    }
}

impl Topics {
    /// Creates an empty set of logs with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Creates an empty set of logs keeping at most `retention` records per
    /// channel.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    /// Appends a payload to `channel` and returns its offset.
    pub async fn append(&self, channel: &str, payload: Vec<u8>) -> u64 {
        let mut logs = self.logs.write().await;
        let log = logs.entry(channel.to_string()).or_default();
        let offset = log.next_offset();
        log.records.push_back(payload);
        if log.records.len() > self.retention {
            log.records.pop_front();
            log.first_offset += 1;
        }
        log.notify.notify_waiters();
        drop(logs);
        offset
    }

    /// Returns the offset a new cursor on `channel` starts at.
    pub async fn start_offset(&self, channel: &str, policy: OffsetPolicy) -> u64 {
        let mut logs = self.logs.write().await;
        let log = logs.entry(channel.to_string()).or_default();
        match policy {
            OffsetPolicy::Latest => log.next_offset(),
            OffsetPolicy::Earliest => log.first_offset,
        }
    }

    /// Reads up to [`MAX_BATCH`] records starting at `offset`.
    ///
    /// Returns the records and the offset to read from next. An `offset`
    /// that points at already evicted records resumes from the oldest
    /// retained one.
    pub async fn read_from(&self, channel: &str, offset: u64) -> (Vec<Record>, u64) {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(channel) else {
            return (Vec::new(), offset);
        };

        let start = offset.max(log.first_offset);
        let skip = usize::try_from(start - log.first_offset).unwrap_or(usize::MAX);
        let records: Vec<Record> = log
            .records
            .iter()
            .skip(skip)
            .take(MAX_BATCH)
            .zip(start..)
            .map(|(payload, offset)| Record {
                offset,
                payload: payload.clone(),
            })
            .collect();
        let next = start + records.len() as u64;
        (records, next)
    }

    /// Reads from `offset`, waiting up to `max_wait` for a record to be
    /// appended when none is pending.
    pub async fn fetch(
        &self,
        channel: &str,
        offset: u64,
        max_wait: Duration,
    ) -> (Vec<Record>, u64) {
        let notify = self.notifier(channel).await;
        let mut notified = pin!(notify.notified());
        notified.as_mut().enable();

        let (records, next) = self.read_from(channel, offset).await;
        if !records.is_empty() || max_wait.is_zero() {
            return (records, next);
        }

        let _ = tokio::time::timeout(max_wait, notified).await;
        self.read_from(channel, offset).await
    }

    /// Number of channels that have been published to or read from.
    pub async fn channel_count(&self) -> usize {
        self.logs.read().await.len()
    }

    /// Number of records currently retained for `channel`.
    pub async fn retained(&self, channel: &str) -> usize {
        self.logs
            .read()
            .await
            .get(channel)
            .map_or(0, |log| log.records.len())
    }

    async fn notifier(&self, channel: &str) -> Arc<Notify> {
        let mut logs = self.logs.write().await;
        Arc::clone(&logs.entry(channel.to_string()).or_default().notify)
    }
}
