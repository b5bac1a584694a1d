//! Loopback broker for testing.
//!
//! Keeps every channel log in process memory. Cloned handles share the same
//! broker, so a test can keep one clone to inject traffic and faults while
//! the session under test owns another. Faults are sticky until cleared:
//!
//! ```rust,no_run
//! use polychat::broker::loopback::LoopbackBroker;
//! use polychat::identity::ClientId;
//!
//! let broker = LoopbackBroker::new();
//! broker.reject_client(&ClientId::new("deadbeef"));
//! broker.fail_fetches("noisy");
//! broker.inject("general", b"(bob) hi");
//! ```

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use polychat_proto::OffsetPolicy;
use tokio::sync::Notify;

use super::{Broker, BrokerError, Cursor, CursorRequest, Publisher, Record};
use crate::identity::ClientId;

/// A payload accepted by the loopback broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    /// Publisher that sent it (`None` for injected traffic).
    pub client_id: Option<ClientId>,
    /// Target channel.
    pub channel: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChannelLog {
    records: Vec<Vec<u8>>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct OpenCursor {
    channel: String,
    client_id: ClientId,
}

#[derive(Debug, Default)]
struct Faults {
    rejected_clients: HashSet<ClientId>,
    rejected_cursor_clients: HashSet<ClientId>,
    unreachable_channels: HashSet<String>,
    failing_fetches: HashSet<String>,
    failing_closes: HashSet<String>,
    publishers_down: bool,
}

#[derive(Debug, Default)]
struct State {
    channels: HashMap<String, ChannelLog>,
    publishers: HashMap<u64, ClientId>,
    cursors: HashMap<u64, OpenCursor>,
    published: Vec<PublishedRecord>,
    faults: Faults,
}

impl State {
    fn append(&mut self, channel: &str, payload: &[u8], client_id: Option<ClientId>) -> u64 {
        let log = self.channels.entry(channel.to_string()).or_default();
        log.records.push(payload.to_vec());
        log.notify.notify_waiters();
        self.published.push(PublishedRecord {
            client_id,
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        (log.records.len() - 1) as u64
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    next_handle: AtomicU64,
}

impl Inner {
    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

/// In-process broker shared by cheap clones.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<Inner>,
}

impl LoopbackBroker {
    /// Creates an empty broker with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload as if another client had published it.
    pub fn inject(&self, channel: &str, payload: &[u8]) -> u64 {
        self.inner.state.lock().append(channel, payload, None)
    }

    /// Makes every publisher and cursor open for `client_id` fail.
    pub fn reject_client(&self, client_id: &ClientId) {
        self.inner
            .state
            .lock()
            .faults
            .rejected_clients
            .insert(client_id.clone());
    }

    /// Lifts [`reject_client`](Self::reject_client) and
    /// [`reject_cursors`](Self::reject_cursors).
    pub fn accept_client(&self, client_id: &ClientId) {
        let mut state = self.inner.state.lock();
        state.faults.rejected_clients.remove(client_id);
        state.faults.rejected_cursor_clients.remove(client_id);
    }

    /// Makes cursor opens for `client_id` fail while its publisher still
    /// opens.
    pub fn reject_cursors(&self, client_id: &ClientId) {
        self.inner
            .state
            .lock()
            .faults
            .rejected_cursor_clients
            .insert(client_id.clone());
    }

    /// Makes cursor opens on `channel` fail.
    pub fn make_unreachable(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .faults
            .unreachable_channels
            .insert(channel.to_string());
    }

    /// Lifts [`make_unreachable`](Self::make_unreachable).
    pub fn make_reachable(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .faults
            .unreachable_channels
            .remove(channel);
    }

    /// Makes fetches on `channel` fail.
    pub fn fail_fetches(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .faults
            .failing_fetches
            .insert(channel.to_string());
    }

    /// Lets fetches on `channel` succeed again.
    pub fn restore_fetches(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .faults
            .failing_fetches
            .remove(channel);
    }

    /// Makes cursor closes on `channel` report an error.
    pub fn fail_closes(&self, channel: &str) {
        self.inner
            .state
            .lock()
            .faults
            .failing_closes
            .insert(channel.to_string());
    }

    /// Makes every publisher open and publish fail while `down` is set.
    pub fn set_publishers_down(&self, down: bool) {
        self.inner.state.lock().faults.publishers_down = down;
    }

    /// Every payload accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedRecord> {
        self.inner.state.lock().published.clone()
    }

    /// Number of payloads sent through publishers (injected traffic excluded).
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|r| r.client_id.is_some())
            .count()
    }

    /// Open cursors as `(channel, client id)` pairs, sorted by channel.
    #[must_use]
    pub fn open_cursors(&self) -> Vec<(String, ClientId)> {
        let mut cursors: Vec<(String, ClientId)> = self
            .inner
            .state
            .lock()
            .cursors
            .values()
            .map(|c| (c.channel.clone(), c.client_id.clone()))
            .collect();
        cursors.sort_by(|a, b| a.0.cmp(&b.0));
        cursors
    }

    /// Client ids of all open publishers.
    #[must_use]
    pub fn open_publishers(&self) -> Vec<ClientId> {
        self.inner.state.lock().publishers.values().cloned().collect()
    }
}

impl Broker for LoopbackBroker {
    type Publisher = LoopbackPublisher;
    type Cursor = LoopbackCursor;

    async fn open_publisher(&self, client_id: &ClientId) -> Result<LoopbackPublisher, BrokerError> {
        let mut state = self.inner.state.lock();
        if state.faults.publishers_down {
            return Err(BrokerError::Unreachable("loopback publisher service".to_string()));
        }
        if state.faults.rejected_clients.contains(client_id) {
            return Err(BrokerError::Rejected(format!("client {client_id} rejected")));
        }
        let handle = self.inner.next_handle();
        state.publishers.insert(handle, client_id.clone());
        drop(state);

        Ok(LoopbackPublisher {
            inner: Arc::clone(&self.inner),
            handle,
            client_id: client_id.clone(),
        })
    }

    async fn open_cursor(&self, request: &CursorRequest) -> Result<LoopbackCursor, BrokerError> {
        let mut state = self.inner.state.lock();
        if state.faults.rejected_clients.contains(&request.client_id)
            || state.faults.rejected_cursor_clients.contains(&request.client_id)
        {
            return Err(BrokerError::Rejected(format!(
                "client {} rejected",
                request.client_id
            )));
        }
        if state.faults.unreachable_channels.contains(&request.channel) {
            return Err(BrokerError::Unreachable(request.channel.clone()));
        }
        let log = state.channels.entry(request.channel.clone()).or_default();
        let position = match request.policy {
            OffsetPolicy::Latest => log.records.len(),
            OffsetPolicy::Earliest => 0,
        };
        let handle = self.inner.next_handle();
        state.cursors.insert(
            handle,
            OpenCursor {
                channel: request.channel.clone(),
                client_id: request.client_id.clone(),
            },
        );
        drop(state);

        Ok(LoopbackCursor {
            inner: Arc::clone(&self.inner),
            handle,
            channel: request.channel.clone(),
            position,
        })
    }
}

/// Publisher handle of a [`LoopbackBroker`].
#[derive(Debug)]
pub struct LoopbackPublisher {
    inner: Arc<Inner>,
    handle: u64,
    client_id: ClientId,
}

impl Publisher for LoopbackPublisher {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.publishers.contains_key(&self.handle) {
            return Err(BrokerError::ConnectionClosed);
        }
        if state.faults.publishers_down {
            return Err(BrokerError::Unreachable("loopback publisher service".to_string()));
        }
        state.append(channel, payload, Some(self.client_id.clone()));
        Ok(())
    }

    async fn close(self) -> Result<(), BrokerError> {
        self.inner.state.lock().publishers.remove(&self.handle);
        Ok(())
    }
}

/// Cursor handle of a [`LoopbackBroker`].
#[derive(Debug)]
pub struct LoopbackCursor {
    inner: Arc<Inner>,
    handle: u64,
    channel: String,
    position: usize,
}

impl LoopbackCursor {
    fn notifier(&self) -> Arc<Notify> {
        let mut state = self.inner.state.lock();
        Arc::clone(&state.channels.entry(self.channel.clone()).or_default().notify)
    }

    fn read_pending(&mut self) -> Result<Vec<Record>, BrokerError> {
        let state = self.inner.state.lock();
        if !state.cursors.contains_key(&self.handle) {
            return Err(BrokerError::ConnectionClosed);
        }
        if state.faults.failing_fetches.contains(&self.channel) {
            return Err(BrokerError::Unreachable(self.channel.clone()));
        }
        let Some(log) = state.channels.get(&self.channel) else {
            return Ok(Vec::new());
        };
        let records: Vec<Record> = log.records[self.position.min(log.records.len())..]
            .iter()
            .zip(self.position as u64..)
            .map(|(payload, offset)| Record {
                offset,
                payload: payload.clone(),
            })
            .collect();
        self.position += records.len();
        Ok(records)
    }
}

impl Cursor for LoopbackCursor {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Vec<Record>, BrokerError> {
        let notify = self.notifier();
        let mut notified = pin!(notify.notified());
        notified.as_mut().enable();

        let records = self.read_pending()?;
        if !records.is_empty() || max_wait.is_zero() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(max_wait, notified).await;
        self.read_pending()
    }

    async fn close(self) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.cursors.remove(&self.handle);
        if state.faults.failing_closes.contains(&self.channel) {
            return Err(BrokerError::Rejected(format!(
                "close failed for {}",
                self.channel
            )));
        }
        Ok(())
    }
}
