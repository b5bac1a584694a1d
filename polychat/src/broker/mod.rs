//! Broker adapter abstraction for `Polychat`.
//!
//! Defines the [`Broker`], [`Publisher`] and [`Cursor`] traits the session
//! core talks to. Concrete implementations include:
//! - [`loopback::LoopbackBroker`] — in-process broker with fault injection for testing
//! - [`ws::WsBroker`] — WebSocket client for a `polychat-broker` server
//!
//! The broker address is fixed when the adapter is constructed; every
//! publisher and cursor it opens talks to that broker.

pub mod loopback;
pub mod ws;

use std::future::Future;
use std::time::Duration;

use polychat_proto::OffsetPolicy;
use polychat_proto::broker::DEFAULT_PARTITION;

pub use polychat_proto::broker::Record;

use crate::identity::ClientId;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker refused the request.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// The operation did not complete within its time bound.
    #[error("broker operation timed out")]
    Timeout,

    /// The connection backing a publisher or cursor is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The broker sent something the adapter did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Everything needed to open a read cursor on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRequest {
    /// Broker-side identifier of the cursor.
    pub cursor_id: String,
    /// Channel to read.
    pub channel: String,
    /// Channel partition.
    pub partition: u32,
    /// Starting position.
    pub policy: OffsetPolicy,
    /// Client the cursor is opened for.
    pub client_id: ClientId,
}

impl CursorRequest {
    /// Builds the request a client uses for `channel`: cursor id
    /// `"{channel}_{client_id}"` on the default partition.
    #[must_use]
    pub fn for_channel(channel: &str, client_id: &ClientId, policy: OffsetPolicy) -> Self {
        Self {
            cursor_id: format!("{channel}_{client_id}"),
            channel: channel.to_string(),
            partition: DEFAULT_PARTITION,
            policy,
            client_id: client_id.clone(),
        }
    }
}

/// Factory for publishers and cursors on one broker.
pub trait Broker: Send + Sync + 'static {
    /// Publisher type produced by this broker.
    type Publisher: Publisher;
    /// Cursor type produced by this broker.
    type Cursor: Cursor;

    /// Opens a publisher identified by `client_id`.
    fn open_publisher(
        &self,
        client_id: &ClientId,
    ) -> impl Future<Output = Result<Self::Publisher, BrokerError>> + Send;

    /// Opens a positioned read cursor.
    fn open_cursor(
        &self,
        request: &CursorRequest,
    ) -> impl Future<Output = Result<Self::Cursor, BrokerError>> + Send;
}

/// Sends payloads to named channels.
pub trait Publisher: Send + Sync + 'static {
    /// Publishes `payload` to `channel`.
    ///
    /// Returns once the broker has accepted the payload.
    fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Closes the publisher. The publisher is gone even when this fails.
    fn close(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A positioned read handle on one channel.
pub trait Cursor: Send + 'static {
    /// Returns every record past the cursor position, waiting at most
    /// `max_wait` for one to arrive. An empty batch means nothing new.
    fn fetch(
        &mut self,
        max_wait: Duration,
    ) -> impl Future<Output = Result<Vec<Record>, BrokerError>> + Send;

    /// Closes the cursor. The cursor is gone even when this fails.
    fn close(self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
