//! Broker wire protocol types.
//!
//! Defines the [`BrokerMessage`] enum that is postcard-encoded and sent over
//! WebSocket binary frames between broker clients and the broker server.
//!
//! Every connection plays exactly one role, chosen by its first frame:
//!
//! * a **publisher** connection opens with [`BrokerMessage::OpenPublisher`]
//!   and then sends [`BrokerMessage::Publish`] frames, each answered by
//!   [`BrokerMessage::Published`];
//! * a **cursor** connection opens with [`BrokerMessage::OpenCursor`] and then
//!   sends [`BrokerMessage::Fetch`] frames, each answered by
//!   [`BrokerMessage::Batch`].
//!
//! Any request may instead be answered by [`BrokerMessage::Error`]. Closing
//! the WebSocket closes the publisher or cursor.

use serde::{Deserialize, Serialize};

use crate::offset::OffsetPolicy;

/// The only partition a channel has.
pub const DEFAULT_PARTITION: u32 = 0;

/// A single retained message as delivered to a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position of the record in its channel log.
    pub offset: u64,
    /// Opaque payload bytes as published.
    pub payload: Vec<u8>,
}

/// Messages exchanged between broker clients and the broker server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerMessage {
    /// Turns this connection into a publisher owned by `client_id`.
    OpenPublisher {
        /// Identifier of the publishing client.
        client_id: String,
    },

    /// Server confirms the publisher is ready.
    PublisherReady,

    /// Appends `payload` to `channel`, creating the channel if needed.
    Publish {
        /// Target channel name.
        channel: String,
        /// Opaque payload bytes.
        payload: Vec<u8>,
    },

    /// Server confirms a publish and reports the assigned offset.
    Published {
        /// Channel the payload was appended to.
        channel: String,
        /// Offset assigned to the payload.
        offset: u64,
    },

    /// Turns this connection into a read cursor on one channel partition.
    OpenCursor {
        /// Identifier of the cursor (unique per client and channel).
        cursor_id: String,
        /// Channel to read.
        channel: String,
        /// Partition to read; only [`DEFAULT_PARTITION`] exists.
        partition: u32,
        /// Where the cursor starts.
        policy: OffsetPolicy,
    },

    /// Server confirms the cursor and reports its starting offset.
    CursorReady {
        /// Offset of the next record the cursor will return.
        offset: u64,
    },

    /// Requests every record past the cursor position, waiting up to
    /// `max_wait_ms` for at least one to arrive.
    Fetch {
        /// Upper bound on how long the server may hold the request.
        max_wait_ms: u64,
    },

    /// Records returned for a fetch (possibly empty after the wait expired).
    Batch {
        /// Records in offset order.
        records: Vec<Record>,
    },

    /// Server reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Errors produced by [`encode`] and [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a [`BrokerMessage`] into bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the message cannot be serialized.
pub fn encode(msg: &BrokerMessage) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`BrokerMessage`] from bytes using postcard.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a valid message.
pub fn decode(bytes: &[u8]) -> Result<BrokerMessage, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
