//! Received-but-undisplayed messages.

use std::fmt;

/// A message fetched from a joined channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Channel the message was fetched from.
    pub channel: String,
    /// Payload decoded as text.
    pub text: String,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.channel, self.text)
    }
}

/// Queue filled by the fetch loop and emptied by the display path.
///
/// Draining hands messages back most-recently-fetched first.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    messages: Vec<ReceivedMessage>,
}

impl MessageBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Appends a message fetched from `channel`.
    pub fn push(&mut self, channel: &str, text: impl Into<String>) {
        self.messages.push(ReceivedMessage {
            channel: channel.to_string(),
            text: text.into(),
        });
    }

    /// Removes and returns every buffered message, newest first.
    pub fn drain_all(&mut self) -> Vec<ReceivedMessage> {
        let mut drained = std::mem::take(&mut self.messages);
        drained.reverse();
        drained
    }

    /// Whether nothing is waiting to be displayed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }
}
