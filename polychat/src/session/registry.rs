//! Joined channels and their read cursors.
//!
//! The registry owns one [`ChannelHandle`] per joined channel. It never
//! talks to the session's lock; callers hold the lock while they call in.

use std::collections::BTreeMap;
use std::time::Duration;

use polychat_proto::OffsetPolicy;

use super::SessionError;
use crate::broker::{Broker, BrokerError, Cursor, CursorRequest, Record};
use crate::identity::ClientId;

/// An open (or detached) read cursor on one channel.
#[derive(Debug)]
pub struct ChannelHandle<C> {
    name: String,
    bound_to: ClientId,
    cursor: Option<C>,
}

impl<C: Cursor> ChannelHandle<C> {
    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client id the cursor was opened under, or `None` while detached.
    #[must_use]
    pub fn bound_to(&self) -> Option<&ClientId> {
        self.cursor.as_ref().map(|_| &self.bound_to)
    }

    /// Whether the cursor was lost during a rebuild and not yet reopened.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.cursor.is_none()
    }

    /// Fetches pending records, waiting at most `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionClosed`] for a detached handle, or
    /// whatever the cursor reports.
    pub async fn fetch(&mut self, max_wait: Duration) -> Result<Vec<Record>, BrokerError> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.fetch(max_wait).await,
            None => Err(BrokerError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        match self.cursor.take() {
            Some(cursor) => cursor.close().await,
            None => Ok(()),
        }
    }
}

/// Outcome of [`ChannelRegistry::rebuild_all`].
#[derive(Debug, Default)]
pub struct RebuildResult {
    /// Channels whose cursor now runs under the requested client id.
    pub rebuilt: Vec<String>,
    /// First channel that could not be reopened, with the reason.
    pub first_error: Option<(String, BrokerError)>,
}

impl RebuildResult {
    /// Whether every channel was rebuilt.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Joined channels keyed by name, iterated in name order.
#[derive(Debug)]
pub struct ChannelRegistry<C> {
    channels: BTreeMap<String, ChannelHandle<C>>,
    policy: OffsetPolicy,
}

impl<C: Cursor> ChannelRegistry<C> {
    /// Creates an empty registry whose cursors all start per `policy`.
    #[must_use]
    pub const fn new(policy: OffsetPolicy) -> Self {
        Self {
            channels: BTreeMap::new(),
            policy,
        }
    }

    /// Offset policy fixed for this registry.
    #[must_use]
    pub const fn policy(&self) -> OffsetPolicy {
        self.policy
    }

    /// Opens a cursor on `name` under `client_id` and records it.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyJoined`] if `name` is already present.
    /// - [`SessionError::ChannelUnreachable`] if the cursor cannot be opened;
    ///   the registry is left unchanged.
    pub async fn join<B>(
        &mut self,
        broker: &B,
        name: &str,
        client_id: &ClientId,
    ) -> Result<(), SessionError>
    where
        B: Broker<Cursor = C>,
    {
        if self.channels.contains_key(name) {
            return Err(SessionError::AlreadyJoined(name.to_string()));
        }

        let request = CursorRequest::for_channel(name, client_id, self.policy);
        let cursor = broker
            .open_cursor(&request)
            .await
            .map_err(|source| SessionError::ChannelUnreachable {
                channel: name.to_string(),
                source,
            })?;

        tracing::info!(channel = %name, cursor_id = %request.cursor_id, "joined channel");
        self.channels.insert(
            name.to_string(),
            ChannelHandle {
                name: name.to_string(),
                bound_to: client_id.clone(),
                cursor: Some(cursor),
            },
        );
        Ok(())
    }

    /// Closes and removes `name`.
    ///
    /// The entry is removed even when closing fails; the close failure is
    /// returned as `Ok(Some(error))`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotJoined`] if `name` is absent.
    pub async fn leave(&mut self, name: &str) -> Result<Option<BrokerError>, SessionError> {
        let Some(mut handle) = self.channels.remove(name) else {
            return Err(SessionError::NotJoined(name.to_string()));
        };

        let close_error = handle.close().await.err();
        if let Some(e) = &close_error {
            tracing::warn!(channel = %name, error = %e, "cursor close failed, channel removed anyway");
        } else {
            tracing::info!(channel = %name, "left channel");
        }
        Ok(close_error)
    }

    /// Reopens every cursor under `client_id`.
    ///
    /// Each old cursor is closed first (failures are logged and ignored).
    /// A channel whose new cursor cannot be opened stays in the registry
    /// detached, so a later rebuild can restore it. All channels are
    /// attempted; the first failure is reported.
    pub async fn rebuild_all<B>(&mut self, broker: &B, client_id: &ClientId) -> RebuildResult
    where
        B: Broker<Cursor = C>,
    {
        let mut result = RebuildResult::default();

        for (name, handle) in &mut self.channels {
            if let Err(e) = handle.close().await {
                tracing::warn!(channel = %name, error = %e, "closing cursor before rebuild failed");
            }

            let request = CursorRequest::for_channel(name, client_id, self.policy);
            match broker.open_cursor(&request).await {
                Ok(cursor) => {
                    handle.cursor = Some(cursor);
                    handle.bound_to = client_id.clone();
                    result.rebuilt.push(name.clone());
                }
                Err(e) => {
                    tracing::warn!(channel = %name, client_id = %client_id, error = %e, "cursor rebuild failed");
                    if result.first_error.is_none() {
                        result.first_error = Some((name.clone(), e));
                    }
                }
            }
        }

        result
    }

    /// Closes every cursor and empties the registry, returning the close
    /// failures.
    pub async fn close_all(&mut self) -> Vec<(String, BrokerError)> {
        let mut failures = Vec::new();
        for (name, mut handle) in std::mem::take(&mut self.channels) {
            if let Err(e) = handle.close().await {
                tracing::warn!(channel = %name, error = %e, "cursor close failed during shutdown");
                failures.push((name, e));
            }
        }
        failures
    }

    /// Joined channel names in stable order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Whether `name` is joined.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Mutable access to one handle.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChannelHandle<C>> {
        self.channels.get_mut(name)
    }

    /// Iterates over the handles in name order.
    pub fn handles(&self) -> impl Iterator<Item = &ChannelHandle<C>> {
        self.channels.values()
    }

    /// Number of joined channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
