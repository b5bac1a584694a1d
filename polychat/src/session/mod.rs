//! Session controller for `Polychat`.
//!
//! A [`Session`] owns everything a connected client has: its identity, the
//! publisher, the joined channels and the buffer of fetched messages. All of
//! it lives in one [`SessionState`] behind a single lock that the
//! foreground command path and the background fetch loop share.
//!
//! # Identity rotation
//!
//! Changing the nickname changes the client id, so the publisher and every
//! cursor must be reopened under the new id. The rotation runs while
//! holding the lock:
//!
//! 1. Close the current publisher.
//! 2. Derive the new id (unsalted) from host, port and the new nickname.
//! 3. Open a publisher under the new id, then rebuild every cursor.
//! 4. On success commit the new id and nickname.
//! 5. On failure reopen the publisher and rebuild every cursor under the old
//!    id. If that fails too the session is left degraded and the outcome
//!    says so.

pub mod buffer;
pub mod registry;

use std::sync::Arc;

use polychat_proto::OffsetPolicy;
use tokio::sync::Mutex;

use crate::broker::{Broker, BrokerError, Publisher};
use crate::command::Command;
use crate::identity::{self, ClientId};

pub use buffer::{MessageBuffer, ReceivedMessage};
pub use registry::{ChannelHandle, ChannelRegistry, RebuildResult};

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The channel is already joined.
    #[error("you already joined {0}")]
    AlreadyJoined(String),

    /// The channel is not joined.
    #[error("you are not joined with channel {0}")]
    NotJoined(String),

    /// A broadcast was attempted with no channel joined.
    #[error("you are not joined with any channel")]
    NoChannelsJoined,

    /// A cursor on the channel could not be opened.
    #[error("cannot connect to {channel}: {source}")]
    ChannelUnreachable {
        /// Channel that failed.
        channel: String,
        /// Broker-side reason.
        source: BrokerError,
    },

    /// The publisher could not be opened or refused a payload.
    #[error("publisher unavailable: {0}")]
    PublisherUnavailable(#[source] BrokerError),

    /// A nickname change failed and was rolled back (or not).
    #[error("cannot change nickname to {nickname}: {cause} ({rollback})")]
    IdentityRotationFailed {
        /// Requested nickname.
        nickname: String,
        /// Why the rotation failed.
        cause: Box<SessionError>,
        /// What happened to the previous identity.
        rollback: RollbackStatus,
    },
}

/// Whether the previous identity was restored after a failed rotation.
#[derive(Debug)]
pub enum RollbackStatus {
    /// Publisher and every cursor run under the previous id again.
    Restored,
    /// Restoring failed; the session may be degraded.
    Failed(Box<SessionError>),
}

impl std::fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restored => write!(f, "previous identity restored"),
            Self::Failed(e) => write!(f, "rollback failed, session may be inconsistent: {e}"),
        }
    }
}

/// Result of [`Session::rotate_identity`].
#[derive(Debug)]
pub enum RotationOutcome {
    /// The new identity is in effect.
    Committed {
        /// The new client id.
        client_id: ClientId,
    },
    /// The rotation failed and the previous identity was restored.
    RolledBack {
        /// Why the rotation failed.
        cause: SessionError,
    },
    /// The rotation failed and so did the rollback.
    Inconsistent {
        /// Why the rotation failed.
        cause: SessionError,
        /// Why the rollback failed.
        rollback_error: SessionError,
    },
}

impl RotationOutcome {
    /// Converts the outcome for a rename to `nickname` into a result.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::IdentityRotationFailed`] for both failure
    /// outcomes.
    pub fn into_result(self, nickname: &str) -> Result<ClientId, SessionError> {
        let (cause, rollback) = match self {
            Self::Committed { client_id } => return Ok(client_id),
            Self::RolledBack { cause } => (cause, RollbackStatus::Restored),
            Self::Inconsistent {
                cause,
                rollback_error,
            } => (cause, RollbackStatus::Failed(Box::new(rollback_error))),
        };
        Err(SessionError::IdentityRotationFailed {
            nickname: nickname.to_string(),
            cause: Box::new(cause),
            rollback,
        })
    }
}

/// What a successfully executed command produced.
#[derive(Debug)]
pub enum Reply {
    /// The nickname (and client id) changed.
    Renamed {
        /// New nickname.
        nickname: String,
    },
    /// A channel was joined.
    Joined {
        /// Joined channel.
        channel: String,
    },
    /// A channel was left.
    Left {
        /// Left channel.
        channel: String,
        /// Set when the cursor did not close cleanly.
        close_error: Option<BrokerError>,
    },
    /// Buffered messages, newest first.
    Messages(Vec<ReceivedMessage>),
    /// A message was published.
    Sent {
        /// Number of channels it went to.
        channels: usize,
    },
    /// The session closed its publisher and cursors.
    Closed {
        /// Resources that did not close cleanly.
        failures: Vec<(String, BrokerError)>,
    },
}

/// The nickname and the client id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Display nickname.
    pub nickname: String,
    /// Broker-facing id.
    pub client_id: ClientId,
}

/// Parameters fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Broker host, part of the client id.
    pub host: String,
    /// Broker port, part of the client id.
    pub port: u16,
    /// Initial nickname.
    pub nickname: String,
    /// Where every cursor of this session starts reading.
    pub offset_policy: OffsetPolicy,
}

/// State shared between the foreground and the fetch loop.
pub struct SessionState<B: Broker> {
    pub(crate) identity: Identity,
    pub(crate) registry: ChannelRegistry<B::Cursor>,
    pub(crate) buffer: MessageBuffer,
    pub(crate) publisher: Option<B::Publisher>,
}

impl<B: Broker> SessionState<B> {
    /// Current identity.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Joined channels.
    #[must_use]
    pub const fn registry(&self) -> &ChannelRegistry<B::Cursor> {
        &self.registry
    }

    /// Buffered messages.
    #[must_use]
    pub const fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }
}

/// Handle to the shared session state.
pub type SharedState<B> = Arc<Mutex<SessionState<B>>>;

/// A connected chat session.
pub struct Session<B: Broker> {
    broker: B,
    host: String,
    port: u16,
    shared: SharedState<B>,
}

impl<B: Broker> Session<B> {
    /// Draws a salted client id and opens the session's publisher.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PublisherUnavailable`] if the publisher
    /// cannot be opened.
    pub async fn connect(broker: B, params: SessionParams) -> Result<Self, SessionError> {
        let salt = identity::random_token();
        let client_id =
            identity::generate(&params.host, params.port, &params.nickname, Some(&salt));

        let publisher = broker
            .open_publisher(&client_id)
            .await
            .map_err(SessionError::PublisherUnavailable)?;

        tracing::info!(
            nickname = %params.nickname,
            client_id = %client_id,
            policy = %params.offset_policy,
            "session connected"
        );

        let state = SessionState {
            identity: Identity {
                nickname: params.nickname,
                client_id,
            },
            registry: ChannelRegistry::new(params.offset_policy),
            buffer: MessageBuffer::new(),
            publisher: Some(publisher),
        };

        Ok(Self {
            broker,
            host: params.host,
            port: params.port,
            shared: Arc::new(Mutex::new(state)),
        })
    }

    /// A handle to the shared state, for the fetch loop.
    #[must_use]
    pub fn shared(&self) -> SharedState<B> {
        Arc::clone(&self.shared)
    }

    /// Current nickname.
    pub async fn nickname(&self) -> String {
        self.shared.lock().await.identity.nickname.clone()
    }

    /// Current client id.
    pub async fn client_id(&self) -> ClientId {
        self.shared.lock().await.identity.client_id.clone()
    }

    /// Joined channel names in stable order.
    pub async fn channels(&self) -> Vec<String> {
        self.shared.lock().await.registry.names()
    }

    /// Each joined channel with the client id its cursor runs under
    /// (`None` for a detached channel).
    pub async fn channel_bindings(&self) -> Vec<(String, Option<ClientId>)> {
        self.shared
            .lock()
            .await
            .registry
            .handles()
            .map(|h| (h.name().to_string(), h.bound_to().cloned()))
            .collect()
    }

    /// Runs one parsed command.
    ///
    /// # Errors
    ///
    /// Returns the [`SessionError`] of the failing operation; the session
    /// stays usable afterwards.
    pub async fn execute(&self, command: Command) -> Result<Reply, SessionError> {
        match command {
            Command::Nick(nickname) => {
                self.rotate_identity(&nickname).await.into_result(&nickname)?;
                Ok(Reply::Renamed { nickname })
            }
            Command::Join(channel) => {
                self.join(&channel).await?;
                Ok(Reply::Joined { channel })
            }
            Command::Leave(channel) => {
                let close_error = self.leave(&channel).await?;
                Ok(Reply::Left {
                    channel,
                    close_error,
                })
            }
            Command::Show => Ok(Reply::Messages(self.take_messages().await)),
            Command::Exit => Ok(Reply::Closed {
                failures: self.shutdown().await,
            }),
            Command::SendTo { channel, text } => {
                self.send_to(&channel, &text).await?;
                Ok(Reply::Sent { channels: 1 })
            }
            Command::Broadcast(text) => {
                let channels = self.broadcast(&text).await?;
                Ok(Reply::Sent { channels })
            }
        }
    }

    /// Joins `channel` under the current client id.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyJoined`] or [`SessionError::ChannelUnreachable`].
    pub async fn join(&self, channel: &str) -> Result<(), SessionError> {
        let mut state = self.shared.lock().await;
        let SessionState {
            identity, registry, ..
        } = &mut *state;
        registry.join(&self.broker, channel, &identity.client_id).await
    }

    /// Leaves `channel`, returning a close failure if there was one.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotJoined`] if `channel` is not joined.
    pub async fn leave(&self, channel: &str) -> Result<Option<BrokerError>, SessionError> {
        self.shared.lock().await.registry.leave(channel).await
    }

    /// Publishes `text` to one joined channel.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotJoined`] if `channel` is not joined (nothing is
    /// published), or [`SessionError::PublisherUnavailable`].
    pub async fn send_to(&self, channel: &str, text: &str) -> Result<(), SessionError> {
        let state = self.shared.lock().await;
        if !state.registry.contains(channel) {
            return Err(SessionError::NotJoined(channel.to_string()));
        }
        let payload = format_payload(&state.identity.nickname, text);
        let publisher = publisher_of(&*state)?;
        publisher
            .publish(channel, payload.as_bytes())
            .await
            .map_err(SessionError::PublisherUnavailable)
    }

    /// Publishes `text` to every joined channel, returning how many.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoChannelsJoined`] if nothing is joined (nothing is
    /// published), or [`SessionError::PublisherUnavailable`] on the first
    /// failing publish.
    pub async fn broadcast(&self, text: &str) -> Result<usize, SessionError> {
        let state = self.shared.lock().await;
        if state.registry.is_empty() {
            return Err(SessionError::NoChannelsJoined);
        }
        let payload = format_payload(&state.identity.nickname, text);
        let publisher = publisher_of(&*state)?;
        let channels = state.registry.names();
        for channel in &channels {
            publisher
                .publish(channel, payload.as_bytes())
                .await
                .map_err(SessionError::PublisherUnavailable)?;
        }
        Ok(channels.len())
    }

    /// Removes and returns buffered messages, newest first.
    pub async fn take_messages(&self) -> Vec<ReceivedMessage> {
        self.shared.lock().await.buffer.drain_all()
    }

    /// Whether fetched messages are waiting.
    pub async fn has_messages(&self) -> bool {
        !self.shared.lock().await.buffer.is_empty()
    }

    /// Changes the nickname, reopening the publisher and every cursor under
    /// the derived id. See the module docs for the protocol.
    pub async fn rotate_identity(&self, new_nickname: &str) -> RotationOutcome {
        let mut state = self.shared.lock().await;
        let old = state.identity.clone();

        if let Some(publisher) = state.publisher.take()
            && let Err(e) = publisher.close().await
        {
            tracing::warn!(client_id = %old.client_id, error = %e, "closing publisher before rotation failed");
        }

        let new_id = identity::generate(&self.host, self.port, new_nickname, None);
        match self.rebind(&mut state, &new_id).await {
            Ok(()) => {
                tracing::info!(
                    old_nickname = %old.nickname,
                    nickname = %new_nickname,
                    client_id = %new_id,
                    "identity rotated"
                );
                state.identity = Identity {
                    nickname: new_nickname.to_string(),
                    client_id: new_id.clone(),
                };
                RotationOutcome::Committed { client_id: new_id }
            }
            Err(cause) => {
                tracing::warn!(nickname = %new_nickname, error = %cause, "identity rotation failed, rolling back");
                match self.rebind(&mut state, &old.client_id).await {
                    Ok(()) => RotationOutcome::RolledBack { cause },
                    Err(rollback_error) => {
                        tracing::error!(
                            client_id = %old.client_id,
                            error = %rollback_error,
                            "rollback failed, session degraded"
                        );
                        RotationOutcome::Inconsistent {
                            cause,
                            rollback_error,
                        }
                    }
                }
            }
        }
    }

    /// Closes the publisher and every cursor, best effort.
    pub async fn shutdown(&self) -> Vec<(String, BrokerError)> {
        let mut state = self.shared.lock().await;
        let mut failures = Vec::new();
        if let Some(publisher) = state.publisher.take()
            && let Err(e) = publisher.close().await
        {
            tracing::warn!(error = %e, "publisher close failed during shutdown");
            failures.push(("publisher".to_string(), e));
        }
        failures.extend(state.registry.close_all().await);
        tracing::info!(failures = failures.len(), "session closed");
        failures
    }

    /// Opens a publisher under `client_id` and rebuilds every cursor.
    async fn rebind(
        &self,
        state: &mut SessionState<B>,
        client_id: &ClientId,
    ) -> Result<(), SessionError> {
        let publisher = self
            .broker
            .open_publisher(client_id)
            .await
            .map_err(SessionError::PublisherUnavailable)?;
        if let Some(stale) = state.publisher.replace(publisher)
            && let Err(e) = stale.close().await
        {
            tracing::warn!(error = %e, "closing replaced publisher failed");
        }

        let result = state.registry.rebuild_all(&self.broker, client_id).await;
        match result.first_error {
            Some((channel, source)) => Err(SessionError::ChannelUnreachable { channel, source }),
            None => Ok(()),
        }
    }
}

fn publisher_of<B: Broker>(state: &SessionState<B>) -> Result<&B::Publisher, SessionError> {
    state
        .publisher
        .as_ref()
        .ok_or(SessionError::PublisherUnavailable(BrokerError::ConnectionClosed))
}

/// Wire text of a chat line: `"(nickname) text"`.
#[must_use]
pub fn format_payload(nickname: &str, text: &str) -> String {
    format!("({nickname}) {text}")
}
