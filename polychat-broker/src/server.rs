//! Broker server core: shared state, WebSocket handler, and the publisher
//! and cursor connection loops.
//!
//! Each WebSocket connection declares its role in its first frame. A
//! publisher appends payloads to channel logs held in [`Topics`]; a cursor
//! tracks its own position in one channel log and answers fetch requests,
//! holding each one open until a record arrives or the requested wait
//! expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use polychat_proto::OffsetPolicy;
use polychat_proto::broker::{self, BrokerMessage, DEFAULT_PARTITION};

use crate::topics::Topics;

/// Per-connection limits the broker enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerLimits {
    /// Largest payload a publisher may append, in bytes.
    pub max_payload_size: usize,
    /// Upper bound on how long a single fetch may be held open.
    pub max_fetch_wait: Duration,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            max_payload_size: 64 * 1024,
            max_fetch_wait: Duration::from_secs(30),
        }
    }
}

/// Shared broker state: channel logs plus connection counters.
pub struct BrokerState {
    /// Channel logs.
    pub topics: Topics,
    limits: BrokerLimits,
    publishers: AtomicUsize,
    cursors: AtomicUsize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Creates broker state with empty logs and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(BrokerLimits::default(), Topics::new())
    }

    /// Creates broker state with custom limits and log set.
    #[must_use]
    pub const fn with_limits(limits: BrokerLimits, topics: Topics) -> Self {
        Self {
            topics,
            limits,
            publishers: AtomicUsize::new(0),
            cursors: AtomicUsize::new(0),
        }
    }

    /// Limits in force for new requests.
    #[must_use]
    pub const fn limits(&self) -> BrokerLimits {
        self.limits
    }

    /// Number of currently open publisher connections.
    #[must_use]
    pub fn active_publishers(&self) -> usize {
        self.publishers.load(Ordering::SeqCst)
    }

    /// Number of currently open cursor connections.
    #[must_use]
    pub fn active_cursors(&self) -> usize {
        self.cursors.load(Ordering::SeqCst)
    }
}

/// Decrements a connection counter when dropped.
struct ConnectionGuard<'a>(&'a AtomicUsize);

impl<'a> ConnectionGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for `OpenPublisher` or `OpenCursor`.
/// 2. Acknowledge with `PublisherReady` or `CursorReady`.
/// 3. Serve publish or fetch requests until the client closes.
pub async fn handle_socket(mut socket: WebSocket, state: Arc<BrokerState>) {
    let Some(opening) = wait_for_open(&mut socket).await else {
        tracing::warn!("connection closed before opening a publisher or cursor");
        return;
    };

    match opening {
        BrokerMessage::OpenPublisher { client_id } => {
            if client_id.is_empty() {
                let _ = send_broker_msg(&mut socket, &error("empty client id")).await;
                return;
            }
            let _guard = ConnectionGuard::enter(&state.publishers);
            tracing::info!(client_id = %client_id, "publisher opened");
            if send_broker_msg(&mut socket, &BrokerMessage::PublisherReady)
                .await
                .is_ok()
            {
                serve_publisher(&mut socket, &client_id, &state).await;
            }
            tracing::info!(client_id = %client_id, "publisher closed");
        }
        BrokerMessage::OpenCursor {
            cursor_id,
            channel,
            partition,
            policy,
        } => {
            if partition != DEFAULT_PARTITION {
                let reason = format!("unknown partition {partition} for channel {channel}");
                let _ = send_broker_msg(&mut socket, &error(&reason)).await;
                return;
            }
            if channel.is_empty() {
                let _ = send_broker_msg(&mut socket, &error("empty channel name")).await;
                return;
            }
            let _guard = ConnectionGuard::enter(&state.cursors);
            serve_cursor(&mut socket, &cursor_id, &channel, policy, &state).await;
            tracing::info!(cursor_id = %cursor_id, channel = %channel, "cursor closed");
        }
        other => {
            tracing::warn!(msg = ?other, "expected OpenPublisher or OpenCursor");
            let _ = send_broker_msg(&mut socket, &error("connection not opened")).await;
        }
    }
}

/// Waits for the first binary frame and decodes it.
async fn wait_for_open(socket: &mut WebSocket) -> Option<BrokerMessage> {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Binary(data) => match broker::decode(&data) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode opening message");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {
                // Skip non-binary frames (ping/pong) while opening.
            }
        }
    }
    None
}

/// Reads the next request frame, returning `None` once the client is gone.
async fn next_request(socket: &mut WebSocket, who: &str) -> Option<BrokerMessage> {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Binary(data) => match broker::decode(&data) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    tracing::warn!(who = %who, error = %e, "failed to decode request");
                    if send_broker_msg(socket, &error("malformed request"))
                        .await
                        .is_err()
                    {
                        return None;
                    }
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn serve_publisher(socket: &mut WebSocket, client_id: &str, state: &BrokerState) {
    while let Some(request) = next_request(socket, client_id).await {
        let reply = match request {
            BrokerMessage::Publish { channel, payload } => {
                if channel.is_empty() {
                    error("empty channel name")
                } else if payload.len() > state.limits.max_payload_size {
                    tracing::warn!(
                        client_id = %client_id,
                        size = payload.len(),
                        max = state.limits.max_payload_size,
                        "payload exceeds size limit"
                    );
                    error(&format!(
                        "payload too large: {} bytes (max {})",
                        payload.len(),
                        state.limits.max_payload_size
                    ))
                } else {
                    let offset = state.topics.append(&channel, payload).await;
                    tracing::debug!(client_id = %client_id, channel = %channel, offset, "published");
                    BrokerMessage::Published { channel, offset }
                }
            }
            other => {
                tracing::warn!(client_id = %client_id, msg = ?other, "unexpected message on publisher");
                error("publisher connections only accept Publish")
            }
        };
        if send_broker_msg(socket, &reply).await.is_err() {
            break;
        }
    }
}

async fn serve_cursor(
    socket: &mut WebSocket,
    cursor_id: &str,
    channel: &str,
    policy: OffsetPolicy,
    state: &BrokerState,
) {
    let mut position = state.topics.start_offset(channel, policy).await;
    tracing::info!(cursor_id = %cursor_id, channel = %channel, %policy, position, "cursor opened");

    if send_broker_msg(socket, &BrokerMessage::CursorReady { offset: position })
        .await
        .is_err()
    {
        return;
    }

    while let Some(request) = next_request(socket, cursor_id).await {
        let reply = match request {
            BrokerMessage::Fetch { max_wait_ms } => {
                let wait = Duration::from_millis(max_wait_ms).min(state.limits.max_fetch_wait);
                let (records, next) = state.topics.fetch(channel, position, wait).await;
                position = next;
                BrokerMessage::Batch { records }
            }
            other => {
                tracing::warn!(cursor_id = %cursor_id, msg = ?other, "unexpected message on cursor");
                error("cursor connections only accept Fetch")
            }
        };
        if send_broker_msg(socket, &reply).await.is_err() {
            break;
        }
    }
}

fn error(reason: &str) -> BrokerMessage {
    BrokerMessage::Error {
        reason: reason.to_string(),
    }
}

/// Encodes and sends a broker message on the WebSocket.
async fn send_broker_msg(socket: &mut WebSocket, msg: &BrokerMessage) -> Result<(), String> {
    let bytes = broker::encode(msg).map_err(|e| e.to_string())?;
    socket
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the broker on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: impl tokio::net::ToSocketAddrs,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: impl tokio::net::ToSocketAddrs,
    state: Arc<BrokerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BrokerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
