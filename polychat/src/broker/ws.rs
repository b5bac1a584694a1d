//! WebSocket broker adapter.
//!
//! Implements the [`Broker`] traits against a `polychat-broker` server at
//! `ws://{host}:{port}/ws`. Every publisher and every cursor owns its own
//! WebSocket connection and speaks strict request/response over it, so a
//! reply always belongs to the request sent just before it. A request that
//! times out or breaks midway leaves the connection out of step, so it is
//! dropped and every later request fails with
//! [`BrokerError::ConnectionClosed`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use polychat_proto::broker::{self, BrokerMessage};

use super::{Broker, BrokerError, Cursor, CursorRequest, Publisher, Record};
use crate::identity::ClientId;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a reply, on top of any fetch wait.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker adapter talking to a `polychat-broker` server.
#[derive(Debug, Clone)]
pub struct WsBroker {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WsBroker {
    /// Creates an adapter for the broker listening on `host:port`.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}/ws"),
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Overrides the connect and reply timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    /// The WebSocket URL this adapter connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connects and sends the opening frame, returning the connection and
    /// the broker's acknowledgment.
    async fn open(&self, opening: &BrokerMessage) -> Result<(Link, BrokerMessage), BrokerError> {
        let connect = connect_async(&self.url);
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.url, "broker connect timed out");
                BrokerError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %self.url, error = %e, "broker connect failed");
                BrokerError::Unreachable(format!("{}: {e}", self.url))
            })?;

        let mut link = Link { ws: Some(ws) };
        let ack = link.request(opening, self.request_timeout).await?;
        Ok((link, ack))
    }
}

impl Broker for WsBroker {
    type Publisher = WsPublisher;
    type Cursor = WsCursor;

    async fn open_publisher(&self, client_id: &ClientId) -> Result<WsPublisher, BrokerError> {
        let opening = BrokerMessage::OpenPublisher {
            client_id: client_id.as_str().to_string(),
        };
        let (link, ack) = self.open(&opening).await?;
        match ack {
            BrokerMessage::PublisherReady => {
                tracing::debug!(client_id = %client_id, "publisher ready");
                Ok(WsPublisher {
                    link: Mutex::new(link),
                    request_timeout: self.request_timeout,
                })
            }
            other => Err(unexpected(other)),
        }
    }

    async fn open_cursor(&self, request: &CursorRequest) -> Result<WsCursor, BrokerError> {
        let opening = BrokerMessage::OpenCursor {
            cursor_id: request.cursor_id.clone(),
            channel: request.channel.clone(),
            partition: request.partition,
            policy: request.policy,
        };
        let (link, ack) = self.open(&opening).await?;
        match ack {
            BrokerMessage::CursorReady { offset } => {
                tracing::debug!(cursor_id = %request.cursor_id, offset, "cursor ready");
                Ok(WsCursor {
                    link,
                    request_timeout: self.request_timeout,
                })
            }
            other => Err(unexpected(other)),
        }
    }
}

/// Publisher backed by one WebSocket connection.
pub struct WsPublisher {
    link: Mutex<Link>,
    request_timeout: Duration,
}

impl Publisher for WsPublisher {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let msg = BrokerMessage::Publish {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        let mut link = self.link.lock().await;
        match link.request(&msg, self.request_timeout).await? {
            BrokerMessage::Published { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn close(self) -> Result<(), BrokerError> {
        self.link.into_inner().close(self.request_timeout).await
    }
}

/// Cursor backed by one WebSocket connection; the broker tracks its position.
pub struct WsCursor {
    link: Link,
    request_timeout: Duration,
}

impl Cursor for WsCursor {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Vec<Record>, BrokerError> {
        let max_wait_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        let msg = BrokerMessage::Fetch { max_wait_ms };
        let deadline = reply_deadline(max_wait, self.request_timeout);
        match self.link.request(&msg, deadline).await? {
            BrokerMessage::Batch { records } => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    async fn close(self) -> Result<(), BrokerError> {
        self.link.close(self.request_timeout).await
    }
}

/// One request/response connection, gone once it falls out of step.
struct Link {
    ws: Option<WsStream>,
}

impl Link {
    async fn request(
        &mut self,
        msg: &BrokerMessage,
        timeout: Duration,
    ) -> Result<BrokerMessage, BrokerError> {
        let ws = self.ws.as_mut().ok_or(BrokerError::ConnectionClosed)?;
        let result = exchange(ws, msg, timeout).await;
        if let Err(e @ (BrokerError::Timeout | BrokerError::ConnectionClosed)) = &result {
            // A reply may still be in flight; it must not answer the next request.
            tracing::warn!(error = %e, "dropping broker connection");
            self.ws = None;
        }
        result
    }

    async fn close(self, timeout: Duration) -> Result<(), BrokerError> {
        match self.ws {
            Some(ws) => close_stream(ws, timeout).await,
            None => Ok(()),
        }
    }
}

/// How long a fetch waits for its reply: the broker's hold plus the usual
/// reply timeout.
fn reply_deadline(max_wait: Duration, request_timeout: Duration) -> Duration {
    max_wait.saturating_add(request_timeout)
}

/// Sends `msg` and waits for the next broker frame.
async fn exchange(
    ws: &mut WsStream,
    msg: &BrokerMessage,
    timeout: Duration,
) -> Result<BrokerMessage, BrokerError> {
    let bytes = broker::encode(msg).map_err(|e| BrokerError::Protocol(e.to_string()))?;
    tokio::time::timeout(timeout, ws.send(Message::Binary(bytes.into())))
        .await
        .map_err(|_| BrokerError::Timeout)?
        .map_err(|e| {
            tracing::warn!(error = %e, "broker send failed");
            BrokerError::ConnectionClosed
        })?;

    tokio::time::timeout(timeout, next_reply(ws))
        .await
        .map_err(|_| BrokerError::Timeout)?
}

async fn next_reply(ws: &mut WsStream) -> Result<BrokerMessage, BrokerError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return broker::decode(&data).map_err(|e| BrokerError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Close(_))) | None => return Err(BrokerError::ConnectionClosed),
            Some(Ok(_)) => {
                // Ping, pong and text frames carry no replies.
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "broker read failed");
                return Err(BrokerError::ConnectionClosed);
            }
        }
    }
}

async fn close_stream(mut ws: WsStream, timeout: Duration) -> Result<(), BrokerError> {
    tokio::time::timeout(timeout, ws.close(None))
        .await
        .map_err(|_| BrokerError::Timeout)?
        .map_err(|e| BrokerError::Protocol(format!("close failed: {e}")))
}

fn unexpected(msg: BrokerMessage) -> BrokerError {
    match msg {
        BrokerMessage::Error { reason } => BrokerError::Rejected(reason),
        other => BrokerError::Protocol(format!("unexpected reply: {other:?}")),
    }
}
