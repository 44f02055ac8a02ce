//! WebSocket message channel
//!
//! One relay frame per binary WebSocket message. Control frames are handled
//! by tungstenite; text messages have no meaning in the relay subprotocol.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use iap_transport::{
    CloseCode, MessageChannel, MessageSink, MessageSource, TransportError, TransportResult,
};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, trace, warn};

pub(crate) type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established relay WebSocket
pub struct WebSocketChannel {
    /// Connection ID for logging
    connection_id: String,
    stream: WsStream,
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl WebSocketChannel {
    pub(crate) fn new(stream: WsStream) -> Self {
        Self {
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
            stream,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl MessageChannel for WebSocketChannel {
    type Sink = WebSocketSink;
    type Source = WebSocketSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.stream.split();
        (
            WebSocketSink {
                connection_id: self.connection_id.clone(),
                sink,
            },
            WebSocketSource {
                connection_id: self.connection_id,
                source,
            },
        )
    }
}

/// Write half of a [`WebSocketChannel`]
pub struct WebSocketSink {
    connection_id: String,
    sink: SplitSink<WsStream, Message>,
}

impl std::fmt::Debug for WebSocketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        trace!(
            "[{}] Sending {} bytes via WebSocket",
            self.connection_id,
            message.len()
        );

        self.sink
            .send(Message::Binary(message.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        debug!(
            "[{}] Closing WebSocket with code {}: {}",
            self.connection_id, code, reason
        );

        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(map_ws_error)
    }
}

/// Read half of a [`WebSocketChannel`]
pub struct WebSocketSource {
    connection_id: String,
    source: SplitStream<WsStream>,
}

impl std::fmt::Debug for WebSocketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl MessageSource for WebSocketSource {
    async fn recv(&mut self) -> TransportResult<Bytes> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    trace!(
                        "[{}] Received {} bytes via WebSocket",
                        self.connection_id,
                        data.len()
                    );
                    return Ok(Bytes::from(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (CloseCode::NO_STATUS, String::new()),
                    };
                    debug!(
                        "[{}] WebSocket closed by relay with code {}: {}",
                        self.connection_id, code, reason
                    );
                    return Err(TransportError::Closed { code, reason });
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping/pong", self.connection_id);
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("[{}] Ignoring text message from relay", self.connection_id);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => {
                    debug!("[{}] WebSocket stream ended", self.connection_id);
                    return Err(TransportError::ConnectionClosed);
                }
            }
        }
    }
}

pub(crate) fn map_ws_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        other => TransportError::WebSocket(other.to_string()),
    }
}
