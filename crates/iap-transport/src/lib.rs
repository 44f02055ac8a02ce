//! Message channel abstraction for IAP tunnel connections
//!
//! The tunnel engine never talks to a socket directly. It needs an ordered,
//! reliable channel of discrete binary messages that can be split in two so
//! that one task owns every write and another owns every read:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              iap-connection                  │
//! │   outbound loop            inbound loop      │
//! └──────┬──────────────────────────▲────────────┘
//!        │ MessageSink              │ MessageSource
//!        ↓                          │
//! ┌──────────────────────────────────────────────┐
//! │  MessageChannel (WebSocket, in-memory, ...)  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use thiserror::Error;

/// WebSocket-style close status codes
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Proxy closed connection with code {code}, reason: {reason}")]
    Closed { code: u16, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Whether the remote end (or the stream itself) is gone, as opposed to
    /// a failure while it was still open
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::Closed { .. } | TransportError::ConnectionClosed
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write side of a message channel
#[async_trait]
pub trait MessageSink: Send + Debug {
    /// Send one binary message
    async fn send(&mut self, message: Bytes) -> TransportResult<()>;

    /// Close the channel with a status code and human-readable reason
    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()>;
}

/// Read side of a message channel
#[async_trait]
pub trait MessageSource: Send + Debug {
    /// Receive the next whole binary message
    ///
    /// Remote closure is reported as [`TransportError::Closed`] or
    /// [`TransportError::ConnectionClosed`], never as `Ok`.
    async fn recv(&mut self) -> TransportResult<Bytes>;
}

/// An established, ordered, reliable channel of binary messages
pub trait MessageChannel: Send + Debug {
    type Sink: MessageSink + 'static;
    type Source: MessageSource + 'static;

    /// Split into independently owned write and read halves
    fn split(self) -> (Self::Sink, Self::Source);
}
