//! IAP tunnel connection engine
//!
//! Turns a [`MessageChannel`](iap_transport::MessageChannel) to the relay into
//! a plain byte stream. [`Connection::connect`] waits for the relay's Success
//! frame, then two background tasks take over:
//!
//! - **inbound**: decodes Data frames for the reader and sends Acks once more
//!   than [`ConnectionConfig::ack_threshold`] bytes are unacknowledged
//! - **outbound**: splits writes into Data frames of at most
//!   [`ConnectionConfig::max_frame_size`] bytes
//!
//! # Example
//!
//! ```no_run
//! use iap_connection::{Connection, ConnectionConfig};
//! use iap_transport_websocket::{IapTarget, WebSocketConfig, WebSocketConnector};
//! use std::sync::Arc;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = WebSocketConnector::new(Arc::new(WebSocketConfig::with_token("ya29...")))?;
//! let channel = connector
//!     .connect(&IapTarget::instance("my-project", "us-central1-a", "vm-1", 22))
//!     .await?;
//!
//! let mut tunnel = Connection::connect(channel, ConnectionConfig::default()).await?;
//! tunnel.write_all(b"SSH-2.0-client\r\n").await?;
//! tunnel.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod stream;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{TunnelError, TunnelResult};
pub use iap_proto::FlowStats;
pub use stream::{TunnelReader, TunnelWriter};
