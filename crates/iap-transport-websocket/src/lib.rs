//! WebSocket transport for the IAP relay using tokio-tungstenite
//!
//! The relay speaks its tunneling subprotocol over a secure WebSocket: each
//! binary WebSocket message carries exactly one relay frame. This crate owns
//! everything needed to get such a socket open:
//!
//! - **URL**: `wss://<proxy-host>/v4/connect?<target query>`
//! - **Authentication**: OAuth bearer token in the `Authorization` header
//! - **Subprotocol**: `relay.tunnel.cloudproxy.app`
//! - **Encryption**: TLS via rustls
//!
//! The resulting [`WebSocketChannel`] implements
//! [`iap_transport::MessageChannel`] and is handed to the tunnel engine.

pub mod config;
pub mod connection;
pub mod connector;

pub use config::{IapTarget, WebSocketConfig};
pub use connection::{WebSocketChannel, WebSocketSink, WebSocketSource};
pub use connector::WebSocketConnector;
