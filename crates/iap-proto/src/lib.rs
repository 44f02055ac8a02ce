//! IAP Tunnel Protocol Definitions
//!
//! This crate defines the on-wire frames of the IAP relay subprotocol and the
//! byte accounting used for acknowledgement-based flow control. It performs no
//! I/O: frames are decoded from, and encoded into, whole transport messages.

pub mod error;
pub mod flow;
pub mod frame;

pub use error::ProtocolError;
pub use flow::{chunks, FlowController, FlowCounters, FlowStats};
pub use frame::{Frame, TAG_ACK, TAG_DATA, TAG_SUCCESS};

/// Maximum payload carried by a single Success or Data frame (16KB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Unacknowledged receive bytes that trigger an Ack frame
pub const ACK_THRESHOLD: u64 = 2 * MAX_FRAME_SIZE as u64;
