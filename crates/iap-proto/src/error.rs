//! Protocol-level errors

use thiserror::Error;

/// Malformed or out-of-order frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame length {len} exceeds subprotocol max data frame size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Message too short to carry a frame tag")]
    MissingTag,

    #[error("Received frame before connection was established (tag {tag:#x})")]
    FrameBeforeHandshake { tag: u16 },
}
