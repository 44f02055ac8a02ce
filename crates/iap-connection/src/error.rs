//! Tunnel errors

use iap_proto::ProtocolError;
use iap_transport::TransportError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the tunnel engine
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The relay connection or handshake could not be established
    #[error("Failed to connect: {0}")]
    Connect(#[source] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The relay closed the channel
    #[error("Proxy closed connection with code {code}, reason: {reason}")]
    TransportClosed { code: u16, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("No frames received for {0:?}")]
    IdleTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel task failed: {0}")]
    Task(String),
}

impl From<TransportError> for TunnelError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed { code, reason } => TunnelError::TransportClosed { code, reason },
            other => TunnelError::Transport(other),
        }
    }
}

impl TunnelError {
    /// Whether the error is the relay ending the tunnel in an orderly way
    pub fn is_normal_closure(&self) -> bool {
        matches!(
            self,
            TunnelError::TransportClosed { code, .. } if *code == iap_transport::CloseCode::NORMAL
        )
    }

    /// Convert into the error a caller's read observes
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            TunnelError::Protocol(_) => io::ErrorKind::InvalidData,
            TunnelError::IdleTimeout(_) => io::ErrorKind::TimedOut,
            TunnelError::Transport(TransportError::Io(e)) => e.kind(),
            _ => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, self)
    }
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_transport_keeps_code_and_reason() {
        let err = TunnelError::from(TransportError::Closed {
            code: 4033,
            reason: "not authorized".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Proxy closed connection with code 4033, reason: not authorized"
        );
        assert!(!err.is_normal_closure());
    }

    #[test]
    fn test_protocol_error_reads_as_invalid_data() {
        let err = TunnelError::Protocol(ProtocolError::FrameTooLarge {
            len: 20_000,
            max: 16_384,
        });
        assert_eq!(err.into_io().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_transport_io_error_keeps_kind() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = TunnelError::from(TransportError::Io(reset));
        assert_eq!(err.into_io().kind(), io::ErrorKind::ConnectionReset);

        let err = TunnelError::from(TransportError::ConnectionClosed);
        assert_eq!(err.into_io().kind(), io::ErrorKind::ConnectionAborted);
    }
}
