//! In-memory message channel
//!
//! Two connected endpoints backed by bounded tokio channels. Used as the
//! relay stand-in in tests and for embedding the engine over a custom
//! carrier.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    CloseCode, MessageChannel, MessageSink, MessageSource, TransportError, TransportResult,
};

#[derive(Debug)]
enum Event {
    Message(Bytes),
    Close { code: u16, reason: String },
}

/// Create two connected endpoints, each buffering up to `capacity` messages
pub fn channel_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));

    (MemoryChannel::new(a_tx, a_rx), MemoryChannel::new(b_tx, b_rx))
}

/// One endpoint of an in-memory channel pair
#[derive(Debug)]
pub struct MemoryChannel {
    sink: MemorySink,
    source: MemorySource,
}

impl MemoryChannel {
    fn new(tx: mpsc::Sender<Event>, rx: mpsc::Receiver<Event>) -> Self {
        Self {
            sink: MemorySink { tx: Some(tx) },
            source: MemorySource { rx, closed: None },
        }
    }

    pub async fn send(&mut self, message: impl Into<Bytes>) -> TransportResult<()> {
        self.sink.send(message.into()).await
    }

    pub async fn recv(&mut self) -> TransportResult<Bytes> {
        self.source.recv().await
    }

    pub async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        self.sink.close(code, reason).await
    }
}

impl MessageChannel for MemoryChannel {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (Self::Sink, Self::Source) {
        (self.sink, self.source)
    }
}

/// Write half of a [`MemoryChannel`]
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Event>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        trace!("Sending {} bytes via memory channel", message.len());

        tx.send(Event::Message(message))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        let tx = self.tx.take().ok_or(TransportError::ConnectionClosed)?;

        tx.send(Event::Close {
            code,
            reason: reason.to_string(),
        })
        .await
        .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Read half of a [`MemoryChannel`]
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Event>,
    closed: Option<(u16, String)>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> TransportResult<Bytes> {
        if let Some((code, reason)) = &self.closed {
            return Err(TransportError::Closed {
                code: *code,
                reason: reason.clone(),
            });
        }

        match self.rx.recv().await {
            Some(Event::Message(message)) => Ok(message),
            Some(Event::Close { code, reason }) => {
                self.closed = Some((code, reason.clone()));
                Err(TransportError::Closed { code, reason })
            }
            None => {
                self.closed = Some((CloseCode::NO_STATUS, String::new()));
                Err(TransportError::ConnectionClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_keep_boundaries_and_order() {
        let (mut a, mut b) = channel_pair(8);

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_close_carries_code_and_reason() {
        let (mut a, mut b) = channel_pair(8);

        a.close(4003, "failed to connect to backend").await.unwrap();

        let err = b.recv().await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(
            err.to_string(),
            "Proxy closed connection with code 4003, reason: failed to connect to backend"
        );

        // Closure is sticky
        assert!(b.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut a, _b) = channel_pair(8);

        a.close(CloseCode::NORMAL, "done").await.unwrap();
        assert!(matches!(
            a.send(Bytes::from_static(b"late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (a, mut b) = channel_pair(8);
        drop(a);

        assert!(matches!(
            b.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (a, mut b) = channel_pair(8);
        let (mut sink, mut source) = a.split();

        sink.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ping"));

        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(source.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }
}
