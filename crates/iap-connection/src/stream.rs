//! Byte-stream halves of a tunnel
//!
//! Each direction is a bounded conduit between the caller and one protocol
//! loop. A read waits until the inbound loop hands over a payload; a write
//! waits until the outbound loop has room for another chunk. Either side
//! stalling backpressures the other.

use bytes::Bytes;
use iap_proto::FlowStats;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::debug;

use crate::connection::{ConnectionState, Shared};
use crate::error::{TunnelError, TunnelResult};

/// Read half of a tunnel
///
/// Yields end-of-stream once the inbound loop is gone, or the error that
/// stopped it.
#[derive(Debug)]
pub struct TunnelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    /// Remainder of a payload larger than the caller's buffer
    pending: Bytes,
    shared: Arc<Shared>,
}

impl TunnelReader {
    pub(crate) fn new(rx: mpsc::Receiver<io::Result<Bytes>>, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
            shared,
        }
    }

    pub fn session_id(&self) -> &Bytes {
        &self.shared.session_id
    }

    /// Total bytes received from the relay
    pub fn received(&self) -> u64 {
        self.shared.stats().recv_unacked
    }

    pub fn stats(&self) -> FlowStats {
        self.shared.stats()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl AsyncRead for TunnelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(payload)) => this.pending = payload,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // Inbound loop finished: end of stream
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

/// Write half of a tunnel
///
/// Every accepted write is framed on its own: it is split into Data frames
/// of at most the maximum frame size, never merged with another write.
#[derive(Debug)]
pub struct TunnelWriter {
    tx: PollSender<Bytes>,
    outbound: Option<JoinHandle<TunnelResult<()>>>,
    shared: Arc<Shared>,
}

impl TunnelWriter {
    pub(crate) fn new(
        tx: mpsc::Sender<Bytes>,
        outbound: JoinHandle<TunnelResult<()>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            tx: PollSender::new(tx),
            outbound: Some(outbound),
            shared,
        }
    }

    pub fn session_id(&self) -> &Bytes {
        &self.shared.session_id
    }

    /// Total bytes handed to the relay
    pub fn sent(&self) -> u64 {
        self.shared.stats().send_unacked
    }

    pub fn stats(&self) -> FlowStats {
        self.shared.stats()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Close the tunnel
    ///
    /// Writes already accepted are still sent, then the relay channel is
    /// closed with a normal-closure status and pending reads see end of
    /// stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> TunnelResult<()> {
        self.tx.close();

        let Some(outbound) = self.outbound.take() else {
            return Ok(());
        };

        debug!("[{}] Waiting for outbound loop to finish", self.shared.connection_id);
        outbound
            .await
            .map_err(|e| TunnelError::Task(e.to_string()))?
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel is closed for writing")
}

impl AsyncWrite for TunnelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.tx.poll_reserve(cx)).map_err(|_| closed_pipe())?;
        self.tx
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| closed_pipe())?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
