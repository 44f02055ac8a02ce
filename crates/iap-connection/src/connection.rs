//! Tunnel connection engine
//!
//! After the handshake two tasks drive a tunnel:
//!
//! - the **inbound** task is the only reader of the relay channel. It decodes
//!   frames, feeds Data payloads to the [`TunnelReader`] and schedules Acks.
//! - the **outbound** task is the only writer. It frames whatever the
//!   [`TunnelWriter`] accepted and sends the Acks scheduled by the inbound task.
//!
//! Acks travel between the two through a watch channel: they are cumulative,
//! so only the latest value matters and scheduling one never blocks reading.

use bytes::Bytes;
use iap_proto::{chunks, FlowController, FlowCounters, FlowStats, Frame, ProtocolError};
use iap_transport::{CloseCode, MessageChannel, MessageSink, MessageSource};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::stream::{TunnelReader, TunnelWriter};

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the relay's Success frame
    Handshaking,
    /// Both loops running
    Connected,
    /// A loop exited or the tunnel was closed
    Closed,
}

/// State shared by the stream halves and the loops
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) connection_id: String,
    pub(crate) session_id: Bytes,
    counters: Arc<FlowCounters>,
    shutdown: CancellationToken,
    /// Set once the inbound loop has exited, even if writes go on
    receive_closed: CancellationToken,
}

impl Shared {
    pub(crate) fn stats(&self) -> FlowStats {
        self.counters.snapshot()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        if self.shutdown.is_cancelled() || self.receive_closed.is_cancelled() {
            ConnectionState::Closed
        } else {
            ConnectionState::Connected
        }
    }
}

/// A connected tunnel, usable as a bidirectional byte stream
///
/// Use [`Connection::into_split`] to read and write from different tasks.
#[derive(Debug)]
pub struct Connection {
    reader: TunnelReader,
    writer: TunnelWriter,
    shared: Arc<Shared>,
}

impl Connection {
    /// Run the relay handshake over `channel` and start the tunnel loops
    ///
    /// Fails without starting anything if the relay does not open with a
    /// Success frame within `config.handshake_timeout`. Dropping the returned
    /// future abandons the handshake.
    pub async fn connect<C: MessageChannel>(
        channel: C,
        config: ConnectionConfig,
    ) -> TunnelResult<Self> {
        config.validate()?;

        let connection_id = format!("iap-{}", uuid::Uuid::new_v4());
        let (mut sink, mut source) = channel.split();

        debug!(
            "[{}] State: {:?}",
            connection_id,
            ConnectionState::Handshaking
        );

        let handshake = read_handshake(&mut source, config.max_frame_size);
        let result = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::HandshakeTimeout(config.handshake_timeout)),
        };

        let session_id = match result {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!("[{}] Handshake failed: {}", connection_id, e);
                abandon(&mut sink, &e, &connection_id).await;
                return Err(e);
            }
        };

        info!(
            "[{}] Tunnel established, session {}",
            connection_id,
            String::from_utf8_lossy(&session_id)
        );

        Ok(Self::start(connection_id, session_id, sink, source, &config))
    }

    fn start<K, S>(
        connection_id: String,
        session_id: Bytes,
        sink: K,
        source: S,
        config: &ConnectionConfig,
    ) -> Self
    where
        K: MessageSink + 'static,
        S: MessageSource + 'static,
    {
        let flow = FlowController::new(config.ack_threshold);
        let shutdown = CancellationToken::new();
        let receive_closed = CancellationToken::new();

        let shared = Arc::new(Shared {
            connection_id: connection_id.clone(),
            session_id,
            counters: flow.counters(),
            shutdown: shutdown.clone(),
            receive_closed: receive_closed.clone(),
        });

        let (recv_tx, recv_rx) = mpsc::channel(config.conduit_depth);
        let (send_tx, send_rx) = mpsc::channel(config.conduit_depth);
        let (ack_tx, ack_rx) = watch::channel(0u64);

        let inbound = Inbound {
            connection_id: connection_id.clone(),
            source,
            flow: flow.clone(),
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout,
            recv_tx,
            ack_tx,
            shutdown: shutdown.clone(),
            receive_closed,
        };
        tokio::spawn(inbound.run());

        let outbound = Outbound {
            connection_id,
            sink,
            flow,
            max_frame_size: config.max_frame_size,
            send_rx,
            ack_rx,
            shutdown,
        };
        let outbound = tokio::spawn(outbound.run());

        debug!(
            "[{}] State: {:?}",
            shared.connection_id,
            ConnectionState::Connected
        );

        Self {
            reader: TunnelReader::new(recv_rx, shared.clone()),
            writer: TunnelWriter::new(send_tx, outbound, shared.clone()),
            shared,
        }
    }

    /// Session id assigned by the relay during the handshake
    pub fn session_id(&self) -> &Bytes {
        &self.shared.session_id
    }

    /// Local identifier used in log lines
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    /// Total bytes handed to the relay
    pub fn sent(&self) -> u64 {
        self.shared.stats().send_unacked
    }

    /// Total bytes received from the relay
    pub fn received(&self) -> u64 {
        self.shared.stats().recv_unacked
    }

    /// All four flow-control counters
    ///
    /// A chunk is counted as soon as its loop takes it on, so a reader never
    /// sees bytes the receive counter does not include yet.
    pub fn stats(&self) -> FlowStats {
        self.shared.stats()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Close the tunnel; see [`TunnelWriter::close`]
    pub async fn close(&mut self) -> TunnelResult<()> {
        self.writer.close().await
    }

    /// Split into halves that can be moved to different tasks
    pub fn into_split(self) -> (TunnelReader, TunnelWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Read the first frame, which must be Success
async fn read_handshake<S: MessageSource>(
    source: &mut S,
    max_frame_size: usize,
) -> TunnelResult<Bytes> {
    let message = source.recv().await.map_err(|e| {
        if e.is_closed() {
            TunnelError::from(e)
        } else {
            TunnelError::Connect(e)
        }
    })?;

    match Frame::decode(message, max_frame_size)? {
        Frame::Success { session_id } => Ok(session_id),
        other => Err(ProtocolError::FrameBeforeHandshake { tag: other.tag() }.into()),
    }
}

/// Best-effort close after a failed handshake
async fn abandon<K: MessageSink>(sink: &mut K, error: &TunnelError, connection_id: &str) {
    let (code, reason) = match error {
        TunnelError::TransportClosed { .. } => return,
        TunnelError::Protocol(_) => (CloseCode::PROTOCOL_ERROR, "Protocol error"),
        _ => (CloseCode::NORMAL, "Handshake failed"),
    };

    if let Err(e) = sink.close(code, reason).await {
        debug!("[{}] Failed to close relay channel: {}", connection_id, e);
    }
}

struct Inbound<S> {
    connection_id: String,
    source: S,
    flow: FlowController,
    max_frame_size: usize,
    idle_timeout: Option<Duration>,
    recv_tx: mpsc::Sender<io::Result<Bytes>>,
    ack_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
    receive_closed: CancellationToken,
}

impl<S: MessageSource> Inbound<S> {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = self.read_frames() => result,
            _ = shutdown.cancelled() => Ok(()),
        };

        let stop_tunnel = match result {
            Ok(()) => {
                debug!("[{}] Inbound loop ended", self.connection_id);
                true
            }
            Err(e) if e.is_normal_closure() => {
                debug!("[{}] Relay closed the tunnel", self.connection_id);
                true
            }
            Err(e) => {
                warn!("[{}] Inbound loop failed: {}", self.connection_id, e);
                // A bad frame only ends this direction; writes can go on.
                let stop_tunnel = !matches!(e, TunnelError::Protocol(_));

                tokio::select! {
                    _ = self.recv_tx.send(Err(e.into_io())) => {}
                    _ = shutdown.cancelled() => {}
                }
                stop_tunnel
            }
        };

        // Closed must be visible before a reader can observe end of stream
        self.receive_closed.cancel();
        // Dropping the conduit is what turns pending reads into end of stream
        drop(self.recv_tx);

        let stats = self.flow.stats();
        info!(
            "[{}] Receive side closed ({} bytes received, {} acknowledged)",
            self.connection_id, stats.recv_unacked, stats.recv_acked
        );

        if stop_tunnel {
            shutdown.cancel();
        }
    }

    async fn next_message(&mut self) -> TunnelResult<Bytes> {
        let message = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.source.recv())
                .await
                .map_err(|_| TunnelError::IdleTimeout(limit))?,
            None => self.source.recv().await,
        };
        Ok(message?)
    }

    async fn read_frames(&mut self) -> TunnelResult<()> {
        loop {
            let message = self.next_message().await?;

            match Frame::decode(message, self.max_frame_size)? {
                Frame::Data { payload } => {
                    let len = payload.len();
                    trace!("[{}] Received data frame: len={}", self.connection_id, len);

                    // Counted before delivery so a reader never sees bytes
                    // the counters do not include yet
                    self.flow.record_received(len);
                    if !payload.is_empty() && self.recv_tx.send(Ok(payload)).await.is_err() {
                        debug!("[{}] Tunnel reader dropped", self.connection_id);
                        return Ok(());
                    }

                    if let Some(received) = self.flow.ack_due() {
                        trace!("[{}] Scheduling ack: {}", self.connection_id, received);
                        self.ack_tx.send_replace(received);
                        self.flow.mark_acked(received);
                    }
                }
                Frame::Ack { received } => {
                    trace!("[{}] Relay acked {} bytes", self.connection_id, received);
                    self.flow.on_ack(received);
                }
                Frame::Success { .. } => {
                    warn!(
                        "[{}] Ignoring Success frame on established tunnel",
                        self.connection_id
                    );
                }
                Frame::Unknown { tag } => {
                    trace!(
                        "[{}] Ignoring frame with unknown tag {:#x}",
                        self.connection_id,
                        tag
                    );
                }
            }
        }
    }
}

enum OutboundExit {
    /// The writer closed its conduit
    Drained,
    /// The inbound side stopped the tunnel
    Shutdown,
}

struct Outbound<K> {
    connection_id: String,
    sink: K,
    flow: FlowController,
    max_frame_size: usize,
    send_rx: mpsc::Receiver<Bytes>,
    ack_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,
}

impl<K: MessageSink> Outbound<K> {
    async fn run(mut self) -> TunnelResult<()> {
        let result = match self.write_frames().await {
            Ok(OutboundExit::Drained) => {
                self.sink
                    .close(CloseCode::NORMAL, "Connection closed")
                    .await
                    .map_err(TunnelError::from)
            }
            Ok(OutboundExit::Shutdown) => {
                if let Err(e) = self.sink.close(CloseCode::NORMAL, "Connection closed").await {
                    debug!("[{}] Relay channel already gone: {}", self.connection_id, e);
                }
                Ok(())
            }
            Err(e) => {
                warn!("[{}] Outbound loop failed: {}", self.connection_id, e);
                Err(e)
            }
        };

        let stats = self.flow.stats();
        info!(
            "[{}] Send side closed ({} bytes sent, {} acknowledged)",
            self.connection_id, stats.send_unacked, stats.send_acked
        );

        self.shutdown.cancel();
        result
    }

    async fn write_frames(&mut self) -> TunnelResult<OutboundExit> {
        let shutdown = self.shutdown.clone();
        let mut acks_open = true;

        loop {
            tokio::select! {
                biased;

                changed = self.ack_rx.changed(), if acks_open => {
                    if changed.is_err() {
                        acks_open = false;
                        continue;
                    }
                    let received = *self.ack_rx.borrow_and_update();
                    self.sink.send(Frame::ack(received).encode()).await?;
                    trace!("[{}] Sent ack: {}", self.connection_id, received);
                }
                data = self.send_rx.recv() => match data {
                    Some(data) => self.send_data(data).await?,
                    None => return Ok(OutboundExit::Drained),
                },
                _ = shutdown.cancelled() => return Ok(OutboundExit::Shutdown),
            }
        }
    }

    async fn send_data(&mut self, data: Bytes) -> TunnelResult<()> {
        for chunk in chunks(data, self.max_frame_size) {
            let len = chunk.len();
            // Counted first so an Ack for this chunk is never clamped away
            self.flow.record_sent(len);
            self.sink.send(Frame::data(chunk).encode()).await?;
            trace!("[{}] Sent data frame: len={}", self.connection_id, len);
        }
        Ok(())
    }
}
