//! Acknowledgement-based flow control
//!
//! The relay expects the client to acknowledge received bytes once enough
//! of them have piled up, which bounds how far the relay may run ahead. On the
//! send side the counters are bookkeeping only: the transport is reliable and
//! ordered, so nothing is retransmitted and sending never waits on acks.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Per-connection byte counters
///
/// Receive counters are only advanced by the task reading the transport and
/// send counters by the task writing it; everyone else just loads them.
#[derive(Debug, Default)]
pub struct FlowCounters {
    recv_acked: AtomicU64,
    recv_unacked: AtomicU64,
    send_acked: AtomicU64,
    send_unacked: AtomicU64,
}

/// Point-in-time copy of [`FlowCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Received bytes covered by an Ack we sent
    pub recv_acked: u64,
    /// Total bytes received
    pub recv_unacked: u64,
    /// Sent bytes the relay has acknowledged
    pub send_acked: u64,
    /// Total bytes sent
    pub send_unacked: u64,
}

impl FlowCounters {
    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            recv_acked: self.recv_acked.load(Ordering::Acquire),
            recv_unacked: self.recv_unacked.load(Ordering::Acquire),
            send_acked: self.send_acked.load(Ordering::Acquire),
            send_unacked: self.send_unacked.load(Ordering::Acquire),
        }
    }
}

/// Applies the ack rule and keeps the counters consistent
#[derive(Debug, Clone)]
pub struct FlowController {
    counters: Arc<FlowCounters>,
    ack_threshold: u64,
}

impl FlowController {
    pub fn new(ack_threshold: u64) -> Self {
        Self {
            counters: Arc::new(FlowCounters::default()),
            ack_threshold,
        }
    }

    pub fn counters(&self) -> Arc<FlowCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> FlowStats {
        self.counters.snapshot()
    }

    /// Account for a Data frame payload handed to the reader
    pub fn record_received(&self, len: usize) {
        self.counters
            .recv_unacked
            .fetch_add(len as u64, Ordering::AcqRel);
    }

    /// Value to acknowledge, if the unacknowledged backlog crossed the threshold
    pub fn ack_due(&self) -> Option<u64> {
        let acked = self.counters.recv_acked.load(Ordering::Acquire);
        let unacked = self.counters.recv_unacked.load(Ordering::Acquire);

        (unacked.saturating_sub(acked) > self.ack_threshold).then_some(unacked)
    }

    /// Record that an Ack carrying `value` has been issued
    pub fn mark_acked(&self, value: u64) {
        let previous = self.counters.recv_acked.fetch_max(value, Ordering::AcqRel);
        trace!(previous, value, "Receive window acknowledged");
    }

    /// Account for a Data frame handed to the transport
    pub fn record_sent(&self, len: usize) {
        self.counters
            .send_unacked
            .fetch_add(len as u64, Ordering::AcqRel);
    }

    /// Apply an Ack frame from the relay
    ///
    /// Acks are advisory: a value beyond what was sent is clamped and a value
    /// behind the current one is ignored.
    pub fn on_ack(&self, received: u64) {
        let sent = self.counters.send_unacked.load(Ordering::Acquire);
        if received > sent {
            warn!(received, sent, "Relay acknowledged more bytes than were sent");
        }

        self.counters
            .send_acked
            .fetch_max(received.min(sent), Ordering::AcqRel);
    }
}

/// Split `data` into frame-sized pieces without copying
pub fn chunks(data: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    let max = max.max(1);
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let take = rest.len().min(max);
        Some(rest.split_to(take))
    })
}
