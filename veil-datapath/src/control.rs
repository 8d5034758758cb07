#![forbid(unsafe_code)]

//! Engine ↔ control-plane handoff.
//!
//! The engine forwards every non-data packet (and data from unrecognized
//! sources) verbatim to the control plane over a bounded queue, and raises
//! events the control plane must act on (rekey, keepalive timeout). Both
//! directions are non-blocking: a full queue is a counted drop, never a
//! stall of the datapath.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::{Error, Result};

/// Events the control plane must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// The transmit packet-id space of a context is spent; a new key must be
    /// negotiated before that key id can send again.
    RekeyRequired { key_id: u8 },
    /// Nothing authenticated has arrived from the peer within the configured
    /// timeout; the control plane decides whether to tear the peer down.
    KeepaliveTimeout,
}

/// Engine-side handle.
#[derive(Clone)]
pub struct ControlChannel {
    packets: mpsc::Sender<Bytes>,
    events: mpsc::Sender<ControlEvent>,
}

/// Control-plane side of the channel pair.
pub struct ControlReceiver {
    pub packets: mpsc::Receiver<Bytes>,
    pub events: mpsc::Receiver<ControlEvent>,
}

/// Build the engine/control-plane channel pair with the given packet queue
/// depth.
pub fn control_channel(depth: usize) -> (ControlChannel, ControlReceiver) {
    let (packets_tx, packets_rx) = mpsc::channel(depth);
    let (events_tx, events_rx) = mpsc::channel(depth.max(8));
    (
        ControlChannel {
            packets: packets_tx,
            events: events_tx,
        },
        ControlReceiver {
            packets: packets_rx,
            events: events_rx,
        },
    )
}

impl ControlChannel {
    /// Forward a packet verbatim. The caller keeps no ownership after
    /// return, whether the send succeeded or not.
    pub fn send_packet(&self, packet: Bytes) -> Result<()> {
        self.packets
            .try_send(packet)
            .map_err(|_| Error::ControlQueueFull)
    }

    /// Raise a control event. Loss is tolerable (the condition persists and
    /// will be raised again), so overflow only logs.
    pub fn send_event(&self, event: ControlEvent) {
        if self.events.try_send(event).is_err() {
            warn!(?event, "control event queue full, event dropped");
        }
    }
}
