#![forbid(unsafe_code)]

//! Engine-wide counters.
//!
//! Packet loss inside the datapath is silent on the wire; these counters and
//! rate-insensitive debug logs are its only externally observable trace.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::Error;

#[derive(Debug, Default)]
pub struct EngineStats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    control_forwarded: AtomicU64,
    keepalive_rx: AtomicU64,
    rekey_events: AtomicU64,

    drop_no_peer: AtomicU64,
    drop_no_key: AtomicU64,
    drop_crypto: AtomicU64,
    drop_replay: AtomicU64,
    drop_malformed: AtomicU64,
    drop_no_route: AtomicU64,
    drop_queue_full: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub control_forwarded: u64,
    pub keepalive_rx: u64,
    pub rekey_events: u64,
    pub drop_no_peer: u64,
    pub drop_no_key: u64,
    pub drop_crypto: u64,
    pub drop_replay: u64,
    pub drop_malformed: u64,
    pub drop_no_route: u64,
    pub drop_queue_full: u64,
}

impl EngineStats {
    pub fn note_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn note_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn note_control_forwarded(&self) {
        self.control_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_keepalive_rx(&self) {
        self.keepalive_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_rekey_event(&self) {
        self.rekey_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a dropped buffer under the counter its error belongs to.
    pub fn note_drop(&self, err: &Error) {
        let counter = match err {
            Error::NoPeer | Error::NoBinding => &self.drop_no_peer,
            Error::NoKey(_) | Error::NoPrimary => &self.drop_no_key,
            Error::RekeyNeeded | Error::Crypto(_) => &self.drop_crypto,
            Error::Replay(_) => &self.drop_replay,
            Error::Malformed(_) => &self.drop_malformed,
            Error::NoRoute(_) => &self.drop_no_route,
            Error::QueueFull | Error::ControlQueueFull => &self.drop_queue_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            control_forwarded: self.control_forwarded.load(Ordering::Relaxed),
            keepalive_rx: self.keepalive_rx.load(Ordering::Relaxed),
            rekey_events: self.rekey_events.load(Ordering::Relaxed),
            drop_no_peer: self.drop_no_peer.load(Ordering::Relaxed),
            drop_no_key: self.drop_no_key.load(Ordering::Relaxed),
            drop_crypto: self.drop_crypto.load(Ordering::Relaxed),
            drop_replay: self.drop_replay.load(Ordering::Relaxed),
            drop_malformed: self.drop_malformed.load(Ordering::Relaxed),
            drop_no_route: self.drop_no_route.load(Ordering::Relaxed),
            drop_queue_full: self.drop_queue_full.load(Ordering::Relaxed),
        }
    }
}
