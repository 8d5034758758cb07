#![forbid(unsafe_code)]

//! Peer state: the remote end of the tunnel.
//!
//! A peer owns its binding, up to eight crypto contexts keyed by key id
//! (exactly one of them primary while the peer can transmit), keepalive
//! timestamps and byte counters. Peers are reference counted: the RX and TX
//! pipelines and the control plane all hold transient `Arc`s, and a peer
//! handed to the crypto offload stays alive until the completion drops its
//! clone.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{RwLock, Weak};
use std::time::Instant;

use std::sync::Arc;

use veil_crypto::CryptoContext;

use crate::bind::Bind;
use crate::engine::Engine;
use crate::errors::{Error, Result};

/// Number of key-id slots; the key id is a 3-bit field.
pub const KEY_SLOTS: usize = 8;

/// Per-key-id context table with a designated primary for TX.
#[derive(Default)]
pub struct CryptoState {
    slots: [Option<Arc<CryptoContext>>; KEY_SLOTS],
    primary: Option<u8>,
}

impl CryptoState {
    /// Install a context under its key id, replacing any previous holder of
    /// that id. `make_primary` moves the TX designation to it.
    pub fn install(&mut self, ctx: Arc<CryptoContext>, make_primary: bool) {
        let key_id = ctx.key_id() as usize;
        self.slots[key_id] = Some(ctx);
        if make_primary || self.primary.is_none() {
            self.primary = Some(key_id as u8);
        }
    }

    /// Current outbound context, if any.
    pub fn primary(&self) -> Option<Arc<CryptoContext>> {
        let key_id = self.primary?;
        self.slots[key_id as usize].clone()
    }

    pub fn by_key_id(&self, key_id: u8) -> Option<Arc<CryptoContext>> {
        self.slots.get(key_id as usize)?.clone()
    }

    /// Remove the context for a key id. If it was primary the peer loses its
    /// TX designation until another install.
    pub fn remove(&mut self, key_id: u8) -> Option<Arc<CryptoContext>> {
        let slot = self.slots.get_mut(key_id as usize)?;
        let removed = slot.take();
        if removed.is_some() && self.primary == Some(key_id) {
            self.primary = None;
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct PeerStats {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl PeerStats {
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }
}

pub struct Peer {
    engine: Weak<Engine>,
    bind: RwLock<Option<Bind>>,
    crypto: RwLock<CryptoState>,
    last_rx: RwLock<Instant>,
    last_tx: RwLock<Instant>,
    stats: PeerStats,
    /// Bit per key id whose exhaustion has already been reported, so the
    /// rekey event fires once per context.
    rekey_flagged: AtomicU8,
}

impl Peer {
    pub(crate) fn new(engine: Weak<Engine>, bind: Bind) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            engine,
            bind: RwLock::new(Some(bind)),
            crypto: RwLock::new(CryptoState::default()),
            last_rx: RwLock::new(now),
            last_tx: RwLock::new(now),
            stats: PeerStats::default(),
            rekey_flagged: AtomicU8::new(0),
        })
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.upgrade()
    }

    /// Snapshot of the current binding. `Bind` is a small copy type, so
    /// readers get a consistent pair without holding the lock.
    pub fn bind(&self) -> Option<Bind> {
        *read_lock(&self.bind)
    }

    /// Replace the binding, e.g. when the peer roams to a new address.
    pub fn set_bind(&self, bind: Bind) {
        *write_lock(&self.bind) = Some(bind);
    }

    pub fn matches_source(&self, src: &std::net::SocketAddr) -> bool {
        self.bind()
            .map(|b| b.matches_source(src))
            .unwrap_or(false)
    }

    /// Install a crypto context built from control-plane key material.
    pub fn install_context(&self, ctx: Arc<CryptoContext>, make_primary: bool) {
        let key_id = ctx.key_id();
        write_lock(&self.crypto).install(ctx, make_primary);
        // a fresh key for this id makes its exhaustion reportable again
        self.rekey_flagged
            .fetch_and(!(1u8 << key_id), Ordering::AcqRel);
    }

    pub fn primary_context(&self) -> Result<Arc<CryptoContext>> {
        read_lock(&self.crypto).primary().ok_or(Error::NoPrimary)
    }

    pub fn context_for(&self, key_id: u8) -> Result<Arc<CryptoContext>> {
        read_lock(&self.crypto)
            .by_key_id(key_id)
            .ok_or(Error::NoKey(key_id))
    }

    pub fn remove_context(&self, key_id: u8) -> Option<Arc<CryptoContext>> {
        write_lock(&self.crypto).remove(key_id)
    }

    /// Note an authenticated packet arrival for keepalive purposes.
    pub fn update_keepalive_rx(&self) {
        *write_lock(&self.last_rx) = Instant::now();
    }

    /// Note an authenticated packet transmit for keepalive purposes.
    pub fn update_keepalive_tx(&self) {
        *write_lock(&self.last_tx) = Instant::now();
    }

    pub fn last_rx(&self) -> Instant {
        *read_lock(&self.last_rx)
    }

    pub fn last_tx(&self) -> Instant {
        *read_lock(&self.last_tx)
    }

    pub fn note_rx_bytes(&self, n: usize) {
        self.stats.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn note_tx_bytes(&self, n: usize) {
        self.stats.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// True the first time a given key id is reported exhausted; later calls
    /// return false until a new context is installed for it.
    pub(crate) fn flag_rekey(&self, key_id: u8) -> bool {
        let bit = 1u8 << key_id;
        self.rekey_flagged.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
