#![forbid(unsafe_code)]

//! Packet-id tracking for the data channel.
//!
//! Transmit side: a single 64-bit atomic hands out strictly monotonic 32-bit
//! packet ids and refuses to wrap; exhaustion is a rekey-required failure.
//!
//! Receive side: a sliding bitmap window that accepts each id at most once,
//! tolerates reordering up to the window size, and treats a forward epoch
//! move as a window reset. Backtracks at or below the current top id stop
//! being admissible once the window has been idle past its expiry interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::{Error as CryptoError, Result};

/// Replay window size in packet ids. Power of two so the circular index is a
/// mask.
pub const REPLAY_WINDOW_SIZE: usize = 256;

const HISTORY_BYTES: usize = REPLAY_WINDOW_SIZE / 8;
const INDEX_MASK: i64 = REPLAY_WINDOW_SIZE as i64 - 1;

/// Rejection reasons from the replay detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("packet id is zero")]
    ZeroId,
    #[error("packet epoch moved backward")]
    EpochBacktrack,
    #[error("packet id already seen")]
    Replay,
    #[error("packet id backtracks beyond the window")]
    Backtrack,
    #[error("packet id at or below the expired floor")]
    Expired,
}

/// Monotonic transmit packet-id source.
///
/// The counter lives in 64 bits so concurrent increments can never wrap the
/// 32-bit id into the epoch; once the id space is spent every further call
/// fails until the control plane installs a new key.
#[derive(Debug, Default)]
pub struct PktIdXmit {
    seq: AtomicU64,
}

impl PktIdXmit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from an already-consumed sequence, e.g. when the control plane
    /// re-installs a half-used key.
    pub fn with_start(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
        }
    }

    /// Next packet id, strictly monotonic across threads. Ids run from 1 to
    /// `u32::MAX`; the call after the last valid id fails with
    /// [`CryptoError::RekeyNeeded`].
    pub fn next(&self) -> Result<u32> {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        if seq > u64::from(u32::MAX) {
            return Err(CryptoError::RekeyNeeded);
        }
        Ok(seq as u32)
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktIdRecvStats {
    pub accepted: u64,
    pub rejected_replay: u64,
    pub rejected_backtrack: u64,
    pub rejected_expired: u64,
    /// Largest backtrack distance ever observed, accepted or not.
    pub max_backtrack: u32,
}

/// Receive-side replay detector.
///
/// `history` is a circular bitmap; `base` is the position of the most
/// recently seen id, and the bit at `(base + k) & mask` covers `id - k` for
/// `k` in `[0, extent)`. Callers serialize access (the owning context wraps
/// this in a mutex) and pass `now` explicitly so expiry is deterministic
/// under test.
#[derive(Debug)]
pub struct PktIdRecv {
    base: u32,
    extent: u32,
    id: u32,
    id_floor: u32,
    epoch: u32,
    expire_at: Option<Instant>,
    expire_after: Duration,
    history: [u8; HISTORY_BYTES],
    stats: PktIdRecvStats,
}

impl PktIdRecv {
    pub fn new(expire_after: Duration) -> Self {
        Self {
            base: 0,
            extent: 0,
            id: 0,
            id_floor: 0,
            epoch: 0,
            expire_at: None,
            expire_after,
            history: [0u8; HISTORY_BYTES],
            stats: PktIdRecvStats::default(),
        }
    }

    fn index(base: u32, offset: i64) -> u32 {
        ((i64::from(base) + offset) & INDEX_MASK) as u32
    }

    fn bit_set(&mut self, idx: u32) {
        self.history[idx as usize / 8] |= 1 << (idx % 8);
    }

    fn bit_clear(&mut self, idx: u32) {
        self.history[idx as usize / 8] &= !(1 << (idx % 8));
    }

    fn bit_test(&self, idx: u32) -> bool {
        self.history[idx as usize / 8] & (1 << (idx % 8)) != 0
    }

    /// Accept-or-reject decision for `(pkt_id, pkt_epoch)` at time `now`.
    ///
    /// On acceptance the window state is updated and the expiry deadline
    /// refreshed; on rejection the state is untouched apart from the
    /// diagnostic counters.
    pub fn check_and_update(
        &mut self,
        pkt_id: u32,
        pkt_epoch: u32,
        now: Instant,
    ) -> core::result::Result<(), ReplayError> {
        // expire backtracks at or below the current top after idle time
        if let Some(expire_at) = self.expire_at {
            if now >= expire_at {
                self.id_floor = self.id;
            }
        }

        if pkt_id == 0 {
            return Err(ReplayError::ZeroId);
        }

        if pkt_epoch != self.epoch {
            if pkt_epoch > self.epoch {
                // epoch moved forward: start a fresh window
                self.base = 0;
                self.extent = 0;
                self.id = 0;
                self.id_floor = 0;
                self.epoch = pkt_epoch;
            } else {
                return Err(ReplayError::EpochBacktrack);
            }
        }

        if pkt_id == self.id.wrapping_add(1) {
            // well-formed sequence, incremented by one
            self.base = Self::index(self.base, -1);
            let base = self.base;
            self.bit_set(base);
            if self.extent < REPLAY_WINDOW_SIZE as u32 {
                self.extent += 1;
            }
            self.id = pkt_id;
        } else if pkt_id > self.id {
            // id jumped forward by more than one
            let delta = pkt_id - self.id;
            if (delta as usize) < REPLAY_WINDOW_SIZE {
                self.base = Self::index(self.base, -i64::from(delta));
                let base = self.base;
                self.bit_set(base);
                self.extent = (self.extent + delta).min(REPLAY_WINDOW_SIZE as u32);
                for i in 1..delta {
                    let skipped = Self::index(self.base, i64::from(i));
                    self.bit_clear(skipped);
                }
            } else {
                self.base = 0;
                self.extent = REPLAY_WINDOW_SIZE as u32;
                self.history = [0u8; HISTORY_BYTES];
                self.bit_set(0);
            }
            self.id = pkt_id;
        } else {
            // id backtrack
            let delta = self.id - pkt_id;
            if delta > self.stats.max_backtrack {
                self.stats.max_backtrack = delta;
            }
            if delta >= self.extent {
                self.stats.rejected_backtrack += 1;
                return Err(ReplayError::Backtrack);
            }
            if pkt_id <= self.id_floor {
                self.stats.rejected_expired += 1;
                return Err(ReplayError::Expired);
            }
            let ri = Self::index(self.base, i64::from(delta));
            if self.bit_test(ri) {
                self.stats.rejected_replay += 1;
                return Err(ReplayError::Replay);
            }
            self.bit_set(ri);
        }

        self.expire_at = Some(now + self.expire_after);
        self.stats.accepted += 1;
        Ok(())
    }

    pub fn stats(&self) -> PktIdRecvStats {
        self.stats
    }

    /// Highest id accepted so far in the current epoch.
    pub fn top_id(&self) -> u32 {
        self.id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}
