#![forbid(unsafe_code)]

//! Per-key-id crypto context.
//!
//! A context owns one direction pair of AEAD keys, the transmit packet-id
//! source and the receive replay window for a single key id. Key id and
//! epoch are immutable for the context's lifetime; rekeying installs a new
//! context under a different key id.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use veil_core::PacketBuf;

use crate::aead::{nonce_for, AeadAlgorithm, AeadKey, DataCipher};
use crate::pktid::{PktIdRecv, PktIdRecvStats, PktIdXmit};
use crate::{Error, Result};

/// Data-channel header the context prepends on encrypt: opcode/key-id byte
/// plus the big-endian packet id. The header doubles as the AEAD associated
/// data.
pub const DATA_HEADER_LEN: usize = 5;

/// Key material handed over by the control plane for one key id.
pub struct KeyDescriptor {
    /// 3-bit key id, 0..8.
    pub key_id: u8,
    /// Epoch bound into every nonce; advanced only by installing a new key.
    pub epoch: u32,
    pub algorithm: AeadAlgorithm,
    /// Key used to seal outbound records.
    pub encrypt_key: AeadKey,
    /// Key used to open inbound records.
    pub decrypt_key: AeadKey,
}

pub struct CryptoContext {
    key_id: u8,
    epoch: u32,
    encrypt: DataCipher,
    decrypt: DataCipher,
    pid_xmit: PktIdXmit,
    pid_recv: Mutex<PktIdRecv>,
}

impl CryptoContext {
    pub fn new(desc: KeyDescriptor, replay_expire: Duration) -> Result<Self> {
        if desc.key_id > 7 {
            return Err(Error::InvalidKey(format!(
                "key id {} outside the 3-bit field",
                desc.key_id
            )));
        }
        Ok(Self {
            key_id: desc.key_id,
            epoch: desc.epoch,
            encrypt: DataCipher::new(desc.algorithm, &desc.encrypt_key),
            decrypt: DataCipher::new(desc.algorithm, &desc.decrypt_key),
            pid_xmit: PktIdXmit::new(),
            pid_recv: Mutex::new(PktIdRecv::new(replay_expire)),
        })
    }

    /// Resume the transmit sequence of a half-used key, e.g. after the
    /// control plane re-installs key material it already sent with.
    pub fn with_transmit_sequence(mut self, seq: u64) -> Self {
        self.pid_xmit = PktIdXmit::with_start(seq);
        self
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Seal `buf` in place: the payload becomes ciphertext plus tag, and the
    /// data-channel header (opcode/key-id byte, packet id) is prepended out
    /// of the buffer's headroom. Fails with [`Error::RekeyNeeded`] once the
    /// packet-id space is spent.
    pub fn encrypt(&self, opcode: u8, buf: &mut PacketBuf) -> Result<()> {
        let pkt_id = self.pid_xmit.next()?;

        let mut header = [0u8; DATA_HEADER_LEN];
        header[0] = (opcode << 3) | self.key_id;
        header[1..5].copy_from_slice(&pkt_id.to_be_bytes());

        let nonce = nonce_for(self.epoch, pkt_id);
        let ct = self.encrypt.seal(nonce, &header, buf.as_slice())?;

        buf.set_payload(&ct);
        let hdr = buf
            .push_front(DATA_HEADER_LEN)
            .map_err(|e| Error::Headroom(e.to_string()))?;
        hdr.copy_from_slice(&header);
        buf.meta_mut().pktid = pkt_id;
        Ok(())
    }

    /// Open `buf` in place. The payload must be a full data-channel record
    /// including its `aad_len`-byte wire header (5 for the V1 layout, 8 when
    /// a peer-id field is present). The replay window is consulted after
    /// authentication and before success is reported, so a replayed id
    /// surfaces as a decrypt failure and the plaintext is never exposed.
    pub fn decrypt(&self, buf: &mut PacketBuf, aad_len: usize, now: Instant) -> Result<()> {
        let record = buf.as_slice();
        if record.len() < aad_len + crate::TAG_LEN || aad_len < DATA_HEADER_LEN {
            return Err(Error::Truncated);
        }

        let aad = &record[..aad_len];
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&aad[aad_len - 4..]);
        let pkt_id = u32::from_be_bytes(id_bytes);

        let nonce = nonce_for(self.epoch, pkt_id);
        let pt = self.decrypt.open(nonce, aad, &record[aad_len..])?;

        self.pid_recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_update(pkt_id, self.epoch, now)?;

        buf.set_payload(&pt);
        buf.meta_mut().pktid = pkt_id;
        Ok(())
    }

    pub fn replay_stats(&self) -> PktIdRecvStats {
        self.pid_recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }
}
