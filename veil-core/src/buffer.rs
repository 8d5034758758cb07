#![forbid(unsafe_code)]

//! Headroom-managed packet buffer.
//!
//! A `PacketBuf` carries one packet through the datapath. Each pipeline stage
//! owns the buffer exclusively and either hands it to the next stage or drops
//! it; there is no sharing. Headroom reserved at allocation lets the encrypt
//! stage prepend the wire header without reallocating, mirroring how the
//! encapsulation overhead is budgeted up front on the transmit path.

use crate::error::{Error, Result};

/// Per-packet scratch carried alongside the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    /// Original on-wire size of the datagram, recorded before decrypt so RX
    /// accounting reflects transport bytes rather than plaintext bytes.
    pub rx_size: usize,
    /// Packet id assigned on encrypt / decoded on decrypt. Zero until set.
    pub pktid: u32,
}

/// Owned byte carrier with reserved front headroom.
#[derive(Debug, Clone)]
pub struct PacketBuf {
    data: Vec<u8>,
    head: usize,
    meta: PacketMeta,
}

impl PacketBuf {
    /// Wrap a received datagram. No headroom; the payload is the whole vec.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            head: 0,
            meta: PacketMeta::default(),
        }
    }

    /// Copy `payload` into a fresh buffer with `headroom` bytes reserved in
    /// front of it.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(headroom + payload.len());
        data.resize(headroom, 0);
        data.extend_from_slice(payload);
        Self {
            data,
            head: headroom,
            meta: PacketMeta::default(),
        }
    }

    /// Remaining front headroom.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Extend the payload at the front by `n` bytes, consuming headroom, and
    /// return the newly exposed region for the caller to fill.
    pub fn push_front(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.head {
            return Err(Error::buffer(format!(
                "push_front {n} exceeds headroom {}",
                self.head
            )));
        }
        self.head -= n;
        Ok(&mut self.data[self.head..self.head + n])
    }

    /// Strip `n` bytes from the front of the payload; they become headroom.
    pub fn pull_front(&mut self, n: usize) -> Result<()> {
        if n > self.len() {
            return Err(Error::buffer(format!(
                "pull_front {n} exceeds payload {}",
                self.len()
            )));
        }
        self.head += n;
        Ok(())
    }

    /// Replace the payload in place, keeping the current headroom.
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.data.truncate(self.head);
        self.data.extend_from_slice(payload);
    }

    pub fn meta(&self) -> &PacketMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut PacketMeta {
        &mut self.meta
    }

    /// Consume the buffer, returning the payload alone.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.split_off(self.head)
    }
}
