#![forbid(unsafe_code)]

//! Veil data-channel cryptography.
//! - Packet-id tracking: monotonic transmit source, sliding-window replay
//!   detector with coarse epoch handling
//! - AEAD: ChaCha20-Poly1305 / AES-256-GCM data ciphers with zeroizing keys
//!   and epoch‖packet-id nonces
//! - Per-key-id crypto contexts that seal/open the data-channel wire format
//! - Offload pool running completions inline or on worker tasks

pub mod aead;
pub mod context;
pub mod offload;
pub mod pktid;

pub use aead::{AeadAlgorithm, AeadKey, DataCipher, TAG_LEN};
pub use context::{CryptoContext, KeyDescriptor, DATA_HEADER_LEN};
pub use offload::{CompletionMode, CryptoOp, OffloadPool};
pub use pktid::{PktIdRecv, PktIdRecvStats, PktIdXmit, ReplayError, REPLAY_WINDOW_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The transmit packet id would wrap; a fresh key must be installed
    /// before this context can send again.
    #[error("rekey required: transmit packet id exhausted")]
    RekeyNeeded,
    #[error("aead seal failed: {0}")]
    Seal(String),
    #[error("aead open failed: {0}")]
    Open(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("packet too short for data-channel header")]
    Truncated,
    #[error("insufficient headroom: {0}")]
    Headroom(String),
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

pub type Result<T> = core::result::Result<T, Error>;
