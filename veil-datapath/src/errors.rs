use thiserror::Error;

pub use veil_crypto::ReplayError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Datapath failure taxonomy. Inside the pipelines every error frees the
/// buffer and bumps a counter; only the transmit entry surfaces one to its
/// caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no peer installed")]
    NoPeer,
    #[error("peer has no binding")]
    NoBinding,
    #[error("no route to peer: {0}")]
    NoRoute(String),
    #[error("no crypto context for key id {0}")]
    NoKey(u8),
    #[error("no primary crypto context")]
    NoPrimary,
    #[error("rekey required: transmit packet id exhausted")]
    RekeyNeeded,
    #[error("crypto failure: {0}")]
    Crypto(veil_crypto::Error),
    #[error(transparent)]
    Replay(ReplayError),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("transmit queue full")]
    QueueFull,
    #[error("control queue full")]
    ControlQueueFull,
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<veil_crypto::Error> for Error {
    fn from(e: veil_crypto::Error) -> Self {
        match e {
            veil_crypto::Error::RekeyNeeded => Self::RekeyNeeded,
            veil_crypto::Error::Replay(r) => Self::Replay(r),
            other => Self::Crypto(other),
        }
    }
}
