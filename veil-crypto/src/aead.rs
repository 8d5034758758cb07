#![forbid(unsafe_code)]

//! AEAD data ciphers.
//!
//! One enum wraps the two suites the data channel negotiates; keys zeroize
//! on drop. The nonce is the context epoch followed by the packet id, both
//! big-endian, zero-padded to the 96 bits the suites require.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Auth tag length shared by both suites.
pub const TAG_LEN: usize = 16;

/// Nonce length shared by both suites.
pub const NONCE_LEN: usize = 12;

/// Negotiated data-channel cipher suite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AeadAlgorithm {
    #[default]
    ChaCha20Poly1305,
    Aes256Gcm,
}

/// AEAD key (zeroized on drop)
#[derive(Clone)]
pub struct AeadKey(pub [u8; 32]);

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

enum Suite {
    ChaCha(ChaCha20Poly1305),
    Aes(Aes256Gcm),
}

/// One-direction data cipher with a pre-built suite instance.
pub struct DataCipher {
    algorithm: AeadAlgorithm,
    suite: Suite,
}

/// Build the 96-bit nonce from the context epoch and the packet id.
pub fn nonce_for(epoch: u32, pkt_id: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..8].copy_from_slice(&pkt_id.to_be_bytes());
    nonce
}

impl DataCipher {
    pub fn new(algorithm: AeadAlgorithm, key: &AeadKey) -> Self {
        let suite = match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => Suite::ChaCha(ChaCha20Poly1305::new(
                chacha20poly1305::Key::from_slice(&key.0),
            )),
            AeadAlgorithm::Aes256Gcm => Suite::Aes(Aes256Gcm::new(
                aes_gcm::Key::<Aes256Gcm>::from_slice(&key.0),
            )),
        };
        Self { algorithm, suite }
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// Seal `plaintext`, returning ciphertext with the trailing auth tag.
    pub fn seal(&self, nonce: [u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match &self.suite {
            Suite::ChaCha(cipher) => cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                .map_err(|e| Error::Seal(e.to_string())),
            Suite::Aes(cipher) => cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|e| Error::Seal(e.to_string())),
        }
    }

    /// Open `ciphertext` (payload plus tag), verifying the tag and `aad`.
    pub fn open(&self, nonce: [u8; NONCE_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::Truncated);
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match &self.suite {
            Suite::ChaCha(cipher) => cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
                .map_err(|e| Error::Open(e.to_string())),
            Suite::Aes(cipher) => cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|e| Error::Open(e.to_string())),
        }
    }
}
