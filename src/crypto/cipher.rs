//! ChaCha20-Poly1305 packet encryption
//!
//! Each direction of a session owns one [`PacketCipher`]. Nonces are never
//! random: they are the packet sequence number, so both ends stay in lockstep
//! and a replayed, dropped or reordered packet fails authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Directional AEAD state: a key plus the next packet sequence number
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
    sequence: u64,
}

impl PacketCipher {
    /// Create a cipher starting at sequence number zero
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        PacketCipher {
            cipher: ChaCha20Poly1305::new(key.into()),
            sequence: 0,
        }
    }

    /// Sequence number the next packet will use
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Encrypt one packet body, authenticating `aad` alongside it
    ///
    /// Returns: ciphertext || tag
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce_bytes = self.next_nonce()?;
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt and verify one packet body
    ///
    /// The AAD must match what the sender authenticated.
    pub fn open(&mut self, ciphertext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let nonce_bytes = self.next_nonce()?;
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn next_nonce(&mut self) -> CryptoResult<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&self.sequence.to_be_bytes());
        self.sequence = self
            .sequence
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;
        Ok(nonce)
    }
}
