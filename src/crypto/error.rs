//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The provided signature has an invalid length
    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected signature length in bytes
        expected: usize,
        /// Actual signature length in bytes
        actual: usize,
    },

    /// Signature verification failed - the signature is invalid
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Key generation failed (random source or encoding failure)
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Serialized private key material could not be parsed
    #[error("Key parse failed: {0}")]
    KeyParse(String),

    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed - authentication tag mismatch (possibly tampered data)
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// The packet sequence counter would wrap and reuse a nonce
    #[error("Nonce sequence exhausted")]
    NonceExhausted,

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The fingerprint string is not in `SHA256:<base64>` form
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// Key exchange produced a non-contributory (all-zero) secret
    #[error("Key exchange produced a weak shared secret")]
    WeakSharedSecret,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
