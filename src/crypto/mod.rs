//! Cryptographic primitives for shttp
//!
//! This module provides all the cryptographic building blocks:
//! - `identity`: Ed25519 identities, signers and fingerprints
//! - `exchange`: X25519 ECDH for session key agreement
//! - `cipher`: ChaCha20-Poly1305 packet encryption
//! - `hash`: BLAKE3 hashing and key derivation

pub mod cipher;
pub mod error;
pub mod exchange;
pub mod hash;
pub mod identity;

// Re-export commonly used types
pub use cipher::PacketCipher;
pub use error::{CryptoError, CryptoResult};
pub use exchange::{EphemeralKeypair, ExchangePublicKey, SessionKeys, SharedSecret};
pub use hash::Hash;
pub use identity::{Fingerprint, Identity, PublicKey, SignatureBytes, Signer};

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_full_packet_flow() {
        // Both parties agree on a secret and bind it to a transcript hash
        let client = EphemeralKeypair::generate();
        let server = EphemeralKeypair::generate();
        let transcript = Hash::hash(b"transcript");

        let client_shared = client.diffie_hellman(server.public_key());
        let server_shared = server.diffie_hellman(client.public_key());
        let client_keys = SessionKeys::derive(&client_shared, &transcript);
        let server_keys = SessionKeys::derive(&server_shared, &transcript);

        let mut sealer = PacketCipher::new(&client_keys.client_to_server);
        let mut opener = PacketCipher::new(&server_keys.client_to_server);

        let message = b"GET / HTTP/1.0\r\n\r\n";
        let ciphertext = sealer.seal(message, b"aad").unwrap();
        let decrypted = opener.open(&ciphertext, b"aad").unwrap();
        assert_eq!(message, decrypted.as_slice());
    }

    #[test]
    fn test_identity_signature_over_transcript() {
        let host = Identity::generate().unwrap().signer();
        let transcript = Hash::hash(b"exchange hash input");

        let signature = host.sign(&transcript);

        // Anyone holding the host's public key can verify
        let public_key = *host.public_key();
        assert!(public_key.verify(&transcript, &signature).is_ok());
        assert!(public_key.verify(&Hash::hash(b"other"), &signature).is_err());
    }

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 16] = random_bytes();
        let b: [u8; 16] = random_bytes();
        assert_ne!(a, b);
    }
}
