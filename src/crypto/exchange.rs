//! X25519 Key Exchange
//!
//! Ephemeral Elliptic Curve Diffie-Hellman for establishing session keys.
//! Each handshake generates a fresh keypair on both sides (forward secrecy).

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::cipher::KEY_SIZE;
use super::error::{CryptoError, CryptoResult};
use super::hash::Hash;

/// Size of a shared secret in bytes
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of an exchange public key in bytes
pub const EXCHANGE_KEY_SIZE: usize = 32;

const CLIENT_TO_SERVER_CONTEXT: &str = "shttp-v1 client-to-server key";
const SERVER_TO_CLIENT_CONTEXT: &str = "shttp-v1 server-to-client key";

/// A public key for key exchange (X25519)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExchangePublicKey(pub [u8; EXCHANGE_KEY_SIZE]);

impl ExchangePublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != EXCHANGE_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: EXCHANGE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; EXCHANGE_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(ExchangePublicKey(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; EXCHANGE_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangePublicKey({}...)", &hex::encode(self.0)[..16])
    }
}

/// Shared secret derived from key exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the raw bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }

    /// Reject the all-zero output produced by low-order peer points
    pub fn ensure_contributory(&self) -> CryptoResult<()> {
        if self.secret.iter().fold(0u8, |acc, b| acc | b) == 0 {
            return Err(CryptoError::WeakSharedSecret);
        }
        Ok(())
    }
}

/// An ephemeral keypair for key exchange
///
/// Used once and then discarded (forward secrecy)
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeypair {
    #[zeroize(skip)]
    public_key: ExchangePublicKey,
    secret_key: [u8; 32],
}

impl EphemeralKeypair {
    /// Generate a new ephemeral keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);

        EphemeralKeypair {
            public_key: ExchangePublicKey(public.to_bytes()),
            secret_key: secret.to_bytes(),
        }
    }

    /// Get the public key to share with the peer
    pub fn public_key(&self) -> &ExchangePublicKey {
        &self.public_key
    }

    /// Compute shared secret with a peer's public key
    pub fn diffie_hellman(&self, peer_public: &ExchangePublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.secret_key);
        let peer = X25519Public::from(peer_public.0);
        let shared = secret.diffie_hellman(&peer);

        SharedSecret {
            secret: shared.to_bytes(),
        }
    }
}

/// Directional packet keys for one session
#[derive(ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key sealing packets sent by the client
    pub client_to_server: [u8; KEY_SIZE],
    /// Key sealing packets sent by the server
    pub server_to_client: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive both directions from the shared secret and the exchange hash
    pub fn derive(shared: &SharedSecret, exchange_hash: &[u8]) -> Self {
        let mut input = Vec::with_capacity(SHARED_SECRET_SIZE + exchange_hash.len());
        input.extend_from_slice(shared.as_bytes());
        input.extend_from_slice(exchange_hash);

        let keys = SessionKeys {
            client_to_server: Hash::derive_key_from_slice(&input, CLIENT_TO_SERVER_CONTEXT),
            server_to_client: Hash::derive_key_from_slice(&input, SERVER_TO_CLIENT_CONTEXT),
        };
        zeroize::Zeroize::zeroize(&mut input);
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_key_exchange() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key());
        let bob_shared = bob.diffie_hellman(alice.public_key());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
        assert!(alice_shared.ensure_contributory().is_ok());
    }

    #[test]
    fn test_different_keys_different_secrets() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let carol = EphemeralKeypair::generate();

        let alice_bob = alice.diffie_hellman(bob.public_key());
        let alice_carol = alice.diffie_hellman(carol.public_key());

        assert_ne!(alice_bob.as_bytes(), alice_carol.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = EphemeralKeypair::generate();
        let identity_point = ExchangePublicKey([0u8; EXCHANGE_KEY_SIZE]);

        let shared = alice.diffie_hellman(&identity_point);
        assert_eq!(
            shared.ensure_contributory(),
            Err(CryptoError::WeakSharedSecret)
        );
    }

    #[test]
    fn test_session_keys_agree_and_differ_by_direction() {
        let client = EphemeralKeypair::generate();
        let server = EphemeralKeypair::generate();
        let hash = [9u8; 32];

        let client_keys = SessionKeys::derive(&client.diffie_hellman(server.public_key()), &hash);
        let server_keys = SessionKeys::derive(&server.diffie_hellman(client.public_key()), &hash);

        assert_eq!(client_keys.client_to_server, server_keys.client_to_server);
        assert_eq!(client_keys.server_to_client, server_keys.server_to_client);
        assert_ne!(client_keys.client_to_server, client_keys.server_to_client);
    }

    #[test]
    fn test_public_key_length_checked() {
        assert!(ExchangePublicKey::from_bytes(&[1u8; 31]).is_err());
        assert!(ExchangePublicKey::from_bytes(&[1u8; 32]).is_ok());
    }
}
