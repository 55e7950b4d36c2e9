//! BLAKE3 Hashing and Key Derivation
//!
//! Provides cryptographic hashing and key derivation functions.

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing and key derivation operations
pub struct Hash;

impl Hash {
    /// Compute hash of data
    pub fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    /// Derive a key from a master key and context string
    ///
    /// The context should be a unique string identifying the purpose
    /// of this derived key (e.g., "shttp-v1 client-to-server key")
    pub fn derive_key(master: &[u8; 32], context: &str) -> [u8; 32] {
        blake3::derive_key(context, master)
    }

    /// Derive a key from arbitrary-length input
    pub fn derive_key_from_slice(input: &[u8], context: &str) -> [u8; 32] {
        // First hash the input to fixed size
        let hashed: [u8; 32] = blake3::hash(input).into();
        Self::derive_key(&hashed, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"Hello, shttp!";
        assert_eq!(Hash::hash(data), Hash::hash(data));
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(Hash::hash(b"input1"), Hash::hash(b"input2"));
    }

    #[test]
    fn test_key_derivation() {
        let master = [0u8; 32];

        let key1 = Hash::derive_key(&master, "purpose-1");
        let key2 = Hash::derive_key(&master, "purpose-2");

        // Different contexts produce different keys
        assert_ne!(key1, key2);
        assert_eq!(key1, Hash::derive_key(&master, "purpose-1"));
    }

    #[test]
    fn test_derive_from_slice_depends_on_every_byte() {
        let a = Hash::derive_key_from_slice(b"shared-secret||hash-a", "ctx");
        let b = Hash::derive_key_from_slice(b"shared-secret||hash-b", "ctx");
        assert_ne!(a, b);
    }
}
