//! Ed25519 Identity management
//!
//! An [`Identity`] is the serialized private key an endpoint keeps between
//! runs. A [`Signer`] is the in-memory capability derived from it and is what
//! the handshake uses to prove possession of the key, on the server as the
//! host credential and on the client as the client credential.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::{CryptoError, CryptoResult};

/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a fingerprint digest in bytes
pub const FINGERPRINT_SIZE: usize = 32;

/// Algorithm name used in SSH key blobs
pub const KEY_ALGORITHM: &str = "ssh-ed25519";

const FINGERPRINT_PREFIX: &str = "SHA256:";

/// A public key for identity verification
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Encode as an SSH public key blob: `string(algorithm) || string(key)`
    pub fn to_ssh_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(4 + KEY_ALGORITHM.len() + 4 + PUBLIC_KEY_SIZE);
        blob.extend_from_slice(&(KEY_ALGORITHM.len() as u32).to_be_bytes());
        blob.extend_from_slice(KEY_ALGORITHM.as_bytes());
        blob.extend_from_slice(&(PUBLIC_KEY_SIZE as u32).to_be_bytes());
        blob.extend_from_slice(&self.0);
        blob
    }

    /// Decode an SSH public key blob produced by [`PublicKey::to_ssh_blob`]
    pub fn from_ssh_blob(blob: &[u8]) -> CryptoResult<Self> {
        let (algorithm, rest) = split_string(blob)?;
        if algorithm != KEY_ALGORITHM.as_bytes() {
            return Err(CryptoError::InvalidPublicKey);
        }
        let (key, rest) = split_string(rest)?;
        if !rest.is_empty() {
            return Err(CryptoError::InvalidPublicKey);
        }
        let key = Self::from_bytes(key)?;
        VerifyingKey::from_bytes(&key.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(key)
    }

    /// SHA-256 fingerprint of the SSH blob
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(Sha256::digest(self.to_ssh_blob()).into())
    }

    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify_strict(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

fn split_string(bytes: &[u8]) -> CryptoResult<(&[u8], &[u8])> {
    if bytes.len() < 4 {
        return Err(CryptoError::InvalidPublicKey);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[4..];
    if rest.len() < len {
        return Err(CryptoError::InvalidPublicKey);
    }
    Ok(rest.split_at(len))
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A signature produced by a signer
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(SignatureBytes(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

/// Hash-derived short identifier of a public key
///
/// Formatted like OpenSSH: `SHA256:` followed by unpadded base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", FINGERPRINT_PREFIX, STANDARD_NO_PAD.encode(self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(FINGERPRINT_PREFIX)
            .ok_or_else(|| CryptoError::InvalidFingerprint(s.to_string()))?;
        let bytes = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidFingerprint(e.to_string()))?;
        let digest: [u8; FINGERPRINT_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidFingerprint(s.to_string()))?;
        Ok(Fingerprint(digest))
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serialized Ed25519 private key (PKCS#8 DER)
///
/// Opaque to callers: persist it with [`Identity::as_bytes`], restore it with
/// [`Identity::from_bytes`]. The bytes are zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Generate a fresh identity from the operating system's random source
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut *seed)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let signing_key = SigningKey::from_bytes(&seed);
        let document = signing_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(Identity(document.as_bytes().to_vec()))
    }

    /// Wrap previously serialized key material
    ///
    /// No validation happens here; parsing is deferred to [`Identity::signer`].
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Identity(bytes.into())
    }

    /// The serialized key material
    ///
    /// WARNING: This exposes the secret key. Handle with extreme care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse the key material into a [`Signer`]
    pub fn try_signer(&self) -> CryptoResult<Signer> {
        let signing_key = SigningKey::from_pkcs8_der(&self.0)
            .map_err(|e| CryptoError::KeyParse(e.to_string()))?;
        Ok(Signer::new(signing_key))
    }

    /// Derive the signing capability used during handshakes
    ///
    /// # Panics
    ///
    /// Panics if the bytes are not a PKCS#8 Ed25519 key. Identities are
    /// expected to come from [`Identity::generate`] or trusted storage; use
    /// [`Identity::try_signer`] for anything else.
    pub fn signer(&self) -> Signer {
        match self.try_signer() {
            Ok(signer) => signer,
            Err(e) => panic!("identity does not hold a valid Ed25519 key: {e}"),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity(<{} bytes redacted>)", self.0.len())
    }
}

/// Signing capability derived from an [`Identity`]
///
/// The secret key is zeroized when dropped.
#[derive(Clone)]
pub struct Signer {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Signer {
    fn new(signing_key: SigningKey) -> Self {
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        Signer {
            signing_key,
            public_key,
        }
    }

    /// Create from a seed (deterministic generation)
    pub fn from_seed(seed: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::new(SigningKey::from_bytes(seed))
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        self.public_key.fingerprint()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id1 = Identity::generate().unwrap();
        let id2 = Identity::generate().unwrap();

        // Each identity should be unique
        assert_ne!(id1.signer().public_key(), id2.signer().public_key());
    }

    #[test]
    fn test_reparse_yields_same_fingerprint() {
        let id = Identity::generate().unwrap();
        let restored = Identity::from_bytes(id.as_bytes().to_vec());

        let first = id.signer().fingerprint();
        let second = restored.signer().fingerprint();
        assert_eq!(first, second);
        assert_eq!(first, id.signer().fingerprint());
    }

    #[test]
    fn test_malformed_identity_is_key_parse_error() {
        let id = Identity::from_bytes(vec![0x30, 0x03, 0x02, 0x01]);
        assert!(matches!(id.try_signer(), Err(CryptoError::KeyParse(_))));
    }

    #[test]
    #[should_panic(expected = "valid Ed25519 key")]
    fn test_malformed_identity_signer_panics() {
        Identity::from_bytes(b"not a key".to_vec()).signer();
    }

    #[test]
    fn test_identity_debug_is_redacted() {
        let id = Identity::generate().unwrap();
        let rendered = format!("{:?}", id);
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains(&hex::encode(id.as_bytes())));
    }

    #[test]
    fn test_sign_verify() {
        let signer = Identity::generate().unwrap().signer();
        let message = b"Hello, shttp!";

        let signature = signer.sign(message);
        assert!(signer.public_key().verify(message, &signature).is_ok());
        assert!(signer.public_key().verify(b"Wrong message", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer1 = Signer::from_seed(&[1u8; 32]);
        let signer2 = Signer::from_seed(&[2u8; 32]);

        let signature = signer1.sign(b"message");
        assert!(signer2.public_key().verify(b"message", &signature).is_err());
    }

    #[test]
    fn test_ssh_blob_roundtrip() {
        let signer = Signer::from_seed(&[42u8; 32]);
        let blob = signer.public_key().to_ssh_blob();

        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(PublicKey::from_ssh_blob(&blob).unwrap(), *signer.public_key());
    }

    #[test]
    fn test_ssh_blob_rejects_other_algorithms() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&7u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-rsa");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[0u8; 32]);

        assert_eq!(
            PublicKey::from_ssh_blob(&blob),
            Err(CryptoError::InvalidPublicKey)
        );
        assert!(PublicKey::from_ssh_blob(&blob[..10]).is_err());
    }

    #[test]
    fn test_fingerprint_format_and_parse() {
        let fingerprint = Signer::from_seed(&[5u8; 32]).fingerprint();
        let text = fingerprint.to_string();

        assert!(text.starts_with("SHA256:"));
        assert!(!text.ends_with('='));
        assert_eq!(text.parse::<Fingerprint>().unwrap(), fingerprint);
        assert!("MD5:abcd".parse::<Fingerprint>().is_err());
        assert!("SHA256:AAAA".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_fingerprint_serde_as_string() {
        let fingerprint = Signer::from_seed(&[6u8; 32]).fingerprint();
        let json = serde_json::to_string(&fingerprint).unwrap();

        assert_eq!(json, format!("\"{}\"", fingerprint));
        let parsed: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fingerprint);
    }
}
