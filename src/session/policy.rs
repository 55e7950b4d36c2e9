//! Peer trust policy
//!
//! The server asks a [`PeerAuthorizer`] whether a client key may open a
//! session; the client asks a [`HostVerifier`] whether the server's host key
//! is the one it meant to reach. Both only see fingerprints.

use std::collections::HashSet;

use crate::crypto::Fingerprint;

/// Server-side decision on a client's public key
pub trait PeerAuthorizer: Send + Sync {
    /// Return true to let the client in
    fn authorize(&self, fingerprint: &Fingerprint) -> bool;
}

/// Client-side decision on a server's host key
pub trait HostVerifier: Send + Sync {
    /// Return true if `fingerprint` is acceptable for `host`
    fn verify(&self, host: &str, fingerprint: &Fingerprint) -> bool;
}

/// Trusts every key
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl PeerAuthorizer for AllowAll {
    fn authorize(&self, _fingerprint: &Fingerprint) -> bool {
        true
    }
}

impl HostVerifier for AllowAll {
    fn verify(&self, _host: &str, _fingerprint: &Fingerprint) -> bool {
        true
    }
}

/// Trusts only the listed keys, whatever host they come from
#[derive(Clone, Debug, Default)]
pub struct FingerprintAllowList {
    allowed: HashSet<Fingerprint>,
}

impl FingerprintAllowList {
    /// Build from a set of fingerprints
    pub fn new(allowed: impl IntoIterator<Item = Fingerprint>) -> Self {
        FingerprintAllowList {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Add one fingerprint
    pub fn insert(&mut self, fingerprint: Fingerprint) {
        self.allowed.insert(fingerprint);
    }

    /// Whether `fingerprint` is listed
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.allowed.contains(fingerprint)
    }
}

impl PeerAuthorizer for FingerprintAllowList {
    fn authorize(&self, fingerprint: &Fingerprint) -> bool {
        self.contains(fingerprint)
    }
}

impl HostVerifier for FingerprintAllowList {
    fn verify(&self, _host: &str, fingerprint: &Fingerprint) -> bool {
        self.contains(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    #[test]
    fn test_allow_all() {
        let fp = Signer::from_seed(&[1u8; 32]).fingerprint();
        assert!(PeerAuthorizer::authorize(&AllowAll, &fp));
        assert!(HostVerifier::verify(&AllowAll, "example:22", &fp));
    }

    #[test]
    fn test_allow_list() {
        let known = Signer::from_seed(&[1u8; 32]).fingerprint();
        let unknown = Signer::from_seed(&[2u8; 32]).fingerprint();
        let list = FingerprintAllowList::new([known]);

        assert!(list.authorize(&known));
        assert!(!list.authorize(&unknown));
        assert!(list.verify("127.0.0.1:8080", &known));
        assert!(!list.verify("127.0.0.1:8080", &unknown));
    }
}
