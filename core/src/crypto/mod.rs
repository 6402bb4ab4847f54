//! Cryptographic primitives
//!
//! Domain-separated SHA-256 digests used to fingerprint published trees, and
//! the ed25519 signing provider that signs export payloads and federation
//! batches.

mod signing;

pub use signing::{verify_with, SignatureInfo, SigningProvider, SIGNATURE_ALGORITHM};

use sha2::{Digest, Sha256};

/// Domain-separated SHA-256: `domain || len(domain) || data`
pub fn secure_hash(domain: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([domain.len() as u8]);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_hash_separates_domains() {
        let hash = secure_hash("KEYFED_FILE", b"export");
        assert_eq!(hash, secure_hash("KEYFED_FILE", b"export"));
        assert_ne!(hash, secure_hash("KEYFED_TREE", b"export"));
        assert_ne!(hash, secure_hash("KEYFED_FILE", b"export2"));
        // the length byte keeps domain and data from sliding into each other
        assert_ne!(secure_hash("AB", b"C"), secure_hash("A", b"BC"));
    }
}
