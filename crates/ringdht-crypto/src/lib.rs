//! ringdht Cryptographic Primitives
//!
//! This crate provides the identity layer of the ringdht network:
//! - InfoHash / NodeId (160-bit BLAKE3 digests and their XOR metric)
//! - Digital signatures (Ed25519)
//! - Public-key encryption (X25519 + HKDF-SHA256 + ChaCha20-Poly1305)
//! - Certificates and on-disk identities

pub mod certificate;
pub mod error;
pub mod identity;
pub mod infohash;
pub mod keys;
mod pem;
pub mod symmetric;

pub use certificate::{generate_identity, Certificate, Identity};
pub use error::{CryptoError, CryptoResult};
pub use identity::IdentityPaths;
pub use infohash::{InfoHash, NodeId};
pub use keys::{PrivateKey, PublicKey};

/// Protocol constants
pub mod constants {
    /// Length of an InfoHash / NodeId in bytes
    pub const HASH_LEN: usize = 20;

    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Packed public key size (Ed25519 verifying key + X25519 key)
    pub const PUBLIC_KEY_SIZE: usize = ED25519_PUBKEY_SIZE + X25519_KEY_SIZE;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Overhead added by `PublicKey::encrypt`
    pub const ENCRYPTION_OVERHEAD: usize = X25519_KEY_SIZE + NONCE_SIZE + AUTH_TAG_SIZE;

    /// Validity period of generated certificates
    pub const CERTIFICATE_VALIDITY_DAYS: i64 = 700;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_identity_flow() {
        let ca = generate_identity("ringdht ca", None).expect("ca");
        let alice = generate_identity("alice", Some(&ca)).expect("alice");
        let bob = generate_identity("bob", Some(&ca)).expect("bob");

        assert!(alice.certificate.is_issued_by(&ca.certificate));
        assert_eq!(alice.id(), alice.key.public_key().get_id());

        // Alice signs then encrypts for Bob
        let message = b"meet at the usual node";
        let signature = alice.key.sign(message);
        let cipher = bob
            .certificate
            .public_key()
            .encrypt(message)
            .expect("encrypt");

        let plain = bob.key.decrypt(&cipher).expect("decrypt");
        assert_eq!(plain, message);
        assert!(alice
            .certificate
            .public_key()
            .check_signature(&plain, &signature));
    }
}
