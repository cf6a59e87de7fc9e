//! Key Pairs
//!
//! A ringdht key pair holds an Ed25519 signing key and an X25519 key
//! agreement secret. The public half travels as 64 packed bytes and its
//! BLAKE3 digest is the owner's NodeId.
//!
//! Encryption to a public key is an ephemeral X25519 exchange, HKDF-SHA256
//! key derivation, then ChaCha20-Poly1305:
//! `[ephemeral public key 32][nonce 12][ciphertext + tag]`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::constants::{
    ED25519_PUBKEY_SIZE, ENCRYPTION_OVERHEAD, NONCE_SIZE, PUBLIC_KEY_SIZE, SYMMETRIC_KEY_SIZE,
    X25519_KEY_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::infohash::InfoHash;
use crate::pem;
use crate::symmetric::{self, Nonce, SymmetricKey};

const PRIVATE_KEY_LABEL: &str = "RINGDHT PRIVATE KEY";
const PRIVATE_KEY_SIZE: usize = 32 + X25519_KEY_SIZE;
const KDF_INFO: &[u8] = b"ringdht:value-encryption:v1";

/// Secret half of a key pair. Both inner secrets zeroize on drop.
#[derive(Clone)]
pub struct PrivateKey {
    signing: SigningKey,
    encryption: StaticSecret,
}

/// Public half of a key pair
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    signing: [u8; ED25519_PUBKEY_SIZE],
    encryption: [u8; X25519_KEY_SIZE],
}

impl PrivateKey {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = Zeroizing::new([0u8; PRIVATE_KEY_SIZE]);
        OsRng
            .try_fill_bytes(seed.as_mut_slice())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_bytes(seed.as_slice())
    }

    /// Rebuild from the 64 raw secret bytes produced by [`PrivateKey::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut signing_seed = Zeroizing::new([0u8; 32]);
        signing_seed.copy_from_slice(&bytes[..32]);
        let mut encryption_seed = [0u8; X25519_KEY_SIZE];
        encryption_seed.copy_from_slice(&bytes[32..]);

        Ok(Self {
            signing: SigningKey::from_bytes(&signing_seed),
            encryption: StaticSecret::from(encryption_seed),
        })
    }

    /// Export raw secret bytes
    pub fn to_bytes(&self) -> Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        let mut out = Zeroizing::new([0u8; PRIVATE_KEY_SIZE]);
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(self.encryption.as_bytes());
        out
    }

    /// PEM-armoured export
    pub fn serialize(&self) -> Zeroizing<String> {
        Zeroizing::new(pem::encode(PRIVATE_KEY_LABEL, self.to_bytes().as_slice()))
    }

    /// Import from PEM or raw bytes
    pub fn import(data: &[u8]) -> CryptoResult<Self> {
        if pem::is_pem(data) {
            let raw = Zeroizing::new(pem::decode(PRIVATE_KEY_LABEL, data)?);
            Self::from_bytes(&raw)
        } else {
            Self::from_bytes(data)
        }
    }

    /// Public half of this key pair
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            encryption: X25519Public::from(&self.encryption).to_bytes(),
        }
    }

    /// Deterministic Ed25519 signature over `data`
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }

    /// Decrypt the output of [`PublicKey::encrypt`]
    pub fn decrypt(&self, cipher: &[u8]) -> CryptoResult<Vec<u8>> {
        if cipher.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }
        let (eph, rest) = cipher.split_at(X25519_KEY_SIZE);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);

        let mut eph_bytes = [0u8; X25519_KEY_SIZE];
        eph_bytes.copy_from_slice(eph);
        let shared = self.encryption.diffie_hellman(&X25519Public::from(eph_bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::DecryptionFailed);
        }

        let own = X25519Public::from(&self.encryption).to_bytes();
        let key = derive_key(shared.as_bytes(), &eph_bytes, &own)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        symmetric::open(&key, &Nonce::try_from_slice(nonce)?, sealed, eph)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({:?})", self.public_key().get_id())
    }
}

impl PublicKey {
    /// Parse 64 packed bytes, rejecting an invalid Ed25519 point
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut signing = [0u8; ED25519_PUBKEY_SIZE];
        signing.copy_from_slice(&bytes[..ED25519_PUBKEY_SIZE]);
        let mut encryption = [0u8; X25519_KEY_SIZE];
        encryption.copy_from_slice(&bytes[ED25519_PUBKEY_SIZE..]);

        VerifyingKey::from_bytes(&signing).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { signing, encryption })
    }

    /// Packed representation
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..ED25519_PUBKEY_SIZE].copy_from_slice(&self.signing);
        out[ED25519_PUBKEY_SIZE..].copy_from_slice(&self.encryption);
        out
    }

    /// NodeId of the key owner
    pub fn get_id(&self) -> InfoHash {
        InfoHash::get(&self.to_bytes())
    }

    /// Verify `signature` over `data`; never fails, only answers
    pub fn check_signature(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }

    /// Encrypt `data` so that only the holder of the private key can read it
    pub fn encrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let recipient = X25519Public::from(self.encryption);
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();

        let shared = ephemeral.diffie_hellman(&recipient);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let key = derive_key(shared.as_bytes(), &ephemeral_public, &self.encryption)?;
        let nonce = Nonce::generate();
        let sealed = symmetric::seal(&key, &nonce, data, &ephemeral_public)?;

        let mut out = Vec::with_capacity(ENCRYPTION_OVERHEAD + data.len());
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:?})", self.get_id())
    }
}

fn derive_key(
    shared: &[u8; 32],
    ephemeral: &[u8; X25519_KEY_SIZE],
    recipient: &[u8; X25519_KEY_SIZE],
) -> CryptoResult<SymmetricKey> {
    let mut salt = [0u8; 2 * X25519_KEY_SIZE];
    salt[..X25519_KEY_SIZE].copy_from_slice(ephemeral);
    salt[X25519_KEY_SIZE..].copy_from_slice(recipient);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; SYMMETRIC_KEY_SIZE]);
    hkdf.expand(KDF_INFO, okm.as_mut_slice())
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SymmetricKey::from_bytes(*okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate().unwrap();
        let public = key.public_key();

        let signature = key.sign(b"hello ring");
        assert!(public.check_signature(b"hello ring", &signature));
        assert!(!public.check_signature(b"hello rinG", &signature));

        // Signatures are deterministic
        assert_eq!(signature, key.sign(b"hello ring"));
    }

    #[test]
    fn test_check_signature_never_panics() {
        let public = PrivateKey::generate().unwrap().public_key();
        assert!(!public.check_signature(b"data", &[]));
        assert!(!public.check_signature(b"data", &[0u8; 3]));
        assert!(!public.check_signature(b"data", &[0xffu8; 64]));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let alice = PrivateKey::generate().unwrap();
        let bob = PrivateKey::generate().unwrap();
        let signature = alice.sign(b"payload");
        assert!(!bob.public_key().check_signature(b"payload", &signature));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = PrivateKey::generate().unwrap();
        let data = b"for your eyes only".to_vec();

        let cipher = key.public_key().encrypt(&data).unwrap();
        assert_eq!(cipher.len(), data.len() + ENCRYPTION_OVERHEAD);
        assert_eq!(key.decrypt(&cipher).unwrap(), data);
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let key = PrivateKey::generate().unwrap();
        let other = PrivateKey::generate().unwrap();
        let cipher = key.public_key().encrypt(b"secret").unwrap();

        assert!(matches!(other.decrypt(&cipher), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_decrypt_corrupted() {
        let key = PrivateKey::generate().unwrap();
        let mut cipher = key.public_key().encrypt(b"secret").unwrap();

        let last = cipher.len() - 1;
        cipher[last] ^= 0x01;
        assert!(key.decrypt(&cipher).is_err());
        assert!(key.decrypt(&cipher[..10]).is_err());
        assert!(key.decrypt(&[]).is_err());
    }

    #[test]
    fn test_low_order_key_rejected() {
        let key = PrivateKey::generate().unwrap();
        let mut packed = key.public_key().to_bytes();
        packed[ED25519_PUBKEY_SIZE..].fill(0);
        let public = PublicKey::from_bytes(&packed).unwrap();

        assert!(matches!(public.encrypt(b"x"), Err(CryptoError::InvalidPublicKey)));
    }

    #[test]
    fn test_private_key_pem_roundtrip() {
        let key = PrivateKey::generate().unwrap();
        let pem = key.serialize();
        let restored = PrivateKey::import(pem.as_bytes()).unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        let raw = PrivateKey::import(key.to_bytes().as_slice()).unwrap();
        assert_eq!(key.public_key(), raw.public_key());

        assert!(PrivateKey::import(b"garbage").is_err());
    }

    #[test]
    fn test_public_key_bytes() {
        let public = PrivateKey::generate().unwrap().public_key();
        let restored = PublicKey::from_bytes(&public.to_bytes()).unwrap();
        assert_eq!(public, restored);
        assert_eq!(public.get_id(), restored.get_id());
        assert!(PublicKey::from_bytes(&[1u8; 10]).is_err());
    }
}
