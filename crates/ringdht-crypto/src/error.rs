//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid hash length or encoding
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// Key generation failed (RNG or signing failure)
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication failed, truncated or foreign ciphertext)
    #[error("Decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Invalid private key material
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Certificate could not be parsed or does not validate
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Filesystem error while loading or saving key material
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
