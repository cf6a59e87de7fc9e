//! On-disk Identity Management
//!
//! An identity directory holds three PEM files:
//! - `id.key`: the node private key
//! - `id.crt`: the node certificate
//! - `ca.crt`: the CA certificate that issued `id.crt`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::certificate::{generate_identity, Certificate, Identity};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::PrivateKey;

/// Locations of the identity triple
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPaths {
    pub key: PathBuf,
    pub certificate: PathBuf,
    pub ca_certificate: PathBuf,
}

impl IdentityPaths {
    /// Standard file names inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            key: dir.join("id.key"),
            certificate: dir.join("id.crt"),
            ca_certificate: dir.join("ca.crt"),
        }
    }

    /// Load the identity, or generate and persist a new one if anything is
    /// missing, unreadable, mismatched or expired
    pub fn load_or_generate(&self, name: &str) -> CryptoResult<Identity> {
        match self.load() {
            Ok(identity) => {
                info!("Loaded identity {}", identity.id());
                Ok(identity)
            }
            Err(e) => {
                warn!("Cannot load identity ({}), generating a new one", e);
                let ca = generate_identity(&format!("{} CA", name), None)?;
                let identity = generate_identity(name, Some(&ca))?;
                self.save(&identity, &ca.certificate)?;
                info!("Generated identity {}", identity.id());
                Ok(identity)
            }
        }
    }

    /// Load and validate the triple
    pub fn load(&self) -> CryptoResult<Identity> {
        let key = PrivateKey::import(&std::fs::read(&self.key)?)?;
        let certificate = Certificate::from_bytes(&std::fs::read(&self.certificate)?)?;
        let ca = Certificate::from_bytes(&std::fs::read(&self.ca_certificate)?)?;

        if key.public_key() != certificate.public_key() {
            return Err(CryptoError::InvalidCertificate(
                "certificate does not match private key".into(),
            ));
        }
        if !ca.is_self_signed() || !certificate.is_issued_by(&ca) {
            return Err(CryptoError::InvalidCertificate("broken certificate chain".into()));
        }
        let now = Utc::now();
        if certificate.is_expired(now) || ca.is_expired(now) {
            return Err(CryptoError::InvalidCertificate("certificate expired".into()));
        }

        Ok(Identity {
            key: Arc::new(key),
            certificate: Arc::new(certificate),
        })
    }

    /// Persist the triple; each file is replaced atomically
    pub fn save(&self, identity: &Identity, ca: &Certificate) -> CryptoResult<()> {
        write_atomic(&self.ca_certificate, ca.to_pem()?.as_bytes())?;
        write_atomic(&self.certificate, identity.certificate.to_pem()?.as_bytes())?;
        write_atomic(&self.key, identity.key.serialize().as_bytes())?;
        Ok(())
    }
}

/// Write `data` to a temporary file next to `path`, then rename it into place
pub fn write_atomic(path: &Path, data: &[u8]) -> CryptoResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CryptoError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_generate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IdentityPaths::in_dir(dir.path());

        let first = paths.load_or_generate("node").unwrap();
        assert!(paths.key.exists());
        assert!(paths.certificate.exists());
        assert!(paths.ca_certificate.exists());

        let second = paths.load_or_generate("node").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.key.public_key(), second.key.public_key());
    }

    #[test]
    fn test_regenerates_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IdentityPaths::in_dir(dir.path());
        let first = paths.load_or_generate("node").unwrap();

        std::fs::write(&paths.certificate, b"garbage").unwrap();
        assert!(paths.load().is_err());

        let second = paths.load_or_generate("node").unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(paths.load().unwrap().id(), second.id());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IdentityPaths::in_dir(dir.path());
        paths.load_or_generate("node").unwrap();

        let other = PrivateKey::generate().unwrap();
        std::fs::write(&paths.key, other.serialize().as_bytes()).unwrap();
        assert!(matches!(paths.load(), Err(CryptoError::InvalidCertificate(_))));
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IdentityPaths::in_dir(dir.path().join("nested"));
        assert!(matches!(paths.load(), Err(CryptoError::Io(_))));

        // Generation creates the directory
        paths.load_or_generate("node").unwrap();
        assert!(paths.key.exists());
    }
}
