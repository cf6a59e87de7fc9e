//! Certificates and Identities
//!
//! A certificate binds a subject name to a [`PublicKey`] and is signed by
//! its issuer (itself for a self-signed CA). The certified id is the hash of
//! the public key, so a certificate published under `id` can be checked
//! against `id` without trusting whoever served it.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::CERTIFICATE_VALIDITY_DAYS;
use crate::error::{CryptoError, CryptoResult};
use crate::infohash::{InfoHash, NodeId};
use crate::keys::{PrivateKey, PublicKey};
use crate::pem;

const CERTIFICATE_LABEL: &str = "RINGDHT CERTIFICATE";
const CERTIFICATE_VERSION: u8 = 1;

/// The signed part of a certificate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct TbsCertificate {
    version: u8,
    serial: u64,
    subject: String,
    issuer: String,
    issuer_id: InfoHash,
    public_key: PublicKey,
    not_before: i64,
    not_after: i64,
    is_ca: bool,
}

#[derive(Serialize, Deserialize)]
struct SignedCertificate {
    tbs: TbsCertificate,
    signature: Vec<u8>,
}

/// A parsed, immutable certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    tbs: TbsCertificate,
    signature: Vec<u8>,
}

/// A private key together with its certificate
#[derive(Clone, Debug)]
pub struct Identity {
    /// Secret half, shared with whoever signs on our behalf
    pub key: Arc<PrivateKey>,
    /// Certificate for `key`
    pub certificate: Arc<Certificate>,
}

impl Certificate {
    /// Parse from PEM or raw (bincode) bytes
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let raw = if pem::is_pem(data) {
            pem::decode(CERTIFICATE_LABEL, data)
                .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?
        } else {
            data.to_vec()
        };

        let signed: SignedCertificate = bincode::deserialize(&raw)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        if signed.tbs.version != CERTIFICATE_VERSION {
            return Err(CryptoError::InvalidCertificate(format!(
                "unsupported version {}",
                signed.tbs.version
            )));
        }
        if signed.tbs.not_after < signed.tbs.not_before {
            return Err(CryptoError::InvalidCertificate("validity period is inverted".into()));
        }

        Ok(Self {
            tbs: signed.tbs,
            signature: signed.signature,
        })
    }

    /// Raw (bincode) encoding, used as the DHT payload
    pub fn pack(&self) -> CryptoResult<Vec<u8>> {
        let signed = SignedCertificate {
            tbs: self.tbs.clone(),
            signature: self.signature.clone(),
        };
        bincode::serialize(&signed).map_err(|e| CryptoError::SerializationError(e.to_string()))
    }

    /// PEM-armoured encoding, used on disk
    pub fn to_pem(&self) -> CryptoResult<String> {
        Ok(pem::encode(CERTIFICATE_LABEL, &self.pack()?))
    }

    /// Certified public key
    pub fn public_key(&self) -> PublicKey {
        self.tbs.public_key
    }

    /// Certified node id (hash of the public key)
    pub fn get_id(&self) -> NodeId {
        self.tbs.public_key.get_id()
    }

    /// Subject common name
    pub fn name(&self) -> &str {
        &self.tbs.subject
    }

    /// Issuer common name
    pub fn issuer_name(&self) -> &str {
        &self.tbs.issuer
    }

    /// Id of the issuing key
    pub fn issuer_id(&self) -> NodeId {
        self.tbs.issuer_id
    }

    pub fn serial(&self) -> u64 {
        self.tbs.serial
    }

    pub fn is_ca(&self) -> bool {
        self.tbs.is_ca
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        timestamp(self.tbs.not_before)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        timestamp(self.tbs.not_after)
    }

    /// Outside of the validity period at `now`?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let t = now.timestamp();
        t < self.tbs.not_before || t > self.tbs.not_after
    }

    pub fn is_self_signed(&self) -> bool {
        self.tbs.issuer_id == self.get_id() && self.check_signature(&self.tbs.public_key)
    }

    /// Was this certificate signed by `issuer`'s key?
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        self.tbs.issuer_id == issuer.get_id() && self.check_signature(&issuer.tbs.public_key)
    }

    fn check_signature(&self, key: &PublicKey) -> bool {
        match bincode::serialize(&self.tbs) {
            Ok(tbs) => key.check_signature(&tbs, &self.signature),
            Err(e) => {
                debug!("Cannot encode certificate for verification: {}", e);
                false
            }
        }
    }

    fn sign(tbs: TbsCertificate, issuer_key: &PrivateKey) -> CryptoResult<Self> {
        let encoded =
            bincode::serialize(&tbs).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let signature = issuer_key.sign(&encoded);
        Ok(Self { tbs, signature })
    }
}

impl Identity {
    /// Id of this identity
    pub fn id(&self) -> NodeId {
        self.certificate.get_id()
    }
}

/// Generate a key pair and certificate valid for 700 days
///
/// Without a parent the certificate is a self-signed CA; otherwise it is
/// issued by the parent's key.
pub fn generate_identity(name: &str, parent: Option<&Identity>) -> CryptoResult<Identity> {
    let key = PrivateKey::generate()?;
    let public_key = key.public_key();
    let now = Utc::now();

    let (issuer, issuer_id, issuer_key) = match parent {
        Some(p) => (p.certificate.name().to_string(), p.id(), p.key.as_ref()),
        None => (name.to_string(), public_key.get_id(), &key),
    };

    let tbs = TbsCertificate {
        version: CERTIFICATE_VERSION,
        serial: rand::random(),
        subject: name.to_string(),
        issuer,
        issuer_id,
        public_key,
        not_before: now.timestamp(),
        not_after: (now + Duration::days(CERTIFICATE_VALIDITY_DAYS)).timestamp(),
        is_ca: parent.is_none(),
    };

    let certificate = Certificate::sign(tbs, issuer_key)?;
    debug!("Generated identity {} ({:?})", name, certificate.get_id());

    Ok(Identity {
        key: Arc::new(key),
        certificate: Arc::new(certificate),
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_ca() {
        let ca = generate_identity("ca", None).unwrap();
        assert!(ca.certificate.is_ca());
        assert!(ca.certificate.is_self_signed());
        assert_eq!(ca.certificate.issuer_id(), ca.id());

        let validity = ca.certificate.not_after() - ca.certificate.not_before();
        assert_eq!(validity.num_days(), CERTIFICATE_VALIDITY_DAYS);
    }

    #[test]
    fn test_issued_certificate() {
        let ca = generate_identity("ca", None).unwrap();
        let node = generate_identity("node", Some(&ca)).unwrap();
        let stranger = generate_identity("stranger", None).unwrap();

        assert!(!node.certificate.is_ca());
        assert_eq!(node.certificate.issuer_name(), "ca");
        assert!(node.certificate.is_issued_by(&ca.certificate));
        assert!(!node.certificate.is_issued_by(&stranger.certificate));
        assert!(!node.certificate.is_self_signed());
    }

    #[test]
    fn test_pack_roundtrip() {
        let id = generate_identity("node", None).unwrap();

        let raw = Certificate::from_bytes(&id.certificate.pack().unwrap()).unwrap();
        assert_eq!(raw, *id.certificate);

        let pem = id.certificate.to_pem().unwrap();
        let parsed = Certificate::from_bytes(pem.as_bytes()).unwrap();
        assert_eq!(parsed.get_id(), id.id());
        assert!(parsed.is_self_signed());
    }

    #[test]
    fn test_malformed_certificate() {
        assert!(matches!(
            Certificate::from_bytes(b"not a certificate"),
            Err(CryptoError::InvalidCertificate(_))
        ));
        assert!(Certificate::from_bytes(b"-----BEGIN RINGDHT CERTIFICATE-----\n!!\n").is_err());

        let id = generate_identity("node", None).unwrap();
        let packed = id.certificate.pack().unwrap();
        assert!(Certificate::from_bytes(&packed[..packed.len() / 2]).is_err());
    }

    #[test]
    fn test_tampered_certificate() {
        let id = generate_identity("node", None).unwrap();
        let mut cert = (*id.certificate).clone();
        cert.tbs.subject = "impostor".into();
        assert!(!cert.is_self_signed());
    }

    #[test]
    fn test_expiry() {
        let id = generate_identity("node", None).unwrap();
        let cert = &id.certificate;
        assert!(!cert.is_expired(Utc::now()));
        assert!(cert.is_expired(Utc::now() + Duration::days(CERTIFICATE_VALIDITY_DAYS + 1)));
        assert!(cert.is_expired(Utc::now() - Duration::days(1)));
    }
}
