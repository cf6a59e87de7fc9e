//! DHT Values
//!
//! A value is an opaque payload stored under an InfoHash, optionally signed
//! by its owner and optionally encrypted for a single recipient.
//!
//! Wire layout (big-endian integers):
//!
//! ```text
//! [id: u64][flags: u8]
//! encrypted -> [cypher ...]
//! otherwise -> [owner: 64 bytes, if signed]
//!              [recipient: HASH_LEN bytes, if flagged]
//!              [type: u16][seq: u16][len: u32][data]
//!              [sig len: u16][signature, if signed]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringdht_crypto::constants::{HASH_LEN, PUBLIC_KEY_SIZE};
use ringdht_crypto::{InfoHash, PrivateKey, PublicKey};

use crate::error::{DhtError, DhtResult};
use crate::MAX_VALUE_SIZE;

/// Value identifier, unique per (key, owner)
pub type ValueId = u64;

/// "Not assigned yet"
pub const INVALID_ID: ValueId = 0;

/// Numeric value type identifier
pub type ValueTypeId = u16;

/// Shared predicate used to select values
pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Decides whether a new value may be stored: `(key, value, from, addr)`
pub type StorePolicy = Arc<dyn Fn(&InfoHash, &Value, &InfoHash, &SocketAddr) -> bool + Send + Sync>;

/// Decides whether `new` may replace `old`: `(key, old, new, from, addr)`
pub type EditPolicy =
    Arc<dyn Fn(&InfoHash, &Value, &Value, &InfoHash, &SocketAddr) -> bool + Send + Sync>;

/// Crypto attributes of a value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptoFlags {
    pub signed: bool,
    pub encrypted: bool,
    pub has_recipient: bool,
}

impl CryptoFlags {
    const SIGNED: u8 = 0x01;
    const ENCRYPTED: u8 = 0x02;
    const RECIPIENT: u8 = 0x04;

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.signed {
            b |= Self::SIGNED;
        }
        if self.encrypted {
            b |= Self::ENCRYPTED;
        }
        if self.has_recipient {
            b |= Self::RECIPIENT;
        }
        b
    }

    pub fn from_byte(b: u8) -> DhtResult<Self> {
        if b & !(Self::SIGNED | Self::ENCRYPTED | Self::RECIPIENT) != 0 {
            return Err(DhtError::MalformedValue(format!("unknown flags {:#04x}", b)));
        }
        Ok(Self {
            signed: b & Self::SIGNED != 0,
            encrypted: b & Self::ENCRYPTED != 0,
            has_recipient: b & Self::RECIPIENT != 0,
        })
    }
}

/// A value stored in the DHT
#[derive(Clone, PartialEq, Eq)]
pub struct Value {
    /// Identifier, unique per key and owner
    pub id: ValueId,
    /// Type, selects expiration and policies
    pub value_type: ValueTypeId,
    /// Edit sequence number
    pub seq: u16,
    /// Payload
    pub data: Vec<u8>,
    flags: CryptoFlags,
    owner: Option<PublicKey>,
    recipient: Option<InfoHash>,
    signature: Vec<u8>,
    cypher: Vec<u8>,
}

impl Value {
    /// Unsigned, unencrypted value with no id yet
    pub fn new(value_type: ValueTypeId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: INVALID_ID,
            value_type,
            seq: 0,
            data: data.into(),
            flags: CryptoFlags::default(),
            owner: None,
            recipient: None,
            signature: Vec::new(),
            cypher: Vec::new(),
        }
    }

    /// Builder-style id assignment
    pub fn with_id(mut self, id: ValueId) -> Self {
        self.id = id;
        self
    }

    pub fn flags(&self) -> CryptoFlags {
        self.flags
    }

    pub fn is_signed(&self) -> bool {
        self.flags.signed
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.encrypted
    }

    /// Public key of the signer
    pub fn owner(&self) -> Option<&PublicKey> {
        self.owner.as_ref()
    }

    /// NodeId of the signer
    pub fn owner_id(&self) -> Option<InfoHash> {
        self.owner.map(|o| o.get_id())
    }

    pub fn recipient(&self) -> Option<InfoHash> {
        self.recipient
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn cypher(&self) -> &[u8] {
        &self.cypher
    }

    /// Bytes covered by the signature
    pub fn get_to_sign(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + HASH_LEN + 8 + self.data.len());
        if let (true, Some(owner)) = (self.flags.signed, &self.owner) {
            out.extend_from_slice(&owner.to_bytes());
        }
        if let (true, Some(recipient)) = (self.flags.has_recipient, &self.recipient) {
            out.extend_from_slice(recipient.as_bytes());
        }
        out.extend_from_slice(&self.value_type.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Bytes sealed by encryption: the signed body plus its signature
    pub fn get_to_encrypt(&self) -> Vec<u8> {
        let mut out = self.get_to_sign();
        if self.flags.signed {
            out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.signature);
        }
        out
    }

    /// Wire encoding
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.data.len() + self.cypher.len() + 128);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.push(self.flags.to_byte());
        if self.flags.encrypted {
            out.extend_from_slice(&self.cypher);
        } else {
            out.extend_from_slice(&self.get_to_encrypt());
        }
        out
    }

    /// Parse the wire encoding
    pub fn unpack(buf: &[u8]) -> DhtResult<Self> {
        let mut r = Reader::new(buf);
        let id = r.u64()?;
        let flags = CryptoFlags::from_byte(r.u8()?)?;

        if flags.encrypted {
            let cypher = r.rest();
            if cypher.is_empty() {
                return Err(DhtError::MalformedValue("empty cypher".into()));
            }
            return Ok(Self {
                id,
                flags,
                cypher: cypher.to_vec(),
                ..Self::new(ValueType::USER_DATA, Vec::new())
            });
        }

        let mut value = parse_body(flags, r.rest())?;
        value.id = id;
        Ok(value)
    }

    /// Sign with `key`, making `key` the owner
    pub fn sign(&mut self, key: &PrivateKey) {
        debug_assert!(!self.flags.encrypted);
        self.owner = Some(key.public_key());
        self.flags.signed = true;
        self.signature = key.sign(&self.get_to_sign());
    }

    /// Verify the owner's signature; false for unsigned or encrypted values
    pub fn check_signature(&self) -> bool {
        if !self.flags.signed || self.flags.encrypted {
            return false;
        }
        match &self.owner {
            Some(owner) => owner.check_signature(&self.get_to_sign(), &self.signature),
            None => false,
        }
    }

    /// Sign with `from`, then seal for `to`
    pub fn encrypt(&self, from: &PrivateKey, to: &PublicKey) -> DhtResult<Self> {
        if self.flags.encrypted {
            return Err(DhtError::MalformedValue("value is already encrypted".into()));
        }
        let mut inner = self.clone();
        inner.recipient = Some(to.get_id());
        inner.flags.has_recipient = true;
        inner.sign(from);

        let cypher = to.encrypt(&inner.get_to_encrypt())?;
        Ok(Self {
            id: self.id,
            flags: CryptoFlags {
                signed: true,
                encrypted: true,
                has_recipient: true,
            },
            cypher,
            ..Self::new(ValueType::USER_DATA, Vec::new())
        })
    }

    /// Open a value sealed for `key`
    pub fn decrypt(&self, key: &PrivateKey) -> DhtResult<Self> {
        if !self.flags.encrypted {
            return Err(DhtError::MalformedValue("value is not encrypted".into()));
        }
        let plain = key.decrypt(&self.cypher)?;
        let flags = CryptoFlags {
            encrypted: false,
            ..self.flags
        };
        let mut value = parse_body(flags, &plain)?;
        value.id = self.id;
        Ok(value)
    }

    /// Lifetime of this value once stored
    pub fn expiration(&self) -> Duration {
        if self.flags.encrypted {
            expiration_for(ValueType::USER_DATA)
        } else {
            expiration_for(self.value_type)
        }
    }

    /// Has a value stored at `inserted_at` outlived its type at `now`?
    pub fn is_expired(&self, now: Instant, inserted_at: Instant) -> bool {
        now.saturating_duration_since(inserted_at) > self.expiration()
    }

    /// Filter accepting values of type `t`
    pub fn type_filter(t: ValueTypeId) -> Filter {
        Arc::new(move |v: &Value| !v.is_encrypted() && v.value_type == t)
    }

    /// Filter accepting the value with id `id`
    pub fn id_filter(id: ValueId) -> Filter {
        Arc::new(move |v: &Value| v.id == id)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value[id:{:016x}", self.id)?;
        if self.flags.encrypted {
            return write!(f, " encrypted {}B]", self.cypher.len());
        }
        write!(f, " type:{} seq:{}", self.value_type, self.seq)?;
        if let Some(owner) = self.owner_id() {
            write!(f, " owner:{:?}", owner)?;
        }
        if let Some(recipient) = self.recipient {
            write!(f, " to:{:?}", recipient)?;
        }
        write!(f, " data:{}B]", self.data.len())
    }
}

fn parse_body(flags: CryptoFlags, buf: &[u8]) -> DhtResult<Value> {
    let mut r = Reader::new(buf);

    let owner = if flags.signed {
        let raw = r.take(PUBLIC_KEY_SIZE)?;
        Some(PublicKey::from_bytes(raw).map_err(|e| DhtError::MalformedValue(e.to_string()))?)
    } else {
        None
    };
    let recipient = if flags.has_recipient {
        let raw = r.take(HASH_LEN)?;
        Some(InfoHash::try_from_slice(raw).map_err(|e| DhtError::MalformedValue(e.to_string()))?)
    } else {
        None
    };

    let value_type = r.u16()?;
    let seq = r.u16()?;
    let len = r.u32()? as usize;
    let data = r.take(len)?.to_vec();
    let signature = if flags.signed {
        let len = r.u16()? as usize;
        r.take(len)?.to_vec()
    } else {
        Vec::new()
    };
    r.finish()?;

    Ok(Value {
        id: INVALID_ID,
        value_type,
        seq,
        data,
        flags,
        owner,
        recipient,
        signature,
        cypher: Vec::new(),
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> DhtResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                DhtError::MalformedValue(format!(
                    "truncated: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> DhtResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DhtResult<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(b))
    }

    fn u32(&mut self) -> DhtResult<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> DhtResult<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn finish(&self) -> DhtResult<()> {
        if self.pos != self.buf.len() {
            return Err(DhtError::MalformedValue(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// A registered value type
#[derive(Clone)]
pub struct ValueType {
    pub id: ValueTypeId,
    pub name: String,
    pub expiration: Duration,
    pub store_policy: StorePolicy,
    pub edit_policy: EditPolicy,
}

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

const BUILTIN_TYPES: [(ValueTypeId, &str, Duration); 4] = [
    (ValueType::USER_DATA, "User Data", Duration::from_secs(7 * DAY)),
    (ValueType::CERTIFICATE, "Certificate", Duration::from_secs(62 * MINUTE)),
    (ValueType::PEER, "Peer", Duration::from_secs(32 * MINUTE)),
    (ValueType::SERVICE_ANNOUNCEMENT, "Service Announcement", Duration::from_secs(7 * DAY)),
];

/// Expiration of a builtin type; unknown types live as long as user data
pub fn expiration_for(t: ValueTypeId) -> Duration {
    BUILTIN_TYPES
        .iter()
        .find(|(id, _, _)| *id == t)
        .map_or(BUILTIN_TYPES[0].2, |(_, _, exp)| *exp)
}

impl ValueType {
    pub const USER_DATA: ValueTypeId = 0;
    pub const CERTIFICATE: ValueTypeId = 1;
    pub const PEER: ValueTypeId = 2;
    pub const SERVICE_ANNOUNCEMENT: ValueTypeId = 3;

    /// Type with default policies
    pub fn new(id: ValueTypeId, name: impl Into<String>, expiration: Duration) -> Self {
        Self {
            id,
            name: name.into(),
            expiration,
            store_policy: Self::default_store_policy(),
            edit_policy: Self::default_edit_policy(),
        }
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> Self {
        self.store_policy = policy;
        self
    }

    pub fn with_edit_policy(mut self, policy: EditPolicy) -> Self {
        self.edit_policy = policy;
        self
    }

    /// Accepts anything within the size limit
    pub fn default_store_policy() -> StorePolicy {
        Arc::new(|_: &InfoHash, value: &Value, _: &InfoHash, _: &SocketAddr| {
            value.data.len() <= MAX_VALUE_SIZE
        })
    }

    /// Rejects every edit
    pub fn default_edit_policy() -> EditPolicy {
        Arc::new(|_: &InfoHash, _: &Value, _: &Value, _: &InfoHash, _: &SocketAddr| false)
    }

    /// The statically known types
    pub fn builtin() -> Vec<ValueType> {
        BUILTIN_TYPES
            .iter()
            .map(|(id, name, exp)| {
                let t = ValueType::new(*id, *name, *exp);
                if *id == Self::SERVICE_ANNOUNCEMENT {
                    t.with_store_policy(Arc::new(|_: &InfoHash, value: &Value, _: &InfoHash, _: &SocketAddr| {
                        value.is_encrypted() || ServiceAnnouncement::from_bytes(&value.data).is_ok()
                    }))
                } else {
                    t
                }
            })
            .collect()
    }
}

impl fmt::Debug for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Registered value types; unknown ids resolve to user data
#[derive(Clone, Debug)]
pub struct TypeStore {
    types: HashMap<ValueTypeId, ValueType>,
    fallback: ValueType,
}

impl TypeStore {
    /// Store holding the builtin types
    pub fn new() -> Self {
        let types: HashMap<_, _> = ValueType::builtin().into_iter().map(|t| (t.id, t)).collect();
        let fallback = types
            .get(&ValueType::USER_DATA)
            .cloned()
            .unwrap_or_else(|| ValueType::new(ValueType::USER_DATA, "User Data", expiration_for(ValueType::USER_DATA)));
        Self { types, fallback }
    }

    /// Register or replace a type
    pub fn register(&mut self, t: ValueType) {
        if t.id == ValueType::USER_DATA {
            self.fallback = t.clone();
        }
        self.types.insert(t.id, t);
    }

    pub fn get(&self, id: ValueTypeId) -> &ValueType {
        self.types.get(&id).unwrap_or(&self.fallback)
    }

    /// Type governing `value`; encrypted values hide theirs
    pub fn for_value(&self, value: &Value) -> &ValueType {
        if value.is_encrypted() {
            &self.fallback
        } else {
            self.get(value.value_type)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueType> {
        self.types.values()
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of a `SERVICE_ANNOUNCEMENT` value: the announced service port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub port: u16,
}

impl ServiceAnnouncement {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.port.to_be_bytes().to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> DhtResult<Self> {
        let raw: [u8; 2] = data
            .try_into()
            .map_err(|_| DhtError::MalformedValue("service announcement must be 2 bytes".into()))?;
        let port = u16::from_be_bytes(raw);
        if port == 0 {
            return Err(DhtError::MalformedValue("service announcement port is 0".into()));
        }
        Ok(Self { port })
    }

    /// Address of the service given the address the announcement came from
    pub fn service_addr(&self, from: SocketAddr) -> SocketAddr {
        SocketAddr::new(from.ip(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PrivateKey {
        PrivateKey::generate().unwrap()
    }

    #[test]
    fn test_plain_roundtrip_every_type() {
        for t in ValueType::builtin() {
            let value = Value::new(t.id, b"payload".to_vec()).with_id(42);
            let decoded = Value::unpack(&value.pack()).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(decoded.value_type, t.id);
        }
    }

    #[test]
    fn test_signed_roundtrip() {
        let k = key();
        let mut value = Value::new(ValueType::USER_DATA, b"hello".to_vec()).with_id(7);
        value.seq = 3;
        value.sign(&k);

        let decoded = Value::unpack(&value.pack()).unwrap();
        assert_eq!(decoded, value);
        assert!(decoded.check_signature());
        assert_eq!(decoded.owner_id(), Some(k.public_key().get_id()));
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let alice = key();
        let bob = key();
        let value = Value::new(ValueType::USER_DATA, b"secret".to_vec()).with_id(9);

        let sealed = value.encrypt(&alice, &bob.public_key()).unwrap();
        assert!(sealed.is_encrypted());
        assert!(sealed.data.is_empty());

        let decoded = Value::unpack(&sealed.pack()).unwrap();
        assert_eq!(decoded, sealed);

        let opened = decoded.decrypt(&bob).unwrap();
        assert_eq!(opened.id, 9);
        assert_eq!(opened.data, b"secret");
        assert_eq!(opened.recipient(), Some(bob.public_key().get_id()));
        assert_eq!(opened.owner_id(), Some(alice.public_key().get_id()));
        assert!(opened.check_signature());

        assert!(decoded.decrypt(&alice).is_err());
    }

    #[test]
    fn test_signature_covers_content() {
        let k = key();
        let mut value = Value::new(ValueType::USER_DATA, b"hello".to_vec());
        value.sign(&k);

        let mut tampered = value.clone();
        tampered.data = b"hellO".to_vec();
        assert!(!tampered.check_signature());

        let mut bumped = value.clone();
        bumped.seq += 1;
        assert!(!bumped.check_signature());

        // The id is not covered
        let renamed = value.clone().with_id(99);
        assert!(renamed.check_signature());
    }

    #[test]
    fn test_unsigned_never_verifies() {
        let value = Value::new(ValueType::USER_DATA, b"x".to_vec());
        assert!(!value.check_signature());
    }

    #[test]
    fn test_get_to_encrypt_extends_get_to_sign() {
        let mut value = Value::new(ValueType::PEER, b"abc".to_vec());
        assert_eq!(value.get_to_sign(), value.get_to_encrypt());

        value.sign(&key());
        let to_sign = value.get_to_sign();
        let to_encrypt = value.get_to_encrypt();
        assert!(to_encrypt.starts_with(&to_sign));
        assert_eq!(to_encrypt.len(), to_sign.len() + 2 + value.signature().len());
    }

    #[test]
    fn test_unpack_rejects_malformed() {
        let mut signed = Value::new(ValueType::USER_DATA, b"hello".to_vec()).with_id(1);
        signed.sign(&key());
        let packed = signed.pack();

        for cut in [0, 5, 9, 20, packed.len() - 1] {
            assert!(
                matches!(Value::unpack(&packed[..cut]), Err(DhtError::MalformedValue(_))),
                "cut at {}",
                cut
            );
        }

        let mut trailing = packed.clone();
        trailing.push(0);
        assert!(Value::unpack(&trailing).is_err());

        let mut bad_flags = packed;
        bad_flags[8] = 0x80;
        assert!(Value::unpack(&bad_flags).is_err());

        let mut empty_cypher = 1u64.to_be_bytes().to_vec();
        empty_cypher.push(CryptoFlags::ENCRYPTED);
        assert!(Value::unpack(&empty_cypher).is_err());
    }

    #[test]
    fn test_expiration_thresholds() {
        let t0 = Instant::now();
        let min = |m: u64| t0 + Duration::from_secs(m * 60);
        let hours = |h: u64| min(h * 60);

        let cert = Value::new(ValueType::CERTIFICATE, Vec::new());
        assert!(!cert.is_expired(min(61), t0));
        assert!(!cert.is_expired(min(62), t0));
        assert!(cert.is_expired(min(63), t0));

        let peer = Value::new(ValueType::PEER, Vec::new());
        assert!(!peer.is_expired(min(31), t0));
        assert!(peer.is_expired(min(33), t0));

        let user = Value::new(ValueType::USER_DATA, Vec::new());
        assert!(!user.is_expired(hours(6 * 24 + 23), t0));
        assert!(!user.is_expired(hours(7 * 24), t0));
        assert!(user.is_expired(hours(7 * 24 + 1), t0));

        let service = Value::new(ValueType::SERVICE_ANNOUNCEMENT, Vec::new());
        assert!(!service.is_expired(hours(6 * 24 + 23), t0));
        assert!(service.is_expired(hours(7 * 24 + 1), t0));

        let mut sealed = Value::new(ValueType::CERTIFICATE, Vec::new());
        sealed.flags.encrypted = true;
        assert!(!sealed.is_expired(hours(6 * 24 + 23), t0));
        assert!(sealed.is_expired(hours(7 * 24 + 1), t0));

        let unknown = Value::new(999, Vec::new());
        assert_eq!(unknown.expiration(), user.expiration());
    }

    #[test]
    fn test_filters() {
        let cert = Value::new(ValueType::CERTIFICATE, Vec::new()).with_id(5);
        assert!(Value::type_filter(ValueType::CERTIFICATE)(&cert));
        assert!(!Value::type_filter(ValueType::PEER)(&cert));
        assert!(Value::id_filter(5)(&cert));
        assert!(!Value::id_filter(6)(&cert));
    }

    #[test]
    fn test_type_store_fallback() {
        let mut types = TypeStore::new();
        assert_eq!(types.get(ValueType::PEER).expiration, Duration::from_secs(32 * 60));
        assert_eq!(types.get(77).id, ValueType::USER_DATA);

        types.register(ValueType::new(77, "custom", Duration::from_secs(5)));
        assert_eq!(types.get(77).expiration, Duration::from_secs(5));

        let sealed = Value::new(ValueType::PEER, b"x".to_vec())
            .encrypt(&key(), &key().public_key())
            .unwrap();
        assert_eq!(types.for_value(&sealed).id, ValueType::USER_DATA);
    }

    #[test]
    fn test_service_announcement() {
        let ann = ServiceAnnouncement { port: 4222 };
        assert_eq!(ServiceAnnouncement::from_bytes(&ann.to_bytes()).unwrap(), ann);
        assert!(ServiceAnnouncement::from_bytes(&[0, 0]).is_err());
        assert!(ServiceAnnouncement::from_bytes(&[1]).is_err());

        let from: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(ann.service_addr(from), "10.0.0.1:4222".parse().unwrap());

        let types = ValueType::builtin();
        let service = types
            .iter()
            .find(|t| t.id == ValueType::SERVICE_ANNOUNCEMENT)
            .unwrap();
        let ok = Value::new(ValueType::SERVICE_ANNOUNCEMENT, ann.to_bytes());
        let bad = Value::new(ValueType::SERVICE_ANNOUNCEMENT, b"nope".to_vec());
        let id = InfoHash::zero();
        assert!((service.store_policy)(&id, &ok, &id, &from));
        assert!(!(service.store_policy)(&id, &bad, &id, &from));
    }
}
