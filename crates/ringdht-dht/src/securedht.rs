//! Authenticated DHT layer
//!
//! [`SecureDht`] owns a [`Dht`] and adds identity on top of it: values are
//! signed and optionally encrypted on the way in, verified and decrypted on
//! the way out, and node certificates are published and cached.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringdht_crypto::{Certificate, Identity, InfoHash, NodeId, PrivateKey};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::engine::{Dht, DhtStatus, DoneCallback, GetCallback, Transport};
use crate::error::DhtResult;
use crate::node::{AddressFamily, NodeExport};
use crate::value::{Filter, Value, ValueId, ValueType, INVALID_ID};

/// Receives the certificate found by [`SecureDht::find_certificate`]
pub type CertificateCallback = Box<dyn FnOnce(Option<Arc<Certificate>>) + Send>;

/// Id of the value carrying a node's own certificate
const CERTIFICATE_VALUE_ID: ValueId = 1;

/// State shared with callbacks running inside the engine
struct SecureContext {
    id: NodeId,
    key: Arc<PrivateKey>,
    certificate: Arc<Certificate>,
    certificates: Mutex<HashMap<NodeId, Arc<Certificate>>>,
}

impl SecureContext {
    fn get_certificate(&self, node: &NodeId) -> Option<Arc<Certificate>> {
        if *node == self.id {
            return Some(self.certificate.clone());
        }
        self.certificates.lock().get(node).cloned()
    }

    fn register_certificate(&self, node: &NodeId, data: &[u8]) -> Option<Arc<Certificate>> {
        let certificate = match Certificate::from_bytes(data) {
            Ok(c) => c,
            Err(e) => {
                debug!("Invalid certificate advertised for {}: {}", node, e);
                return None;
            }
        };
        let id = certificate.get_id();
        if id != *node {
            debug!("Certificate {} advertised under {} does not match", id, node);
            return None;
        }
        let certificate = Arc::new(certificate);
        debug!("Registering certificate for {}", id);
        self.certificates.lock().insert(id, certificate.clone());
        Some(certificate)
    }

    /// The value as delivered to callers, or None if it fails verification
    fn check_value(&self, value: &Arc<Value>) -> Option<Arc<Value>> {
        if value.is_encrypted() {
            let plain = match value.decrypt(&self.key) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Cannot decrypt value {:016x}: {}", value.id, e);
                    return None;
                }
            };
            if plain.recipient() != Some(self.id) {
                debug!("Dropping value {:016x} sealed for another recipient", value.id);
                return None;
            }
            if !plain.check_signature() {
                debug!("Dropping encrypted value {:016x} with a bad signature", value.id);
                return None;
            }
            return Some(Arc::new(plain));
        }
        if value.is_signed() && !value.check_signature() {
            debug!("Dropping value {:016x} with a bad signature", value.id);
            return None;
        }
        Some(value.clone())
    }
}

struct DeferredPut {
    key: InfoHash,
    value: Value,
    done: Option<DoneCallback>,
}

fn fail(done: Option<DoneCallback>) {
    if let Some(done) = done {
        done(false);
    }
}

/// DHT engine with signed and encrypted values
pub struct SecureDht {
    dht: Dht,
    ctx: Arc<SecureContext>,
    /// Puts issued from engine callbacks, run after each engine call
    deferred: Arc<Mutex<VecDeque<DeferredPut>>>,
}

impl SecureDht {
    /// Start an engine for `identity` and publish its certificate
    pub fn new(transport: Box<dyn Transport>, identity: &Identity, config: DhtConfig) -> DhtResult<Self> {
        let id = identity.id();
        let mut dht = Dht::with_config(id, transport, config)?;
        for t in ValueType::builtin() {
            dht.register_type(Self::secure_type(t));
        }

        let cert_value =
            Value::new(ValueType::CERTIFICATE, identity.certificate.pack()?).with_id(CERTIFICATE_VALUE_ID);
        dht.put(id, cert_value, None);

        info!("Secure DHT started for {}", id);
        Ok(Self {
            dht,
            ctx: Arc::new(SecureContext {
                id,
                key: identity.key.clone(),
                certificate: identity.certificate.clone(),
                certificates: Mutex::new(HashMap::new()),
            }),
            deferred: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Our identity, also used as node id
    pub fn id(&self) -> &NodeId {
        &self.ctx.id
    }

    /// Wrap a type's policies with signature checks
    ///
    /// The store policy refuses signed values whose signature does not verify.
    /// Edits of a signed value must keep its owner, carry a valid signature
    /// and not go back in sequence; identical content at the same sequence is
    /// a re-announcement and passes.
    pub fn secure_type(t: ValueType) -> ValueType {
        let store = t.store_policy.clone();
        let edit = t.edit_policy.clone();
        t.with_store_policy(Arc::new(
            move |key: &InfoHash, value: &Value, from: &InfoHash, addr: &SocketAddr| {
                if value.is_signed() && !value.is_encrypted() && !value.check_signature() {
                    debug!("Refusing to store value {:016x} with a bad signature", value.id);
                    return false;
                }
                store(key, value, from, addr)
            },
        ))
        .with_edit_policy(Arc::new(
            move |key: &InfoHash, old: &Value, new: &Value, from: &InfoHash, addr: &SocketAddr| {
                if !old.is_signed() || old.is_encrypted() {
                    return edit(key, old, new, from, addr);
                }
                if new.owner() != old.owner() {
                    debug!("Refusing edit of {:016x}: owner changed", old.id);
                    return false;
                }
                if !new.check_signature() {
                    debug!("Refusing edit of {:016x}: bad signature", old.id);
                    return false;
                }
                if new.seq < old.seq || (new.seq == old.seq && new != old) {
                    debug!("Refusing edit of {:016x}: seq {} after {}", old.id, new.seq, old.seq);
                    return false;
                }
                true
            },
        ))
    }

    /// Register a value type, adding signature checks to its policies
    pub fn register_type(&mut self, t: ValueType) {
        self.dht.register_type(Self::secure_type(t));
    }

    /// Get values under `key`
    ///
    /// Encrypted values are decrypted and checked for recipient and
    /// signature, signed values are verified. Values failing a check are
    /// dropped. `filter` sees the decrypted values.
    pub fn get(
        &mut self,
        key: InfoHash,
        mut callback: GetCallback,
        done: Option<DoneCallback>,
        filter: Option<Filter>,
    ) {
        let ctx = self.ctx.clone();
        let checked: GetCallback = Box::new(move |values: &[Arc<Value>]| {
            for v in values {
                if v.value_type == ValueType::CERTIFICATE && !v.is_encrypted() {
                    ctx.register_certificate(&key, &v.data);
                }
            }
            let accepted: Vec<Arc<Value>> = values
                .iter()
                .filter_map(|v| ctx.check_value(v))
                .filter(|v| {
                    let value: &Value = v;
                    filter.as_ref().map_or(true, |f| f(value))
                })
                .collect();
            if accepted.is_empty() {
                return true;
            }
            callback(&accepted)
        });
        self.dht.get(key, checked, done, None);
        self.flush();
    }

    /// Put a value as is
    pub fn put(&mut self, key: InfoHash, value: Value, done: Option<DoneCallback>) {
        self.dht.put(key, value, done);
        self.flush();
    }

    /// Sign and put a value
    ///
    /// Without an id the value gets one derived from our identity and `key`,
    /// so that repeated puts edit the same value. The sequence number follows
    /// the locally stored version.
    pub fn put_signed(&mut self, key: InfoHash, mut value: Value, done: Option<DoneCallback>) {
        if value.id == INVALID_ID {
            value.id = self.signed_value_id(&key);
        }
        if let Some(existing) = self.dht.get_local_by_id(&key, value.id) {
            if existing.owner_id() == Some(self.ctx.id) {
                value.seq = existing.seq.saturating_add(1);
            }
        }
        value.sign(&self.ctx.key);
        self.put(key, value, done);
    }

    /// Sign and encrypt a value for node `to`, then put it
    ///
    /// `done` receives false when no certificate for `to` can be found.
    pub fn put_encrypted(&mut self, key: InfoHash, to: NodeId, value: Value, done: Option<DoneCallback>) {
        let ctx = self.ctx.clone();
        let deferred = self.deferred.clone();
        self.find_certificate(
            to,
            Box::new(move |certificate: Option<Arc<Certificate>>| {
                let Some(certificate) = certificate else {
                    debug!("No certificate for {}, cannot encrypt", to);
                    fail(done);
                    return;
                };
                match value.encrypt(&ctx.key, &certificate.public_key()) {
                    Ok(sealed) => deferred.lock().push_back(DeferredPut {
                        key,
                        value: sealed,
                        done,
                    }),
                    Err(e) => {
                        warn!("Encryption for {} failed: {}", to, e);
                        fail(done);
                    }
                }
            }),
        );
        self.flush();
    }

    /// Stop announcing a value
    pub fn cancel_put(&mut self, key: &InfoHash, id: ValueId) -> bool {
        self.dht.cancel_put(key, id)
    }

    /// Cached certificate of `node`
    pub fn get_certificate(&self, node: &NodeId) -> Option<Arc<Certificate>> {
        self.ctx.get_certificate(node)
    }

    /// Parse and cache a certificate advertised under `node`
    ///
    /// Refused unless the certificate's id is `node`.
    pub fn register_certificate(&self, node: &NodeId, data: &[u8]) -> Option<Arc<Certificate>> {
        self.ctx.register_certificate(node, data)
    }

    /// Find the certificate of `node`, from cache or from the network
    pub fn find_certificate(&mut self, node: NodeId, callback: CertificateCallback) {
        if let Some(certificate) = self.ctx.get_certificate(&node) {
            debug!("Using cached certificate for {}", node);
            callback(Some(certificate));
            return;
        }

        let slot = Arc::new(Mutex::new(Some(callback)));
        let on_done = slot.clone();
        let ctx = self.ctx.clone();
        self.dht.get(
            node,
            Box::new(move |values: &[Arc<Value>]| {
                for v in values {
                    if let Some(certificate) = ctx.register_certificate(&node, &v.data) {
                        debug!("Found certificate for {}", node);
                        let callback = slot.lock().take();
                        if let Some(callback) = callback {
                            callback(Some(certificate));
                        }
                        return false;
                    }
                }
                true
            }),
            Some(Box::new(move |_ok: bool| {
                let callback = on_done.lock().take();
                if let Some(callback) = callback {
                    callback(None);
                }
            })),
            Some(Value::type_filter(ValueType::CERTIFICATE)),
        );
        self.flush();
    }

    /// See [`Dht::periodic`]
    pub fn periodic(&mut self, packet: Option<(&[u8], SocketAddr)>, now: Instant) -> Duration {
        let wake = self.dht.periodic(packet, now);
        if self.flush() {
            return Duration::ZERO;
        }
        wake
    }

    pub fn insert_node(&mut self, id: NodeId, addr: SocketAddr) {
        self.dht.insert_node(id, addr);
    }

    pub fn ping_node(&mut self, addr: SocketAddr) {
        self.dht.ping_node(addr);
    }

    pub fn status(&self, family: AddressFamily) -> DhtStatus {
        self.dht.status(family)
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.dht.has_node(id)
    }

    pub fn export_nodes(&self) -> Vec<NodeExport> {
        self.dht.export_nodes()
    }

    pub fn export_values(&self) -> Vec<(InfoHash, Vec<u8>)> {
        self.dht.export_values()
    }

    pub fn import_values(&mut self, blobs: &[(InfoHash, Vec<u8>)]) -> usize {
        self.dht.import_values(blobs)
    }

    /// Locally stored values, unverified
    pub fn get_local(&self, key: &InfoHash) -> Vec<Arc<Value>> {
        self.dht.get_local(key, None)
    }

    /// The underlying engine
    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    fn signed_value_id(&self, key: &InfoHash) -> ValueId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.ctx.id.as_bytes());
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest.as_bytes()[..8]);
        match u64::from_be_bytes(raw) {
            INVALID_ID => 1,
            id => id,
        }
    }

    /// Run deferred puts; true if there were any
    fn flush(&mut self) -> bool {
        let mut any = false;
        loop {
            let next = self.deferred.lock().pop_front();
            let Some(put) = next else {
                return any;
            };
            any = true;
            self.dht.put(put.key, put.value, put.done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DhtStorage;
    use crate::value::TypeStore;
    use ringdht_crypto::generate_identity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport;

    impl Transport for NullTransport {
        fn send_to(&self, data: &[u8], _addr: &SocketAddr) -> std::io::Result<usize> {
            Ok(data.len())
        }

        fn supports(&self, family: AddressFamily) -> bool {
            family == AddressFamily::V4
        }
    }

    fn secure(name: &str) -> (SecureDht, Identity) {
        let identity = generate_identity(name, None).unwrap();
        let dht = SecureDht::new(Box::new(NullTransport), &identity, DhtConfig::default()).unwrap();
        (dht, identity)
    }

    fn collect(dht: &mut SecureDht, key: InfoHash) -> Vec<Arc<Value>> {
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        dht.get(
            key,
            Box::new(move |values: &[Arc<Value>]| {
                sink.lock().extend_from_slice(values);
                true
            }),
            None,
            None,
        );
        let values = found.lock().clone();
        values
    }

    fn user_data_type() -> ValueType {
        SecureDht::secure_type(TypeStore::new().get(ValueType::USER_DATA).clone())
    }

    fn signed(identity: &Identity, id: ValueId, seq: u16, data: &[u8]) -> Value {
        let mut v = Value::new(ValueType::USER_DATA, data.to_vec()).with_id(id);
        v.seq = seq;
        v.sign(&identity.key);
        v
    }

    fn corrupt(value: &Value) -> Value {
        let mut packed = value.pack();
        if let Some(last) = packed.last_mut() {
            *last ^= 0x01;
        }
        Value::unpack(&packed).unwrap()
    }

    #[test]
    fn test_publishes_own_certificate() {
        let (dht, identity) = secure("alice");
        let local = dht.get_local(dht.id());
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].value_type, ValueType::CERTIFICATE);
        let cert = Certificate::from_bytes(&local[0].data).unwrap();
        assert_eq!(cert.get_id(), identity.id());
    }

    #[test]
    fn test_put_signed_then_get() {
        let (mut dht, identity) = secure("alice");
        let key = InfoHash::get(b"profile");
        dht.put_signed(key, Value::new(ValueType::USER_DATA, b"v1".to_vec()), None);
        dht.put_signed(key, Value::new(ValueType::USER_DATA, b"v2".to_vec()), None);

        let values = collect(&mut dht, key);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].data, b"v2");
        assert_eq!(values[0].seq, 1);
        assert_eq!(values[0].owner_id(), Some(identity.id()));
        assert!(values[0].check_signature());
    }

    #[test]
    fn test_get_drops_corrupted_signature() {
        let (mut dht, _) = secure("bob");
        let alice = generate_identity("alice", None).unwrap();
        let key = InfoHash::get(b"mixed");

        let good = signed(&alice, 1, 0, b"genuine");
        let bad = corrupt(&signed(&alice, 2, 0, b"forged"));
        assert!(!bad.check_signature());

        let mut storage = DhtStorage::new();
        let now = Instant::now();
        storage.insert(key, Arc::new(good.clone()), now);
        storage.insert(key, Arc::new(bad), now);
        assert_eq!(dht.import_values(&storage.export_values(now)), 2);

        let values = collect(&mut dht, key);
        assert_eq!(values.len(), 1);
        assert_eq!(*values[0], good);
    }

    #[test]
    fn test_store_policy_checks_signature() {
        let alice = generate_identity("alice", None).unwrap();
        let t = user_data_type();
        let key = InfoHash::get(b"k");
        let from = InfoHash::get_random();
        let addr: SocketAddr = "127.0.0.1:4222".parse().unwrap();

        let good = signed(&alice, 1, 0, b"data");
        assert!((t.store_policy)(&key, &good, &from, &addr));
        assert!(!(t.store_policy)(&key, &corrupt(&good), &from, &addr));
        let plain = Value::new(ValueType::USER_DATA, b"plain".to_vec());
        assert!((t.store_policy)(&key, &plain, &from, &addr));
    }

    #[test]
    fn test_edit_policy_sequence_rules() {
        let alice = generate_identity("alice", None).unwrap();
        let mallory = generate_identity("mallory", None).unwrap();
        let t = user_data_type();
        let key = InfoHash::get(b"k");
        let from = InfoHash::get_random();
        let addr: SocketAddr = "127.0.0.1:4222".parse().unwrap();
        let edit = |old: &Value, new: &Value| (t.edit_policy)(&key, old, new, &from, &addr);

        let old = signed(&alice, 9, 5, b"old");
        assert!(edit(&old, &signed(&alice, 9, 6, b"new")));
        assert!(!edit(&old, &signed(&alice, 9, 5, b"new")));
        assert!(!edit(&old, &signed(&alice, 9, 4, b"new")));
        assert!(edit(&old, &signed(&alice, 9, 5, b"old")));
        assert!(!edit(&old, &signed(&mallory, 9, 6, b"new")));
        assert!(!edit(&old, &corrupt(&signed(&alice, 9, 6, b"new"))));
    }

    #[test]
    fn test_register_certificate_rejects_spoofing() {
        let (dht, _) = secure("alice");
        let bob = generate_identity("bob", None).unwrap();
        let data = bob.certificate.pack().unwrap();

        assert!(dht.register_certificate(&InfoHash::get_random(), &data).is_none());
        assert!(dht.get_certificate(&bob.id()).is_none());
        assert!(dht.register_certificate(&bob.id(), &data).is_some());
        assert_eq!(dht.get_certificate(&bob.id()).unwrap().get_id(), bob.id());
        assert!(dht.register_certificate(&bob.id(), b"garbage").is_none());
    }

    #[test]
    fn test_put_encrypted_for_self() {
        let (mut dht, identity) = secure("alice");
        let key = InfoHash::get(b"inbox");
        let me = identity.id();
        dht.put_encrypted(key, me, Value::new(ValueType::USER_DATA, b"secret".to_vec()), None);

        let stored = dht.get_local(&key);
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_encrypted());

        let values = collect(&mut dht, key);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].data, b"secret");
        assert_eq!(values[0].recipient(), Some(me));
        assert_eq!(values[0].owner_id(), Some(me));
    }

    #[test]
    fn test_get_drops_value_for_other_recipient() {
        let (mut dht, _) = secure("alice");
        let bob = generate_identity("bob", None).unwrap();
        let carol = generate_identity("carol", None).unwrap();
        let key = InfoHash::get(b"inbox");

        let sealed = Value::new(ValueType::USER_DATA, b"for carol".to_vec())
            .with_id(3)
            .encrypt(&bob.key, &carol.certificate.public_key())
            .unwrap();
        dht.put(key, sealed, None);
        assert!(collect(&mut dht, key).is_empty());
    }

    #[test]
    fn test_put_encrypted_without_certificate_fails() {
        let (mut dht, _) = secure("alice");
        let state = Arc::new(AtomicUsize::new(0));
        let s = state.clone();
        dht.put_encrypted(
            InfoHash::get(b"k"),
            InfoHash::get_random(),
            Value::new(ValueType::USER_DATA, b"x".to_vec()),
            Some(Box::new(move |ok| s.store(if ok { 1 } else { 2 }, Ordering::SeqCst))),
        );
        assert_eq!(state.load(Ordering::SeqCst), 0);

        dht.periodic(None, Instant::now() + Duration::from_secs(61));
        assert_eq!(state.load(Ordering::SeqCst), 2);
    }
}
