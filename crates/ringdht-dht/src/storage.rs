//! DHT Value Storage
//!
//! Values are kept per key in insertion order. New values go through the
//! store policy of their type, replacements of an existing id through the
//! edit policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ringdht_crypto::InfoHash;
use tracing::{debug, warn};

use crate::error::{DhtError, DhtResult};
use crate::value::{Filter, TypeStore, Value, ValueId};
use crate::{MAX_HASHES, MAX_VALUES};

/// A stored value with metadata
#[derive(Debug, Clone)]
pub struct ValueStorage {
    /// The value
    pub data: Arc<Value>,
    /// When this value was stored or last refreshed
    pub time: Instant,
}

/// Outcome of [`DhtStorage::store`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreStatus {
    /// New value
    Stored,
    /// Identical value already present, timestamp renewed
    Refreshed,
    /// Existing value replaced
    Edited,
    /// Refused by the type's policy
    Rejected,
    /// Key or value limit reached
    Full,
}

/// DHT key-value storage
pub struct DhtStorage {
    /// Stored values by key
    store: HashMap<InfoHash, Vec<ValueStorage>>,
    /// Maximum keys
    max_hashes: usize,
    /// Maximum values per key
    max_values: usize,
}

impl DhtStorage {
    /// Create new storage
    pub fn new() -> Self {
        Self::with_limits(MAX_HASHES, MAX_VALUES)
    }

    /// Create with custom limits
    pub fn with_limits(max_hashes: usize, max_values: usize) -> Self {
        Self {
            store: HashMap::new(),
            max_hashes,
            max_values,
        }
    }

    /// Store a value received from `from` at `addr`, applying type policies
    pub fn store(
        &mut self,
        key: &InfoHash,
        value: Arc<Value>,
        from: &InfoHash,
        addr: &SocketAddr,
        now: Instant,
        types: &TypeStore,
    ) -> StoreStatus {
        let vtype = types.for_value(&value);

        if let Some(slot) = self
            .store
            .get_mut(key)
            .and_then(|vals| vals.iter_mut().find(|s| s.data.id == value.id))
        {
            if *slot.data == *value {
                slot.time = now;
                return StoreStatus::Refreshed;
            }
            if (vtype.edit_policy)(key, slot.data.as_ref(), value.as_ref(), from, addr) {
                debug!("Edited value {:016x} under {:?}", value.id, key);
                slot.data = value;
                slot.time = now;
                return StoreStatus::Edited;
            }
            return StoreStatus::Rejected;
        }

        if !(vtype.store_policy)(key, value.as_ref(), from, addr) {
            return StoreStatus::Rejected;
        }
        if self.insert(*key, value, now) {
            StoreStatus::Stored
        } else {
            StoreStatus::Full
        }
    }

    /// Insert or replace without consulting policies
    pub fn insert(&mut self, key: InfoHash, value: Arc<Value>, now: Instant) -> bool {
        if !self.store.contains_key(&key) && self.store.len() >= self.max_hashes {
            warn!("Storage full: {} keys", self.store.len());
            return false;
        }
        let vals = self.store.entry(key).or_default();
        if let Some(slot) = vals.iter_mut().find(|s| s.data.id == value.id) {
            slot.data = value;
            slot.time = now;
            return true;
        }
        if vals.len() >= self.max_values {
            warn!("Storage full under {:?}: {} values", key, vals.len());
            return false;
        }
        vals.push(ValueStorage { data: value, time: now });
        true
    }

    /// Values under `key` accepted by `filter`
    pub fn get_values(&self, key: &InfoHash, filter: Option<&Filter>) -> Vec<Arc<Value>> {
        self.store
            .get(key)
            .map(|vals| {
                vals.iter()
                    .filter(|s| filter.map_or(true, |f| f(s.data.as_ref())))
                    .map(|s| s.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_value(&self, key: &InfoHash, id: ValueId) -> Option<Arc<Value>> {
        self.store
            .get(key)?
            .iter()
            .find(|s| s.data.id == id)
            .map(|s| s.data.clone())
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Number of values across all keys
    pub fn value_count(&self) -> usize {
        self.store.values().map(Vec::len).sum()
    }

    /// Drop values that outlived their type's expiration
    pub fn expire(&mut self, now: Instant, types: &TypeStore) -> usize {
        let mut removed = 0;
        self.store.retain(|_, vals| {
            let before = vals.len();
            vals.retain(|s| {
                now.saturating_duration_since(s.time) <= types.for_value(&s.data).expiration
            });
            removed += before - vals.len();
            !vals.is_empty()
        });
        if removed > 0 {
            debug!("Cleaned up {} expired values", removed);
        }
        removed
    }

    /// Serialize every key's values, with their storage time
    ///
    /// Blob layout: `[count: u16]` then per value
    /// `[stored at, unix secs: u64][len: u32][packed value]`.
    pub fn export_values(&self, now: Instant) -> Vec<(InfoHash, Vec<u8>)> {
        let wall = unix_now();
        self.store
            .iter()
            .map(|(key, vals)| {
                let count = vals.len().min(u16::MAX as usize);
                let mut blob = Vec::new();
                blob.extend_from_slice(&(count as u16).to_be_bytes());
                for s in &vals[..count] {
                    let age = now.saturating_duration_since(s.time).as_secs();
                    let packed = s.data.pack();
                    blob.extend_from_slice(&wall.saturating_sub(age).to_be_bytes());
                    blob.extend_from_slice(&(packed.len() as u32).to_be_bytes());
                    blob.extend_from_slice(&packed);
                }
                (*key, blob)
            })
            .collect()
    }

    /// Load blobs produced by [`export_values`](Self::export_values)
    ///
    /// Malformed entries and values already expired are skipped. Returns the
    /// number of values imported.
    pub fn import_values(
        &mut self,
        blobs: &[(InfoHash, Vec<u8>)],
        now: Instant,
        types: &TypeStore,
    ) -> usize {
        let wall = unix_now();
        let mut imported = 0;
        for (key, blob) in blobs {
            let entries = match parse_blob(blob) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping values under {:?}: {}", key, e);
                    continue;
                }
            };
            for (stored_at, packed) in entries {
                let value = match Value::unpack(packed) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Skipping malformed value under {:?}: {}", key, e);
                        continue;
                    }
                };
                let age = Duration::from_secs(wall.saturating_sub(stored_at));
                if age > types.for_value(&value).expiration {
                    continue;
                }
                let time = now.checked_sub(age).unwrap_or(now);
                if self.insert(*key, Arc::new(value), time) {
                    imported += 1;
                }
            }
        }
        imported
    }
}

impl Default for DhtStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> DhtResult<&'a [u8]> {
    let cur: &'a [u8] = rest;
    if cur.len() < n {
        return Err(DhtError::MalformedValue("truncated value blob".into()));
    }
    let (head, tail) = cur.split_at(n);
    *rest = tail;
    Ok(head)
}

fn parse_blob(blob: &[u8]) -> DhtResult<Vec<(u64, &[u8])>> {
    let mut rest = blob;

    let mut count = [0u8; 2];
    count.copy_from_slice(take(&mut rest, 2)?);
    let count = u16::from_be_bytes(count);

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut stored_at = [0u8; 8];
        stored_at.copy_from_slice(take(&mut rest, 8)?);
        let mut len = [0u8; 4];
        len.copy_from_slice(take(&mut rest, 4)?);
        let packed = take(&mut rest, u32::from_be_bytes(len) as usize)?;
        entries.push((u64::from_be_bytes(stored_at), packed));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use ringdht_crypto::PrivateKey;

    fn addr() -> SocketAddr {
        "127.0.0.1:4222".parse().unwrap()
    }

    fn value(id: ValueId, data: &[u8]) -> Arc<Value> {
        Arc::new(Value::new(ValueType::USER_DATA, data.to_vec()).with_id(id))
    }

    fn store(storage: &mut DhtStorage, key: &InfoHash, v: Arc<Value>, now: Instant) -> StoreStatus {
        storage.store(key, v, &InfoHash::zero(), &addr(), now, &TypeStore::new())
    }

    #[test]
    fn test_store_and_get() {
        let mut storage = DhtStorage::new();
        let key = InfoHash::get(b"key");
        let now = Instant::now();

        assert_eq!(store(&mut storage, &key, value(1, b"a"), now), StoreStatus::Stored);
        assert_eq!(store(&mut storage, &key, value(2, b"b"), now), StoreStatus::Stored);
        assert_eq!(store(&mut storage, &key, value(1, b"a"), now), StoreStatus::Refreshed);

        assert_eq!(storage.get_values(&key, None).len(), 2);
        assert_eq!(storage.get_value(&key, 2).unwrap().data, b"b");
        let only_one: Filter = Value::id_filter(1);
        assert_eq!(storage.get_values(&key, Some(&only_one)).len(), 1);
        assert!(storage.get_values(&InfoHash::get(b"other"), None).is_empty());
    }

    #[test]
    fn test_edit_policy_applies_to_same_id() {
        let mut storage = DhtStorage::new();
        let key = InfoHash::get(b"key");
        let now = Instant::now();

        store(&mut storage, &key, value(1, b"a"), now);
        // Default edit policy rejects every change
        assert_eq!(store(&mut storage, &key, value(1, b"b"), now), StoreStatus::Rejected);
        assert_eq!(storage.get_value(&key, 1).unwrap().data, b"a");

        let mut types = TypeStore::new();
        types.register(
            ValueType::new(ValueType::USER_DATA, "editable", Duration::from_secs(60)).with_edit_policy(
                Arc::new(|_: &InfoHash, _: &Value, _: &Value, _: &InfoHash, _: &SocketAddr| true),
            ),
        );
        let status = storage.store(&key, value(1, b"b"), &InfoHash::zero(), &addr(), now, &types);
        assert_eq!(status, StoreStatus::Edited);
        assert_eq!(storage.get_value(&key, 1).unwrap().data, b"b");
    }

    #[test]
    fn test_store_policy_rejects() {
        let mut storage = DhtStorage::new();
        let key = InfoHash::get(b"key");
        let bad = Arc::new(Value::new(ValueType::SERVICE_ANNOUNCEMENT, b"not a port".to_vec()).with_id(1));
        assert_eq!(store(&mut storage, &key, bad, Instant::now()), StoreStatus::Rejected);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_limits() {
        let mut storage = DhtStorage::with_limits(2, 2);
        let now = Instant::now();
        let k = |i: u8| InfoHash::from_bytes([i; 20]);

        assert_eq!(store(&mut storage, &k(1), value(1, b"x"), now), StoreStatus::Stored);
        assert_eq!(store(&mut storage, &k(1), value(2, b"x"), now), StoreStatus::Stored);
        assert_eq!(store(&mut storage, &k(1), value(3, b"x"), now), StoreStatus::Full);

        assert_eq!(store(&mut storage, &k(2), value(1, b"x"), now), StoreStatus::Stored);
        assert_eq!(store(&mut storage, &k(3), value(1, b"x"), now), StoreStatus::Full);
        assert_eq!(storage.value_count(), 3);
    }

    #[test]
    fn test_expiry() {
        let mut storage = DhtStorage::new();
        let types = TypeStore::new();
        let key = InfoHash::get(b"key");
        let t0 = Instant::now();

        storage.insert(key, Arc::new(Value::new(ValueType::PEER, b"p".to_vec()).with_id(1)), t0);
        storage.insert(key, value(2, b"u"), t0);

        assert_eq!(storage.expire(t0 + Duration::from_secs(31 * 60), &types), 0);
        assert_eq!(storage.expire(t0 + Duration::from_secs(33 * 60), &types), 1);
        assert!(storage.get_value(&key, 1).is_none());
        assert!(storage.get_value(&key, 2).is_some());

        assert_eq!(storage.expire(t0 + Duration::from_secs(8 * 24 * 3600), &types), 1);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_export_import() {
        let mut storage = DhtStorage::new();
        let types = TypeStore::new();
        let now = Instant::now();
        let key = InfoHash::get(b"key");

        let mut signed = Value::new(ValueType::USER_DATA, b"signed".to_vec()).with_id(3);
        signed.sign(&PrivateKey::generate().unwrap());
        storage.insert(key, value(1, b"a"), now);
        storage.insert(key, Arc::new(signed.clone()), now);
        storage.insert(InfoHash::get(b"other"), value(2, b"b"), now);

        let exported = storage.export_values(now);
        assert_eq!(exported.len(), 2);

        let mut restored = DhtStorage::new();
        assert_eq!(restored.import_values(&exported, Instant::now(), &types), 3);
        assert_eq!(*restored.get_value(&key, 3).unwrap(), signed);
        assert!(restored.get_value(&key, 3).unwrap().check_signature());
    }

    #[test]
    fn test_import_skips_malformed() {
        let mut storage = DhtStorage::new();
        let now = Instant::now();
        let key = InfoHash::get(b"key");
        storage.insert(key, value(1, b"a"), now);

        let mut exported = storage.export_values(now);
        exported.push((InfoHash::get(b"truncated"), vec![0, 5, 1]));

        // One entry whose packed value is garbage
        let mut bad = Vec::new();
        bad.extend_from_slice(&1u16.to_be_bytes());
        bad.extend_from_slice(&unix_now().to_be_bytes());
        bad.extend_from_slice(&3u32.to_be_bytes());
        bad.extend_from_slice(&[1, 2, 3]);
        exported.push((InfoHash::get(b"garbage"), bad));

        let mut restored = DhtStorage::new();
        assert_eq!(restored.import_values(&exported, now, &TypeStore::new()), 1);
        assert_eq!(restored.len(), 1);
    }
}
