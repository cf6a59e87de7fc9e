//! InfoHash / NodeId
//!
//! A fixed-length 160-bit identifier used both as a node identity and as a
//! key in the DHT. Distances between ids use the Kademlia XOR metric.
//!
//! Bits are addressed from the most significant end: bit `i` lives in byte
//! `i / 8` under mask `0x80 >> (i % 8)`.

use std::cmp::Ordering;
use std::fmt;
use std::ops::BitXor;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::HASH_LEN;
use crate::error::{CryptoError, CryptoResult};

/// A 160-bit hash, ordered lexicographically by bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct InfoHash {
    bytes: [u8; HASH_LEN],
}

/// Node identifiers share the InfoHash representation
pub type NodeId = InfoHash;

impl InfoHash {
    /// The all-zero hash
    pub const fn zero() -> Self {
        Self { bytes: [0u8; HASH_LEN] }
    }

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; HASH_LEN] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidHash(format!("expected {} bytes, got {}", HASH_LEN, slice.len())))?;
        Ok(Self { bytes })
    }

    /// Hash arbitrary data down to `HASH_LEN` bytes
    pub fn get(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        let mut bytes = [0u8; HASH_LEN];
        hasher.finalize_xof().fill(&mut bytes);
        Self { bytes }
    }

    /// Random hash from the OS RNG
    pub fn get_random() -> Self {
        let mut bytes = [0u8; HASH_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Random hash from a caller supplied RNG
    pub fn random_with<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; HASH_LEN];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.bytes
    }

    /// Is this the all-zero hash?
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Compare `a` and `b` by their XOR distance to `self`
    pub fn xor_cmp(&self, a: &InfoHash, b: &InfoHash) -> Ordering {
        for i in 0..HASH_LEN {
            let da = a.bytes[i] ^ self.bytes[i];
            let db = b.bytes[i] ^ self.bytes[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }

    /// Number of identical leading bits
    pub fn common_bits(a: &InfoHash, b: &InfoHash) -> usize {
        match (0..HASH_LEN).find(|&i| a.bytes[i] != b.bytes[i]) {
            Some(i) => 8 * i + (a.bytes[i] ^ b.bytes[i]).leading_zeros() as usize,
            None => 8 * HASH_LEN,
        }
    }

    /// Index of the last set bit, `None` for the zero hash
    pub fn lowbit(&self) -> Option<usize> {
        let (i, byte) = self
            .bytes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| **b != 0)?;
        Some(8 * i + 7 - byte.trailing_zeros() as usize)
    }

    /// Read a single bit
    pub fn get_bit(&self, bit: usize) -> bool {
        debug_assert!(bit < 8 * HASH_LEN);
        self.bytes[bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    /// Set or clear a single bit
    pub fn set_bit(&mut self, bit: usize, value: bool) {
        debug_assert!(bit < 8 * HASH_LEN);
        let mask = 0x80u8 >> (bit % 8);
        if value {
            self.bytes[bit / 8] |= mask;
        } else {
            self.bytes[bit / 8] &= !mask;
        }
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidHash(e.to_string()))?;
        Self::try_from_slice(&raw)
    }
}

impl BitXor for InfoHash {
    type Output = InfoHash;

    fn bitxor(self, rhs: InfoHash) -> InfoHash {
        let mut bytes = self.bytes;
        for (b, r) in bytes.iter_mut().zip(rhs.bytes.iter()) {
            *b ^= r;
        }
        InfoHash { bytes }
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl FromStr for InfoHash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hash_with(first: u8, last: u8) -> InfoHash {
        let mut bytes = [0u8; HASH_LEN];
        bytes[0] = first;
        bytes[HASH_LEN - 1] = last;
        InfoHash::from_bytes(bytes)
    }

    #[test]
    fn test_get_is_deterministic() {
        let a = InfoHash::get(b"alice");
        let b = InfoHash::get(b"alice");
        let c = InfoHash::get(b"bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_hex_roundtrip() {
        let h = InfoHash::get_random();
        let parsed: InfoHash = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_hex().len(), 2 * HASH_LEN);
        assert!(InfoHash::from_hex("abcd").is_err());
        assert!(InfoHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_lowbit() {
        assert_eq!(InfoHash::zero().lowbit(), None);
        assert_eq!(hash_with(0x80, 0).lowbit(), Some(0));
        assert_eq!(hash_with(0x01, 0).lowbit(), Some(7));
        assert_eq!(hash_with(0xff, 0x01).lowbit(), Some(8 * HASH_LEN - 1));
        assert_eq!(hash_with(0xff, 0x80).lowbit(), Some(8 * HASH_LEN - 8));
    }

    #[test]
    fn test_set_bit() {
        let mut h = InfoHash::zero();
        h.set_bit(0, true);
        assert_eq!(h.as_bytes()[0], 0x80);
        h.set_bit(9, true);
        assert_eq!(h.as_bytes()[1], 0x40);
        assert!(h.get_bit(9));
        assert_eq!(h.lowbit(), Some(9));
        h.set_bit(0, false);
        assert_eq!(h.as_bytes()[0], 0);
    }

    #[test]
    fn test_common_bits() {
        let a = hash_with(0xf0, 0);
        assert_eq!(InfoHash::common_bits(&a, &a), 8 * HASH_LEN);
        assert_eq!(InfoHash::common_bits(&a, &hash_with(0xf8, 0)), 4);
        assert_eq!(InfoHash::common_bits(&a, &hash_with(0x70, 0)), 0);
        assert_eq!(InfoHash::common_bits(&a, &hash_with(0xf0, 1)), 8 * HASH_LEN - 1);
    }

    #[test]
    fn test_ordering_is_bytewise() {
        assert!(hash_with(0x01, 0) < hash_with(0x02, 0));
        assert!(hash_with(0x01, 0xff) < hash_with(0x02, 0));
        assert_eq!(hash_with(3, 3).cmp(&hash_with(3, 3)), Ordering::Equal);
    }

    fn arb_hash() -> impl Strategy<Value = InfoHash> {
        prop::array::uniform20(any::<u8>()).prop_map(InfoHash::from_bytes)
    }

    proptest! {
        #[test]
        fn prop_xor_cmp_reflexive(r in arb_hash(), a in arb_hash()) {
            prop_assert_eq!(r.xor_cmp(&a, &a), Ordering::Equal);
        }

        #[test]
        fn prop_xor_cmp_antisymmetric(r in arb_hash(), a in arb_hash(), b in arb_hash()) {
            prop_assert_eq!(r.xor_cmp(&a, &b), r.xor_cmp(&b, &a).reverse());
        }

        #[test]
        fn prop_xor_cmp_transitive(r in arb_hash(), a in arb_hash(), b in arb_hash(), c in arb_hash()) {
            if r.xor_cmp(&a, &b) != Ordering::Greater && r.xor_cmp(&b, &c) != Ordering::Greater {
                prop_assert_ne!(r.xor_cmp(&a, &c), Ordering::Greater);
            }
        }

        #[test]
        fn prop_self_is_closest(r in arb_hash(), a in arb_hash()) {
            prop_assert_ne!(r.xor_cmp(&r, &a), Ordering::Greater);
        }

        #[test]
        fn prop_common_bits_matches_xor(a in arb_hash(), b in arb_hash()) {
            let bits = InfoHash::common_bits(&a, &b);
            let distance = a ^ b;
            match distance.lowbit() {
                None => prop_assert_eq!(bits, 8 * HASH_LEN),
                Some(_) => prop_assert!(distance.get_bit(bits)),
            }
        }
    }
}
