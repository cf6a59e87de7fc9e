//! RingDHT Distributed Hash Table
//!
//! Kademlia-style DHT storing typed, optionally signed and encrypted values
//! under 160-bit InfoHashes, over UDP on IPv4 and IPv6.
//!
//! Layers, bottom up:
//! - [`value`]: values, their wire format and value types
//! - [`routing`]: buckets and the routing table
//! - [`engine`]: the single-threaded protocol engine ([`Dht`])
//! - [`securedht`]: signing, encryption and verification on top of it
//! - [`runner`]: sockets, threads and a thread-safe facade ([`DhtRunner`])

pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod persist;
pub mod protocol;
pub mod routing;
pub mod runner;
mod search;
pub mod securedht;
pub mod storage;
pub mod value;

pub use config::{DhtConfig, RunnerConfig};
pub use engine::{Dht, DhtStatus, DoneCallback, GetCallback, Transport};
pub use error::{DhtError, DhtResult};
pub use node::{AddressFamily, NodeEntry, NodeExport};
pub use routing::{Bucket, RoutingTable};
pub use runner::{DhtRunner, StatusCallback};
pub use securedht::{CertificateCallback, SecureDht};
pub use storage::DhtStorage;
pub use value::{
    CryptoFlags, Filter, ServiceAnnouncement, TypeStore, Value, ValueId, ValueType, ValueTypeId,
};

pub use ringdht_crypto::{InfoHash, NodeId};

/// Maximum nodes per bucket
pub const BUCKET_MAX_SIZE: usize = 8;

/// Candidate nodes tracked per search
pub const SEARCH_NODES: usize = 14;

/// Closest live nodes a search must sync with
pub const TARGET_NODES: usize = 8;

/// Requests in flight per search
pub const ALPHA: usize = 3;

/// Values stored under a single key
pub const MAX_VALUES: usize = 2048;

/// Distinct keys in local storage
pub const MAX_HASHES: usize = 16384;

/// Concurrent searches
pub const MAX_SEARCHES: usize = 1024;

/// Largest value payload, leaves room for headers in one datagram
pub const MAX_VALUE_SIZE: usize = 56 * 1024;

/// Largest UDP payload
pub const MAX_PACKET_SIZE: usize = 65507;

/// Incoming requests served per second
pub const MAX_REQUESTS_PER_SEC: u32 = 400;
