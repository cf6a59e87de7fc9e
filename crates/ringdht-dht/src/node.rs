//! DHT Node Information

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ringdht_crypto::NodeId;
use serde::{Deserialize, Serialize};

/// A node that has not replied for this long is no longer good
pub const NODE_GOOD_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// A node we have not heard from for this long is no longer good
pub const NODE_EXPIRE_TIME: Duration = Duration::from_secs(15 * 60);

/// Unanswered requests after which a node is considered dead
pub const MAX_PINGS: u32 = 3;

/// IP address family of a socket address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Node entry in routing table
#[derive(Clone, Debug)]
pub struct NodeEntry {
    /// Node identifier
    pub id: NodeId,

    /// Where the node talks from
    pub addr: SocketAddr,

    /// Last time we received anything from the node
    pub time: Instant,

    /// Last time the node answered one of our requests
    pub reply_time: Option<Instant>,

    /// Requests sent since the last reply
    pub pinged: u32,

    /// Last time we sent a request
    pub pinged_time: Option<Instant>,
}

impl NodeEntry {
    /// Entry for a node heard from at `now` that has not replied yet
    pub fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            time: now,
            reply_time: None,
            pinged: 0,
            pinged_time: None,
        }
    }

    /// Record a message from the node; `reply` marks an answer to our request
    pub fn received(&mut self, now: Instant, reply: bool) {
        self.time = now;
        if reply {
            self.reply_time = Some(now);
            self.pinged = 0;
        }
    }

    /// Record a request sent to the node
    pub fn requested(&mut self, now: Instant) {
        self.pinged += 1;
        self.pinged_time = Some(now);
    }

    /// Replied recently, heard from recently and not failing
    pub fn is_good(&self, now: Instant) -> bool {
        !self.is_expired()
            && self
                .reply_time
                .map_or(false, |t| now.saturating_duration_since(t) < NODE_GOOD_TIME)
            && now.saturating_duration_since(self.time) < NODE_EXPIRE_TIME
    }

    /// Too many unanswered requests
    pub fn is_expired(&self) -> bool {
        self.pinged >= MAX_PINGS
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }

    pub fn export(&self) -> NodeExport {
        NodeExport {
            id: self.id,
            addr: self.addr,
        }
    }
}

/// A node as exchanged with peers and persisted for bootstrapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeExport {
    pub id: NodeId,
    pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (NodeEntry, Instant) {
        let now = Instant::now();
        let e = NodeEntry::new(NodeId::from_bytes([1u8; 20]), "127.0.0.1:4222".parse().unwrap(), now);
        (e, now)
    }

    #[test]
    fn test_new_node_is_not_good() {
        let (e, now) = entry();
        assert!(!e.is_good(now));
        assert!(!e.is_expired());
    }

    #[test]
    fn test_reply_makes_good() {
        let (mut e, now) = entry();
        e.requested(now);
        e.received(now, true);
        assert_eq!(e.pinged, 0);
        assert!(e.is_good(now));
        assert!(!e.is_good(now + NODE_EXPIRE_TIME + Duration::from_secs(1)));
    }

    #[test]
    fn test_unanswered_requests_expire() {
        let (mut e, now) = entry();
        e.received(now, true);
        for _ in 0..MAX_PINGS {
            e.requested(now);
        }
        assert!(e.is_expired());
        assert!(!e.is_good(now));

        // A request from the node is not a reply
        e.received(now, false);
        assert!(e.is_expired());
    }

    #[test]
    fn test_family() {
        let (e, _) = entry();
        assert_eq!(e.family(), AddressFamily::V4);
        let v6: SocketAddr = "[::1]:4222".parse().unwrap();
        assert_eq!(AddressFamily::of(&v6), AddressFamily::V6);
    }
}
