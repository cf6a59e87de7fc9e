//! Iterative searches
//!
//! A search tracks the nodes closest to one target across both address
//! families, together with the gets waiting on it and the values it keeps
//! announced. The engine drives it; this module only holds state and answers
//! questions about it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringdht_crypto::{InfoHash, NodeId};

use crate::engine::{DoneCallback, GetCallback};
use crate::node::{MAX_PINGS, NODE_EXPIRE_TIME};
use crate::value::{Filter, Value, ValueId};
use crate::{SEARCH_NODES, TARGET_NODES};

/// Reply deadline for one search request
pub(crate) const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A search with no live node for this long fails
pub(crate) const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Re-announce this long before the value would expire on the remote node
pub(crate) const REANNOUNCE_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A candidate node of a search
#[derive(Debug)]
pub(crate) struct SearchNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Last GetValues sent
    pub request_time: Option<Instant>,
    /// Last reply of any kind
    pub reply_time: Option<Instant>,
    /// Requests sent since the last reply
    pub pinged: u32,
    /// Write token from the last GetValues reply
    pub token: Vec<u8>,
    /// Values the node acknowledged, and when
    pub acked: HashMap<ValueId, Instant>,
    /// Last announce sent per value
    pub announced: HashMap<ValueId, Instant>,
    /// Values the node refused
    pub rejected: HashSet<ValueId>,
}

impl SearchNode {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            request_time: None,
            reply_time: None,
            pinged: 0,
            token: Vec::new(),
            acked: HashMap::new(),
            announced: HashMap::new(),
            rejected: HashSet::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.pinged >= MAX_PINGS
    }

    /// A GetValues is outstanding and has not timed out
    pub fn is_pending(&self, now: Instant) -> bool {
        match self.request_time {
            Some(sent) => {
                !self.replied_since(sent) && now.saturating_duration_since(sent) < SEARCH_REQUEST_TIMEOUT
            }
            None => false,
        }
    }

    pub fn replied_since(&self, t: Instant) -> bool {
        self.reply_time.map_or(false, |r| r >= t)
    }

    /// Replied recently enough that its token and view are usable
    pub fn is_synced(&self, now: Instant) -> bool {
        !self.is_dead()
            && !self.token.is_empty()
            && self
                .reply_time
                .map_or(false, |t| now.saturating_duration_since(t) < NODE_EXPIRE_TIME)
    }

    pub fn on_request(&mut self, now: Instant) {
        self.request_time = Some(now);
        self.pinged += 1;
    }

    pub fn on_reply(&mut self, now: Instant) {
        self.reply_time = Some(now);
        self.pinged = 0;
    }

    /// Whether `value` should be (re)announced to this node now
    pub fn needs_announce(&self, value: ValueId, expiration: Duration, now: Instant) -> bool {
        if self.rejected.contains(&value) {
            return false;
        }
        if let Some(sent) = self.announced.get(&value) {
            let acked_after = self.acked.get(&value).map_or(false, |a| a >= sent);
            if !acked_after && now.saturating_duration_since(*sent) < SEARCH_REQUEST_TIMEOUT {
                return false;
            }
        }
        match self.acked.get(&value) {
            Some(acked) => {
                now.saturating_duration_since(*acked) + REANNOUNCE_MARGIN >= expiration
            }
            None => true,
        }
    }
}

/// A get waiting on a search
pub(crate) struct GetRequest {
    pub callback: GetCallback,
    pub done: Option<DoneCallback>,
    pub filter: Option<Filter>,
    pub start: Instant,
    /// Digests of values already delivered
    pub seen: HashSet<InfoHash>,
}

impl GetRequest {
    pub fn new(
        callback: GetCallback,
        done: Option<DoneCallback>,
        filter: Option<Filter>,
        start: Instant,
    ) -> Self {
        Self {
            callback,
            done,
            filter,
            start,
            seen: HashSet::new(),
        }
    }

    /// Deliver the unseen values accepted by the filter; false once the
    /// callback asks to stop
    pub fn deliver(&mut self, values: &[Arc<Value>]) -> bool {
        let fresh: Vec<Arc<Value>> = values
            .iter()
            .filter(|v| {
                let value: &Value = v;
                self.filter.as_ref().map_or(true, |f| f(value))
            })
            .filter(|v| self.seen.insert(InfoHash::get(&v.pack())))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return true;
        }
        (self.callback)(&fresh)
    }

    pub fn finish(mut self, ok: bool) {
        if let Some(done) = self.done.take() {
            done(ok);
        }
    }
}

/// A value a search keeps announced
pub(crate) struct Announce {
    pub value: Arc<Value>,
    pub callback: Option<DoneCallback>,
}

impl Announce {
    pub fn finish(&mut self, ok: bool) {
        if let Some(done) = self.callback.take() {
            done(ok);
        }
    }
}

pub(crate) struct Search {
    pub target: InfoHash,
    /// Sorted by XOR distance to the target
    pub nodes: Vec<SearchNode>,
    pub gets: Vec<GetRequest>,
    pub announces: Vec<Announce>,
    /// Last time the search had a live node or was (re)started
    pub last_progress: Instant,
}

impl Search {
    pub fn new(target: InfoHash, now: Instant) -> Self {
        Self {
            target,
            nodes: Vec::new(),
            gets: Vec::new(),
            announces: Vec::new(),
            last_progress: now,
        }
    }

    /// Add a candidate; false if already known or too far to be kept
    pub fn insert_node(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        if self.nodes.iter().any(|n| n.id == id) {
            return false;
        }
        let target = self.target;
        let pos = self
            .nodes
            .partition_point(|n| target.xor_cmp(&n.id, &id) == std::cmp::Ordering::Less);
        if pos >= SEARCH_NODES {
            return false;
        }
        self.nodes.insert(pos, SearchNode::new(id, addr));
        if self.nodes.len() > SEARCH_NODES {
            // Prefer dropping a dead node over the farthest live one
            let drop = self
                .nodes
                .iter()
                .rposition(SearchNode::is_dead)
                .unwrap_or(self.nodes.len() - 1);
            self.nodes.remove(drop);
            return drop != pos;
        }
        true
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut SearchNode> {
        self.nodes.iter_mut().find(|n| n.id == *id)
    }

    /// Indices of the closest live nodes, at most TARGET_NODES
    pub fn target_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_dead())
            .map(|(i, _)| i)
            .take(TARGET_NODES)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_dead()).count()
    }

    /// Every target node replied after `since`
    pub fn is_synced_since(&self, since: Instant) -> bool {
        let targets = self.target_indices();
        !targets.is_empty() && targets.iter().all(|&i| self.nodes[i].replied_since(since))
    }

    pub fn in_flight(&self, now: Instant) -> usize {
        self.nodes.iter().filter(|n| n.is_pending(now)).count()
    }

    /// Nothing left to do
    pub fn is_idle(&self) -> bool {
        self.gets.is_empty() && self.announces.is_empty()
    }

    /// Fail every get and pending announce callback. Announced values are
    /// kept so they go out once nodes are known again.
    pub fn fail(&mut self) {
        for get in self.gets.drain(..) {
            get.finish(false);
        }
        for announce in &mut self.announces {
            announce.finish(false);
        }
    }
}
