//! Kademlia Routing Table
//!
//! Buckets partition the id space into contiguous ranges ordered by their
//! lower limit. The table starts with a single bucket covering everything
//! and splits a full bucket only when it contains our own id.
//!
//! Each bucket tracks three disjoint sets of nodes:
//! - connected nodes (`nodes`, at most [`BUCKET_MAX_SIZE`])
//! - known nodes: heard of, no connection attempted
//! - connecting nodes: a connection attempt is in progress

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use rand::seq::IteratorRandom;
use rand::Rng;
use ringdht_crypto::constants::HASH_LEN;
use ringdht_crypto::{InfoHash, NodeId};
use tracing::{debug, trace};

use crate::error::{DhtError, DhtResult};
use crate::node::NodeEntry;
use crate::BUCKET_MAX_SIZE;

/// A range of the id space and the nodes it holds
#[derive(Debug, Clone)]
pub struct Bucket {
    lower_limit: NodeId,
    nodes: BTreeMap<NodeId, NodeEntry>,
    known_nodes: BTreeSet<NodeId>,
    connecting_nodes: BTreeSet<NodeId>,
    time: Option<Instant>,
}

impl Bucket {
    /// Create a new empty bucket starting at `lower_limit`
    pub fn new(lower_limit: NodeId) -> Self {
        Self {
            lower_limit,
            nodes: BTreeMap::new(),
            known_nodes: BTreeSet::new(),
            connecting_nodes: BTreeSet::new(),
            time: None,
        }
    }

    pub fn lower_limit(&self) -> &NodeId {
        &self.lower_limit
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= BUCKET_MAX_SIZE
    }

    /// Number of connected nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connected, known and connecting nodes together
    pub fn population(&self) -> usize {
        self.nodes.len() + self.known_nodes.len() + self.connecting_nodes.len()
    }

    /// Add a connected node; fails if already present or the bucket is full
    pub fn add_node(&mut self, entry: NodeEntry) -> bool {
        if self.nodes.contains_key(&entry.id) || self.is_full() {
            return false;
        }
        self.connecting_nodes.remove(&entry.id);
        self.known_nodes.remove(&entry.id);
        self.nodes.insert(entry.id, entry);
        true
    }

    /// Remove a connected node
    pub fn delete_node(&mut self, id: &NodeId) -> bool {
        self.nodes.remove(id).is_some()
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(id)
    }

    /// Connected nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut NodeEntry> {
        self.nodes.values_mut()
    }

    /// Remember a node we heard of; fails if it is connected or already known
    pub fn add_known_node(&mut self, id: NodeId) -> bool {
        if self.nodes.contains_key(&id) || self.connecting_nodes.contains(&id) {
            return false;
        }
        self.known_nodes.insert(id)
    }

    pub fn remove_known_node(&mut self, id: &NodeId) -> bool {
        self.known_nodes.remove(id)
    }

    pub fn has_known_node(&self, id: &NodeId) -> bool {
        self.known_nodes.contains(id)
    }

    pub fn known_nodes(&self) -> &BTreeSet<NodeId> {
        &self.known_nodes
    }

    /// Mark a connection attempt; the node leaves the known set
    pub fn add_connecting_node(&mut self, id: NodeId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.known_nodes.remove(&id);
        self.connecting_nodes.insert(id)
    }

    pub fn remove_connecting_node(&mut self, id: &NodeId) -> bool {
        self.connecting_nodes.remove(id)
    }

    pub fn has_connecting_node(&self, id: &NodeId) -> bool {
        self.connecting_nodes.contains(id)
    }

    pub fn connecting_nodes(&self) -> &BTreeSet<NodeId> {
        &self.connecting_nodes
    }

    /// Up to `n` distinct known nodes chosen uniformly; all of them if there
    /// are no more than `n`
    pub fn get_known_nodes_random<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<NodeId> {
        if self.known_nodes.len() <= n {
            return self.known_nodes.iter().copied().collect();
        }
        self.known_nodes.iter().copied().choose_multiple(rng, n)
    }

    /// Last time a node of this bucket replied
    pub fn time(&self) -> Option<Instant> {
        self.time
    }

    pub fn touch(&mut self, now: Instant) {
        self.time = Some(now);
    }
}

/// Kademlia routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our node ID
    id: NodeId,
    /// Buckets ordered by lower limit, first one at zero
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create a new routing table with one bucket covering the id space
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            buckets: vec![Bucket::new(InfoHash::zero())],
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn bucket_mut(&mut self, index: usize) -> Option<&mut Bucket> {
        self.buckets.get_mut(index)
    }

    /// Index of the bucket whose range contains `id`
    pub fn find_bucket(&self, id: &NodeId) -> usize {
        self.buckets
            .partition_point(|b| b.lower_limit <= *id)
            .saturating_sub(1)
    }

    /// Does bucket `index` cover `id`?
    pub fn contains(&self, index: usize, id: &NodeId) -> bool {
        let Some(bucket) = self.buckets.get(index) else {
            return false;
        };
        bucket.lower_limit <= *id
            && self
                .buckets
                .get(index + 1)
                .map_or(true, |next| *id < next.lower_limit)
    }

    /// Number of leading bits shared by every id of bucket `index`
    pub fn depth(&self, index: usize) -> usize {
        let own = self.buckets[index].lower_limit.lowbit();
        let next = self
            .buckets
            .get(index + 1)
            .and_then(|b| b.lower_limit.lowbit());
        own.max(next).map_or(0, |bit| bit + 1)
    }

    /// Lower limit of the upper half of bucket `index`
    pub fn middle(&self, index: usize) -> DhtResult<NodeId> {
        let depth = self.depth(index);
        if depth >= 8 * HASH_LEN {
            return Err(DhtError::TableExhausted(depth));
        }
        let mut id = self.buckets[index].lower_limit;
        id.set_bit(depth, true);
        Ok(id)
    }

    /// Split bucket `index` in two, redistributing every node it tracks
    pub fn split(&mut self, index: usize) -> DhtResult<()> {
        let middle = self.middle(index)?;
        let bucket = &mut self.buckets[index];

        let mut upper = Bucket::new(middle);
        upper.nodes = bucket.nodes.split_off(&middle);
        upper.known_nodes = bucket.known_nodes.split_off(&middle);
        upper.connecting_nodes = bucket.connecting_nodes.split_off(&middle);
        upper.time = bucket.time;

        debug!(
            "Split bucket {} at {:?}: {} / {} nodes",
            index,
            middle,
            bucket.len(),
            upper.len()
        );
        self.buckets.insert(index + 1, upper);
        Ok(())
    }

    /// Add a connected node, splitting our own bucket as needed
    ///
    /// Returns false if the node is already present, is ourselves, or falls
    /// in a full bucket that does not contain our id.
    pub fn add_node(&mut self, entry: NodeEntry) -> DhtResult<bool> {
        let id = entry.id;
        if id == self.id {
            return Ok(false);
        }

        let mut index = self.find_bucket(&id);
        if self.buckets[index].has_node(&id) {
            return Ok(false);
        }

        while self.buckets[index].is_full() {
            let own = self.id;
            if !self.contains(index, &own) {
                trace!("Bucket {} full, not adding {:?}", index, id);
                return Ok(false);
            }
            self.split(index)?;
            index = self.find_bucket(&id);
        }

        let added = self.buckets[index].add_node(entry);
        if added {
            trace!("Added node {:?} to bucket {}", id, index);
        }
        Ok(added)
    }

    /// Remove a connected node
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        let index = self.find_bucket(id);
        self.buckets[index].delete_node(id)
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.buckets[self.find_bucket(id)].has_node(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.buckets[self.find_bucket(id)].get_node(id)
    }

    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut NodeEntry> {
        let index = self.find_bucket(id);
        self.buckets[index].get_node_mut(id)
    }

    pub fn add_known_node(&mut self, id: NodeId) -> bool {
        if id == self.id {
            return false;
        }
        let index = self.find_bucket(&id);
        self.buckets[index].add_known_node(id)
    }

    pub fn remove_known_node(&mut self, id: &NodeId) -> bool {
        let index = self.find_bucket(id);
        self.buckets[index].remove_known_node(id)
    }

    pub fn has_known_node(&self, id: &NodeId) -> bool {
        self.buckets[self.find_bucket(id)].has_known_node(id)
    }

    pub fn add_connecting_node(&mut self, id: NodeId) -> bool {
        if id == self.id {
            return false;
        }
        let index = self.find_bucket(&id);
        self.buckets[index].add_connecting_node(id)
    }

    pub fn remove_connecting_node(&mut self, id: &NodeId) -> bool {
        let index = self.find_bucket(id);
        self.buckets[index].remove_connecting_node(id)
    }

    pub fn has_connecting_node(&self, id: &NodeId) -> bool {
        self.buckets[self.find_bucket(id)].has_connecting_node(id)
    }

    /// Random known nodes from the bucket covering `reference`
    pub fn get_known_nodes_random<R: Rng + ?Sized>(
        &self,
        reference: &NodeId,
        n: usize,
        rng: &mut R,
    ) -> Vec<NodeId> {
        self.buckets[self.find_bucket(reference)].get_known_nodes_random(n, rng)
    }

    /// Up to `count` connected nodes sorted by XOR distance to `target`
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut all: Vec<NodeEntry> = self.nodes().cloned().collect();
        all.sort_by(|a, b| target.xor_cmp(&a.id, &b.id));
        all.truncate(count);
        all
    }

    /// A random id inside the range of bucket `index`
    pub fn random_id<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> NodeId {
        let depth = self.depth(index).min(8 * HASH_LEN);
        let lower = self.buckets[index].lower_limit;
        let mut id = InfoHash::random_with(rng);
        for bit in 0..depth {
            id.set_bit(bit, lower.get_bit(bit));
        }
        id
    }

    /// All connected nodes
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.buckets.iter().flat_map(|b| b.nodes())
    }

    /// Total number of connected nodes
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Connected nodes that are good at `now`
    pub fn good_count(&self, now: Instant) -> usize {
        self.nodes().filter(|n| n.is_good(now)).count()
    }
}
