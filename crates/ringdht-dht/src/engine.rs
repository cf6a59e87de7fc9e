//! DHT Protocol Engine
//!
//! [`Dht`] is single-threaded and does no I/O of its own besides sending
//! through its [`Transport`]. The owner feeds it received datagrams and calls
//! [`Dht::periodic`] again after the delay it returns. Get and put results are
//! delivered through callbacks invoked from inside those calls.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringdht_crypto::{InfoHash, NodeId};
use tracing::{debug, error, info, trace, warn};

use crate::config::DhtConfig;
use crate::error::DhtResult;
use crate::node::{AddressFamily, NodeEntry, NodeExport, MAX_PINGS, NODE_EXPIRE_TIME};
use crate::protocol::{
    error_code, DhtMessage, DhtRequest, DhtResponse, RpcMessage, TransactionId, WANT4, WANT6,
};
use crate::routing::RoutingTable;
use crate::search::{Announce, GetRequest, Search, SEARCH_REQUEST_TIMEOUT, SEARCH_TIMEOUT};
use crate::storage::{DhtStorage, StoreStatus};
use crate::value::{Filter, TypeStore, Value, ValueId, ValueType, INVALID_ID};
use crate::{ALPHA, BUCKET_MAX_SIZE, MAX_PACKET_SIZE, SEARCH_NODES, TARGET_NODES};

/// Receives values found by a get; returning false ends the get
pub type GetCallback = Box<dyn FnMut(&[Arc<Value>]) -> bool + Send>;

/// Called once when an operation completes, with its success
pub type DoneCallback = Box<dyn FnOnce(bool) + Send>;

/// Sends datagrams on behalf of the engine
pub trait Transport: Send {
    /// Send one datagram
    fn send_to(&self, data: &[u8], addr: &SocketAddr) -> std::io::Result<usize>;

    /// Whether this address family can be reached at all
    fn supports(&self, family: AddressFamily) -> bool;
}

/// Connectivity of one address family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtStatus {
    /// No node in the routing table
    Disconnected,
    /// Nodes known, none confirmed good
    Connecting,
    /// At least one good node
    Connected,
}

impl fmt::Display for DhtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtStatus::Disconnected => write!(f, "disconnected"),
            DhtStatus::Connecting => write!(f, "connecting"),
            DhtStatus::Connected => write!(f, "connected"),
        }
    }
}

const TOKEN_SIZE: usize = 16;

/// Maintenance period once connected
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Maintenance period while looking for nodes
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(5);

const STORAGE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Wake-up period while a search has work in flight
const SEARCH_STEP_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum delay between pings of a dubious node
const DUBIOUS_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Buckets not refreshed for this long get a random lookup
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Addresses remembered for known, not yet connected nodes
const MAX_ADDRESS_BOOK: usize = 4096;

/// Packed value bytes per GetValues reply, leaving room for the node lists
const MAX_VALUES_PAYLOAD: usize = MAX_PACKET_SIZE - 4096;

#[derive(Clone, Copy, Debug)]
enum RequestKind {
    Ping,
    FindNode,
    GetValues { target: InfoHash },
    Announce { target: InfoHash, value_id: ValueId },
}

#[derive(Debug)]
struct PendingRequest {
    addr: SocketAddr,
    /// Id the destination is believed to have
    expected: Option<NodeId>,
    kind: RequestKind,
    sent: Instant,
}

enum Outgoing {
    Get,
    Announce { value: Arc<Value>, token: Vec<u8> },
}

struct RateLimiter {
    max: u32,
    window: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(max: u32, now: Instant) -> Self {
        Self { max, window: now, count: 0 }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window) >= Duration::from_secs(1) {
            self.window = now;
            self.count = 0;
        }
        if self.count >= self.max {
            return false;
        }
        self.count += 1;
        true
    }
}

/// The DHT protocol engine
pub struct Dht {
    id: NodeId,
    transport: Box<dyn Transport>,
    config: DhtConfig,
    types: TypeStore,
    table4: RoutingTable,
    table6: RoutingTable,
    /// Where to reach known nodes once we try to connect
    address_book: HashMap<NodeId, SocketAddr>,
    storage: DhtStorage,
    searches: HashMap<InfoHash, Search>,
    pending: HashMap<TransactionId, PendingRequest>,
    next_tid: TransactionId,
    secret: [u8; 32],
    old_secret: [u8; 32],
    rotate_secrets_at: Instant,
    next_maintenance: Instant,
    next_storage_maintenance: Instant,
    limiter: RateLimiter,
    rng: StdRng,
}

impl Dht {
    /// Engine with default limits
    pub fn new(id: NodeId, transport: Box<dyn Transport>) -> Self {
        let now = Instant::now();
        let config = DhtConfig::default();
        let mut rng = StdRng::from_entropy();
        let secret = rng.gen();
        let old_secret = rng.gen();
        let next_tid = rng.gen();

        info!("DHT engine {} started", id);
        Self {
            id,
            transport,
            types: TypeStore::new(),
            table4: RoutingTable::new(id),
            table6: RoutingTable::new(id),
            address_book: HashMap::new(),
            storage: DhtStorage::with_limits(config.max_hashes, config.max_values),
            searches: HashMap::new(),
            pending: HashMap::new(),
            next_tid,
            secret,
            old_secret,
            rotate_secrets_at: now + Self::secret_lifetime(&mut rng),
            next_maintenance: now,
            next_storage_maintenance: now + STORAGE_MAINTENANCE_INTERVAL,
            limiter: RateLimiter::new(config.max_requests_per_sec, now),
            config,
            rng,
        }
    }

    /// Engine with custom limits
    pub fn with_config(id: NodeId, transport: Box<dyn Transport>, config: DhtConfig) -> DhtResult<Self> {
        config.validate()?;
        let mut dht = Self::new(id, transport);
        dht.storage = DhtStorage::with_limits(config.max_hashes, config.max_values);
        dht.limiter = RateLimiter::new(config.max_requests_per_sec, Instant::now());
        dht.config = config;
        Ok(dht)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Register or replace a value type
    pub fn register_type(&mut self, t: ValueType) {
        debug!("Registered value type {} ({})", t.id, t.name);
        self.types.register(t);
    }

    pub fn types(&self) -> &TypeStore {
        &self.types
    }

    fn table(&self, family: AddressFamily) -> &RoutingTable {
        match family {
            AddressFamily::V4 => &self.table4,
            AddressFamily::V6 => &self.table6,
        }
    }

    fn table_mut(&mut self, family: AddressFamily) -> &mut RoutingTable {
        match family {
            AddressFamily::V4 => &mut self.table4,
            AddressFamily::V6 => &mut self.table6,
        }
    }

    /// Routing table of `family`
    pub fn routing_table(&self, family: AddressFamily) -> &RoutingTable {
        self.table(family)
    }

    /// Connectivity of `family`
    pub fn status(&self, family: AddressFamily) -> DhtStatus {
        let table = self.table(family);
        if table.is_empty() {
            DhtStatus::Disconnected
        } else if table.good_count(Instant::now()) == 0 {
            DhtStatus::Connecting
        } else {
            DhtStatus::Connected
        }
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.table4.has_node(id) || self.table6.has_node(id)
    }

    /// Good nodes, those of our own bucket first
    pub fn export_nodes(&self) -> Vec<NodeExport> {
        let now = Instant::now();
        let mut out = Vec::new();
        for table in [&self.table4, &self.table6] {
            let own = table.find_bucket(&self.id);
            let Some(bucket) = table.bucket(own) else {
                continue;
            };
            out.extend(bucket.nodes().filter(|n| n.is_good(now)).map(|n| n.export()));
            for (i, b) in table.buckets().iter().enumerate() {
                if i != own {
                    out.extend(b.nodes().filter(|n| n.is_good(now)).map(|n| n.export()));
                }
            }
        }
        out
    }

    /// Make `id` at `addr` known and try to connect to it
    pub fn insert_node(&mut self, id: NodeId, addr: SocketAddr) {
        let family = AddressFamily::of(&addr);
        if id == self.id || is_martian(&addr) || !self.transport.supports(family) {
            return;
        }
        let now = Instant::now();
        if self.table(family).has_node(&id) {
            return;
        }
        self.table_mut(family).add_connecting_node(id);
        self.send_request(addr, Some(id), RequestKind::Ping, DhtRequest::Ping { sender_id: self.id }, now);
    }

    /// Ping a node whose id we do not know
    pub fn ping_node(&mut self, addr: SocketAddr) {
        if is_martian(&addr) || !self.transport.supports(AddressFamily::of(&addr)) {
            debug!("Not pinging unreachable address {}", addr);
            return;
        }
        debug!("Pinging {}", addr);
        self.send_request(addr, None, RequestKind::Ping, DhtRequest::Ping { sender_id: self.id }, Instant::now());
    }

    /// Values stored locally under `key`
    pub fn get_local(&self, key: &InfoHash, filter: Option<&Filter>) -> Vec<Arc<Value>> {
        self.storage.get_values(key, filter)
    }

    pub fn get_local_by_id(&self, key: &InfoHash, id: ValueId) -> Option<Arc<Value>> {
        self.storage.get_value(key, id)
    }

    /// Find values under `key`
    ///
    /// Local values are delivered first, then values returned by the nodes
    /// closest to `key`. `done` receives true once every target node answered
    /// or the callback stopped the get, false on timeout.
    pub fn get(
        &mut self,
        key: InfoHash,
        callback: GetCallback,
        done: Option<DoneCallback>,
        filter: Option<Filter>,
    ) {
        let now = Instant::now();
        let mut get = GetRequest::new(callback, done, filter, now);

        let local = self.storage.get_values(&key, None);
        if !local.is_empty() && !get.deliver(&local) {
            get.finish(true);
            return;
        }
        if !self.ensure_search(key, now) {
            warn!("Too many searches, failing get on {:?}", key);
            get.finish(false);
            return;
        }
        if let Some(search) = self.searches.get_mut(&key) {
            search.gets.push(get);
        }
        self.search_step(key, now);
    }

    /// Store `value` locally and announce it to the nodes closest to `key`
    ///
    /// A value without id gets a random one. The value keeps being
    /// re-announced until [`cancel_put`](Self::cancel_put). `done` receives
    /// true on the first acknowledgement, and false right away when local
    /// storage has no room for the value.
    pub fn put(&mut self, key: InfoHash, mut value: Value, done: Option<DoneCallback>) {
        let now = Instant::now();
        if value.id == INVALID_ID {
            value.id = self.rng.gen_range(1..=u64::MAX);
        }
        let value = Arc::new(value);
        debug!("Put {:?} under {:?}", value, key);
        if !self.storage.insert(key, value.clone(), now) {
            warn!("Local storage full, failing put on {:?}", key);
            if let Some(done) = done {
                done(false);
            }
            return;
        }

        if !self.ensure_search(key, now) {
            warn!("Too many searches, failing put on {:?}", key);
            if let Some(done) = done {
                done(false);
            }
            return;
        }
        if let Some(search) = self.searches.get_mut(&key) {
            let id = value.id;
            for node in &mut search.nodes {
                node.acked.remove(&id);
                node.announced.remove(&id);
                node.rejected.remove(&id);
            }
            match search.announces.iter_mut().find(|a| a.value.id == id) {
                Some(existing) => {
                    existing.finish(false);
                    existing.value = value;
                    existing.callback = done;
                }
                None => search.announces.push(Announce { value, callback: done }),
            }
        }
        self.search_step(key, now);
    }

    /// Stop announcing value `id` under `key`
    pub fn cancel_put(&mut self, key: &InfoHash, id: ValueId) -> bool {
        let Some(search) = self.searches.get_mut(key) else {
            return false;
        };
        let Some(pos) = search.announces.iter().position(|a| a.value.id == id) else {
            return false;
        };
        search.announces.remove(pos).finish(false);
        if search.is_idle() {
            self.searches.remove(key);
        }
        true
    }

    /// Active searches
    pub fn search_count(&self) -> usize {
        self.searches.len()
    }

    pub fn export_values(&self) -> Vec<(InfoHash, Vec<u8>)> {
        self.storage.export_values(Instant::now())
    }

    /// Load values saved by [`export_values`](Self::export_values), bypassing
    /// store policies
    pub fn import_values(&mut self, blobs: &[(InfoHash, Vec<u8>)]) -> usize {
        let imported = self.storage.import_values(blobs, Instant::now(), &self.types);
        info!("Imported {} values", imported);
        imported
    }

    /// Process an optional datagram, run due work and return how long the
    /// caller may wait before calling again
    pub fn periodic(&mut self, packet: Option<(&[u8], SocketAddr)>, now: Instant) -> Duration {
        if let Some((buf, from)) = packet {
            self.process_packet(buf, from, now);
        }

        self.expire_pending(now);

        if now >= self.rotate_secrets_at {
            self.rotate_secrets(now);
        }
        if now >= self.next_maintenance {
            self.maintenance(now);
            let connected = [AddressFamily::V4, AddressFamily::V6]
                .into_iter()
                .any(|f| self.status(f) == DhtStatus::Connected);
            self.next_maintenance = now + if connected { MAINTENANCE_INTERVAL } else { BOOTSTRAP_INTERVAL };
        }
        if now >= self.next_storage_maintenance {
            self.storage.expire(now, &self.types);
            self.next_storage_maintenance = now + STORAGE_MAINTENANCE_INTERVAL;
        }

        self.step_searches(now);

        let mut wake = self
            .next_maintenance
            .min(self.next_storage_maintenance)
            .min(self.rotate_secrets_at);
        let busy = !self.pending.is_empty()
            || self
                .searches
                .values()
                .any(|s| !s.gets.is_empty() || s.announces.iter().any(|a| a.callback.is_some()));
        if busy {
            wake = wake.min(now + SEARCH_STEP_INTERVAL);
        }
        wake.saturating_duration_since(now)
    }

    // --- Incoming messages ---

    fn process_packet(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        if is_martian(&from) {
            trace!("Dropping packet from martian address {}", from);
            return;
        }
        let msg = match RpcMessage::from_bytes(buf) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };
        let sender = msg.message.sender_id();
        if sender == self.id {
            trace!("Dropping packet from our own id at {}", from);
            return;
        }

        let tid = msg.tid;
        match msg.message {
            DhtMessage::Request(request) => {
                if !self.limiter.allow(now) {
                    trace!("Rate limit reached, dropping request from {}", from);
                    return;
                }
                self.on_new_node(sender, from, now, false);
                let response = self.handle_request(request, from, now);
                self.send(&RpcMessage::new(tid, DhtMessage::Response(response)), from);
            }
            DhtMessage::Response(response) => self.handle_response(tid, sender, response, from, now),
        }
    }

    fn handle_request(&mut self, request: DhtRequest, from: SocketAddr, now: Instant) -> DhtResponse {
        match request {
            DhtRequest::Ping { .. } => {
                trace!("Ping from {}", from);
                DhtResponse::Pong { sender_id: self.id }
            }
            DhtRequest::FindNode { target, want, .. } => self.nodes_reply(&target, want, from, Vec::new()),
            DhtRequest::GetValues { key, want, .. } => {
                let values = self.pack_values(&key);
                trace!("GetValues {:?} from {}: {} values", key, from, values.len());
                self.nodes_reply(&key, want, from, values)
            }
            DhtRequest::AnnounceValue {
                sender_id,
                key,
                value,
                token,
            } => self.handle_announce(sender_id, key, &value, &token, from, now),
        }
    }

    fn nodes_reply(&self, target: &InfoHash, want: u8, from: SocketAddr, values: Vec<Vec<u8>>) -> DhtResponse {
        let want = if want == 0 {
            match AddressFamily::of(&from) {
                AddressFamily::V4 => WANT4,
                AddressFamily::V6 => WANT6,
            }
        } else {
            want
        };
        let closest = |table: &RoutingTable| -> Vec<NodeExport> {
            table
                .closest_nodes(target, TARGET_NODES)
                .iter()
                .filter(|n| !n.is_expired())
                .map(|n| n.export())
                .collect()
        };
        DhtResponse::Nodes {
            sender_id: self.id,
            nodes4: if want & WANT4 != 0 { closest(&self.table4) } else { Vec::new() },
            nodes6: if want & WANT6 != 0 { closest(&self.table6) } else { Vec::new() },
            token: self.make_token(&from, false),
            values,
        }
    }

    fn pack_values(&self, key: &InfoHash) -> Vec<Vec<u8>> {
        let mut total = 0;
        let mut out = Vec::new();
        for value in self.storage.get_values(key, None) {
            let packed = value.pack();
            total += packed.len() + 8;
            if total > MAX_VALUES_PAYLOAD {
                debug!("Truncating values under {:?} to {}", key, out.len());
                break;
            }
            out.push(packed);
        }
        out
    }

    fn handle_announce(
        &mut self,
        sender_id: NodeId,
        key: InfoHash,
        packed: &[u8],
        token: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> DhtResponse {
        let error = |code: u16, message: &str| DhtResponse::Error {
            sender_id: self.id,
            code,
            message: message.to_string(),
        };
        if !self.token_match(token, &from) {
            debug!("Invalid token from {} for {:?}", from, key);
            return error(error_code::UNAUTHORIZED, "invalid token");
        }
        let value = match Value::unpack(packed) {
            Ok(v) => v,
            Err(e) => {
                debug!("Malformed value from {}: {}", from, e);
                return error(error_code::MALFORMED, "malformed value");
            }
        };
        let value_id = value.id;
        match self
            .storage
            .store(&key, Arc::new(value), &sender_id, &from, now, &self.types)
        {
            StoreStatus::Full => error(error_code::STORAGE_FULL, "storage full"),
            StoreStatus::Rejected => {
                debug!("Value {:016x} from {} rejected under {:?}", value_id, from, key);
                error(error_code::REJECTED, "rejected by policy")
            }
            status => {
                trace!("Value {:016x} under {:?} from {}: {:?}", value_id, key, from, status);
                DhtResponse::ValueAnnounced {
                    sender_id: self.id,
                    value_id,
                }
            }
        }
    }

    fn handle_response(
        &mut self,
        tid: TransactionId,
        sender: NodeId,
        response: DhtResponse,
        from: SocketAddr,
        now: Instant,
    ) {
        let Some(pending) = self.pending.remove(&tid) else {
            trace!("No pending request for tid {} from {}", tid, from);
            return;
        };
        if pending.addr != from {
            debug!("Response for tid {} from {}, expected {}", tid, from, pending.addr);
            self.pending.insert(tid, pending);
            return;
        }
        if let Some(expected) = pending.expected {
            if expected != sender {
                debug!("Node at {} changed id from {:?} to {:?}", from, expected, sender);
                let table = self.table_mut(AddressFamily::of(&from));
                table.remove_node(&expected);
                table.remove_connecting_node(&expected);
            }
        }
        self.on_new_node(sender, from, now, true);

        if let DhtResponse::Error { code, message, .. } = &response {
            debug!("Error {} from {}: {}", code, from, message);
            match pending.kind {
                RequestKind::Announce { target, value_id } => {
                    if let Some(node) = self.searches.get_mut(&target).and_then(|s| s.node_mut(&sender)) {
                        node.on_reply(now);
                        node.rejected.insert(value_id);
                    }
                }
                RequestKind::GetValues { target } => {
                    if let Some(node) = self.searches.get_mut(&target).and_then(|s| s.node_mut(&sender)) {
                        node.pinged = MAX_PINGS;
                    }
                }
                RequestKind::Ping | RequestKind::FindNode => {}
            }
            return;
        }

        match (pending.kind, response) {
            (RequestKind::Ping, DhtResponse::Pong { .. }) => {
                trace!("Pong from {:?} at {}", sender, from);
            }
            (RequestKind::FindNode, DhtResponse::Nodes { nodes4, nodes6, .. }) => {
                self.learn_nodes(&nodes4);
                self.learn_nodes(&nodes6);
            }
            (
                RequestKind::GetValues { target },
                DhtResponse::Nodes {
                    nodes4,
                    nodes6,
                    token,
                    values,
                    ..
                },
            ) => {
                self.learn_nodes(&nodes4);
                self.learn_nodes(&nodes6);
                self.on_values_reply(target, sender, from, nodes4.into_iter().chain(nodes6), token, &values, now);
            }
            (RequestKind::Announce { target, value_id }, DhtResponse::ValueAnnounced { .. }) => {
                self.on_announce_reply(target, sender, value_id, now);
            }
            (kind, response) => {
                debug!("Unexpected response to {:?} from {}: {:?}", kind, from, response);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_values_reply(
        &mut self,
        target: InfoHash,
        sender: NodeId,
        from: SocketAddr,
        nodes: impl Iterator<Item = NodeExport>,
        token: Vec<u8>,
        values: &[Vec<u8>],
        now: Instant,
    ) {
        let values: Vec<Arc<Value>> = values
            .iter()
            .filter_map(|packed| match Value::unpack(packed) {
                Ok(v) => Some(Arc::new(v)),
                Err(e) => {
                    debug!("Dropping malformed value from {}: {}", from, e);
                    None
                }
            })
            .collect();

        let my_id = self.id;
        let supports4 = self.transport.supports(AddressFamily::V4);
        let supports6 = self.transport.supports(AddressFamily::V6);
        let Some(search) = self.searches.get_mut(&target) else {
            return;
        };

        if search.node_mut(&sender).is_none() {
            search.insert_node(sender, from);
        }
        if let Some(node) = search.node_mut(&sender) {
            node.on_reply(now);
            node.token = token;
        }
        search.last_progress = now;

        for n in nodes {
            let reachable = match AddressFamily::of(&n.addr) {
                AddressFamily::V4 => supports4,
                AddressFamily::V6 => supports6,
            };
            if n.id != my_id && reachable && !is_martian(&n.addr) {
                search.insert_node(n.id, n.addr);
            }
        }

        if values.is_empty() {
            return;
        }
        for mut get in std::mem::take(&mut search.gets) {
            if get.deliver(&values) {
                search.gets.push(get);
            } else {
                get.finish(true);
            }
        }
    }

    fn on_announce_reply(&mut self, target: InfoHash, sender: NodeId, value_id: ValueId, now: Instant) {
        let Some(search) = self.searches.get_mut(&target) else {
            return;
        };
        if let Some(node) = search.node_mut(&sender) {
            node.on_reply(now);
            node.acked.insert(value_id, now);
        }
        if let Some(announce) = search.announces.iter_mut().find(|a| a.value.id == value_id) {
            if announce.callback.is_some() {
                debug!("Value {:016x} announced under {:?}", value_id, target);
            }
            announce.finish(true);
        }
    }

    // --- Routing table ---

    /// Record a message from `id` at `addr`; `reply` if it answered us
    fn on_new_node(&mut self, id: NodeId, addr: SocketAddr, now: Instant, reply: bool) {
        if id == self.id || id.is_zero() {
            return;
        }
        let family = AddressFamily::of(&addr);
        let table = match family {
            AddressFamily::V4 => &mut self.table4,
            AddressFamily::V6 => &mut self.table6,
        };

        if let Some(node) = table.get_node_mut(&id) {
            if node.addr != addr {
                if !reply {
                    return;
                }
                debug!("Node {:?} moved from {} to {}", id, node.addr, addr);
                node.addr = addr;
            }
            node.received(now, reply);
            if reply {
                let index = table.find_bucket(&id);
                if let Some(bucket) = table.bucket_mut(index) {
                    bucket.touch(now);
                }
            }
            return;
        }

        let mut entry = NodeEntry::new(id, addr, now);
        if reply {
            entry.received(now, true);
        }
        let was_empty = table.is_empty();
        let added = match table.add_node(entry.clone()) {
            Ok(true) => true,
            Ok(false) => {
                let index = table.find_bucket(&id);
                let expired = table
                    .bucket(index)
                    .and_then(|b| b.nodes().find(|n| n.is_expired()).map(|n| n.id));
                match expired {
                    Some(old) => {
                        debug!("Replacing expired node {:?} with {:?}", old, id);
                        table.remove_node(&old);
                        matches!(table.add_node(entry), Ok(true))
                    }
                    None => {
                        if table.add_known_node(id)
                            && (self.address_book.len() < MAX_ADDRESS_BOOK || self.address_book.contains_key(&id))
                        {
                            self.address_book.insert(id, addr);
                        }
                        false
                    }
                }
            }
            Err(e) => {
                error!("Cannot insert node {:?}: {}", id, e);
                false
            }
        };

        if added {
            debug!("New {} node {:?} at {}", family, id, addr);
            self.address_book.remove(&id);
            if was_empty {
                // First contact: look up our own neighbourhood through it
                self.send_request(
                    addr,
                    Some(id),
                    RequestKind::FindNode,
                    DhtRequest::FindNode {
                        sender_id: self.id,
                        target: self.id,
                        want: self.want(),
                    },
                    now,
                );
            }
        }
    }

    /// Remember nodes from a reply as known
    fn learn_nodes(&mut self, nodes: &[NodeExport]) {
        for n in nodes {
            let family = AddressFamily::of(&n.addr);
            if n.id == self.id || is_martian(&n.addr) || !self.transport.supports(family) {
                continue;
            }
            let table = match family {
                AddressFamily::V4 => &mut self.table4,
                AddressFamily::V6 => &mut self.table6,
            };
            if table.has_node(&n.id) || table.has_connecting_node(&n.id) {
                continue;
            }
            table.add_known_node(n.id);
            if self.address_book.len() < MAX_ADDRESS_BOOK || self.address_book.contains_key(&n.id) {
                self.address_book.insert(n.id, n.addr);
            }
        }
    }

    fn maintenance(&mut self, now: Instant) {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            if self.transport.supports(family) {
                self.table_maintenance(family, now);
            }
        }
    }

    fn table_maintenance(&mut self, family: AddressFamily, now: Instant) {
        let table = match family {
            AddressFamily::V4 => &self.table4,
            AddressFamily::V6 => &self.table6,
        };

        let mut dead = Vec::new();
        let mut dubious = Vec::new();
        for node in table.nodes() {
            if node.is_expired() {
                if now.saturating_duration_since(node.time) > NODE_EXPIRE_TIME {
                    dead.push(node.id);
                }
                continue;
            }
            let recently_pinged = node
                .pinged_time
                .map_or(false, |t| now.saturating_duration_since(t) < DUBIOUS_PING_INTERVAL);
            if !node.is_good(now) && !recently_pinged {
                dubious.push((node.id, node.addr));
            }
        }

        let mut connect = Vec::new();
        let mut refresh = None;
        for (index, bucket) in table.buckets().iter().enumerate() {
            let room = BUCKET_MAX_SIZE.saturating_sub(bucket.len() + bucket.connecting_nodes().len());
            if room > 0 {
                connect.extend(bucket.get_known_nodes_random(room, &mut self.rng));
            }
            let stale = bucket
                .time()
                .map_or(true, |t| now.saturating_duration_since(t) > BUCKET_REFRESH_INTERVAL);
            if refresh.is_none() && stale && !bucket.is_empty() {
                refresh = Some(table.random_id(index, &mut self.rng));
            }
        }

        let mut lookups: Vec<(NodeId, SocketAddr, NodeId)> = table
            .closest_nodes(&self.id, ALPHA)
            .into_iter()
            .filter(|n| !n.is_expired())
            .map(|n| (n.id, n.addr, self.id))
            .collect();
        if let Some(target) = refresh {
            if let Some(n) = table.closest_nodes(&target, 1).into_iter().next() {
                lookups.push((n.id, n.addr, target));
            }
        }

        for id in dead {
            debug!("Removing dead node {:?}", id);
            self.table_mut(family).remove_node(&id);
        }
        for (id, addr) in dubious {
            self.send_request(addr, Some(id), RequestKind::Ping, DhtRequest::Ping { sender_id: self.id }, now);
        }
        for id in connect {
            match self.address_book.get(&id).copied() {
                Some(addr) => {
                    trace!("Connecting to known node {:?} at {}", id, addr);
                    self.table_mut(family).add_connecting_node(id);
                    self.send_request(addr, Some(id), RequestKind::Ping, DhtRequest::Ping { sender_id: self.id }, now);
                }
                None => {
                    self.table_mut(family).remove_known_node(&id);
                }
            }
        }
        let want = self.want();
        for (id, addr, target) in lookups {
            self.send_request(
                addr,
                Some(id),
                RequestKind::FindNode,
                DhtRequest::FindNode {
                    sender_id: self.id,
                    target,
                    want,
                },
                now,
            );
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent) >= SEARCH_REQUEST_TIMEOUT)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            let Some(p) = self.pending.remove(&tid) else {
                continue;
            };
            trace!("Request {:?} to {} timed out", p.kind, p.addr);
            if let (RequestKind::Ping, Some(id)) = (p.kind, p.expected) {
                if self.table_mut(AddressFamily::of(&p.addr)).remove_connecting_node(&id) {
                    self.address_book.remove(&id);
                }
            }
        }
    }

    // --- Searches ---

    fn ensure_search(&mut self, key: InfoHash, now: Instant) -> bool {
        match self.searches.get_mut(&key) {
            Some(search) => {
                if search.live_count() == 0 {
                    search.last_progress = now;
                }
            }
            None => {
                if self.searches.len() >= self.config.max_searches {
                    return false;
                }
                trace!("New search for {:?}", key);
                self.searches.insert(key, Search::new(key, now));
            }
        }
        self.refill_search(key);
        true
    }

    /// Seed a search with the closest nodes of the routing tables
    fn refill_search(&mut self, key: InfoHash) {
        let Some(search) = self.searches.get_mut(&key) else {
            return;
        };
        if search.live_count() >= TARGET_NODES {
            return;
        }
        for (family, table) in [(AddressFamily::V4, &self.table4), (AddressFamily::V6, &self.table6)] {
            if !self.transport.supports(family) {
                continue;
            }
            for n in table.closest_nodes(&key, SEARCH_NODES) {
                if !n.is_expired() {
                    search.insert_node(n.id, n.addr);
                }
            }
        }
    }

    fn step_searches(&mut self, now: Instant) {
        let keys: Vec<InfoHash> = self.searches.keys().copied().collect();
        for key in keys {
            self.search_step(key, now);
        }
    }

    fn search_step(&mut self, key: InfoHash, now: Instant) {
        self.refill_search(key);

        let mut outgoing: Vec<(NodeId, SocketAddr, Outgoing)> = Vec::new();
        let idle = {
            let Some(search) = self.searches.get_mut(&key) else {
                return;
            };
            let targets = search.target_indices();

            // Gets complete once every target node answered after they began
            if !targets.is_empty() {
                for get in std::mem::take(&mut search.gets) {
                    if search.is_synced_since(get.start) {
                        get.finish(true);
                    } else {
                        search.gets.push(get);
                    }
                }
            }

            let latest_get = search.gets.iter().map(|g| g.start).max();
            let announcing = !search.announces.is_empty();
            let mut in_flight = search.in_flight(now);
            for &i in &targets {
                if in_flight >= ALPHA {
                    break;
                }
                let node = &mut search.nodes[i];
                if node.is_pending(now) {
                    continue;
                }
                let needed = match latest_get {
                    Some(start) => !node.replied_since(start),
                    None => announcing && !node.is_synced(now),
                };
                if needed {
                    node.on_request(now);
                    outgoing.push((node.id, node.addr, Outgoing::Get));
                    in_flight += 1;
                }
            }

            for &i in &targets {
                let node = &mut search.nodes[i];
                if !node.is_synced(now) {
                    continue;
                }
                for announce in &search.announces {
                    let id = announce.value.id;
                    let expiration = self.types.for_value(&announce.value).expiration;
                    if node.needs_announce(id, expiration, now) {
                        node.announced.insert(id, now);
                        node.pinged += 1;
                        outgoing.push((
                            node.id,
                            node.addr,
                            Outgoing::Announce {
                                value: announce.value.clone(),
                                token: node.token.clone(),
                            },
                        ));
                    }
                }
            }

            // Every synced target refused: the put cannot succeed
            let synced: Vec<usize> = targets
                .iter()
                .copied()
                .filter(|&i| search.nodes[i].is_synced(now))
                .collect();
            if !synced.is_empty() {
                for announce in &mut search.announces {
                    let id = announce.value.id;
                    if announce.callback.is_some() && synced.iter().all(|&i| search.nodes[i].rejected.contains(&id)) {
                        debug!("Value {:016x} refused by every node under {:?}", id, key);
                        announce.finish(false);
                    }
                }
            }

            if search.live_count() > 0 {
                search.last_progress = now;
            } else if now.saturating_duration_since(search.last_progress) >= SEARCH_TIMEOUT {
                debug!("Search for {:?} timed out", key);
                search.fail();
                search.last_progress = now;
            }
            search.is_idle()
        };

        if idle {
            trace!("Search for {:?} done", key);
            self.searches.remove(&key);
        }

        let want = self.want();
        for (id, addr, out) in outgoing {
            match out {
                Outgoing::Get => {
                    self.send_request(
                        addr,
                        Some(id),
                        RequestKind::GetValues { target: key },
                        DhtRequest::GetValues {
                            sender_id: self.id,
                            key,
                            want,
                        },
                        now,
                    );
                }
                Outgoing::Announce { value, token } => {
                    self.send_request(
                        addr,
                        Some(id),
                        RequestKind::Announce {
                            target: key,
                            value_id: value.id,
                        },
                        DhtRequest::AnnounceValue {
                            sender_id: self.id,
                            key,
                            value: value.pack(),
                            token,
                        },
                        now,
                    );
                }
            }
        }
    }

    // --- Sending ---

    fn want(&self) -> u8 {
        let mut want = 0;
        if self.transport.supports(AddressFamily::V4) {
            want |= WANT4;
        }
        if self.transport.supports(AddressFamily::V6) {
            want |= WANT6;
        }
        want
    }

    fn send(&self, msg: &RpcMessage, addr: SocketAddr) -> bool {
        let buf = match msg.to_bytes() {
            Ok(buf) => buf,
            Err(e) => {
                error!("Cannot encode message for {}: {}", addr, e);
                return false;
            }
        };
        if buf.len() > MAX_PACKET_SIZE {
            error!("Message for {} too large: {} bytes", addr, buf.len());
            return false;
        }
        match self.transport.send_to(&buf, &addr) {
            Ok(_) => true,
            Err(e) => {
                warn!("Send to {} failed: {}", addr, e);
                false
            }
        }
    }

    fn send_request(
        &mut self,
        addr: SocketAddr,
        expected: Option<NodeId>,
        kind: RequestKind,
        request: DhtRequest,
        now: Instant,
    ) -> bool {
        let mut tid = self.next_tid;
        while self.pending.contains_key(&tid) {
            tid = tid.wrapping_add(1);
        }
        self.next_tid = tid.wrapping_add(1);

        if !self.send(&RpcMessage::new(tid, DhtMessage::Request(request)), addr) {
            return false;
        }
        self.pending.insert(
            tid,
            PendingRequest {
                addr,
                expected,
                kind,
                sent: now,
            },
        );
        if let Some(id) = expected {
            if let Some(node) = self.table_mut(AddressFamily::of(&addr)).get_node_mut(&id) {
                node.requested(now);
            }
        }
        true
    }

    // --- Tokens ---

    fn secret_lifetime(rng: &mut StdRng) -> Duration {
        Duration::from_secs(rng.gen_range(5 * 60..=15 * 60))
    }

    fn rotate_secrets(&mut self, now: Instant) {
        trace!("Rotating token secrets");
        self.old_secret = self.secret;
        self.secret = self.rng.gen();
        self.rotate_secrets_at = now + Self::secret_lifetime(&mut self.rng);
    }

    fn make_token(&self, addr: &SocketAddr, old: bool) -> Vec<u8> {
        let secret = if old { &self.old_secret } else { &self.secret };
        let hash = match addr.ip() {
            IpAddr::V4(ip) => blake3::keyed_hash(secret, &ip.octets()),
            IpAddr::V6(ip) => blake3::keyed_hash(secret, &ip.octets()),
        };
        hash.as_bytes()[..TOKEN_SIZE].to_vec()
    }

    fn token_match(&self, token: &[u8], addr: &SocketAddr) -> bool {
        token.len() == TOKEN_SIZE
            && (token == self.make_token(addr, false).as_slice() || token == self.make_token(addr, true).as_slice())
    }
}

/// Addresses no node can legitimately use
fn is_martian(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return true;
    }
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast(),
        IpAddr::V6(ip) => ip.is_unspecified() || ip.is_multicast(),
    }
}
