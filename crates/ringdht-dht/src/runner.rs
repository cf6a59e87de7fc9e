//! Threaded DHT Runner
//!
//! [`DhtRunner`] binds the UDP sockets and drives a [`SecureDht`] from a loop
//! thread. Every public operation only queues a request and wakes the loop;
//! results come back through callbacks called on the loop thread.
//!
//! Callbacks are collected while the engine is locked and called once it is
//! released, so they may use any runner method except `join`. A get callback
//! returning false stops deliveries to it; the engine search ends on its next
//! delivery.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringdht_crypto::{Identity, InfoHash, NodeId};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::config::RunnerConfig;
use crate::engine::{DhtStatus, DoneCallback, GetCallback, Transport};
use crate::error::{DhtError, DhtResult};
use crate::node::{AddressFamily, NodeExport};
use crate::securedht::SecureDht;
use crate::value::{Filter, Value, ValueType};
use crate::MAX_PACKET_SIZE;

/// Receives `(ipv4, ipv6)` connectivity whenever it changes
pub type StatusCallback = Box<dyn FnMut(DhtStatus, DhtStatus) + Send>;

/// Pause after a receive error
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A user callback ready to run
type Task = Box<dyn FnOnce() + Send>;

/// Callbacks waiting for the engine lock to be released
type Deferred = Arc<Mutex<VecDeque<Task>>>;

struct GetRequest {
    key: InfoHash,
    callback: GetCallback,
    done: Option<DoneCallback>,
    filter: Option<Filter>,
}

struct PutRequest {
    key: InfoHash,
    value: Value,
    done: Option<DoneCallback>,
    signed: bool,
}

struct EncryptedPutRequest {
    key: InfoHash,
    to: NodeId,
    value: Value,
    done: Option<DoneCallback>,
}

#[derive(Default)]
struct Requests {
    gets: VecDeque<GetRequest>,
    puts: VecDeque<PutRequest>,
    encrypted_puts: VecDeque<EncryptedPutRequest>,
    bootstrap_nodes: VecDeque<NodeExport>,
    bootstrap_addrs: VecDeque<SocketAddr>,
}

impl Requests {
    fn is_empty(&self) -> bool {
        self.gets.is_empty()
            && self.puts.is_empty()
            && self.encrypted_puts.is_empty()
            && self.bootstrap_nodes.is_empty()
            && self.bootstrap_addrs.is_empty()
    }
}

struct Shared {
    running: AtomicBool,
    engine: Mutex<Option<SecureDht>>,
    requests: Mutex<Requests>,
    inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    /// Set when work arrives, cleared by the loop
    wake: Mutex<bool>,
    signal: Condvar,
    status: Mutex<(DhtStatus, DhtStatus)>,
    status_callback: Mutex<Option<StatusCallback>>,
    callbacks: Deferred,
    max_sleep: Mutex<Duration>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            engine: Mutex::new(None),
            requests: Mutex::new(Requests::default()),
            inbound: Mutex::new(VecDeque::new()),
            wake: Mutex::new(false),
            signal: Condvar::new(),
            status: Mutex::new((DhtStatus::Disconnected, DhtStatus::Disconnected)),
            status_callback: Mutex::new(None),
            callbacks: Deferred::default(),
            max_sleep: Mutex::new(RunnerConfig::default().max_sleep),
        }
    }

    fn notify(&self) {
        *self.wake.lock() = true;
        self.signal.notify_all();
    }
}

/// Sends through the runner's sockets
struct UdpTransport {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl Transport for UdpTransport {
    fn send_to(&self, data: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        match socket {
            Some(s) => s.send_to(data, addr),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no socket for {}", addr),
            )),
        }
    }

    fn supports(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.v4.is_some(),
            AddressFamily::V6 => self.v6.is_some(),
        }
    }
}

fn bind_udp(addr: SocketAddr, read_timeout: Duration) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(read_timeout))?;

    let socket: UdpSocket = socket.into();
    debug!("UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Thread-safe front end of a DHT node
pub struct DhtRunner {
    shared: Arc<Shared>,
    loop_thread: Option<JoinHandle<()>>,
    recv_threads: Vec<JoinHandle<()>>,
    id: Option<NodeId>,
    local4: Option<SocketAddr>,
    local6: Option<SocketAddr>,
}

impl DhtRunner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            loop_thread: None,
            recv_threads: Vec::new(),
            id: None,
            local4: None,
            local6: None,
        }
    }

    /// Start on `port` with default settings
    pub fn run(
        &mut self,
        port: u16,
        identity: &Identity,
        status_callback: Option<StatusCallback>,
        threaded: bool,
    ) -> DhtResult<()> {
        let config = RunnerConfig {
            port,
            ..Default::default()
        };
        self.run_with_config(config, identity, status_callback, threaded)
    }

    /// Bind sockets, start the engine and one receive thread per socket
    ///
    /// With `threaded` false no loop thread is started and the caller drives
    /// the node with [`loop_once`](Self::loop_once). Fails only if neither
    /// socket can be bound. A running node is stopped first.
    pub fn run_with_config(
        &mut self,
        config: RunnerConfig,
        identity: &Identity,
        status_callback: Option<StatusCallback>,
        threaded: bool,
    ) -> DhtResult<()> {
        config.validate()?;
        if self.is_running() {
            self.join();
        }

        let v4 = if config.enable_ipv4 {
            let addr = SocketAddr::new(config.bind4.into(), config.port);
            bind_udp(addr, config.recv_poll_interval)
                .map_err(|e| warn!("Cannot bind IPv4 socket on {}: {}", addr, e))
                .ok()
        } else {
            None
        };
        let v6 = if config.enable_ipv6 {
            // Same port for both families when the system picked one
            let port = match (&v4, config.port) {
                (Some(s), 0) => s.local_addr()?.port(),
                _ => config.port,
            };
            let addr = SocketAddr::new(config.bind6.into(), port);
            bind_udp(addr, config.recv_poll_interval)
                .map_err(|e| warn!("Cannot bind IPv6 socket on {}: {}", addr, e))
                .ok()
        } else {
            None
        };
        if v4.is_none() && v6.is_none() {
            return Err(DhtError::BindFailed(format!(
                "no socket could be bound on port {}",
                config.port
            )));
        }

        self.local4 = v4.as_ref().map(UdpSocket::local_addr).transpose()?;
        self.local6 = v6.as_ref().map(UdpSocket::local_addr).transpose()?;
        let transport = UdpTransport {
            v4: v4.as_ref().map(UdpSocket::try_clone).transpose()?,
            v6: v6.as_ref().map(UdpSocket::try_clone).transpose()?,
        };
        let dht = SecureDht::new(Box::new(transport), identity, config.dht.clone())?;
        self.id = Some(*dht.id());

        *self.shared.engine.lock() = Some(dht);
        *self.shared.status.lock() = (DhtStatus::Disconnected, DhtStatus::Disconnected);
        *self.shared.status_callback.lock() = status_callback;
        *self.shared.max_sleep.lock() = config.max_sleep;
        self.shared.running.store(true, Ordering::SeqCst);

        for socket in v4.into_iter().chain(v6) {
            self.recv_threads.push(spawn_receiver(&self.shared, socket)?);
        }
        if threaded {
            let shared = self.shared.clone();
            self.loop_thread = Some(
                thread::Builder::new()
                    .name("ringdht-loop".into())
                    .spawn(move || run_loop(&shared))?,
            );
        }

        info!(
            "DHT node {} running (IPv4: {:?}, IPv6: {:?})",
            identity.id(),
            self.local4,
            self.local6
        );
        Ok(())
    }

    /// One pass of the loop: process received packets and queued requests
    ///
    /// Returns how long the caller may wait before the next pass.
    pub fn loop_once(&self) -> Duration {
        loop_once(&self.shared)
    }

    /// Stop the node
    ///
    /// Queued requests are dropped without calling their callbacks. Safe to
    /// call at any time, any number of times.
    pub fn join(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify();

        let threads = self.loop_thread.take().into_iter().chain(self.recv_threads.drain(..));
        for handle in threads {
            if handle.join().is_err() {
                error!("DHT thread panicked");
            }
        }

        if self.shared.engine.lock().take().is_some() {
            info!("DHT node stopped");
        }
        *self.shared.requests.lock() = Requests::default();
        self.shared.inbound.lock().clear();
        self.shared.callbacks.lock().clear();
        *self.shared.status_callback.lock() = None;
        self.id = None;
        self.local4 = None;
        self.local6 = None;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Our node id, once running
    pub fn get_id(&self) -> Option<NodeId> {
        self.id
    }

    /// Bound address of `family`
    pub fn local_addr(&self, family: AddressFamily) -> Option<SocketAddr> {
        match family {
            AddressFamily::V4 => self.local4,
            AddressFamily::V6 => self.local6,
        }
    }

    /// Good nodes of the routing tables
    pub fn get_nodes(&self) -> Vec<NodeExport> {
        self.shared
            .engine
            .lock()
            .as_ref()
            .map(SecureDht::export_nodes)
            .unwrap_or_default()
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.shared.engine.lock().as_ref().map_or(false, |dht| dht.has_node(id))
    }

    /// Last reported `(ipv4, ipv6)` status
    pub fn status(&self) -> (DhtStatus, DhtStatus) {
        *self.shared.status.lock()
    }

    pub fn export_values(&self) -> Vec<(InfoHash, Vec<u8>)> {
        self.shared
            .engine
            .lock()
            .as_ref()
            .map(SecureDht::export_values)
            .unwrap_or_default()
    }

    /// Load saved values; fails when not running
    pub fn import_values(&self, blobs: &[(InfoHash, Vec<u8>)]) -> DhtResult<usize> {
        match self.shared.engine.lock().as_mut() {
            Some(dht) => Ok(dht.import_values(blobs)),
            None => Err(DhtError::NotRunning),
        }
    }

    /// Get values under `key`
    pub fn get(&self, key: InfoHash, callback: GetCallback, done: Option<DoneCallback>, filter: Option<Filter>) {
        let queue = &self.shared.callbacks;
        self.shared.requests.lock().gets.push_back(GetRequest {
            key,
            callback: defer_get(queue, callback),
            done: defer_done(queue, done),
            filter,
        });
        self.shared.notify();
    }

    /// Put a value, signed unless it is a peer announcement
    pub fn put(&self, key: InfoHash, value: Value, done: Option<DoneCallback>) {
        let signed = value.value_type != ValueType::PEER;
        self.enqueue_put(key, value, done, signed);
    }

    /// Put a signed value
    pub fn put_signed(&self, key: InfoHash, value: Value, done: Option<DoneCallback>) {
        self.enqueue_put(key, value, done, true);
    }

    /// Put a value only `to` can read
    pub fn put_encrypted(&self, key: InfoHash, to: NodeId, value: Value, done: Option<DoneCallback>) {
        self.shared
            .requests
            .lock()
            .encrypted_puts
            .push_back(EncryptedPutRequest {
                key,
                to,
                value,
                done: defer_done(&self.shared.callbacks, done),
            });
        self.shared.notify();
    }

    /// Ping nodes at `addrs`
    pub fn bootstrap(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        self.shared.requests.lock().bootstrap_addrs.extend(addrs);
        self.shared.notify();
    }

    /// Insert nodes of known id, typically saved by a previous run
    pub fn bootstrap_nodes(&self, nodes: impl IntoIterator<Item = NodeExport>) {
        self.shared.requests.lock().bootstrap_nodes.extend(nodes);
        self.shared.notify();
    }

    fn enqueue_put(&self, key: InfoHash, value: Value, done: Option<DoneCallback>, signed: bool) {
        self.shared.requests.lock().puts.push_back(PutRequest {
            key,
            value,
            done: defer_done(&self.shared.callbacks, done),
            signed,
        });
        self.shared.notify();
    }
}

impl Default for DhtRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhtRunner {
    fn drop(&mut self) {
        self.join();
    }
}

/// Queue each delivery for after the engine lock is released
fn defer_get(queue: &Deferred, callback: GetCallback) -> GetCallback {
    let queue = queue.clone();
    let callback = Arc::new(Mutex::new(callback));
    let stopped = Arc::new(AtomicBool::new(false));
    Box::new(move |values: &[Arc<Value>]| {
        if stopped.load(Ordering::SeqCst) {
            return false;
        }
        let values = values.to_vec();
        let callback = callback.clone();
        let stopped = stopped.clone();
        queue.lock().push_back(Box::new(move || {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let mut callback = callback.lock();
            if !(&mut **callback)(values.as_slice()) {
                stopped.store(true, Ordering::SeqCst);
            }
        }));
        true
    })
}

fn defer_done(queue: &Deferred, done: Option<DoneCallback>) -> Option<DoneCallback> {
    let queue = queue.clone();
    done.map(move |done| -> DoneCallback {
        Box::new(move |ok: bool| queue.lock().push_back(Box::new(move || done(ok))))
    })
}

fn spawn_receiver(shared: &Arc<Shared>, socket: UdpSocket) -> io::Result<JoinHandle<()>> {
    let name = if socket.local_addr()?.is_ipv4() {
        "ringdht-recv4"
    } else {
        "ringdht-recv6"
    };
    let shared = shared.clone();
    thread::Builder::new()
        .name(name.into())
        .spawn(move || receive_loop(&shared, &socket))
}

fn receive_loop(shared: &Shared, socket: &UdpSocket) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    while shared.running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                trace!("Received {} bytes from {}", len, from);
                shared.inbound.lock().push_back((buf[..len].to_vec(), from));
                shared.notify();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("Error receiving packet: {}", e);
                thread::sleep(RECV_ERROR_BACKOFF);
            }
        }
    }
    debug!("Receive thread stopped");
}

fn run_loop(shared: &Shared) {
    while shared.running.load(Ordering::SeqCst) {
        let sleep = loop_once(shared);
        let mut wake = shared.wake.lock();
        if !*wake && shared.running.load(Ordering::SeqCst) {
            shared.signal.wait_for(&mut wake, sleep);
        }
        *wake = false;
    }
    debug!("Loop thread stopped");
}

fn loop_once(shared: &Shared) -> Duration {
    let max_sleep = *shared.max_sleep.lock();
    let Some((sleep, status)) = step_engine(shared, max_sleep) else {
        return max_sleep;
    };

    let changed = {
        let mut last = shared.status.lock();
        let changed = *last != status;
        *last = status;
        changed
    };
    if changed {
        info!("DHT status: IPv4 {}, IPv6 {}", status.0, status.1);
        if let Some(callback) = shared.status_callback.lock().as_mut() {
            callback(status.0, status.1);
        }
    }

    loop {
        let Some(task) = shared.callbacks.lock().pop_front() else {
            break;
        };
        task();
    }

    sleep.min(max_sleep)
}

/// Feed packets and requests to the engine; `None` when stopped
fn step_engine(shared: &Shared, max_sleep: Duration) -> Option<(Duration, (DhtStatus, DhtStatus))> {
    let mut engine = shared.engine.lock();
    let dht = engine.as_mut()?;

    let packets: Vec<(Vec<u8>, SocketAddr)> = shared.inbound.lock().drain(..).collect();
    let mut sleep = if packets.is_empty() {
        dht.periodic(None, Instant::now())
    } else {
        let mut sleep = max_sleep;
        for (buf, from) in &packets {
            sleep = dht.periodic(Some((buf, *from)), Instant::now());
        }
        sleep
    };

    let requests = std::mem::take(&mut *shared.requests.lock());
    if !requests.is_empty() {
        for node in requests.bootstrap_nodes {
            dht.insert_node(node.id, node.addr);
        }
        for addr in requests.bootstrap_addrs {
            dht.ping_node(addr);
        }
        for get in requests.gets {
            dht.get(get.key, get.callback, get.done, get.filter);
        }
        for put in requests.encrypted_puts {
            dht.put_encrypted(put.key, put.to, put.value, put.done);
        }
        for put in requests.puts {
            if put.signed {
                dht.put_signed(put.key, put.value, put.done);
            } else {
                dht.put(put.key, put.value, put.done);
            }
        }
        sleep = dht.periodic(None, Instant::now());
    }

    let status = (dht.status(AddressFamily::V4), dht.status(AddressFamily::V6));
    Some((sleep, status))
}
