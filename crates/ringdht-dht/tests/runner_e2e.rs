//! Two runners talking over loopback

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringdht_crypto::{generate_identity, Identity, InfoHash};
use ringdht_dht::config::RunnerConfig;
use ringdht_dht::{AddressFamily, DhtRunner, DhtStatus, Value, ValueType};

const TIMEOUT: Duration = Duration::from_secs(15);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ringdht_dht=debug")
        .with_test_writer()
        .try_init();
}

fn start(name: &str) -> (DhtRunner, Identity) {
    let identity = generate_identity(name, None).expect("identity");
    let mut runner = DhtRunner::new();
    runner
        .run_with_config(RunnerConfig::local(), &identity, None, true)
        .expect("run");
    (runner, identity)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// A bootstraps from B, both learn each other
fn connected_pair() -> ((DhtRunner, Identity), (DhtRunner, Identity)) {
    let (a, id_a) = start("alice");
    let (b, id_b) = start("bob");
    a.bootstrap([b.local_addr(AddressFamily::V4).expect("bound")]);

    assert!(wait_until(|| a.has_node(&id_b.id()) && b.has_node(&id_a.id())));
    ((a, id_a), (b, id_b))
}

fn done_channel() -> (mpsc::Receiver<bool>, Box<dyn FnOnce(bool) + Send>) {
    let (tx, rx) = mpsc::channel();
    (rx, Box::new(move |ok| {
        let _ = tx.send(ok);
    }))
}

#[test]
fn bootstrap_adds_node_to_routing_table() {
    init_logging();
    let ((mut a, _), (mut b, id_b)) = connected_pair();

    assert!(wait_until(|| a.get_nodes().iter().any(|n| n.id == id_b.id())));
    assert_eq!(a.status().0, DhtStatus::Connected);
    assert_eq!(a.status().1, DhtStatus::Disconnected);

    a.join();
    b.join();
}

#[test]
fn status_callback_reports_changes() {
    init_logging();
    let (b, _) = start("bob");
    let identity = generate_identity("alice", None).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut a = DhtRunner::new();
    a.run_with_config(
        RunnerConfig::local(),
        &identity,
        Some(Box::new(move |v4, v6| {
            let _ = tx.send((v4, v6));
        })),
        true,
    )
    .unwrap();
    a.bootstrap([b.local_addr(AddressFamily::V4).unwrap()]);

    let deadline = Instant::now() + TIMEOUT;
    let mut last = None;
    while last != Some((DhtStatus::Connected, DhtStatus::Disconnected)) {
        let left = deadline.saturating_duration_since(Instant::now());
        last = Some(rx.recv_timeout(left).expect("status change"));
    }
    a.join();
}

#[test]
fn signed_put_is_retrieved_and_verified() {
    init_logging();
    let ((a, id_a), (b, _)) = connected_pair();
    let key = id_a.id();

    let (done, on_done) = done_channel();
    a.put_signed(key, Value::new(ValueType::USER_DATA, b"hello from alice".to_vec()), Some(on_done));
    assert!(done.recv_timeout(TIMEOUT).expect("put done"));

    let (tx, rx) = mpsc::channel();
    b.get(
        key,
        Box::new(move |values: &[Arc<Value>]| {
            for v in values {
                let _ = tx.send(v.clone());
            }
            true
        }),
        None,
        Some(Value::type_filter(ValueType::USER_DATA)),
    );

    let value = rx.recv_timeout(TIMEOUT).expect("value");
    assert_eq!(value.data, b"hello from alice");
    assert!(value.check_signature());
    assert_eq!(value.owner_id(), Some(id_a.id()));
}

#[test]
fn encrypted_put_is_decrypted_by_recipient() {
    init_logging();
    let ((a, id_a), (b, id_b)) = connected_pair();
    let key = InfoHash::get(b"bob's inbox");

    let (done, on_done) = done_channel();
    a.put_encrypted(
        key,
        id_b.id(),
        Value::new(ValueType::USER_DATA, b"for bob only".to_vec()),
        Some(on_done),
    );
    assert!(done.recv_timeout(TIMEOUT).expect("put done"));

    let (tx, rx) = mpsc::channel();
    b.get(
        key,
        Box::new(move |values: &[Arc<Value>]| {
            for v in values {
                let _ = tx.send(v.clone());
            }
            true
        }),
        None,
        None,
    );
    let value = rx.recv_timeout(TIMEOUT).expect("value");
    assert_eq!(value.data, b"for bob only");
    assert_eq!(value.recipient(), Some(id_b.id()));
    assert_eq!(value.owner_id(), Some(id_a.id()));

    // Alice stored the sealed form and cannot read it back
    let (tx, rx) = mpsc::channel();
    a.get(
        key,
        Box::new(move |values: &[Arc<Value>]| {
            let _ = tx.send(values.len());
            true
        }),
        None,
        None,
    );
    assert!(rx.recv_timeout(Duration::from_secs(3)).is_err());
}

#[test]
fn encrypted_put_to_unknown_node_fails() {
    init_logging();
    let ((a, _), _b) = connected_pair();

    let (done, on_done) = done_channel();
    a.put_encrypted(
        InfoHash::get(b"nowhere"),
        InfoHash::get_random(),
        Value::new(ValueType::USER_DATA, b"lost".to_vec()),
        Some(on_done),
    );
    assert!(!done.recv_timeout(TIMEOUT).expect("put done"));
}
