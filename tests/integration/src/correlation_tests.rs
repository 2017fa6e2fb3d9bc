//! Correlation tests: out-of-order replies, cancellation, deadlines.
//!
//! All calls in these tests share a single multiplexed connection, so a
//! slow request must not delay a fast one, a cancelled request must
//! resolve without waiting for its reply, and a deadline must fire even
//! when the server never answers in time.

mod common;

use common::*;
use orb::{CallToken, Orb, OrbConfig, OrbError, Value};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sleeper pair over loopback, reference translated to the client.
async fn sleeper_engines(
    client_config: OrbConfig,
) -> (Orb, Orb, orb::Ior, Arc<SleeperServant>) {
    let (server, client, _addr) = engine_pair(OrbConfig::default(), client_config).await;
    server.register_interface(sleeper_interface()).unwrap();
    client.register_interface(sleeper_interface()).unwrap();

    let servant = SleeperServant::new();
    let reference = server.activate("app", servant.clone()).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();
    (server, client, reference, servant)
}

fn work_args(delay_ms: u32, tag: i32) -> Vec<Value> {
    vec![Value::ULong(delay_ms), Value::Long(tag)]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_first_reply_does_not_block_fast_second() {
    init_logging();
    println!("=== Out-Of-Order Reply Test ===");

    let (server, client, reference, _servant) = sleeper_engines(OrbConfig::default()).await;

    let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    // issue the slow request first so its reply arrives second
    let slow = {
        let client = client.clone();
        let reference = reference.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let result = client
                .invoke(&reference, "work", work_args(300, 7))
                .await
                .unwrap();
            order.lock().push(7);
            result
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fast = {
        let client = client.clone();
        let reference = reference.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let result = client
                .invoke(&reference, "work", work_args(30, 9))
                .await
                .unwrap();
            order.lock().push(9);
            result
        })
    };

    assert_eq!(fast.await.unwrap(), Some(Value::Long(9)));
    assert_eq!(slow.await.unwrap(), Some(Value::Long(7)));
    assert_eq!(*order.lock(), vec![9, 7]);
    assert_eq!(client.connections_originated(), 1);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Out-Of-Order Reply Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_call_resolves_immediately() {
    init_logging();
    println!("=== Cancellation Test ===");

    let (server, client, reference, _servant) = sleeper_engines(OrbConfig::default()).await;

    let token = CallToken::new();
    let started = Instant::now();
    let pending = {
        let client = client.clone();
        let reference = reference.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client
                .invoke_cancellable(&reference, "work", work_args(5000, 1), &token)
                .await
        })
    };

    // wait for the request to hit the wire, then abort it
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_id = token.request_id().unwrap();
    token.cancel().await.unwrap();

    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(OrbError::Cancelled(id)) if id == request_id));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "cancel took {:?}",
        started.elapsed()
    );

    // the connection outlives the cancelled call
    let result = client
        .invoke(&reference, "work", work_args(1, 2))
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));
    assert_eq!(client.connections_originated(), 1);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Cancellation Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_cancelled_token_never_sends() {
    init_logging();

    let (server, client, reference, servant) = sleeper_engines(OrbConfig::default()).await;

    let token = CallToken::new();
    token.cancel().await.unwrap();

    let err = client
        .invoke_cancellable(&reference, "work", work_args(5, 1), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::Cancelled(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(servant.completed.load(Ordering::SeqCst), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_expires_into_timeout() {
    init_logging();
    println!("=== Deadline Test ===");

    let client_config = OrbConfig {
        request_timeout: Some(Duration::from_millis(80)),
        ..OrbConfig::default()
    };
    let (server, client, reference, _servant) = sleeper_engines(client_config).await;

    let started = Instant::now();
    let err = client
        .invoke(&reference, "work", work_args(5000, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::Timeout(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Deadline Test PASSED ===");
}
