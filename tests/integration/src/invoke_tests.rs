//! Invocation tests: request/reply between two engines over loopback TCP.
//!
//! - Two-way calls returning results, connection reuse across calls
//! - Void operations with empty reply bodies
//! - User and system exceptions travelling back to the caller
//! - Oneway calls: no reply, silent failures
//! - LocateRequest probes
//! - corbaloc-addressed references into user-assigned keys

mod common;

use bytes::Bytes;
use common::*;
use futures::future::join_all;
use orb::{AdapterPolicy, IiopProfile, Ior, Orb, OrbConfig, OrbError, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Counter pair over loopback with the reference already translated to
/// the client through its stringified form.
async fn counter_engines() -> (Orb, Orb, Ior, std::sync::Arc<CounterServant>) {
    let (server, client, _addr) = engine_pair(OrbConfig::default(), OrbConfig::default()).await;
    server.register_interface(counter_interface()).unwrap();
    client.register_interface(counter_interface()).unwrap();

    let servant = CounterServant::new();
    let reference = server.activate("app", servant.clone()).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();
    (server, client, reference, servant)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_way_call_round_trips() {
    init_logging();
    println!("=== Two-Way Call Test ===");

    let (server, client, reference, servant) = counter_engines().await;

    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));
    assert_eq!(servant.hits.load(Ordering::SeqCst), 1);

    // later calls ride the connection the first one dialed
    for n in 2..7 {
        let result = client
            .invoke(&reference, "inc", vec![Value::Long(n)])
            .await
            .unwrap();
        assert_eq!(result, Some(Value::Long(n + 1)));
    }
    assert_eq!(client.connections_originated(), 1);
    assert_eq!(servant.hits.load(Ordering::SeqCst), 6);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Two-Way Call Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn void_operation_returns_none() {
    init_logging();

    let (server, client, reference, servant) = counter_engines().await;

    client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(servant.hits.load(Ordering::SeqCst), 1);

    let result = client.invoke(&reference, "reset", vec![]).await.unwrap();
    assert_eq!(result, None);
    assert_eq!(servant.hits.load(Ordering::SeqCst), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_exception_carries_its_members() {
    init_logging();
    println!("=== User Exception Test ===");

    let (server, client, reference, _servant) = counter_engines().await;

    let err = client
        .invoke(&reference, "boom", vec![Value::Long(13)])
        .await
        .unwrap_err();
    match err {
        OrbError::UserException { repo_id, body } => {
            assert_eq!(repo_id, COUNTER_ERROR_ID);
            assert_eq!(body, counter_error_body(13));
        }
        other => panic!("expected a user exception, got {other:?}"),
    }

    // the connection survives the exception
    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== User Exception Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_key_maps_to_object_not_exist() {
    init_logging();

    let (server, client, reference, servant) = counter_engines().await;

    let profile = reference.primary_profile().unwrap();
    let stray = Ior::new(
        COUNTER_ID,
        IiopProfile::new(
            profile.host.clone(),
            profile.port,
            Bytes::from_static(b"no-such-key"),
        ),
    );

    let err = client
        .invoke(&stray, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::ObjectNotExist(_)));
    assert_eq!(servant.hits.load(Ordering::SeqCst), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oneway_is_silent_even_on_failure() {
    init_logging();
    println!("=== Oneway Test ===");

    let (server, client, reference, servant) = counter_engines().await;

    // declared oneway: plain invoke already goes without a reply
    let result = client
        .invoke(&reference, "note", vec![Value::Long(5)])
        .await
        .unwrap();
    assert_eq!(result, None);

    // forced oneway onto a failing operation: no error surfaces
    client
        .oneway(&reference, "boom", vec![Value::Long(1)])
        .await
        .unwrap();

    for _ in 0..200 {
        if servant.notes.load(Ordering::SeqCst) == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(servant.notes.load(Ordering::SeqCst), 5);

    // connection still healthy after the silent failure
    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Oneway Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locate_probes_report_liveness() {
    init_logging();

    let (server, client, reference, _servant) = counter_engines().await;

    assert!(client.locate(&reference).await.unwrap());

    let profile = reference.primary_profile().unwrap();
    let stray = Ior::new(
        COUNTER_ID,
        IiopProfile::new(profile.host.clone(), profile.port, Bytes::from_static(b"gone")),
    );
    assert!(!client.locate(&stray).await.unwrap());

    assert!(matches!(
        client.locate(&Ior::nil()).await,
        Err(OrbError::UnresolvableReference(_))
    ));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corbaloc_reaches_a_user_assigned_key() {
    init_logging();
    println!("=== corbaloc Test ===");

    let server = Orb::new(OrbConfig::default());
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    server.register_interface(counter_interface()).unwrap();
    let adapter = server
        .create_adapter("svc", AdapterPolicy::persistent_user())
        .unwrap();
    adapter.activate_with_id(b"K1", CounterServant::new()).unwrap();

    let client = Orb::new(OrbConfig::default());
    client.register_interface(counter_interface()).unwrap();

    // persistent key layout: marker, adapter name, NUL, object id
    let url = format!("corbaloc::127.0.0.1:{}/Psvc%00K1", addr.port());
    let mut reference = client.string_to_object(&url).unwrap();
    reference.type_id = COUNTER_ID.to_string();

    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== corbaloc Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_multiplex_one_connection() {
    init_logging();
    println!("=== Concurrent Calls Test ===");

    let (server, client, reference, servant) = counter_engines().await;

    let tasks: Vec<_> = (0..8)
        .map(|worker| {
            let client = client.clone();
            let reference = reference.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    let n = worker * 100 + i;
                    let result = client
                        .invoke(&reference, "inc", vec![Value::Long(n)])
                        .await
                        .unwrap();
                    assert_eq!(result, Some(Value::Long(n + 1)));
                }
            })
        })
        .collect();

    for outcome in join_all(tasks).await {
        outcome.unwrap();
    }

    assert_eq!(servant.hits.load(Ordering::SeqCst), 200);
    assert_eq!(client.connections_originated(), 1);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Concurrent Calls Test PASSED ===");
}
