//! Adapter lifecycle tests over the wire.
//!
//! Transient keys die with their adapter incarnation, persistent keys
//! come back after a restart of the adapter, and deactivation removes
//! exactly one object. All failures surface at the caller as
//! OBJECT_NOT_EXIST; oneways swallow them.

mod common;

use common::*;
use orb::{AdapterPolicy, Orb, OrbConfig, OrbError, Value};
use std::sync::atomic::Ordering;

async fn counter_pair() -> (Orb, Orb, std::net::SocketAddr) {
    let (server, client, addr) = engine_pair(OrbConfig::default(), OrbConfig::default()).await;
    server.register_interface(counter_interface()).unwrap();
    client.register_interface(counter_interface()).unwrap();
    (server, client, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_key_dies_with_its_adapter() {
    init_logging();
    println!("=== Transient Lifecycle Test ===");

    let (server, client, _addr) = counter_pair().await;

    let servant = CounterServant::new();
    let reference = server.activate("app", servant).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();

    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));

    server.destroy_adapter("app").unwrap();
    let err = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::ObjectNotExist(_)), "got {err:?}");
    assert!(!client.locate(&reference).await.unwrap());

    // a new incarnation never honors the old incarnation's keys
    server.create_adapter("app", AdapterPolicy::default()).unwrap();
    let replacement = CounterServant::new();
    let fresh = server.activate("app", replacement.clone()).unwrap();
    let fresh = client
        .string_to_object(&server.object_to_string(&fresh))
        .unwrap();

    let err = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::ObjectNotExist(_)));

    let result = client
        .invoke(&fresh, "inc", vec![Value::Long(10)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(11)));
    assert_eq!(replacement.hits.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Transient Lifecycle Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_key_survives_reincarnation() {
    init_logging();
    println!("=== Persistent Lifecycle Test ===");

    let (server, client, _addr) = counter_pair().await;

    let adapter = server
        .create_adapter("store", AdapterPolicy::persistent_user())
        .unwrap();
    let key = adapter
        .activate_with_id(b"acct-7", CounterServant::new())
        .unwrap();
    let reference = server.object_reference(COUNTER_ID, key).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();

    let result = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));

    server.destroy_adapter("store").unwrap();
    let err = client
        .invoke(&reference, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::ObjectNotExist(_)));

    // same adapter name, same object id: the old reference works again
    let adapter = server
        .create_adapter("store", AdapterPolicy::persistent_user())
        .unwrap();
    let revived = CounterServant::new();
    adapter.activate_with_id(b"acct-7", revived.clone()).unwrap();

    let result = client
        .invoke(&reference, "inc", vec![Value::Long(40)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(41)));
    assert_eq!(revived.hits.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Persistent Lifecycle Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivation_stops_one_object() {
    init_logging();

    let (server, client, _addr) = counter_pair().await;

    let adapter = server.adapter("app").unwrap();
    let first = CounterServant::new();
    let second = CounterServant::new();
    let first_key = adapter.activate(first).unwrap();
    let second_key = adapter.activate(second).unwrap();

    let first_ref = client
        .string_to_object(
            &server.object_to_string(
                &server.object_reference(COUNTER_ID, first_key.clone()).unwrap(),
            ),
        )
        .unwrap();
    let second_ref = client
        .string_to_object(
            &server.object_to_string(&server.object_reference(COUNTER_ID, second_key).unwrap()),
        )
        .unwrap();

    adapter.deactivate(&first_key).unwrap();

    let err = client
        .invoke(&first_ref, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::ObjectNotExist(_)));

    let result = client
        .invoke(&second_ref, "inc", vec![Value::Long(3)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(4)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oneway_to_a_dead_key_is_silent() {
    init_logging();

    let (server, client, _addr) = counter_pair().await;

    let servant = CounterServant::new();
    let doomed = server.activate("app", servant).unwrap();
    let doomed = client
        .string_to_object(&server.object_to_string(&doomed))
        .unwrap();
    server.destroy_adapter("app").unwrap();

    server.create_adapter("app", AdapterPolicy::default()).unwrap();
    let live = CounterServant::new();
    let live_ref = server.activate("app", live.clone()).unwrap();
    let live_ref = client
        .string_to_object(&server.object_to_string(&live_ref))
        .unwrap();

    // no reply requested, so the failure stays on the server
    client
        .oneway(&doomed, "note", vec![Value::Long(1)])
        .await
        .unwrap();

    let result = client
        .invoke(&live_ref, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));
    assert_eq!(live.notes.load(Ordering::SeqCst), 0);

    client.shutdown().await;
    server.shutdown().await;
}
