//! Value-type tests: graphs travelling whole across the wire.
//!
//! Chains, shared nodes and cycles are encoded once per instance with
//! indirections for every re-reference, so the decoded graph has the
//! same shape as the one sent: aliasing preserved, cycles closed, and
//! custom-mapped types rebuilt through their registered functions.

mod common;

use common::*;
use orb::{
    InterfaceDescriptor, Ior, OperationSignature, Orb, OrbConfig, OrbError, TypeMapping, Value,
    ValueInstance, ValueRef, WireType,
};
use std::sync::Arc;

/// Graph servant active on the server, reference held by the client.
async fn graph_engines() -> (Orb, Orb, Ior) {
    let (server, client, _addr) = engine_pair(OrbConfig::default(), OrbConfig::default()).await;
    register_graph_types(&server);
    register_graph_types(&client);

    let reference = server.activate("app", Arc::new(GraphServant)).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();
    (server, client, reference)
}

fn node(value: i32) -> ValueRef {
    ValueInstance::new(NODE_ID, vec![Value::Long(value), Value::null()]).into_ref()
}

fn link(from: &ValueRef, to: &ValueRef) {
    from.write().fields[1] = Value::Instance(Some(to.clone()));
}

fn unwrap_instance(value: Option<Value>) -> ValueRef {
    match value {
        Some(Value::Instance(Some(vref))) => vref,
        other => panic!("expected an instance, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chain_round_trips_with_distinct_instances() {
    init_logging();
    println!("=== Value Chain Test ===");

    let (server, client, reference) = graph_engines().await;

    let a = node(1);
    let b = node(2);
    link(&a, &b);

    let echoed = client
        .invoke(&reference, "echo", vec![Value::Instance(Some(a))])
        .await
        .unwrap();
    let first = unwrap_instance(echoed);
    let second = match &first.read().fields[1] {
        Value::Instance(Some(next)) => next.clone(),
        other => panic!("chain broken: {other:?}"),
    };

    assert_eq!(first.read().type_id, NODE_ID);
    assert!(matches!(first.read().fields[0], Value::Long(1)));
    assert!(matches!(second.read().fields[0], Value::Long(2)));
    assert!(matches!(second.read().fields[1], Value::Instance(None)));
    assert!(!Arc::ptr_eq(&first, &second));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Value Chain Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cycle_survives_two_codecs() {
    init_logging();
    println!("=== Value Cycle Test ===");

    let (server, client, reference) = graph_engines().await;

    // a -> b -> a, encoded by the client, decoded and re-encoded by the
    // server, decoded again here
    let a = node(10);
    let b = node(20);
    link(&a, &b);
    link(&b, &a);

    let echoed = client
        .invoke(&reference, "echo", vec![Value::Instance(Some(a))])
        .await
        .unwrap();
    let first = unwrap_instance(echoed);
    let second = match &first.read().fields[1] {
        Value::Instance(Some(next)) => next.clone(),
        other => panic!("cycle broken at first hop: {other:?}"),
    };
    let back = match &second.read().fields[1] {
        Value::Instance(Some(next)) => next.clone(),
        other => panic!("cycle broken at second hop: {other:?}"),
    };

    assert!(Arc::ptr_eq(&first, &back));
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(matches!(first.read().fields[0], Value::Long(10)));
    assert!(matches!(second.read().fields[0], Value::Long(20)));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Value Cycle Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_node_stays_shared() {
    init_logging();
    println!("=== Shared Node Test ===");

    let (server, client, reference) = graph_engines().await;

    let shared = node(7);
    let pair = ValueInstance::new(
        PAIR_ID,
        vec![
            Value::Instance(Some(shared.clone())),
            Value::Instance(Some(shared)),
        ],
    );

    let echoed = client
        .invoke(&reference, "echo_pair", vec![Value::instance(pair)])
        .await
        .unwrap();
    let pair = unwrap_instance(echoed);
    let (left, right) = {
        let fields = &pair.read().fields;
        match (&fields[0], &fields[1]) {
            (Value::Instance(Some(l)), Value::Instance(Some(r))) => (l.clone(), r.clone()),
            other => panic!("pair arms missing: {other:?}"),
        }
    };

    // one decoded instance aliased from both arms
    assert!(Arc::ptr_eq(&left, &right));
    left.write().fields[0] = Value::Long(99);
    assert!(matches!(right.read().fields[0], Value::Long(99)));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Shared Node Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_walks_a_decoded_cycle() {
    init_logging();

    let (server, client, reference) = graph_engines().await;

    let a = node(5);
    let b = node(6);
    link(&a, &b);
    link(&b, &a);

    let result = client
        .invoke(&reference, "sum", vec![Value::Instance(Some(a))])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::LongLong(11)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn null_instance_round_trips() {
    init_logging();

    let (server, client, reference) = graph_engines().await;

    let echoed = client
        .invoke(&reference, "echo", vec![Value::null()])
        .await
        .unwrap();
    assert_eq!(echoed, Some(Value::null()));

    client.shutdown().await;
    server.shutdown().await;
}

const STAMP_ID: &str = "IDL:demo/Timestamp:1.0";
const CLOCK_ID: &str = "IDL:demo/Clock:1.0";

fn stamp_mapping() -> TypeMapping {
    TypeMapping::new(
        WireType::LongLong,
        |instance| match instance.fields.first() {
            Some(Value::LongLong(t)) => Ok(Value::LongLong(*t)),
            other => Err(OrbError::MalformedMessage(format!("timestamp of {other:?}"))),
        },
        |value| match value {
            Value::LongLong(t) => Ok(ValueInstance::new(STAMP_ID, vec![Value::LongLong(t)])),
            other => Err(OrbError::MalformedMessage(format!("timestamp from {other:?}"))),
        },
    )
}

fn clock_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new(CLOCK_ID).operation(
        OperationSignature::new("bump")
            .param(WireType::value(STAMP_ID))
            .returns(WireType::value(STAMP_ID)),
    )
}

struct ClockServant;

#[async_trait::async_trait]
impl orb::Servant for ClockServant {
    fn type_id(&self) -> &str {
        CLOCK_ID
    }

    async fn invoke(&self, operation: &str, mut args: Vec<Value>) -> orb::Result<Option<Value>> {
        match operation {
            "bump" => match args.pop() {
                Some(Value::Instance(Some(stamp))) => {
                    let t = match stamp.read().fields.first() {
                        Some(Value::LongLong(t)) => *t,
                        other => {
                            return Err(OrbError::MalformedMessage(format!("bump of {other:?}")))
                        }
                    };
                    Ok(Some(Value::instance(ValueInstance::new(
                        STAMP_ID,
                        vec![Value::LongLong(t + 1)],
                    ))))
                }
                other => Err(OrbError::MalformedMessage(format!("bump of {other:?}"))),
            },
            other => Err(OrbError::BadOperation(other.to_string())),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn custom_mapping_applies_on_both_ends() {
    init_logging();
    println!("=== Custom Mapping Test ===");

    let (server, client, _addr) = engine_pair(OrbConfig::default(), OrbConfig::default()).await;
    for orb in [&server, &client] {
        orb.register_interface(clock_interface()).unwrap();
        orb.register_type_mapping(STAMP_ID, stamp_mapping()).unwrap();
    }

    let reference = server.activate("app", Arc::new(ClockServant)).unwrap();
    let reference = client
        .string_to_object(&server.object_to_string(&reference))
        .unwrap();

    let stamp = ValueInstance::new(STAMP_ID, vec![Value::LongLong(1_000)]);
    let bumped = client
        .invoke(&reference, "bump", vec![Value::instance(stamp)])
        .await
        .unwrap();
    let bumped = unwrap_instance(bumped);
    assert_eq!(bumped.read().type_id, STAMP_ID);
    assert!(matches!(bumped.read().fields.as_slice(), [Value::LongLong(1_001)]));

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Custom Mapping Test PASSED ===");
}
