//! Shared fixtures for the integration suite: logging setup, the demo
//! interfaces and the servants behind them. Every test file talks to a
//! real engine pair over loopback TCP.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use orb::{
    InterfaceDescriptor, OperationSignature, Orb, OrbConfig, OrbError, Servant, Value,
    ValueTypeDescriptor, WireType,
};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static LOGGING: Once = Once::new();

/// Install the tracing subscriber once per test binary. `RUST_LOG`
/// overrides the default filter.
pub fn init_logging() {
    LOGGING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .init();
    });
}

pub const COUNTER_ID: &str = "IDL:demo/Counter:1.0";
pub const COUNTER_ERROR_ID: &str = "IDL:demo/CounterError:1.0";
pub const SLEEPER_ID: &str = "IDL:demo/Sleeper:1.0";
pub const BLOB_ID: &str = "IDL:demo/Blob:1.0";
pub const GRAPH_ID: &str = "IDL:demo/Graph:1.0";
pub const NODE_ID: &str = "IDL:demo/Node:1.0";
pub const PAIR_ID: &str = "IDL:demo/Pair:1.0";

/// Counter: `inc(long) -> long`, `reset()`, `boom(long) -> long` raising
/// a user exception, oneway `note(long)`.
pub fn counter_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new(COUNTER_ID)
        .operation(
            OperationSignature::new("inc")
                .param(WireType::Long)
                .returns(WireType::Long),
        )
        .operation(OperationSignature::new("reset"))
        .operation(
            OperationSignature::new("boom")
                .param(WireType::Long)
                .returns(WireType::Long),
        )
        .operation(OperationSignature::new("note").param(WireType::Long).oneway())
}

/// Exception members `boom` appends after the repository id: the
/// offending argument as four big-endian octets.
pub fn counter_error_body(n: i32) -> Bytes {
    Bytes::copy_from_slice(&n.to_be_bytes())
}

pub struct CounterServant {
    pub hits: AtomicU64,
    pub notes: AtomicI64,
}

impl CounterServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicU64::new(0),
            notes: AtomicI64::new(0),
        })
    }
}

#[async_trait]
impl Servant for CounterServant {
    fn type_id(&self) -> &str {
        COUNTER_ID
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> orb::Result<Option<Value>> {
        match (operation, args.as_slice()) {
            ("inc", [Value::Long(n)]) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Value::Long(n + 1)))
            }
            ("reset", []) => {
                self.hits.store(0, Ordering::SeqCst);
                Ok(None)
            }
            ("boom", [Value::Long(n)]) => Err(OrbError::UserException {
                repo_id: COUNTER_ERROR_ID.to_string(),
                body: counter_error_body(*n),
            }),
            ("note", [Value::Long(n)]) => {
                self.notes.fetch_add(*n as i64, Ordering::SeqCst);
                Ok(None)
            }
            _ => Err(OrbError::BadOperation(operation.to_string())),
        }
    }
}

/// Sleeper: `work(ulong delay_ms, long tag) -> long` echoes the tag
/// after sleeping, so reply ordering and cancellation can be observed.
pub fn sleeper_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new(SLEEPER_ID).operation(
        OperationSignature::new("work")
            .param(WireType::ULong)
            .param(WireType::Long)
            .returns(WireType::Long),
    )
}

pub struct SleeperServant {
    pub completed: AtomicU64,
}

impl SleeperServant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Servant for SleeperServant {
    fn type_id(&self) -> &str {
        SLEEPER_ID
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> orb::Result<Option<Value>> {
        match (operation, args.as_slice()) {
            ("work", [Value::ULong(delay_ms), Value::Long(tag)]) => {
                tokio::time::sleep(Duration::from_millis(*delay_ms as u64)).await;
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Value::Long(*tag)))
            }
            _ => Err(OrbError::BadOperation(operation.to_string())),
        }
    }
}

/// Blob: `echo(sequence<octet>)` and `digest(sequence<octet>) -> u64`,
/// for payloads big enough to fragment.
pub fn blob_interface() -> InterfaceDescriptor {
    let octets = || WireType::seq(WireType::Octet);
    InterfaceDescriptor::new(BLOB_ID)
        .operation(
            OperationSignature::new("echo")
                .param(octets())
                .returns(octets()),
        )
        .operation(
            OperationSignature::new("digest")
                .param(octets())
                .returns(WireType::ULongLong),
        )
}

pub struct BlobServant;

#[async_trait]
impl Servant for BlobServant {
    fn type_id(&self) -> &str {
        BLOB_ID
    }

    async fn invoke(&self, operation: &str, mut args: Vec<Value>) -> orb::Result<Option<Value>> {
        match operation {
            "echo" => Ok(args.pop()),
            "digest" => match args.pop() {
                Some(Value::Seq(items)) => Ok(Some(Value::ULongLong(payload_digest(&items)))),
                other => Err(OrbError::MalformedMessage(format!(
                    "digest of {other:?}"
                ))),
            },
            other => Err(OrbError::BadOperation(other.to_string())),
        }
    }
}

/// Deterministic octet payload of the given length.
pub fn octet_payload(len: usize) -> Vec<Value> {
    (0..len).map(|i| Value::Octet((i % 251) as u8)).collect()
}

/// Position-weighted digest over a decoded octet sequence.
pub fn payload_digest(items: &[Value]) -> u64 {
    items
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, item)| match item {
            Value::Octet(b) => acc
                .wrapping_mul(31)
                .wrapping_add(*b as u64)
                .wrapping_add(i as u64),
            _ => acc,
        })
}

/// Register the graph value types and interface on an engine. Both ends
/// of a connection need the same registrations.
pub fn register_graph_types(orb: &Orb) {
    orb.register_value_type(
        ValueTypeDescriptor::new(NODE_ID)
            .field("value", WireType::Long)
            .field("next", WireType::value(NODE_ID)),
    )
    .unwrap();
    orb.register_value_type(
        ValueTypeDescriptor::new(PAIR_ID)
            .field("left", WireType::value(NODE_ID))
            .field("right", WireType::value(NODE_ID)),
    )
    .unwrap();
    orb.register_interface(
        InterfaceDescriptor::new(GRAPH_ID)
            .operation(
                OperationSignature::new("echo")
                    .param(WireType::value(NODE_ID))
                    .returns(WireType::value(NODE_ID)),
            )
            .operation(
                OperationSignature::new("echo_pair")
                    .param(WireType::value(PAIR_ID))
                    .returns(WireType::value(PAIR_ID)),
            )
            .operation(
                OperationSignature::new("sum")
                    .param(WireType::value(NODE_ID))
                    .returns(WireType::LongLong),
            ),
    )
    .unwrap();
}

/// Echoes graphs back unchanged and sums node chains cycle-safely.
pub struct GraphServant;

#[async_trait]
impl Servant for GraphServant {
    fn type_id(&self) -> &str {
        GRAPH_ID
    }

    async fn invoke(&self, operation: &str, mut args: Vec<Value>) -> orb::Result<Option<Value>> {
        match operation {
            "echo" | "echo_pair" => Ok(args.pop()),
            "sum" => match args.pop() {
                Some(value) => Ok(Some(Value::LongLong(sum_chain(&value)))),
                None => Err(OrbError::BadOperation("sum without argument".into())),
            },
            other => Err(OrbError::BadOperation(other.to_string())),
        }
    }
}

/// Walk a node chain following `next`, stopping at null or at the first
/// revisited instance.
pub fn sum_chain(value: &Value) -> i64 {
    let mut seen = std::collections::HashSet::new();
    let mut total = 0i64;
    let mut current = match value {
        Value::Instance(Some(vref)) => Some(vref.clone()),
        _ => None,
    };
    while let Some(vref) = current {
        if !seen.insert(Arc::as_ptr(&vref) as usize) {
            break;
        }
        let instance = vref.read();
        if let Some(Value::Long(n)) = instance.fields.first() {
            total += *n as i64;
        }
        current = match instance.fields.get(1) {
            Some(Value::Instance(Some(next))) => Some(next.clone()),
            _ => None,
        };
    }
    total
}

/// Engine pair over loopback: server listening with the given adapter
/// created, client freshly configured. Registrations are up to the test.
pub async fn engine_pair(
    server_config: OrbConfig,
    client_config: OrbConfig,
) -> (Orb, Orb, std::net::SocketAddr) {
    let server = Orb::new(server_config);
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    server
        .create_adapter("app", orb::AdapterPolicy::default())
        .unwrap();
    let client = Orb::new(client_config);
    (server, client, addr)
}
