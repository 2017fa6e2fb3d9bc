//! Forwarding tests: replies that point the caller somewhere else.
//!
//! A LocationForward reply carries a replacement reference and the engine
//! retries the call against it transparently; locate queries follow
//! ObjectForward the same way. The far end here is a bare GIOP endpoint
//! that answers everything with a forward, either to a live engine or
//! back to itself until the hop cap runs out.

mod common;

use bytes::Bytes;
use common::*;
use giop::{
    GiopTransport, LocateReplyHeader, LocateStatus, Message, MessageWriter, ReplyHeader,
    ReplyStatus,
};
use orb::{IiopProfile, Ior, Orb, OrbConfig, OrbError, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Forwarding endpoint: every Request gets a LocationForward reply and
/// every LocateRequest an ObjectForward reply, both carrying the
/// reference `forward_to` builds from the endpoint's own address.
/// Returns that address and the count of forwards served.
async fn forwarding_far_end<F>(forward_to: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: FnOnce(SocketAddr) -> Ior,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let target = forward_to(addr);
    let served = Arc::new(AtomicUsize::new(0));

    let count = served.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let target = target.clone();
            let count = count.clone();
            tokio::spawn(async move {
                let (read, write) = socket.into_split();
                let mut reader = GiopTransport::new(read);
                let mut writer = GiopTransport::new(write);
                while let Ok(frame) = reader.read_message().await {
                    let reply = match Message::parse(frame) {
                        Ok(Message::Request { header, .. }) => {
                            let header =
                                ReplyHeader::new(header.request_id, ReplyStatus::LocationForward);
                            let mut mw = MessageWriter::reply(&header, false);
                            target.encode(mw.body());
                            mw.finish()
                        }
                        Ok(Message::LocateRequest(header)) => {
                            let header = LocateReplyHeader {
                                request_id: header.request_id,
                                status: LocateStatus::ObjectForward,
                            };
                            let mut mw = MessageWriter::locate_reply(&header, false);
                            target.encode(mw.body());
                            mw.finish()
                        }
                        _ => break,
                    };
                    count.fetch_add(1, Ordering::SeqCst);
                    if writer.write_message(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, served)
}

/// Counter pair over loopback with the reference already translated to
/// the client through its stringified form.
async fn counter_engines() -> (Orb, Orb, Ior, Arc<CounterServant>) {
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

/// Reference reaching `addr` under the type id and key of `original`.
fn reference_via(addr: SocketAddr, original: &Ior) -> Ior {
    Ior::new(
        original.type_id.clone(),
        IiopProfile::new(
            addr.ip().to_string(),
            addr.port(),
            original.object_key().unwrap().clone(),
        ),
    )
}

/// Reference that points back at the forwarder itself.
fn loop_reference(addr: SocketAddr) -> Ior {
    Ior::new(
        COUNTER_ID,
        IiopProfile::new(
            addr.ip().to_string(),
            addr.port(),
            Bytes::from_static(b"loop"),
        ),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarded_call_lands_on_the_live_engine() {
    init_logging();
    println!("=== Location Forward Test ===");

    let (server, client, reference, servant) = counter_engines().await;

    let target = reference.clone();
    let (fwd_addr, served) = forwarding_far_end(move |_| target).await;
    let via = reference_via(fwd_addr, &reference);

    let result = client
        .invoke(&via, "inc", vec![Value::Long(1)])
        .await
        .unwrap();
    assert_eq!(result, Some(Value::Long(2)));
    assert_eq!(servant.hits.load(Ordering::SeqCst), 1);

    // one hop through the forwarder, then the call went to the engine
    assert_eq!(served.load(Ordering::SeqCst), 1);
    assert_eq!(client.connections_originated(), 2);

    client.shutdown().await;
    server.shutdown().await;
    println!("=== Location Forward Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_loop_gives_up_after_the_hop_cap() {
    init_logging();
    println!("=== Forward Cap Test ===");

    let client = Orb::new(OrbConfig::default());
    client.register_interface(counter_interface()).unwrap();

    let (fwd_addr, served) = forwarding_far_end(loop_reference).await;
    let via = loop_reference(fwd_addr);

    let err = client
        .invoke(&via, "inc", vec![Value::Long(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, OrbError::UnresolvableReference(_)));

    // the original attempt plus four followed hops, all on one connection
    assert_eq!(served.load(Ordering::SeqCst), 5);
    assert_eq!(client.connections_originated(), 1);

    client.shutdown().await;
    println!("=== Forward Cap Test PASSED ===");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locate_follows_object_forward() {
    init_logging();

    let (server, client, reference, _servant) = counter_engines().await;

    let target = reference.clone();
    let (fwd_addr, served) = forwarding_far_end(move |_| target).await;
    let via = reference_via(fwd_addr, &reference);

    assert!(client.locate(&via).await.unwrap());
    assert_eq!(served.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    server.shutdown().await;
}
