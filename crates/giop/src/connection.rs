//! GIOP connection runtime
//!
//! A single IIOP connection multiplexes concurrent calls in both
//! directions. A reader task owns the receive half: it reassembles
//! fragment trains, routes Reply and LocateReply frames to the pending
//! map by request id, and hands inbound Request frames to the installed
//! [`RequestHandler`]. Callers block on a oneshot slot, never on the
//! socket, so replies may resolve in any order.
//!
//! Request ids are allocated with distinct parity per direction: the
//! connection originator uses even ids, the acceptor uses odd ids for
//! callbacks it sends back over the same connection. The two sides can
//! therefore never collide inside one pending map.

use crate::error::{GiopError, Result};
use crate::fragments::{read_request_id, FragmentAssembler, FragmentSplitter};
use crate::message::{
    BiDirContext, GiopHeader, ListenPoint, Message, MessageKind, MessageWriter, ServiceContext,
};
use crate::transport::{GiopTransport, DEFAULT_MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Boxed receive half of a transport stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed send half of a transport stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Grace period for draining in-flight replies during an orderly close
/// when no request timeout is configured.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed the peer.
    Originator,
    /// The peer dialed us.
    Acceptor,
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Byte order for frames this connection originates itself
    /// (CancelRequest, CloseConnection, MessageError).
    pub little_endian: bool,
    /// Cap on a single incoming message, reassembled size included.
    pub max_message_size: usize,
    /// Split outgoing frames larger than this into fragment trains.
    /// `None` disables outgoing fragmentation.
    pub fragment_size: Option<usize>,
    /// Fail a pending call with `Timeout` after this long.
    pub request_timeout: Option<Duration>,
    /// Honor BiDir listen points advertised by peers on accepted
    /// connections, making them eligible for callback reuse.
    pub accept_bidir: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            little_endian: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_size: None,
            request_timeout: None,
            accept_bidir: true,
        }
    }
}

/// Receiver side of inbound Request and LocateRequest frames.
///
/// The reader task parses the frame and spawns one task per invocation,
/// so a slow servant never stalls reply routing for other calls on the
/// same connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound message, returning the complete reply frame to
    /// send back, or `None` when no reply is owed.
    async fn handle(&self, message: Message) -> Option<Bytes>;

    /// Advisory notice that the peer cancelled an in-flight request.
    /// Execution already in progress may still run to completion.
    async fn cancel(&self, request_id: u32) {
        let _ = request_id;
    }
}

struct ConnectionInner {
    peer: String,
    role: ConnectionRole,
    config: ConnectionConfig,
    writer: tokio::sync::Mutex<GiopTransport<BoxedWriter>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Bytes>>>>,
    /// Signalled whenever the pending map drains to empty.
    drained: Notify,
    next_request_id: AtomicU32,
    closed: AtomicBool,
    /// Signalled once the connection reaches its final closed state.
    closed_notify: Notify,
    /// The one-per-connection CodeSets advertisement went out.
    codesets_sent: AtomicBool,
    /// We advertised listen points to the peer, so it may send requests
    /// back over this connection.
    bidir_offered: AtomicBool,
    /// Listen points the peer advertised on an accepted connection.
    peer_listen_points: Mutex<Vec<ListenPoint>>,
    handler: Option<Arc<dyn RequestHandler>>,
    last_used: Mutex<Instant>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Take the pending slot for a request id, signalling drain waiters
    /// when the map empties.
    fn take_pending(&self, request_id: u32) -> Option<oneshot::Sender<Result<Bytes>>> {
        let mut pending = self.pending.lock();
        let slot = pending.remove(&request_id);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
        slot
    }

    fn complete(&self, request_id: u32, frame: Bytes) {
        match self.take_pending(request_id) {
            Some(slot) => {
                if slot.send(Ok(frame)).is_err() {
                    trace!("reply {} arrived after the caller gave up", request_id);
                }
            }
            None => trace!("dropping unmatched reply for request {}", request_id),
        }
    }

    /// Fail every pending call. The connection is unusable afterwards.
    fn fail_all(&self) {
        let pending = {
            let mut map = self.pending.lock();
            self.drained.notify_waiters();
            std::mem::take(&mut *map)
        };
        for (request_id, slot) in pending {
            trace!("failing pending request {} on dropped connection", request_id);
            let _ = slot.send(Err(GiopError::ConnectionClosed));
        }
    }

    fn accepts_requests(&self) -> bool {
        self.handler.is_some()
            && (self.role == ConnectionRole::Acceptor || self.bidir_offered.load(Ordering::SeqCst))
    }
}

/// A live GIOP connection. Cheap to clone; all clones share the same
/// transport, pending map and reader task.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an already established transport and start the reader task.
    ///
    /// `handler` receives inbound requests; pass `None` for a pure
    /// client connection, which answers any inbound Request with
    /// MessageError.
    pub fn spawn<R, W>(
        peer: impl Into<String>,
        role: ConnectionRole,
        reader: R,
        writer: W,
        handler: Option<Arc<dyn RequestHandler>>,
        config: ConnectionConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let max_message_size = config.max_message_size;
        // Originators allocate even request ids, acceptors odd ones.
        let first_id = match role {
            ConnectionRole::Originator => 2,
            ConnectionRole::Acceptor => 1,
        };
        let inner = Arc::new(ConnectionInner {
            peer: peer.into(),
            role,
            config,
            writer: tokio::sync::Mutex::new(GiopTransport::new(Box::new(writer) as BoxedWriter)),
            pending: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            next_request_id: AtomicU32::new(first_id),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            codesets_sent: AtomicBool::new(false),
            bidir_offered: AtomicBool::new(false),
            peer_listen_points: Mutex::new(Vec::new()),
            handler,
            last_used: Mutex::new(Instant::now()),
            reader_task: Mutex::new(None),
        });

        let transport = GiopTransport::new(Box::new(reader) as BoxedReader)
            .with_max_message_size(max_message_size);
        let task = tokio::spawn(read_loop(Arc::clone(&inner), transport));
        *inner.reader_task.lock() = Some(task);

        Self { inner }
    }

    /// Peer endpoint this connection reaches, as a `host:port` key.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Allocate the next request id, preserving the per-role parity.
    pub fn next_request_id(&self) -> u32 {
        self.inner.next_request_id.fetch_add(2, Ordering::SeqCst)
    }

    /// Claim the one-per-connection CodeSets advertisement. Returns true
    /// only on the first call; the caller attaches the context to that
    /// request.
    pub fn claim_codesets(&self) -> bool {
        !self.inner.codesets_sent.swap(true, Ordering::SeqCst)
    }

    /// Record that we attached a BiDir listen-point context on this
    /// connection, which licenses the peer to send requests back.
    pub fn mark_bidir_offered(&self) {
        self.inner.bidir_offered.store(true, Ordering::SeqCst);
    }

    pub fn bidir_offered(&self) -> bool {
        self.inner.bidir_offered.load(Ordering::SeqCst)
    }

    /// Listen points the peer advertised over this connection, if any.
    pub fn peer_listen_points(&self) -> Vec<ListenPoint> {
        self.inner.peer_listen_points.lock().clone()
    }

    /// Time since the last frame crossed this connection.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_used.lock().elapsed()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Send a frame that expects no correlated reply.
    pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
        send_frame_inner(&self.inner, frame).await
    }

    /// Send a request frame and wait for the correlated reply frame.
    ///
    /// The pending slot is registered before the frame hits the wire,
    /// so a reply can never race past its waiter.
    pub async fn invoke_frame(&self, request_id: u32, frame: Bytes) -> Result<Bytes> {
        if self.is_closed() {
            return Err(GiopError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);

        if let Err(e) = send_frame_inner(&self.inner, frame).await {
            self.inner.take_pending(request_id);
            return Err(e);
        }

        let outcome = match self.inner.config.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.take_pending(request_id);
                    return Err(GiopError::Timeout(request_id));
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result,
            // Sender dropped without resolving: the reader task died.
            Err(_) => Err(GiopError::ConnectionClosed),
        }
    }

    /// Cancel a pending request: the local waiter resolves with
    /// `Cancelled` immediately, and a best-effort CancelRequest is sent
    /// so the peer may abandon execution.
    pub async fn cancel(&self, request_id: u32) -> Result<()> {
        if let Some(slot) = self.inner.take_pending(request_id) {
            let _ = slot.send(Err(GiopError::Cancelled(request_id)));
        }
        let frame =
            MessageWriter::cancel_request(request_id, self.inner.config.little_endian).finish();
        if let Err(e) = send_frame_inner(&self.inner, frame).await {
            debug!(
                "could not send CancelRequest {} to {}: {}",
                request_id, self.inner.peer, e
            );
        }
        Ok(())
    }

    /// Orderly shutdown: drain in-flight replies up to a grace period,
    /// notify the peer with CloseConnection, then tear down. Pending
    /// calls that did not resolve in time fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<()> {
        let grace = self.inner.config.request_timeout.unwrap_or(CLOSE_GRACE);
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.pending.lock().is_empty() || self.is_closed() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }

        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let frame = MessageWriter::close_connection(self.inner.config.little_endian).finish();
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.write_message(&frame).await {
                debug!("CloseConnection to {} not delivered: {}", self.inner.peer, e);
            }
            if let Err(e) = writer.shutdown().await {
                debug!("write half to {} already down: {}", self.inner.peer, e);
            }
        }
        self.abort();
        Ok(())
    }

    /// Tear down without notifying the peer.
    pub fn abort(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.reader_task.lock().take() {
            task.abort();
        }
        self.inner.fail_all();
        self.inner.closed_notify.notify_waiters();
    }

    /// Resolve once the connection has fully stopped, whichever side
    /// ended it.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn send_frame_inner(inner: &ConnectionInner, frame: Bytes) -> Result<()> {
    if inner.closed.load(Ordering::SeqCst) {
        return Err(GiopError::ConnectionClosed);
    }
    let frames = match inner.config.fragment_size {
        Some(limit) => FragmentSplitter::split(frame, limit)?,
        None => vec![frame],
    };
    let mut writer = inner.writer.lock().await;
    for frame in &frames {
        writer.write_message(frame).await?;
    }
    drop(writer);
    inner.touch();
    Ok(())
}

/// Receive loop: one task per connection owns the read half and the
/// fragment assembler. Frames are read in arrival order; request
/// execution is spawned off so it cannot stall reply routing.
async fn read_loop(inner: Arc<ConnectionInner>, mut transport: GiopTransport<BoxedReader>) {
    let mut assembler = FragmentAssembler::with_max_message_size(inner.config.max_message_size);

    let stop = loop {
        let frame = match transport.read_message().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        inner.touch();
        let frame = match assembler.push(frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => break e,
        };
        let header = match GiopHeader::decode(&frame) {
            Ok(header) => header,
            Err(e) => break e,
        };
        match header.kind {
            MessageKind::Reply | MessageKind::LocateReply => {
                match read_request_id(&frame, header.little_endian) {
                    Ok(request_id) => inner.complete(request_id, frame),
                    Err(e) => break e,
                }
            }
            MessageKind::Request | MessageKind::LocateRequest => {
                if let Err(e) = handle_inbound(&inner, frame).await {
                    break e;
                }
            }
            MessageKind::CancelRequest => {
                let request_id = match read_request_id(&frame, header.little_endian) {
                    Ok(request_id) => request_id,
                    Err(e) => break e,
                };
                if assembler.cancel(request_id) {
                    trace!("discarded partial fragment train for request {}", request_id);
                }
                if let Some(handler) = &inner.handler {
                    handler.cancel(request_id).await;
                }
            }
            MessageKind::CloseConnection => {
                debug!("peer {} closed the connection", inner.peer);
                break GiopError::ConnectionClosed;
            }
            MessageKind::MessageError => {
                warn!("peer {} reported a protocol error", inner.peer);
                break GiopError::PeerMessageError;
            }
            // The assembler never emits a bare Fragment frame.
            MessageKind::Fragment => break GiopError::UnexpectedFragment,
        }
    };

    debug!("connection to {} stopped: {}", inner.peer, stop);
    inner.closed.store(true, Ordering::SeqCst);
    inner.fail_all();
    // Answer protocol violations with MessageError, then shut our write
    // half down so the peer observes the close. A sender stuck mid-frame
    // still holds the writer lock; the shutdown is skipped then and the
    // socket closes when the last handle drops.
    if let Ok(mut writer) = inner.writer.try_lock() {
        if peer_protocol_fault(&stop) {
            let frame = MessageWriter::message_error(inner.config.little_endian).finish();
            if let Err(e) = writer.write_message(&frame).await {
                trace!("MessageError to {} not delivered: {}", inner.peer, e);
            }
        }
        if let Err(e) = writer.shutdown().await {
            trace!("write half to {} already down: {}", inner.peer, e);
        }
    }
    inner.closed_notify.notify_waiters();
}

/// Whether a reader stop was caused by the peer violating the protocol,
/// as opposed to the transport going away or an announced close.
fn peer_protocol_fault(error: &GiopError) -> bool {
    !matches!(
        error,
        GiopError::Io(_) | GiopError::ConnectionClosed | GiopError::PeerMessageError
    )
}

/// Dispatch one inbound Request or LocateRequest frame.
async fn handle_inbound(inner: &Arc<ConnectionInner>, frame: Bytes) -> Result<()> {
    if !inner.accepts_requests() {
        warn!(
            "request on connection to {} without bidirectional agreement",
            inner.peer
        );
        let frame = MessageWriter::message_error(inner.config.little_endian).finish();
        return send_frame_inner(inner, frame).await;
    }
    let message = Message::parse(frame)?;

    // An accepted connection becomes callback-eligible once the peer
    // advertises its listen points, when the local config honors them.
    if inner.role == ConnectionRole::Acceptor && inner.config.accept_bidir {
        if let Message::Request { header, .. } = &message {
            if let Some(context) = header.context(ServiceContext::BI_DIR_IIOP) {
                match BiDirContext::from_context(context) {
                    Ok(bidir) => {
                        debug!(
                            "peer {} advertised {} bidir listen point(s)",
                            inner.peer,
                            bidir.listen_points.len()
                        );
                        *inner.peer_listen_points.lock() = bidir.listen_points;
                    }
                    Err(e) => warn!("ignoring malformed BiDir context from {}: {}", inner.peer, e),
                }
            }
        }
    }

    let handler = match &inner.handler {
        Some(handler) => Arc::clone(handler),
        None => return Ok(()),
    };
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Some(reply) = handler.handle(message).await {
            if let Err(e) = send_frame_inner(&inner, reply).await {
                warn!("reply on connection to {} not delivered: {}", inner.peer, e);
            }
        }
    });
    Ok(())
}
