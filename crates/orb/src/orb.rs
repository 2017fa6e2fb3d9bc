//! Engine facade.
//!
//! [`Orb`] ties the layers together: the type registry, the object
//! adapters served by the request dispatcher, the connection manager and
//! the listen loop. It is the one handle applications hold; clones share
//! the same engine instance.
//!
//! Invocations go through [`Orb::resolve`]: a reference whose object key
//! names a servant activated in this engine short-circuits to a direct
//! call, everything else becomes a [`Proxy`] over the connection manager.

use crate::adapter::{AdapterPolicy, AdapterRegistry, ObjectAdapter, Servant};
use crate::dispatcher::Dispatcher;
use crate::error::{OrbError, Result};
use crate::ior::{IiopProfile, Ior};
use crate::naming::InitialReferences;
use crate::proxy::{CallToken, Proxy};
use crate::registry::{InterfaceDescriptor, TypeMapping, TypeRegistry, ValueTypeDescriptor};
use crate::value::Value;
use bytes::Bytes;
use giop::{
    ConnectionConfig, ConnectionManager, ListenPoint, ManagerConfig, DEFAULT_MAX_MESSAGE_SIZE,
};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct OrbConfig {
    /// Byte order for messages this engine originates.
    pub little_endian: bool,
    /// Cap on a single incoming message, reassembled size included.
    pub max_message_size: usize,
    /// Split outgoing frames larger than this into fragment trains.
    /// `None` disables outgoing fragmentation.
    pub fragment_size: Option<usize>,
    /// Fail an outstanding call after this long.
    pub request_timeout: Option<Duration>,
    /// Close dialed connections unused for this long.
    pub idle_timeout: Option<Duration>,
    /// Give up dialing a peer after this long.
    pub connect_timeout: Option<Duration>,
    /// Offer our listen points to peers we dial, and honor listen points
    /// peers advertise to us, so callbacks reuse existing connections.
    pub bidirectional: bool,
    /// Ceiling on concurrently served accepted connections per listener.
    pub max_connections: usize,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            little_endian: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragment_size: None,
            request_timeout: None,
            idle_timeout: None,
            connect_timeout: None,
            bidirectional: true,
            max_connections: 256,
        }
    }
}

/// Where a reference leads.
pub enum Resolved {
    /// A servant activated in this engine.
    Local(Arc<dyn Servant>),
    /// A remote object reached through the connection manager.
    Remote(Proxy),
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolved::Local(servant) => write!(f, "Local({})", servant.type_id()),
            Resolved::Remote(proxy) => write!(f, "Remote({:?})", proxy),
        }
    }
}

pub(crate) struct OrbCore {
    pub(crate) config: OrbConfig,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) adapters: Arc<AdapterRegistry>,
    pub(crate) manager: ConnectionManager,
    listen_points: Mutex<Vec<ListenPoint>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Notify,
    shutting_down: AtomicBool,
    initial: RwLock<Option<Arc<dyn InitialReferences>>>,
}

/// One protocol engine instance.
#[derive(Clone)]
pub struct Orb {
    core: Arc<OrbCore>,
}

impl Orb {
    pub fn new(config: OrbConfig) -> Self {
        let registry = Arc::new(TypeRegistry::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let manager = ConnectionManager::new(ManagerConfig {
            connection: ConnectionConfig {
                little_endian: config.little_endian,
                max_message_size: config.max_message_size,
                fragment_size: config.fragment_size,
                request_timeout: config.request_timeout,
                accept_bidir: config.bidirectional,
            },
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
        });
        manager.set_handler(Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&adapters),
            config.little_endian,
        )));
        Self {
            core: Arc::new(OrbCore {
                config,
                registry,
                adapters,
                manager,
                listen_points: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                shutdown: Notify::new(),
                shutting_down: AtomicBool::new(false),
                initial: RwLock::new(None),
            }),
        }
    }

    /// Bind a listener and serve inbound connections until [`shutdown`].
    ///
    /// The engine may listen on several endpoints; each bound address
    /// becomes part of newly minted references and, with bidirectional
    /// reuse on, of the callback endpoints advertised to peers. Returns
    /// the bound address, which carries the actual port for `:0` binds.
    ///
    /// [`shutdown`]: Orb::shutdown
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let points = {
            let mut table = self.core.listen_points.lock();
            table.push(ListenPoint {
                host: local.ip().to_string(),
                port: local.port(),
            });
            table.clone()
        };
        if self.core.config.bidirectional {
            self.core.manager.set_own_listen_points(points);
        }

        let task = tokio::spawn(accept_loop(Arc::clone(&self.core), listener));
        self.core.listeners.lock().push(task);
        info!("listening on {}", local);
        Ok(local)
    }

    /// Stop the listeners, close every connection and destroy all
    /// adapters. Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.shutdown.notify_waiters();
        let listeners: Vec<JoinHandle<()>> = self.core.listeners.lock().drain(..).collect();
        for task in listeners {
            let _ = task.await;
        }
        self.core.manager.shutdown().await;
        self.core.adapters.destroy_all();
        info!("engine stopped");
    }

    /// Resolve a reference. A profile whose object key names a servant
    /// activated in one of this engine's adapters short-circuits to it;
    /// anything else becomes a remote proxy.
    pub fn resolve(&self, reference: &Ior) -> Result<Resolved> {
        if reference.is_nil() {
            return Err(OrbError::UnresolvableReference("nil reference".into()));
        }
        for profile in reference.iiop_profiles() {
            if let Some(servant) = self.core.adapters.resolve(&profile.object_key) {
                return Ok(Resolved::Local(servant));
            }
        }
        Ok(Resolved::Remote(Proxy::new(
            Arc::clone(&self.core),
            reference.clone(),
        )))
    }

    /// Invoke `operation` on the object `reference` names and wait for
    /// the result (`None` for void operations). Operations declared
    /// oneway are fired without waiting.
    pub async fn invoke(
        &self,
        reference: &Ior,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        match self.resolve(reference)? {
            Resolved::Local(servant) => {
                self.invoke_local(servant, reference, operation, args, false)
                    .await
            }
            Resolved::Remote(proxy) => proxy.invoke(operation, &args).await,
        }
    }

    /// Like [`invoke`](Orb::invoke), with a token another task may use to
    /// cancel the call. Local calls run to completion; the token only
    /// affects the remote leg.
    pub async fn invoke_cancellable(
        &self,
        reference: &Ior,
        operation: &str,
        args: Vec<Value>,
        token: &CallToken,
    ) -> Result<Option<Value>> {
        match self.resolve(reference)? {
            Resolved::Local(servant) => {
                self.invoke_local(servant, reference, operation, args, false)
                    .await
            }
            Resolved::Remote(proxy) => proxy.invoke_cancellable(operation, &args, token).await,
        }
    }

    /// Fire-and-forget invocation. Returns once the frame is on the wire
    /// (or, for a local target, once execution is scheduled); failures in
    /// the target are logged, never reported.
    pub async fn oneway(&self, reference: &Ior, operation: &str, args: Vec<Value>) -> Result<()> {
        match self.resolve(reference)? {
            Resolved::Local(servant) => {
                self.invoke_local(servant, reference, operation, args, true)
                    .await?;
                Ok(())
            }
            Resolved::Remote(proxy) => proxy.oneway(operation, &args).await,
        }
    }

    /// Whether the reference names an active object, here or remotely.
    pub async fn locate(&self, reference: &Ior) -> Result<bool> {
        match self.resolve(reference)? {
            Resolved::Local(_) => Ok(true),
            Resolved::Remote(proxy) => proxy.locate().await,
        }
    }

    /// Local leg of an invocation: the same signature checks the remote
    /// path performs, without a wire in between.
    async fn invoke_local(
        &self,
        servant: Arc<dyn Servant>,
        reference: &Ior,
        operation: &str,
        args: Vec<Value>,
        force_oneway: bool,
    ) -> Result<Option<Value>> {
        let interface = self
            .core
            .registry
            .interface(&reference.type_id)
            .ok_or_else(|| OrbError::UnknownType(reference.type_id.clone()))?;
        let signature = interface.find_operation(operation).ok_or_else(|| {
            OrbError::BadOperation(format!(
                "{} has no operation {:?}",
                reference.type_id, operation
            ))
        })?;
        if signature.params.len() != args.len() {
            return Err(OrbError::BadOperation(format!(
                "{operation} takes {} argument(s), got {}",
                signature.params.len(),
                args.len()
            )));
        }

        if force_oneway || signature.oneway {
            let operation = operation.to_string();
            tokio::spawn(async move {
                if let Err(e) = servant.invoke(&operation, args).await {
                    warn!("oneway {} failed: {}", operation, e);
                }
            });
            return Ok(None);
        }

        let result = servant.invoke(operation, args).await?;
        match (&signature.result, result) {
            (Some(_), Some(value)) => Ok(Some(value)),
            (Some(_), None) => Err(OrbError::MalformedMessage(format!(
                "operation {operation} produced no result"
            ))),
            (None, _) => Ok(None),
        }
    }

    /// Create an object adapter with the given policy.
    pub fn create_adapter(
        &self,
        name: impl Into<String>,
        policy: AdapterPolicy,
    ) -> Result<Arc<ObjectAdapter>> {
        self.core.adapters.create(name, policy)
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.core.adapters.get(name)
    }

    /// Destroy an adapter. References minted by a transient adapter stop
    /// resolving for good.
    pub fn destroy_adapter(&self, name: &str) -> Result<()> {
        self.core.adapters.destroy(name)
    }

    /// Activate `servant` under the named adapter and mint a reference
    /// rooted at this engine's first listen endpoint.
    pub fn activate(&self, adapter: &str, servant: Arc<dyn Servant>) -> Result<Ior> {
        let adapter = self
            .core
            .adapters
            .get(adapter)
            .ok_or_else(|| OrbError::ObjectNotExist(format!("adapter {adapter}")))?;
        let type_id = servant.type_id().to_string();
        let key = adapter.activate(servant)?;
        self.object_reference(&type_id, key)
    }

    /// Reference to `object_key` as served by this engine. Fails until
    /// [`listen`](Orb::listen) has bound an endpoint to root it at.
    pub fn object_reference(&self, type_id: &str, object_key: Bytes) -> Result<Ior> {
        let point = self
            .core
            .listen_points
            .lock()
            .first()
            .cloned()
            .ok_or_else(|| OrbError::UnresolvableReference("engine is not listening".into()))?;
        Ok(Ior::new(
            type_id,
            IiopProfile::new(point.host, point.port, object_key),
        ))
    }

    pub fn register_value_type(&self, descriptor: ValueTypeDescriptor) -> Result<()> {
        self.core.registry.register_value_type(descriptor)
    }

    pub fn register_interface(&self, descriptor: InterfaceDescriptor) -> Result<()> {
        self.core.registry.register_interface(descriptor)
    }

    /// Custom wire mapping for a repository id; see
    /// [`TypeRegistry::register_mapping`].
    pub fn register_type_mapping(
        &self,
        type_id: impl Into<String>,
        mapping: TypeMapping,
    ) -> Result<()> {
        self.core.registry.register_mapping(type_id, mapping)
    }

    /// `IOR:` hex form of a reference.
    pub fn object_to_string(&self, reference: &Ior) -> String {
        reference.to_string()
    }

    /// Parse `IOR:` or `corbaloc:` text into a reference.
    pub fn string_to_object(&self, text: &str) -> Result<Ior> {
        text.parse()
    }

    /// CDR encapsulation of a reference, as embedded in message bodies.
    pub fn reference_to_wire(&self, reference: &Ior) -> Bytes {
        reference.to_wire()
    }

    pub fn reference_from_wire(&self, bytes: Bytes) -> Result<Ior> {
        Ior::from_wire(bytes)
    }

    /// Install the bootstrap resolver behind [`resolve_initial`].
    ///
    /// [`resolve_initial`]: Orb::resolve_initial
    pub fn set_initial_references(&self, provider: Arc<dyn InitialReferences>) {
        *self.core.initial.write() = Some(provider);
    }

    /// Resolve a bootstrap name such as `"NameService"` to a reference.
    pub async fn resolve_initial(&self, name: &str) -> Result<Ior> {
        let provider = self.core.initial.read().clone().ok_or_else(|| {
            OrbError::UnresolvableReference(format!("no initial references installed ({name})"))
        })?;
        provider.resolve_initial(name).await
    }

    /// Endpoints this engine is listening on.
    pub fn listen_points(&self) -> Vec<ListenPoint> {
        self.core.listen_points.lock().clone()
    }

    pub fn connections_originated(&self) -> usize {
        self.core.manager.originated_count()
    }

    pub fn connections_accepted(&self) -> usize {
        self.core.manager.accepted_count()
    }
}

impl std::fmt::Debug for Orb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orb")
            .field("listen_points", &*self.core.listen_points.lock())
            .field("shutting_down", &self.core.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

/// Accept loop of one listener: admits up to `max_connections` peers at
/// a time, each handed to the connection manager, until shutdown.
async fn accept_loop(core: Arc<OrbCore>, listener: TcpListener) {
    let permits = Arc::new(Semaphore::new(core.config.max_connections));
    while !core.shutting_down.load(Ordering::SeqCst) {
        tokio::select! {
            biased;
            _ = core.shutdown.notified() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let permit = match Arc::clone(&permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection from {} refused: at capacity", peer);
                        continue;
                    }
                };
                let (r, w) = stream.into_split();
                let conn = core.manager.accept(peer.to_string(), r, w);
                debug!("accepted connection from {}", peer);
                // The permit lives as long as the connection it admitted.
                tokio::spawn(async move {
                    conn.wait_closed().await;
                    drop(permit);
                });
            }
        }
    }
    debug!("listener stopped");
}
