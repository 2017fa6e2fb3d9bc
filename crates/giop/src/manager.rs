//! Connection manager
//!
//! Owns every transport connection of an engine instance: the ones it
//! dialed, keyed by peer endpoint, and the ones it accepted. Selection
//! for an outbound target goes through a single function that prefers an
//! accepted connection whose peer advertised the target as a callback
//! listen point, so bidirectional traffic reuses the inbound connection
//! instead of dialing back.
//!
//! Idle dialed connections are closed by a background sweep after a
//! configurable inactivity period. Accepted connections are never swept;
//! their lifetime belongs to the peer that opened them.

use crate::connection::{Connection, ConnectionConfig, ConnectionRole, RequestHandler};
use crate::error::{GiopError, Result};
use crate::message::{BiDirContext, ListenPoint, ServiceContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connection manager tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Settings applied to every connection this manager creates.
    pub connection: ConnectionConfig,
    /// Close dialed connections unused for this long. `None` keeps them
    /// open until the peer closes or `shutdown`.
    pub idle_timeout: Option<Duration>,
    /// Give up dialing a peer after this long.
    pub connect_timeout: Option<Duration>,
}

struct ManagerInner {
    config: ManagerConfig,
    /// Dispatcher for inbound requests, captured by each new connection.
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    /// Connections we dialed, keyed by peer endpoint.
    originated: Mutex<HashMap<String, Connection>>,
    /// Connections peers dialed to us.
    accepted: Mutex<Vec<Connection>>,
    /// Endpoints we accept callbacks on, advertised via BiDir contexts.
    own_listen_points: Mutex<Vec<ListenPoint>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Manager over all GIOP connections of one engine instance.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                handler: Mutex::new(None),
                originated: Mutex::new(HashMap::new()),
                accepted: Mutex::new(Vec::new()),
                own_listen_points: Mutex::new(Vec::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Install the inbound request dispatcher. Must happen before
    /// connections are created; existing connections keep the handler
    /// they were spawned with.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// Record the endpoints this engine listens on. They are what
    /// [`bidir_context`](Self::bidir_context) advertises to peers.
    pub fn set_own_listen_points(&self, points: Vec<ListenPoint>) {
        *self.inner.own_listen_points.lock() = points;
    }

    pub fn own_listen_points(&self) -> Vec<ListenPoint> {
        self.inner.own_listen_points.lock().clone()
    }

    /// BiDir service context advertising our listen points, or `None`
    /// when this engine is not listening.
    pub fn bidir_context(&self) -> Option<ServiceContext> {
        let listen_points = self.inner.own_listen_points.lock().clone();
        if listen_points.is_empty() {
            return None;
        }
        Some(BiDirContext { listen_points }.to_context())
    }

    pub fn originated_count(&self) -> usize {
        self.inner.originated.lock().len()
    }

    pub fn accepted_count(&self) -> usize {
        self.inner.accepted.lock().len()
    }

    /// The one selection point for outbound traffic: an accepted
    /// connection whose peer advertised `endpoint` as a callback listen
    /// point wins over a dialed connection to the same endpoint. Returns
    /// `None` when a new connection would have to be dialed.
    pub fn select_for(&self, endpoint: &str) -> Option<Connection> {
        {
            let mut accepted = self.inner.accepted.lock();
            accepted.retain(|conn| !conn.is_closed());
            if let Some(conn) = accepted.iter().find(|conn| {
                conn.peer_listen_points()
                    .iter()
                    .any(|point| point.endpoint() == endpoint)
            }) {
                return Some(conn.clone());
            }
        }
        let mut originated = self.inner.originated.lock();
        match originated.get(endpoint) {
            Some(conn) if !conn.is_closed() => Some(conn.clone()),
            Some(_) => {
                originated.remove(endpoint);
                None
            }
            None => None,
        }
    }

    /// Get a connection able to reach `endpoint`, dialing a new one only
    /// when no eligible connection exists. Dialing never blocks traffic
    /// on other connections.
    pub async fn get_connection(&self, endpoint: &str) -> Result<Connection> {
        if let Some(conn) = self.select_for(endpoint) {
            return Ok(conn);
        }
        let conn = self.dial(endpoint).await?;
        self.ensure_sweeper();

        let mut originated = self.inner.originated.lock();
        if let Some(existing) = originated.get(endpoint) {
            if !existing.is_closed() {
                // Lost a dial race; keep the registered connection.
                let existing = existing.clone();
                drop(originated);
                conn.abort();
                return Ok(existing);
            }
        }
        originated.insert(endpoint.to_string(), conn.clone());
        Ok(conn)
    }

    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        debug!("opening connection to {}", endpoint);
        let stream = match self.inner.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(endpoint))
                .await
                .map_err(|_| {
                    GiopError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {endpoint} timed out"),
                    ))
                })??,
            None => TcpStream::connect(endpoint).await?,
        };
        let (reader, writer) = stream.into_split();
        let handler = self.inner.handler.lock().clone();
        Ok(Connection::spawn(
            endpoint,
            ConnectionRole::Originator,
            reader,
            writer,
            handler,
            self.inner.config.connection.clone(),
        ))
    }

    /// Register an inbound transport accepted from `peer` and start
    /// servicing it. The connection becomes callback-eligible once the
    /// peer advertises listen points over it.
    pub fn accept<R, W>(&self, peer: impl Into<String>, reader: R, writer: W) -> Connection
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handler = self.inner.handler.lock().clone();
        if handler.is_none() {
            warn!("accepting a connection without an installed request handler");
        }
        let conn = Connection::spawn(
            peer,
            ConnectionRole::Acceptor,
            reader,
            writer,
            handler,
            self.inner.config.connection.clone(),
        );
        self.inner.accepted.lock().push(conn.clone());
        self.ensure_sweeper();
        conn
    }

    /// Close the dialed connection to `endpoint`, draining in-flight
    /// replies first. Refuses with `NotCloseable` when the endpoint is
    /// served by an accepted bidirectional connection, whose lifetime
    /// belongs to the peer.
    pub async fn close_peer(&self, endpoint: &str) -> Result<()> {
        let originated = self.inner.originated.lock().remove(endpoint);
        if let Some(conn) = originated {
            return conn.close().await;
        }
        let serves_callback = self.inner.accepted.lock().iter().any(|conn| {
            !conn.is_closed()
                && conn
                    .peer_listen_points()
                    .iter()
                    .any(|point| point.endpoint() == endpoint)
        });
        if serves_callback {
            return Err(GiopError::NotCloseable);
        }
        Ok(())
    }

    /// Close every connection, dialed and accepted, gracefully.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        let originated: Vec<Connection> = {
            let mut table = self.inner.originated.lock();
            table.drain().map(|(_, conn)| conn).collect()
        };
        let accepted: Vec<Connection> = std::mem::take(&mut *self.inner.accepted.lock());
        let closes = originated.into_iter().chain(accepted).map(|conn| async move {
            if let Err(e) = conn.close().await {
                debug!("connection to {} closed with error: {}", conn.peer(), e);
            }
        });
        futures::future::join_all(closes).await;
    }

    /// Start the idle sweep on first use; needs a runtime, so it cannot
    /// run from `new`.
    fn ensure_sweeper(&self) {
        let Some(idle) = self.inner.config.idle_timeout else {
            return;
        };
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_none() {
            let inner = Arc::clone(&self.inner);
            *sweeper = Some(tokio::spawn(sweep_loop(inner, idle)));
        }
    }
}

/// Periodically close dialed connections that sat unused for the idle
/// period and hold no pending replies.
async fn sweep_loop(inner: Arc<ManagerInner>, idle: Duration) {
    let start = tokio::time::Instant::now() + idle * 2;
    let mut ticker = tokio::time::interval_at(start, idle);
    loop {
        ticker.tick().await;
        let victims: Vec<(String, Connection)> = {
            let mut table = inner.originated.lock();
            let keys: Vec<String> = table
                .iter()
                .filter(|(_, conn)| {
                    conn.is_closed() || (conn.pending_count() == 0 && conn.idle_for() >= idle)
                })
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            keys.into_iter()
                .filter_map(|endpoint| table.remove(&endpoint).map(|conn| (endpoint, conn)))
                .collect()
        };
        for (endpoint, conn) in victims {
            if conn.is_closed() {
                continue;
            }
            debug!("closing idle connection to {}", endpoint);
            let _ = conn.close().await;
        }
        inner.accepted.lock().retain(|conn| !conn.is_closed());
    }
}
