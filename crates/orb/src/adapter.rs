//! Object adapters: the mapping from object keys to live servants.
//!
//! Every activation produces an object key that encodes the adapter name,
//! and, for transient adapters, an incarnation nonce drawn at adapter
//! creation. A key minted by a destroyed transient adapter can therefore
//! never resolve again, even if an adapter with the same name is created
//! later; persistent keys deliberately omit the nonce so they remain valid
//! across restarts.
//!
//! Key layout: a lifespan marker octet (`T`/`P`), the adapter name, a NUL,
//! the 8-octet incarnation (transient only), then the object id.

use crate::error::{OrbError, Result};
use crate::value::Value;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// How long references produced by an adapter stay meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifespan {
    /// Keys are bound to this adapter incarnation.
    #[default]
    Transient,
    /// Keys survive adapter and process restarts.
    Persistent,
}

/// Who chooses object ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdAssignment {
    /// The adapter mints ids.
    #[default]
    System,
    /// The caller supplies ids.
    User,
}

/// Whether producing a reference for an unregistered servant activates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Implicit,
    Explicit,
}

/// Policy triple fixed at adapter creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterPolicy {
    pub lifespan: Lifespan,
    pub id_assignment: IdAssignment,
    pub activation: Activation,
}

impl AdapterPolicy {
    pub fn persistent_user() -> Self {
        Self {
            lifespan: Lifespan::Persistent,
            id_assignment: IdAssignment::User,
            activation: Activation::Explicit,
        }
    }
}

/// An object implementation hosted by an adapter.
#[async_trait]
pub trait Servant: Send + Sync {
    /// Repository id of the interface this servant implements.
    fn type_id(&self) -> &str;

    /// Execute one operation. Arguments arrive decoded per the registered
    /// signature; the result (or `None` for void) is encoded the same way.
    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Option<Value>>;
}

fn make_key(name: &str, lifespan: Lifespan, incarnation: &[u8; 8], object_id: &[u8]) -> Bytes {
    let mut key = BytesMut::with_capacity(1 + name.len() + 1 + 8 + object_id.len());
    key.put_u8(match lifespan {
        Lifespan::Transient => b'T',
        Lifespan::Persistent => b'P',
    });
    key.put_slice(name.as_bytes());
    key.put_u8(0);
    if lifespan == Lifespan::Transient {
        key.put_slice(incarnation);
    }
    key.put_slice(object_id);
    key.freeze()
}

/// Adapter name embedded in an object key, if the key has our layout.
pub(crate) fn adapter_name_of(key: &[u8]) -> Option<&str> {
    match key.first() {
        Some(b'T') | Some(b'P') => {}
        _ => return None,
    }
    let rest = &key[1..];
    let nul = rest.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&rest[..nul]).ok()
}

fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[derive(Default)]
struct AdapterState {
    servants: HashMap<Bytes, Arc<dyn Servant>>,
    /// Servant identity to its key, for implicit activation reuse.
    by_identity: HashMap<usize, Bytes>,
}

/// One object adapter.
pub struct ObjectAdapter {
    name: String,
    policy: AdapterPolicy,
    incarnation: [u8; 8],
    next_system_id: AtomicU64,
    state: RwLock<AdapterState>,
    destroyed: AtomicBool,
}

impl ObjectAdapter {
    fn new(name: String, policy: AdapterPolicy) -> Self {
        let mut incarnation = [0u8; 8];
        incarnation.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
        Self {
            name,
            policy,
            incarnation,
            next_system_id: AtomicU64::new(1),
            state: RwLock::new(AdapterState::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> AdapterPolicy {
        self.policy
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.state.read().servants.len()
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(OrbError::ObjectNotExist(format!(
                "adapter {} is destroyed",
                self.name
            )));
        }
        Ok(())
    }

    /// Activate under a system-minted id. Requires system id assignment.
    pub fn activate(&self, servant: Arc<dyn Servant>) -> Result<Bytes> {
        self.check_alive()?;
        if self.policy.id_assignment != IdAssignment::System {
            return Err(OrbError::BadOperation(format!(
                "adapter {} uses caller-assigned ids",
                self.name
            )));
        }
        let id = self.next_system_id.fetch_add(1, Ordering::Relaxed);
        let key = make_key(
            &self.name,
            self.policy.lifespan,
            &self.incarnation,
            &id.to_be_bytes(),
        );
        let mut state = self.state.write();
        state
            .by_identity
            .insert(Arc::as_ptr(&servant) as *const () as usize, key.clone());
        state.servants.insert(key.clone(), servant);
        debug!("adapter {} activated object {}", self.name, id);
        Ok(key)
    }

    /// Activate under a caller-supplied id. Requires user id assignment.
    pub fn activate_with_id(&self, object_id: &[u8], servant: Arc<dyn Servant>) -> Result<Bytes> {
        self.check_alive()?;
        if self.policy.id_assignment != IdAssignment::User {
            return Err(OrbError::BadOperation(format!(
                "adapter {} mints its own ids",
                self.name
            )));
        }
        let key = make_key(&self.name, self.policy.lifespan, &self.incarnation, object_id);
        let mut state = self.state.write();
        if state.servants.contains_key(&key) {
            return Err(OrbError::DuplicateId(display_key(object_id)));
        }
        state
            .by_identity
            .insert(Arc::as_ptr(&servant) as *const () as usize, key.clone());
        state.servants.insert(key.clone(), servant);
        debug!(
            "adapter {} activated object {}",
            self.name,
            display_key(object_id)
        );
        Ok(key)
    }

    /// Key for a servant, activating it on the fly when the policy allows
    /// implicit activation.
    pub fn reference_key_for(&self, servant: &Arc<dyn Servant>) -> Result<Bytes> {
        self.check_alive()?;
        let identity = Arc::as_ptr(servant) as *const () as usize;
        if let Some(key) = self.state.read().by_identity.get(&identity) {
            return Ok(key.clone());
        }
        if self.policy.activation != Activation::Implicit {
            return Err(OrbError::BadOperation(format!(
                "adapter {} requires explicit activation",
                self.name
            )));
        }
        self.activate(servant.clone())
    }

    /// Servant behind a key; `None` if unknown, deactivated, from another
    /// incarnation, or if this adapter is destroyed.
    pub fn resolve(&self, key: &[u8]) -> Option<Arc<dyn Servant>> {
        if self.is_destroyed() {
            return None;
        }
        self.state.read().servants.get(key).cloned()
    }

    pub fn deactivate(&self, key: &[u8]) -> Result<()> {
        self.check_alive()?;
        let mut state = self.state.write();
        let servant = state
            .servants
            .remove(key)
            .ok_or_else(|| OrbError::ObjectNotExist(display_key(key)))?;
        state
            .by_identity
            .remove(&(Arc::as_ptr(&servant) as *const () as usize));
        Ok(())
    }

    /// Drop every servant and refuse all further use. Transient keys from
    /// this incarnation are dead for good.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let mut state = self.state.write();
        state.servants.clear();
        state.by_identity.clear();
        debug!("adapter {} destroyed", self.name);
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("active", &self.active_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// All adapters of one engine, addressed by the adapter name inside each
/// object key.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<ObjectAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: impl Into<String>, policy: AdapterPolicy) -> Result<Arc<ObjectAdapter>> {
        let name = name.into();
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(OrbError::MalformedMessage(format!(
                "invalid adapter name {name:?}"
            )));
        }
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&name) {
            return Err(OrbError::DuplicateId(name));
        }
        let adapter = Arc::new(ObjectAdapter::new(name.clone(), policy));
        adapters.insert(name, adapter.clone());
        Ok(adapter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    /// Destroy an adapter and forget it.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let adapter = self
            .adapters
            .write()
            .remove(name)
            .ok_or_else(|| OrbError::ObjectNotExist(format!("adapter {name}")))?;
        adapter.destroy();
        Ok(())
    }

    pub fn destroy_all(&self) {
        let mut adapters = self.adapters.write();
        for adapter in adapters.values() {
            adapter.destroy();
        }
        adapters.clear();
    }

    /// Route an object key to its servant.
    pub fn resolve(&self, key: &[u8]) -> Option<Arc<dyn Servant>> {
        let name = adapter_name_of(key)?;
        self.get(name)?.resolve(key)
    }
}
