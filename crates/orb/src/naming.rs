//! Bootstrap references.
//!
//! Applications reach well-known services ("NameService" and friends)
//! through an [`InitialReferences`] provider installed on the engine.
//! [`StaticInitialReferences`] is the table-driven implementation:
//! entries bound programmatically or parsed from `IOR:`/`corbaloc:`
//! text, typically at configuration time.

use crate::error::{OrbError, Result};
use crate::ior::Ior;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source of bootstrap references, installed via
/// [`Orb::set_initial_references`](crate::orb::Orb::set_initial_references).
#[async_trait]
pub trait InitialReferences: Send + Sync {
    /// Resolve a bootstrap name to a reference.
    async fn resolve_initial(&self, name: &str) -> Result<Ior>;
}

/// Fixed table of bootstrap references.
#[derive(Default)]
pub struct StaticInitialReferences {
    entries: RwLock<HashMap<String, Ior>>,
}

impl StaticInitialReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a reference, replacing any previous binding.
    pub fn set(&self, name: impl Into<String>, reference: Ior) {
        self.entries.write().insert(name.into(), reference);
    }

    /// Bind `name` to a reference given as `IOR:` or `corbaloc:` text.
    pub fn set_from_text(&self, name: impl Into<String>, text: &str) -> Result<()> {
        let reference: Ior = text.parse()?;
        self.set(name, reference);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for StaticInitialReferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticInitialReferences")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[async_trait]
impl InitialReferences for StaticInitialReferences {
    async fn resolve_initial(&self, name: &str) -> Result<Ior> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| OrbError::UnresolvableReference(format!("no initial reference {name:?}")))
    }
}
