//! Type registry.
//!
//! Bindings produced outside the engine (an IDL compiler, hand-written
//! glue) register three kinds of entries here:
//!
//!   - value-type descriptors: repository id, optional parent, declared
//!     fields. The registry flattens the inheritance chain once at
//!     registration and caches the ancestors-first field list, so the
//!     marshaller never walks parents per instance.
//!   - interface descriptors: the operation signatures the dispatcher and
//!     proxies need to decode and encode request bodies.
//!   - custom wire mappings: per-type encode/decode functions that replace
//!     structural field marshalling, looked up by exact repository id
//!     first and by nearest registered ancestor second.
//!
//! Field types may refer to repository ids that are not registered yet
//! (self-referential and mutually recursive value types); only the parent
//! of a descriptor must exist at registration time.

use crate::error::{OrbError, Result};
use crate::value::{Value, ValueInstance, WireType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One declared field of a value type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: WireType,
}

/// A value type as the binding layer declares it: only the fields added at
/// this level of the hierarchy.
#[derive(Debug, Clone)]
pub struct ValueTypeDescriptor {
    pub type_id: String,
    pub parent: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

impl ValueTypeDescriptor {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            parent: None,
            fields: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: WireType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            ty,
        });
        self
    }
}

/// Signature of one operation: parameter shapes in call order and the
/// result shape (`None` for void).
#[derive(Debug, Clone)]
pub struct OperationSignature {
    pub name: String,
    pub params: Vec<WireType>,
    pub result: Option<WireType>,
    pub oneway: bool,
}

impl OperationSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            result: None,
            oneway: false,
        }
    }

    pub fn param(mut self, ty: WireType) -> Self {
        self.params.push(ty);
        self
    }

    pub fn returns(mut self, ty: WireType) -> Self {
        self.result = Some(ty);
        self
    }

    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }
}

/// The operations an interface exposes.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub type_id: String,
    pub operations: Vec<OperationSignature>,
}

impl InterfaceDescriptor {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, signature: OperationSignature) -> Self {
        self.operations.push(signature);
        self
    }

    pub fn find_operation(&self, name: &str) -> Option<&OperationSignature> {
        self.operations.iter().find(|op| op.name == name)
    }
}

pub type EncodeFn = Arc<dyn Fn(&ValueInstance) -> Result<Value> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(Value) -> Result<ValueInstance> + Send + Sync>;

/// A custom wire mapping: the type's instances travel as `wire`-shaped
/// values produced and consumed by the two functions, bypassing structural
/// field marshalling entirely.
#[derive(Clone)]
pub struct TypeMapping {
    pub wire: WireType,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl TypeMapping {
    pub fn new<E, D>(wire: WireType, encode: E, decode: D) -> Self
    where
        E: Fn(&ValueInstance) -> Result<Value> + Send + Sync + 'static,
        D: Fn(Value) -> Result<ValueInstance> + Send + Sync + 'static,
    {
        Self {
            wire,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }
}

impl fmt::Debug for TypeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMapping")
            .field("wire", &self.wire)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ValueTypeEntry {
    descriptor: ValueTypeDescriptor,
    /// Complete field list, ancestor fields first, cached at registration.
    flat_fields: Arc<Vec<FieldDescriptor>>,
    /// This id followed by its ancestors, nearest first.
    ancestry: Vec<String>,
}

/// Shared registry of descriptors and mappings.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    values: RwLock<HashMap<String, ValueTypeEntry>>,
    interfaces: RwLock<HashMap<String, Arc<InterfaceDescriptor>>>,
    mappings: RwLock<HashMap<String, TypeMapping>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value type. Its parent, if any, must already be
    /// registered; the flattened field list is derived here once.
    pub fn register_value_type(&self, descriptor: ValueTypeDescriptor) -> Result<()> {
        let mut values = self.values.write();
        if values.contains_key(&descriptor.type_id) {
            return Err(OrbError::DuplicateId(descriptor.type_id.clone()));
        }

        let (mut flat, mut ancestry) = match &descriptor.parent {
            Some(parent) => {
                let entry = values.get(parent).ok_or_else(|| {
                    OrbError::UnknownType(format!(
                        "parent {parent} of {} is not registered",
                        descriptor.type_id
                    ))
                })?;
                ((*entry.flat_fields).clone(), entry.ancestry.clone())
            }
            None => (Vec::new(), Vec::new()),
        };
        flat.extend(descriptor.fields.iter().cloned());
        ancestry.insert(0, descriptor.type_id.clone());

        values.insert(
            descriptor.type_id.clone(),
            ValueTypeEntry {
                descriptor,
                flat_fields: Arc::new(flat),
                ancestry,
            },
        );
        Ok(())
    }

    pub fn register_interface(&self, descriptor: InterfaceDescriptor) -> Result<()> {
        let mut interfaces = self.interfaces.write();
        if interfaces.contains_key(&descriptor.type_id) {
            return Err(OrbError::DuplicateId(descriptor.type_id.clone()));
        }
        interfaces.insert(descriptor.type_id.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Register a custom mapping for `type_id`. The id does not need a
    /// structural descriptor; opaque types are mapped without one.
    pub fn register_mapping(&self, type_id: impl Into<String>, mapping: TypeMapping) -> Result<()> {
        let type_id = type_id.into();
        let mut mappings = self.mappings.write();
        if mappings.contains_key(&type_id) {
            return Err(OrbError::DuplicateId(type_id));
        }
        mappings.insert(type_id, mapping);
        Ok(())
    }

    pub fn has_value_type(&self, type_id: &str) -> bool {
        self.values.read().contains_key(type_id)
    }

    pub fn has_mapping(&self, type_id: &str) -> bool {
        self.mappings.read().contains_key(type_id)
    }

    /// The cached ancestors-first field list, or `None` for unknown ids.
    pub fn flat_fields(&self, type_id: &str) -> Option<Arc<Vec<FieldDescriptor>>> {
        self.values
            .read()
            .get(type_id)
            .map(|entry| entry.flat_fields.clone())
    }

    pub fn parent_of(&self, type_id: &str) -> Option<String> {
        self.values
            .read()
            .get(type_id)?
            .descriptor
            .parent
            .clone()
    }

    /// True when an instance of `concrete` may occupy a slot declared as
    /// `declared`.
    pub fn is_assignable(&self, concrete: &str, declared: &str) -> bool {
        if concrete == declared {
            return true;
        }
        self.values
            .read()
            .get(concrete)
            .is_some_and(|entry| entry.ancestry.iter().any(|id| id == declared))
    }

    /// Custom mapping for `type_id`: exact match first, then the nearest
    /// registered ancestor.
    pub fn mapping_for(&self, type_id: &str) -> Option<TypeMapping> {
        let mappings = self.mappings.read();
        if let Some(mapping) = mappings.get(type_id) {
            return Some(mapping.clone());
        }
        let values = self.values.read();
        let entry = values.get(type_id)?;
        entry
            .ancestry
            .iter()
            .skip(1)
            .find_map(|ancestor| mappings.get(ancestor))
            .cloned()
    }

    pub fn interface(&self, type_id: &str) -> Option<Arc<InterfaceDescriptor>> {
        self.interfaces.read().get(type_id).cloned()
    }

    /// True when decoding can make sense of this repository id, either
    /// structurally or through a mapping.
    pub fn knows_type(&self, type_id: &str) -> bool {
        self.has_value_type(type_id) || self.has_mapping(type_id)
    }
}
