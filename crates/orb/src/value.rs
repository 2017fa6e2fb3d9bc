//! Runtime value model.
//!
//! Operation arguments and value-type fields are carried as [`Value`]s, a
//! dynamic representation driven by the registered descriptors rather than
//! by compiled-in types. Value-type instances live behind
//! [`ValueRef`] (shared, mutable, nullable); the marshaller preserves their
//! identity on the wire, so two fields holding the same `ValueRef` still
//! hold the same instance after a round trip.

use crate::ior::Ior;
use parking_lot::RwLock;
use std::sync::Arc;

/// A shared value-type instance. Cloning the ref aliases the instance;
/// identity (not content) is what the marshaller tracks.
pub type ValueRef = Arc<RwLock<ValueInstance>>;

/// State of one value-type instance: the concrete repository id plus the
/// flattened field values, ancestor fields first.
#[derive(Debug)]
pub struct ValueInstance {
    pub type_id: String,
    pub fields: Vec<Value>,
}

impl ValueInstance {
    pub fn new(type_id: impl Into<String>, fields: Vec<Value>) -> Self {
        Self {
            type_id: type_id.into(),
            fields,
        }
    }

    pub fn into_ref(self) -> ValueRef {
        Arc::new(RwLock::new(self))
    }
}

/// Wire shape of a field, parameter or result.
#[derive(Debug, Clone, PartialEq)]
pub enum WireType {
    Bool,
    Octet,
    Short,
    UShort,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Str,
    Seq(Box<WireType>),
    Union(Box<UnionLayout>),
    /// A value-type slot; the string is the declared repository id. The
    /// concrete instance may be of any registered descendant.
    Value(String),
    /// An object reference, encoded as an IOR.
    Object,
}

impl WireType {
    pub fn value(type_id: impl Into<String>) -> Self {
        WireType::Value(type_id.into())
    }

    pub fn seq(element: WireType) -> Self {
        WireType::Seq(Box::new(element))
    }

    pub fn name(&self) -> &'static str {
        match self {
            WireType::Bool => "boolean",
            WireType::Octet => "octet",
            WireType::Short => "short",
            WireType::UShort => "unsigned short",
            WireType::Long => "long",
            WireType::ULong => "unsigned long",
            WireType::LongLong => "long long",
            WireType::ULongLong => "unsigned long long",
            WireType::Float => "float",
            WireType::Double => "double",
            WireType::Str => "string",
            WireType::Seq(_) => "sequence",
            WireType::Union(_) => "union",
            WireType::Value(_) => "valuetype",
            WireType::Object => "object reference",
        }
    }

    /// Least number of octets one value of this shape occupies, used to
    /// validate sequence counts before allocating.
    pub(crate) fn min_wire_size(&self) -> usize {
        match self {
            WireType::Bool | WireType::Octet => 1,
            WireType::Short | WireType::UShort => 2,
            WireType::Long | WireType::ULong | WireType::Float => 4,
            WireType::LongLong | WireType::ULongLong | WireType::Double => 8,
            // length prefix, discriminant, value tag, type id prefix
            WireType::Str
            | WireType::Seq(_)
            | WireType::Union(_)
            | WireType::Value(_)
            | WireType::Object => 4,
        }
    }
}

/// Discriminated-union layout: the wire shape selected by each discriminant
/// value, with an optional default arm.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionLayout {
    pub arms: Vec<(u32, WireType)>,
    pub default_arm: Option<WireType>,
}

impl UnionLayout {
    pub fn arm_for(&self, discriminant: u32) -> Option<&WireType> {
        self.arms
            .iter()
            .find(|(d, _)| *d == discriminant)
            .map(|(_, ty)| ty)
            .or(self.default_arm.as_ref())
    }
}

/// One dynamic value.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Octet(u8),
    Short(i16),
    UShort(u16),
    Long(i32),
    ULong(u32),
    LongLong(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Seq(Vec<Value>),
    Union { discriminant: u32, value: Box<Value> },
    Object(Option<Ior>),
    Instance(Option<ValueRef>),
}

impl Value {
    /// Wrap a freshly built instance.
    pub fn instance(instance: ValueInstance) -> Self {
        Value::Instance(Some(instance.into_ref()))
    }

    /// The null value-type reference.
    pub fn null() -> Self {
        Value::Instance(None)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Octet(_) => "octet",
            Value::Short(_) => "short",
            Value::UShort(_) => "unsigned short",
            Value::Long(_) => "long",
            Value::ULong(_) => "unsigned long",
            Value::LongLong(_) => "long long",
            Value::ULongLong(_) => "unsigned long long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Union { .. } => "union",
            Value::Object(_) => "object reference",
            Value::Instance(_) => "valuetype",
        }
    }

    /// The instance behind a non-null value-type slot.
    pub fn as_instance(&self) -> Option<&ValueRef> {
        match self {
            Value::Instance(Some(vref)) => Some(vref),
            _ => None,
        }
    }
}

// Instance slots compare by identity: a decoded graph is equal to nothing
// but itself, which is what sharing-preservation is about.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Octet(a), Value::Octet(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::UShort(a), Value::UShort(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::ULong(a), Value::ULong(b)) => a == b,
            (Value::LongLong(a), Value::LongLong(b)) => a == b,
            (Value::ULongLong(a), Value::ULongLong(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (
                Value::Union {
                    discriminant: da,
                    value: va,
                },
                Value::Union {
                    discriminant: db,
                    value: vb,
                },
            ) => da == db && va == vb,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Instance(None), Value::Instance(None)) => true,
            (Value::Instance(Some(a)), Value::Instance(Some(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
