//! Inter-ORB engine core
//!
//! This crate is the layer above the GIOP wire: interoperable object
//! references, value-type graph marshalling, object adapters and the
//! request dispatcher, tied together by the [`Orb`] facade.
//!
//! # Features
//!
//! - References: `IOR:` and `corbaloc:` text forms, CDR wire form,
//!   multi-profile fallback in listed order
//! - Value graphs: sharing and cycles preserved through indirections,
//!   truncatable inheritance, custom per-type wire mappings
//! - Object adapters: transient or persistent keys, system or caller
//!   ids, implicit activation, destruction that kills transient keys
//! - Dispatch: decoded arguments handed to [`Servant`] implementations,
//!   faults mapped onto standard system exceptions
//! - Calls: concurrent requests multiplexed per connection, oneway,
//!   cancellation tokens, locate probes, bidirectional callback reuse
//!
//! # Example
//!
//! ```no_run
//! use orb::{
//!     AdapterPolicy, InterfaceDescriptor, OperationSignature, Orb, OrbConfig, Value, WireType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> orb::Result<()> {
//!     let orb = Orb::new(OrbConfig::default());
//!     orb.register_interface(InterfaceDescriptor::new("IDL:demo/Counter:1.0").operation(
//!         OperationSignature::new("inc")
//!             .param(WireType::Long)
//!             .returns(WireType::Long),
//!     ))?;
//!
//!     let reference = orb.string_to_object("corbaloc::counters.example.org:2809/K1")?;
//!     let result = orb.invoke(&reference, "inc", vec![Value::Long(1)]).await?;
//!     println!("result: {result:?}");
//!     orb.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod dispatcher;
pub mod error;
pub mod ior;
pub mod marshal;
pub mod naming;
pub mod orb;
pub mod proxy;
pub mod registry;
pub mod value;

pub use error::{
    CompletionStatus, OrbError, Result, EX_BAD_OPERATION, EX_INV_OBJREF, EX_MARSHAL,
    EX_NO_IMPLEMENT, EX_OBJECT_NOT_EXIST, EX_UNKNOWN,
};

pub use ior::{
    IiopProfile, Ior, TaggedComponent, TaggedProfile, DEFAULT_CORBALOC_PORT, TAG_INTERNET_IOP,
};
pub use value::{UnionLayout, Value, ValueInstance, ValueRef, WireType};

pub use marshal::{ValueDecoder, ValueEncoder};
pub use registry::{
    FieldDescriptor, InterfaceDescriptor, OperationSignature, TypeMapping, TypeRegistry,
    ValueTypeDescriptor,
};

pub use adapter::{
    Activation, AdapterPolicy, AdapterRegistry, IdAssignment, Lifespan, ObjectAdapter, Servant,
};
pub use dispatcher::Dispatcher;
pub use naming::{InitialReferences, StaticInitialReferences};
pub use orb::{Orb, OrbConfig, Resolved};
pub use proxy::{CallToken, Proxy};
