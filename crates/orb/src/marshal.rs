//! Value-graph marshalling.
//!
//! Instances travel as tagged values:
//!
//! ```text
//! null:        u32 0
//! instance:    u32 tag (0x7fffff02) | repository id | flattened fields
//! back-ref:    u32 0xffffffff | i32 offset (negative, to the earlier tag)
//! ```
//!
//! Both encoder and decoder keep per-message identity maps: the encoder
//! maps instance identity to the stream position of its tag, the decoder
//! maps tag positions back to instances. A second occurrence therefore
//! costs eight octets and decodes to the same shared instance, which is
//! what keeps aliasing and cycles intact across the wire. Repository id
//! strings are pooled the same way.
//!
//! Custom mappings registered for a repository id (or an ancestor of it)
//! take precedence over structural field marshalling on both sides.
//! Chunked encodings are not produced and not accepted.

use crate::error::{OrbError, Result};
use crate::ior::Ior;
use crate::registry::TypeRegistry;
use crate::value::{Value, ValueInstance, ValueRef, WireType};
use cdr::{CdrReader, CdrWriter};
use std::collections::HashMap;
use std::sync::Arc;

const VALUE_TAG: u32 = 0x7FFF_FF00;
const VALUE_TAG_MASK: u32 = 0xFFFF_FF00;
const INDIRECTION_TAG: u32 = 0xFFFF_FFFF;

/// Tag bit: a codebase URL precedes the type information.
const FLAG_CODEBASE: u32 = 0x1;
/// Tag bits selecting how the concrete type is identified.
const TYPE_INFO_MASK: u32 = 0x6;
const TYPE_INFO_NONE: u32 = 0x0;
const TYPE_INFO_SINGLE: u32 = 0x2;
const TYPE_INFO_LIST: u32 = 0x6;
/// Tag bit: chunked encoding.
const FLAG_CHUNKED: u32 = 0x8;

fn read_indirection_target(r: &mut CdrReader) -> Result<usize> {
    let offset_pos = r.position();
    let offset = r.read_i32()?;
    if offset >= -4 {
        return Err(OrbError::MalformedMessage(format!(
            "indirection offset {offset} out of range"
        )));
    }
    let target = offset_pos as i64 + offset as i64;
    if target < 0 {
        return Err(OrbError::MalformedMessage(format!(
            "indirection offset {offset} points before the stream"
        )));
    }
    Ok(target as usize)
}

fn write_indirection(w: &mut CdrWriter, target: usize) {
    w.write_u32(INDIRECTION_TAG);
    let offset_pos = w.position();
    w.write_i32((target as i64 - offset_pos as i64) as i32);
}

/// Encodes value graphs into a CDR stream. One encoder spans one message
/// body, so identity is preserved across all arguments of a call but never
/// across calls.
pub struct ValueEncoder<'a> {
    registry: &'a TypeRegistry,
    /// Instance identity (by allocation) to tag stream position.
    instances: HashMap<usize, usize>,
    /// Repository id to the position of its first occurrence.
    repo_ids: HashMap<String, usize>,
}

impl<'a> ValueEncoder<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
            repo_ids: HashMap::new(),
        }
    }

    pub fn encode(&mut self, w: &mut CdrWriter, ty: &WireType, value: &Value) -> Result<()> {
        match (ty, value) {
            (WireType::Bool, Value::Bool(v)) => w.write_bool(*v),
            (WireType::Octet, Value::Octet(v)) => w.write_octet(*v),
            (WireType::Short, Value::Short(v)) => w.write_i16(*v),
            (WireType::UShort, Value::UShort(v)) => w.write_u16(*v),
            (WireType::Long, Value::Long(v)) => w.write_i32(*v),
            (WireType::ULong, Value::ULong(v)) => w.write_u32(*v),
            (WireType::LongLong, Value::LongLong(v)) => w.write_i64(*v),
            (WireType::ULongLong, Value::ULongLong(v)) => w.write_u64(*v),
            (WireType::Float, Value::Float(v)) => w.write_f32(*v),
            (WireType::Double, Value::Double(v)) => w.write_f64(*v),
            (WireType::Str, Value::Str(v)) => w.write_string(v),
            (WireType::Seq(element), Value::Seq(items)) => {
                w.write_u32(items.len() as u32);
                for item in items {
                    self.encode(w, element, item)?;
                }
            }
            (WireType::Union(layout), Value::Union { discriminant, value }) => {
                let arm = layout.arm_for(*discriminant).ok_or_else(|| {
                    OrbError::MalformedMessage(format!(
                        "union has no arm for discriminant {discriminant}"
                    ))
                })?;
                w.write_u32(*discriminant);
                self.encode(w, arm, value)?;
            }
            (WireType::Value(declared), Value::Instance(instance)) => {
                self.encode_instance(w, declared, instance)?;
            }
            (WireType::Object, Value::Object(reference)) => match reference {
                Some(ior) => ior.encode(w),
                None => Ior::nil().encode(w),
            },
            (ty, value) => {
                return Err(OrbError::MalformedMessage(format!(
                    "cannot encode {} where {} is expected",
                    value.kind_name(),
                    ty.name()
                )));
            }
        }
        Ok(())
    }

    fn encode_instance(
        &mut self,
        w: &mut CdrWriter,
        declared: &str,
        value: &Option<ValueRef>,
    ) -> Result<()> {
        let Some(vref) = value else {
            w.write_u32(0);
            return Ok(());
        };

        let key = Arc::as_ptr(vref) as usize;
        if let Some(&pos) = self.instances.get(&key) {
            write_indirection(w, pos);
            return Ok(());
        }

        w.align(4);
        let tag_pos = w.position();
        self.instances.insert(key, tag_pos);
        w.write_u32(VALUE_TAG | TYPE_INFO_SINGLE);

        let instance = vref.read();
        if instance.type_id != declared
            && self.registry.has_value_type(&instance.type_id)
            && !self.registry.is_assignable(&instance.type_id, declared)
        {
            return Err(OrbError::MalformedMessage(format!(
                "instance of {} is not assignable to a {declared} slot",
                instance.type_id
            )));
        }
        self.write_repo_id(w, &instance.type_id);

        match self.registry.mapping_for(&instance.type_id) {
            Some(mapping) => {
                let body = (mapping.encode)(&instance)?;
                self.encode(w, &mapping.wire, &body)?;
            }
            None => {
                let descriptors = self
                    .registry
                    .flat_fields(&instance.type_id)
                    .ok_or_else(|| OrbError::UnknownType(instance.type_id.clone()))?;
                if descriptors.len() != instance.fields.len() {
                    return Err(OrbError::MalformedMessage(format!(
                        "instance of {} carries {} fields, descriptor declares {}",
                        instance.type_id,
                        instance.fields.len(),
                        descriptors.len()
                    )));
                }
                for (descriptor, field) in descriptors.iter().zip(&instance.fields) {
                    self.encode(w, &descriptor.ty, field)?;
                }
            }
        }
        Ok(())
    }

    fn write_repo_id(&mut self, w: &mut CdrWriter, id: &str) {
        if let Some(&pos) = self.repo_ids.get(id) {
            write_indirection(w, pos);
        } else {
            w.align(4);
            let pos = w.position();
            self.repo_ids.insert(id.to_string(), pos);
            w.write_string(id);
        }
    }
}

/// Decodes value graphs from a CDR stream; the mirror of [`ValueEncoder`],
/// with the identity maps keyed by tag position.
pub struct ValueDecoder<'a> {
    registry: &'a TypeRegistry,
    instances: HashMap<usize, ValueRef>,
    repo_ids: HashMap<usize, String>,
}

impl<'a> ValueDecoder<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
            repo_ids: HashMap::new(),
        }
    }

    pub fn decode(&mut self, r: &mut CdrReader, ty: &WireType) -> Result<Value> {
        Ok(match ty {
            WireType::Bool => Value::Bool(r.read_bool()?),
            WireType::Octet => Value::Octet(r.read_octet()?),
            WireType::Short => Value::Short(r.read_i16()?),
            WireType::UShort => Value::UShort(r.read_u16()?),
            WireType::Long => Value::Long(r.read_i32()?),
            WireType::ULong => Value::ULong(r.read_u32()?),
            WireType::LongLong => Value::LongLong(r.read_i64()?),
            WireType::ULongLong => Value::ULongLong(r.read_u64()?),
            WireType::Float => Value::Float(r.read_f32()?),
            WireType::Double => Value::Double(r.read_f64()?),
            WireType::Str => Value::Str(r.read_string()?),
            WireType::Seq(element) => {
                let count = r.read_seq_len(element.min_wire_size())?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode(r, element)?);
                }
                Value::Seq(items)
            }
            WireType::Union(layout) => {
                let discriminant = r.read_u32()?;
                let arm = layout.arm_for(discriminant).ok_or_else(|| {
                    OrbError::MalformedMessage(format!(
                        "union has no arm for discriminant {discriminant}"
                    ))
                })?;
                let value = self.decode(r, arm)?;
                Value::Union {
                    discriminant,
                    value: Box::new(value),
                }
            }
            WireType::Value(declared) => Value::Instance(self.decode_instance(r, declared)?),
            WireType::Object => {
                let ior = Ior::decode(r)?;
                if ior.is_nil() {
                    Value::Object(None)
                } else {
                    Value::Object(Some(ior))
                }
            }
        })
    }

    fn decode_instance(&mut self, r: &mut CdrReader, declared: &str) -> Result<Option<ValueRef>> {
        r.align(4)?;
        let tag_pos = r.position();
        let tag = r.read_u32()?;

        if tag == 0 {
            return Ok(None);
        }
        if tag == INDIRECTION_TAG {
            let target = read_indirection_target(r)?;
            let vref = self.instances.get(&target).cloned().ok_or_else(|| {
                OrbError::MalformedMessage(format!(
                    "indirection to position {target} names no earlier instance"
                ))
            })?;
            return Ok(Some(vref));
        }
        if tag & VALUE_TAG_MASK != VALUE_TAG {
            return Err(OrbError::MalformedMessage(format!(
                "expected a value tag, found {tag:#010x}"
            )));
        }
        if tag & FLAG_CHUNKED != 0 {
            return Err(OrbError::MalformedMessage(
                "chunked value encoding is not supported".into(),
            ));
        }
        if tag & FLAG_CODEBASE != 0 {
            // codebase URLs carry no meaning here; consume and drop
            self.read_repo_id(r)?;
        }

        let concrete = match tag & TYPE_INFO_MASK {
            TYPE_INFO_NONE => declared.to_string(),
            TYPE_INFO_SINGLE => self.read_repo_id(r)?,
            TYPE_INFO_LIST => self.read_repo_id_list(r)?,
            bits => {
                return Err(OrbError::MalformedMessage(format!(
                    "invalid type information bits {bits:#x} in value tag"
                )));
            }
        };

        if concrete != declared
            && self.registry.has_value_type(&concrete)
            && !self.registry.is_assignable(&concrete, declared)
        {
            return Err(OrbError::MalformedMessage(format!(
                "instance of {concrete} is not assignable to a {declared} slot"
            )));
        }

        if let Some(mapping) = self.registry.mapping_for(&concrete) {
            // The encoder records an instance before running its mapping,
            // so the mapped body may reach back to the instance it belongs
            // to. Register a shell at the tag first and fill it once the
            // mapping has produced the real state.
            let shell = ValueInstance::new(concrete, Vec::new()).into_ref();
            self.instances.insert(tag_pos, shell.clone());
            let body = self.decode(r, &mapping.wire)?;
            let instance = (mapping.decode)(body)?;
            *shell.write() = instance;
            return Ok(Some(shell));
        }

        let descriptors = self
            .registry
            .flat_fields(&concrete)
            .ok_or_else(|| OrbError::UnknownType(concrete.clone()))?;

        // Register the shell before its fields decode, so back-references
        // inside the graph (including cycles through this instance) find it.
        let shell = ValueInstance::new(concrete, Vec::new()).into_ref();
        self.instances.insert(tag_pos, shell.clone());

        let mut fields = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.iter() {
            fields.push(self.decode(r, &descriptor.ty)?);
        }
        shell.write().fields = fields;
        Ok(Some(shell))
    }

    fn read_repo_id(&mut self, r: &mut CdrReader) -> Result<String> {
        r.align(4)?;
        let pos = r.position();
        let marker = r.read_u32()?;
        if marker == INDIRECTION_TAG {
            let target = read_indirection_target(r)?;
            return self.repo_ids.get(&target).cloned().ok_or_else(|| {
                OrbError::MalformedMessage(format!(
                    "indirection to position {target} names no earlier repository id"
                ))
            });
        }
        let id = read_string_body(r, marker)?;
        self.repo_ids.insert(pos, id.clone());
        Ok(id)
    }

    fn read_repo_id_list(&mut self, r: &mut CdrReader) -> Result<String> {
        let count = r.read_seq_len(4)?;
        if count == 0 {
            return Err(OrbError::MalformedMessage(
                "empty repository id list in value tag".into(),
            ));
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.read_repo_id(r)?);
        }
        // ids run from most to least derived; take the first one we can
        // actually decode, or let the most derived fail downstream
        Ok(ids
            .iter()
            .find(|id| self.registry.knows_type(id))
            .unwrap_or(&ids[0])
            .clone())
    }
}

/// Read the body of a CDR string whose length prefix was already consumed.
fn read_string_body(r: &mut CdrReader, len: u32) -> Result<String> {
    if len == 0 {
        return Err(OrbError::MalformedMessage(
            "zero-length string prefix".into(),
        ));
    }
    let data = r.read_opaque(len as usize)?;
    let (body, terminator) = data.split_at(len as usize - 1);
    if terminator != [0] {
        return Err(OrbError::MalformedMessage(
            "string missing NUL terminator".into(),
        ));
    }
    String::from_utf8(body.to_vec())
        .map_err(|_| OrbError::MalformedMessage("string is not valid UTF-8".into()))
}
