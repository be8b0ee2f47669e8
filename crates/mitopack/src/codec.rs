//! # Transport codec
//!
//! Recursive encode/decode between dynamic values and their wire shape.
//! Pure apart from user-supplied custom codec hooks: the same value under
//! the same descriptor always encodes to the same tree, and
//! `decode(encode(v))` reconstructs a value with the same type identity and
//! field contents.
//!
//! ## Invariants
//! - Cycle safety: entering any list, typed instance, or struct records the
//!   cell's identity; meeting it again fails the whole encode before
//!   anything is sent.
//! - Shared bytes stay shared: a region-backed buffer encodes as a region
//!   reference, never as a copy, in both directions.

use std::collections::HashSet;
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::descriptor::Position;
use crate::descriptor::TypeId;
use crate::descriptor::TypeKind;
use crate::encoded::EncodedBuffer;
use crate::encoded::EncodedValue;
use crate::provider::BindError;
use crate::provider::MetadataProvider;
use crate::provider::StructProvider;
use crate::region;
use crate::value::ByteBuf;
use crate::value::ObjRef;
use crate::value::Value;

#[derive(Debug)]
pub enum Error {
    /// The value graph references itself; nothing was transmitted.
    CircularReference,
    /// A descriptor names a type the metadata provider does not know.
    UnknownType(TypeId),
    /// The value's shape does not fit the descriptor's target type.
    Shape {
        type_id: TypeId,
        expected: &'static str,
        got: &'static str,
    },
    Bind(BindError),
    Region(region::Error),
    /// A custom codec hook failed.
    Custom(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircularReference => write!(f, "value graph contains a circular reference"),
            Self::UnknownType(ty) => write!(f, "unknown target type {}", ty),
            Self::Shape { type_id, expected, got } => {
                write!(f, "{} expects a {}, got a {}", type_id, expected, got)
            }
            Self::Bind(e) => write!(f, "struct binding failed: {}", e),
            Self::Region(e) => write!(f, "region reference invalid: {}", e),
            Self::Custom(msg) => write!(f, "custom codec failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<BindError> for Error {
    fn from(e: BindError) -> Self {
        Self::Bind(e)
    }
}

impl From<region::Error> for Error {
    fn from(e: region::Error) -> Self {
        Self::Region(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity set scoped to one top-level encode.
#[derive(Default)]
struct Visited {
    seen: HashSet<usize>,
}

impl Visited {
    fn enter(&mut self, addr: usize) -> Result<()> {
        if self.seen.insert(addr) {
            Ok(())
        } else {
            Err(Error::CircularReference)
        }
    }
}

/// The transport codec. Cheap to clone; both handles are shared.
#[derive(Clone)]
pub struct Codec {
    meta: Arc<dyn MetadataProvider>,
    structs: Arc<dyn StructProvider>,
}

impl Codec {
    pub fn new(meta: Arc<dyn MetadataProvider>, structs: Arc<dyn StructProvider>) -> Self {
        Self { meta, structs }
    }

    /// Encodes `value` under `descriptor` into its wire shape.
    pub fn encode(&self, value: &Value, descriptor: &Descriptor) -> Result<EncodedValue> {
        let mut visited = Visited::default();
        self.encode_value(value, descriptor, &mut visited)
    }

    fn encode_value(
        &self,
        value: &Value,
        descriptor: &Descriptor,
        visited: &mut Visited,
    ) -> Result<EncodedValue> {
        match descriptor {
            Descriptor::Custom(hook) => return (hook.encode)(value).map_err(Error::Custom),
            Descriptor::Suppressed => return Ok(EncodedValue::absent()),
            _ => {}
        }

        match value {
            Value::Null => Ok(EncodedValue::absent()),
            Value::Bytes(buf) => Ok(EncodedValue::Buffer(EncodedBuffer::capture(buf))),
            Value::Region(r) => Ok(EncodedValue::Region(r.clone())),
            Value::List(list) => {
                visited.enter(list.addr())?;
                let elem = element_descriptor(descriptor);
                let mut items = Vec::with_capacity(list.len());
                for item in list.snapshot() {
                    items.push(self.encode_value(&item, &elem, visited)?);
                }
                Ok(EncodedValue::Array(items))
            }
            Value::Struct(s) => {
                visited.enter(s.addr())?;
                let ty = s.type_id();
                if !self.structs.is_struct_type(ty) {
                    return Err(Error::Shape {
                        type_id: ty,
                        expected: "registered struct type",
                        got: value.shape_name(),
                    });
                }
                let buf = self.structs.raw_buffer_of(s);
                let layout_fields = self.structs.struct_field_names(ty).unwrap_or_default();
                let mut extra = Vec::new();
                for (name, field) in s.extra_snapshot() {
                    if layout_fields.contains(&name) {
                        continue;
                    }
                    let desc = self.meta.resolve(ty, &Position::Property(&name));
                    extra.push((name, self.encode_value(&field, &desc, visited)?));
                }
                Ok(EncodedValue::Struct {
                    type_id: ty,
                    buf: EncodedBuffer::capture(&buf),
                    extra,
                })
            }
            Value::Instance(obj) => self.encode_instance(obj, descriptor, visited),
            // Primitives and built-in containers survive the channel's
            // native copy untouched.
            _ => Ok(EncodedValue::Raw(value.clone())),
        }
    }

    fn encode_instance(
        &self,
        obj: &ObjRef,
        descriptor: &Descriptor,
        visited: &mut Visited,
    ) -> Result<EncodedValue> {
        // The descriptor's target wins; the instance's own type is only
        // trusted when it is not a generic object.
        let target = match descriptor {
            Descriptor::Typed { target, .. } => Some(*target),
            _ => obj.type_id(),
        };
        let Some(ty) = target else {
            // Untyped plain object: left to the native copy.
            return Ok(EncodedValue::Raw(Value::Instance(obj.clone())));
        };

        let kind = self.meta.kind(ty).ok_or(Error::UnknownType(ty))?;
        if kind != TypeKind::Class {
            return Err(Error::Shape {
                type_id: ty,
                expected: "class instance",
                got: "instance of a non-class type",
            });
        }

        visited.enter(obj.addr())?;
        let mut fields = Vec::new();
        for (name, field) in obj.fields_snapshot() {
            let desc = self.meta.resolve(ty, &Position::Property(&name));
            fields.push((name, self.encode_value(&field, &desc, visited)?));
        }
        Ok(EncodedValue::Object { type_id: ty, fields })
    }

    /// Decodes a wire shape back into a value under `descriptor`.
    pub fn decode(&self, encoded: EncodedValue, descriptor: &Descriptor) -> Result<Value> {
        match descriptor {
            Descriptor::Custom(hook) => return (hook.decode)(encoded).map_err(Error::Custom),
            Descriptor::Suppressed => return Ok(Value::Null),
            _ => {}
        }

        match encoded {
            EncodedValue::Raw(value) => Ok(value),
            EncodedValue::Array(items) => {
                let elem = element_descriptor(descriptor);
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.decode(item, &elem)?);
                }
                Ok(Value::list(out))
            }
            EncodedValue::Buffer(buf) => Ok(Value::Bytes(decode_buffer(buf)?)),
            EncodedValue::Region(r) => Ok(Value::Region(r)),
            EncodedValue::Struct { type_id, buf, extra } => {
                let copy = !buf.is_shared();
                let buf = decode_buffer(buf)?;
                let instance = self.structs.bind_to_buffer(type_id, buf, copy)?;
                for (name, field) in extra {
                    let desc = self.meta.resolve(type_id, &Position::Property(&name));
                    instance.set_extra(name, self.decode(field, &desc)?);
                }
                Ok(Value::Struct(instance))
            }
            EncodedValue::Object { type_id, fields } => {
                // Reconstruct with the right type identity but without
                // running any constructor.
                let obj = ObjRef::typed(type_id);
                for (name, field) in fields {
                    let desc = self.meta.resolve(type_id, &Position::Property(&name));
                    obj.set(name, self.decode(field, &desc)?);
                }
                Ok(Value::Instance(obj))
            }
        }
    }
}

/// The descriptor elements of an array recurse under.
fn element_descriptor(descriptor: &Descriptor) -> Descriptor {
    match descriptor {
        Descriptor::Typed { target, array: true } => Descriptor::typed(*target),
        _ => Descriptor::None,
    }
}

fn decode_buffer(buf: EncodedBuffer) -> Result<ByteBuf> {
    match buf {
        EncodedBuffer::Shared { region, offset, len } => {
            Ok(ByteBuf::region_view(region, offset, len)?)
        }
        EncodedBuffer::Owned(bytes) => Ok(ByteBuf::owned(bytes)),
    }
}
