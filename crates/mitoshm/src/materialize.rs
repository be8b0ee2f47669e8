//! # Materialization
//!
//! Replaces every owned buffer and struct backing store in a value with a
//! freshly allocated shared region of identical size, copying the bytes
//! exactly once. Buffers and struct instances come back as new values
//! (struct storage cannot be swapped in place); class instances are
//! mutated in place and returned as the same cell.

use std::collections::HashSet;

use mitopack::ByteBuf;
use mitopack::Descriptor;
use mitopack::MetadataProvider;
use mitopack::Position;
use mitopack::SharedRegion;
use mitopack::StructProvider;
use mitopack::TypeId;
use mitopack::Value;

use crate::enter;
use crate::error::Result;

/// Returns `value` with every owned backing store replaced by a shared
/// region. Already-shared inputs, built-ins, and suppressed fields pass
/// through untouched.
pub fn materialize_shared(
    meta: &dyn MetadataProvider,
    structs: &dyn StructProvider,
    value: &Value,
) -> Result<Value> {
    let mut visited = HashSet::new();
    mat(meta, structs, value, &mut visited)
}

fn mat(
    meta: &dyn MetadataProvider,
    structs: &dyn StructProvider,
    value: &Value,
    visited: &mut HashSet<usize>,
) -> Result<Value> {
    match value {
        Value::Bytes(buf) => {
            if buf.is_shared() {
                return Ok(value.clone());
            }
            Ok(Value::Bytes(share_bytes(buf)))
        }
        Value::Region(_) => Ok(value.clone()),
        Value::List(list) => {
            enter(visited, list.addr())?;
            for (index, item) in list.snapshot().into_iter().enumerate() {
                let shared = mat(meta, structs, &item, visited)?;
                list.set(index, shared);
            }
            Ok(value.clone())
        }
        Value::Struct(s) => {
            enter(visited, s.addr())?;
            let ty = s.type_id();
            let buf = structs.raw_buffer_of(s);
            if buf.is_shared() {
                // Storage already shared; only extras may need work.
                for (name, field) in s.extra_snapshot() {
                    if let Some(shared) = mat_field(meta, structs, ty, &name, &field, visited)? {
                        s.set_extra(name, shared);
                    }
                }
                return Ok(value.clone());
            }
            // Struct storage cannot be swapped in place: bind a new
            // instance to the fresh region and carry the extras over.
            let bound = structs.bind_to_buffer(ty, share_bytes(&buf), false)?;
            for (name, field) in s.extra_snapshot() {
                let shared = mat_field(meta, structs, ty, &name, &field, visited)?;
                bound.set_extra(name, shared.unwrap_or(field));
            }
            Ok(Value::Struct(bound))
        }
        Value::Instance(obj) => {
            let Some(ty) = obj.type_id() else {
                return Ok(value.clone());
            };
            enter(visited, obj.addr())?;
            for (name, field) in obj.fields_snapshot() {
                if let Some(shared) = mat_field(meta, structs, ty, &name, &field, visited)? {
                    obj.set(name, shared);
                }
            }
            Ok(value.clone())
        }
        _ => Ok(value.clone()),
    }
}

/// Materializes one property if its descriptor qualifies it for sharing.
/// Suppressed and untyped fields are not visited at all.
fn mat_field(
    meta: &dyn MetadataProvider,
    structs: &dyn StructProvider,
    ty: TypeId,
    name: &str,
    field: &Value,
    visited: &mut HashSet<usize>,
) -> Result<Option<Value>> {
    match meta.resolve(ty, &Position::Property(name)) {
        Descriptor::Typed { .. } => Ok(Some(mat(meta, structs, field, visited)?)),
        _ => Ok(None),
    }
}

fn share_bytes(buf: &ByteBuf) -> ByteBuf {
    let bytes = buf.snapshot();
    let region = SharedRegion::from_bytes(&bytes);
    tracing::debug!(region = %region.id(), len = bytes.len(), "materialized owned bytes");
    ByteBuf::whole_region(region)
}
