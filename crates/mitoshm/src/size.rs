//! # Extra-size computation
//!
//! Counts the bytes that would have to be newly allocated to make a value
//! fully shared. Anything already region-backed contributes nothing, so a
//! fully shared value always sizes to exactly zero.

use std::collections::HashSet;

use mitopack::Descriptor;
use mitopack::MetadataProvider;
use mitopack::Position;
use mitopack::StructProvider;
use mitopack::TypeId;
use mitopack::Value;

use crate::enter;
use crate::error::Result;

/// Bytes of new shared allocation needed to fully share `value`.
pub fn compute_extra_size(
    meta: &dyn MetadataProvider,
    structs: &dyn StructProvider,
    value: &Value,
) -> Result<usize> {
    let mut visited = HashSet::new();
    size_of(meta, structs, value, &mut visited)
}

fn size_of(
    meta: &dyn MetadataProvider,
    structs: &dyn StructProvider,
    value: &Value,
    visited: &mut HashSet<usize>,
) -> Result<usize> {
    match value {
        Value::Bytes(buf) => Ok(if buf.is_shared() { 0 } else { buf.len() }),
        Value::Region(_) => Ok(0),
        Value::List(list) => {
            enter(visited, list.addr())?;
            let mut total = 0;
            for item in list.snapshot() {
                total += size_of(meta, structs, &item, visited)?;
            }
            Ok(total)
        }
        Value::Struct(s) => {
            enter(visited, s.addr())?;
            let buf = structs.raw_buffer_of(s);
            let mut total = if buf.is_shared() { 0 } else { buf.len() };
            for (name, field) in s.extra_snapshot() {
                if qualifies(meta, s.type_id(), &name) {
                    total += size_of(meta, structs, &field, visited)?;
                }
            }
            Ok(total)
        }
        Value::Instance(obj) => {
            // Untyped objects have no descriptors, so no qualifying fields.
            let Some(ty) = obj.type_id() else {
                return Ok(0);
            };
            enter(visited, obj.addr())?;
            let mut total = 0;
            for (name, field) in obj.fields_snapshot() {
                if qualifies(meta, ty, &name) {
                    total += size_of(meta, structs, &field, visited)?;
                }
            }
            Ok(total)
        }
        _ => Ok(0),
    }
}

/// Only fields whose descriptor targets a registered (non-built-in) type
/// participate in sharing.
fn qualifies(meta: &dyn MetadataProvider, ty: TypeId, name: &str) -> bool {
    matches!(
        meta.resolve(ty, &Position::Property(name)),
        Descriptor::Typed { .. }
    )
}
