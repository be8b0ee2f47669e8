//! # Type-level shareability scan
//!
//! Decides, from metadata alone, whether values of a type can carry shared
//! backing bytes. Runs at registration time so that a constructor parameter
//! designated as shareable is rejected long before any context exists.

use mitopack::Descriptor;
use mitopack::MetadataProvider;
use mitopack::TypeId;
use mitopack::TypeKind;

use crate::error::Error;
use crate::error::Result;

/// True iff `ty` is a fixed-layout struct, raw-buffer, or shared-region
/// type, or a class whose properties recursively reach one.
///
/// A cycle in the type graph is a usage error, not `false`: the predicate
/// must be decidable.
pub fn has_shared_segments(meta: &dyn MetadataProvider, ty: TypeId) -> Result<bool> {
    scan(meta, ty, &mut Vec::new())
}

fn scan(meta: &dyn MetadataProvider, ty: TypeId, stack: &mut Vec<TypeId>) -> Result<bool> {
    let kind = meta.kind(ty).ok_or(Error::UndefinedType(ty))?;
    match kind {
        TypeKind::Bytes | TypeKind::Region | TypeKind::Struct => Ok(true),
        TypeKind::Class => {
            if stack.contains(&ty) {
                return Err(Error::CircularTypeReference(ty));
            }
            stack.push(ty);
            let found = scan_properties(meta, ty, stack);
            stack.pop();
            found
        }
    }
}

fn scan_properties(
    meta: &dyn MetadataProvider,
    ty: TypeId,
    stack: &mut Vec<TypeId>,
) -> Result<bool> {
    for (_, desc) in meta.properties(ty) {
        // Built-in targets have no descriptor record and never share.
        if let Descriptor::Typed { target, .. } = desc {
            if scan(meta, target, stack)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
