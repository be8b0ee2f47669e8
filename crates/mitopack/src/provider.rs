//! # Collaborator contracts
//!
//! The codec and the shared-memory manager never own type metadata; they
//! consult these two providers. An implementation must be pure and stable
//! for a given type once that type is fully defined — the codec caches
//! nothing and relies on both sides of the boundary resolving identically.

use std::collections::BTreeSet;

use crate::descriptor::Descriptor;
use crate::descriptor::Position;
use crate::descriptor::TypeId;
use crate::descriptor::TypeKind;
use crate::value::ByteBuf;
use crate::value::StructRef;

#[derive(Debug, Clone)]
pub enum BindError {
    NotAStruct(TypeId),
    /// The supplied backing buffer is smaller than the layout requires.
    InvalidBufferSize {
        type_id: TypeId,
        need: usize,
        got: usize,
    },
    Factory(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAStruct(ty) => write!(f, "{} is not a fixed-layout struct type", ty),
            Self::InvalidBufferSize { type_id, need, got } => write!(
                f,
                "buffer of {} bytes is too small for {} (needs {})",
                got, type_id, need
            ),
            Self::Factory(msg) => write!(f, "struct factory failed: {}", msg),
        }
    }
}

impl std::error::Error for BindError {}

/// Yields the descriptor for any position on a registered type.
pub trait MetadataProvider: Send + Sync {
    /// The structural category of `ty`, or `None` if `ty` is not defined.
    fn kind(&self, ty: TypeId) -> Option<TypeKind>;

    /// The descriptor attached to `position` on `ty`. Positions with no
    /// attached descriptor resolve to [`Descriptor::None`].
    fn resolve(&self, ty: TypeId, position: &Position<'_>) -> Descriptor;

    /// All property positions of `ty` with their descriptors.
    fn properties(&self, ty: TypeId) -> Vec<(String, Descriptor)>;
}

/// Integration contract for the fixed-layout struct library.
pub trait StructProvider: Send + Sync {
    fn is_struct_type(&self, ty: TypeId) -> bool;

    /// The fixed byte size of the layout, if `ty` is a struct type.
    fn struct_byte_size(&self, ty: TypeId) -> Option<usize>;

    /// Field names that live inside the layout buffer and are therefore
    /// excluded from extra-field encoding.
    fn struct_field_names(&self, ty: TypeId) -> Option<BTreeSet<String>>;

    /// Binds a new instance to `buf`. With `copy` the instance gets its own
    /// storage initialized from `buf`; without, it aliases `buf` directly.
    fn bind_to_buffer(&self, ty: TypeId, buf: ByteBuf, copy: bool) -> Result<StructRef, BindError>;

    /// The backing buffer of an instance.
    fn raw_buffer_of(&self, value: &StructRef) -> ByteBuf;
}
