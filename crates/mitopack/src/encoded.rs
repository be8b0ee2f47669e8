//! # Wire shapes
//!
//! The tagged representation produced by the codec. The channel between
//! host and context is in-process, so the tree is carried as-is — region
//! and buffer handles ride inside it, which is exactly what keeps shared
//! bytes zero-copy. Byte-level serialization of primitives is a declared
//! non-goal; `Raw` leans on the channel's native move.

use crate::descriptor::TypeId;
use crate::region::SharedRegion;
use crate::value::ByteBuf;
use crate::value::Value;

/// Wire form of a raw byte buffer.
#[derive(Clone, Debug)]
pub enum EncodedBuffer {
    /// Reference into a shared region; zero bytes copied.
    Shared {
        region: SharedRegion,
        offset: usize,
        len: usize,
    },
    /// Owned copy of the bytes.
    Owned(Vec<u8>),
}

impl EncodedBuffer {
    /// Captures a buffer: shared views by reference, owned storage by copy.
    pub fn capture(buf: &ByteBuf) -> Self {
        match buf.backing_region() {
            Some((region, offset, len)) => Self::Shared { region, offset, len },
            None => Self::Owned(buf.snapshot()),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Shared { len, .. } => *len,
            Self::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire form of a value.
#[derive(Clone, Debug)]
pub enum EncodedValue {
    /// Passed through unchanged by the channel's native copy.
    Raw(Value),
    Array(Vec<EncodedValue>),
    Buffer(EncodedBuffer),
    Region(SharedRegion),
    Struct {
        type_id: TypeId,
        buf: EncodedBuffer,
        extra: Vec<(String, EncodedValue)>,
    },
    Object {
        type_id: TypeId,
        fields: Vec<(String, EncodedValue)>,
    },
}

impl EncodedValue {
    /// The encoding of an absent value.
    pub fn absent() -> Self {
        Self::Raw(Value::Null)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Raw(Value::Null))
    }
}
