//! # Transport descriptors
//!
//! A descriptor is attached to a position (property, parameter, return,
//! constructor parameter) and tells the codec how a value at that position
//! crosses the context boundary. Descriptors are resolved once when the
//! owning type is registered and never change afterwards, so both sides of
//! the boundary always agree on shape.

use std::sync::Arc;

use crate::encoded::EncodedValue;
use crate::value::Value;

/// Identifier for a registered type.
///
/// Assigned by the registry at declaration time. Stable for the lifetime of
/// the process.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeId(pub u64);

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "type-{}", self.0)
    }
}

/// The structural category of a registered type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    /// A raw byte buffer type.
    Bytes,
    /// A shared memory region type.
    Region,
    /// A plain class: named fields, no fixed binary layout.
    Class,
    /// A fixed-layout struct: a class whose primary fields live in a
    /// backing buffer of a known byte size.
    Struct,
}

/// User-supplied encode/decode hooks for a position.
///
/// The hooks are fully responsible for producing and consuming a wire-safe
/// value; the codec never recurses into their output.
#[derive(Clone)]
pub struct CustomCodec {
    pub encode: Arc<dyn Fn(&Value) -> Result<EncodedValue, String> + Send + Sync>,
    pub decode: Arc<dyn Fn(EncodedValue) -> Result<Value, String> + Send + Sync>,
}

impl CustomCodec {
    pub fn new(
        encode: impl Fn(&Value) -> Result<EncodedValue, String> + Send + Sync + 'static,
        decode: impl Fn(EncodedValue) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }
}

impl std::fmt::Debug for CustomCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomCodec")
    }
}

/// How a value at one position is carried across the boundary.
#[derive(Clone, Debug)]
pub enum Descriptor {
    /// Pass through unchanged.
    None,
    /// Recurse as the named type, or an array thereof.
    Typed { target: TypeId, array: bool },
    /// Opaque user codec; no recursion.
    Custom(CustomCodec),
    /// The value never crosses: encodes to absent, decodes to absent.
    Suppressed,
}

impl Descriptor {
    /// A non-array reference to `target`.
    pub fn typed(target: TypeId) -> Self {
        Self::Typed { target, array: false }
    }

    /// An array whose elements recurse as `target`.
    pub fn typed_array(target: TypeId) -> Self {
        Self::Typed { target, array: true }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Which direction a method belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallKind {
    /// Host calls into the worker context.
    Remote,
    /// Worker context calls back into the host.
    Callback,
}

/// A descriptor-bearing position on a registered type.
#[derive(Clone, Debug)]
pub enum Position<'a> {
    Property(&'a str),
    Param {
        kind: CallKind,
        method: &'a str,
        index: usize,
    },
    Return { kind: CallKind, method: &'a str },
    CtorParam { index: usize },
}
