//! # Dynamic value model
//!
//! Everything that crosses the context boundary is a `Value`. Objects,
//! lists, and struct instances are `Arc`-backed cells so that aliasing and
//! cyclic graphs are representable and identity-checkable — the codec's
//! cycle guard keys on cell addresses, and the shared-memory manager
//! mutates class instances in place through the same cells.
//!
//! Buffers come in two flavours: owned storage private to one context, and
//! views into a [`SharedRegion`](crate::region::SharedRegion) whose bytes
//! are visible from every context holding the region.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::TypeId;
use crate::region;
use crate::region::SharedRegion;

#[derive(Clone)]
enum Store {
    Owned(Arc<RwLock<Vec<u8>>>),
    Region {
        region: SharedRegion,
        offset: usize,
        len: usize,
    },
}

/// A raw byte buffer, either owned or backed by a shared region.
#[derive(Clone)]
pub struct ByteBuf {
    store: Store,
}

impl ByteBuf {
    /// A buffer with its own private storage.
    pub fn owned(bytes: Vec<u8>) -> Self {
        Self {
            store: Store::Owned(Arc::new(RwLock::new(bytes))),
        }
    }

    /// A view of `region[offset..offset + len]`.
    pub fn region_view(region: SharedRegion, offset: usize, len: usize) -> region::Result<Self> {
        region.check_range(offset, len)?;
        Ok(Self {
            store: Store::Region { region, offset, len },
        })
    }

    /// A view covering all of `region`.
    pub fn whole_region(region: SharedRegion) -> Self {
        let len = region.len();
        Self {
            store: Store::Region { region, offset: 0, len },
        }
    }

    pub fn len(&self) -> usize {
        match &self.store {
            Store::Owned(bytes) => bytes.read().len(),
            Store::Region { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The backing region, if this buffer is a shared view.
    pub fn backing_region(&self) -> Option<(SharedRegion, usize, usize)> {
        match &self.store {
            Store::Owned(_) => None,
            Store::Region { region, offset, len } => Some((region.clone(), *offset, *len)),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.store, Store::Region { .. })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        match &self.store {
            Store::Owned(bytes) => bytes.read().clone(),
            Store::Region { region, offset, len } => {
                region.with_bytes(|bytes| bytes[*offset..*offset + *len].to_vec())
            }
        }
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.store {
            Store::Owned(bytes) => f(&bytes.read()),
            Store::Region { region, offset, len } => {
                region.with_bytes(|bytes| f(&bytes[*offset..*offset + *len]))
            }
        }
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &self.store {
            Store::Owned(bytes) => f(&mut bytes.write()),
            Store::Region { region, offset, len } => {
                region.with_bytes_mut(|bytes| f(&mut bytes[*offset..*offset + *len]))
            }
        }
    }

    /// Two buffers alias iff they share storage and, for region views,
    /// cover the same range.
    pub fn same_buffer(a: &ByteBuf, b: &ByteBuf) -> bool {
        match (&a.store, &b.store) {
            (Store::Owned(x), Store::Owned(y)) => Arc::ptr_eq(x, y),
            (
                Store::Region { region: rx, offset: ox, len: lx },
                Store::Region { region: ry, offset: oy, len: ly },
            ) => SharedRegion::same_region(rx, ry) && ox == oy && lx == ly,
            _ => false,
        }
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.store {
            Store::Owned(_) => write!(f, "ByteBuf(owned, {} bytes)", self.len()),
            Store::Region { region, offset, len } => {
                write!(f, "ByteBuf({}[{}..{}])", region.id(), offset, offset + len)
            }
        }
    }
}

struct ObjBody {
    type_id: Option<TypeId>,
    fields: BTreeMap<String, Value>,
}

/// A shared, mutable object cell: a plain object (`type_id` absent) or an
/// instance of a registered class.
#[derive(Clone)]
pub struct ObjRef {
    inner: Arc<RwLock<ObjBody>>,
}

impl ObjRef {
    /// A generic object with no registered type.
    pub fn plain() -> Self {
        Self::with_type(None)
    }

    /// An instance of a registered class. No constructor runs; fields are
    /// assigned afterwards.
    pub fn typed(type_id: TypeId) -> Self {
        Self::with_type(Some(type_id))
    }

    fn with_type(type_id: Option<TypeId>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ObjBody {
                type_id,
                fields: BTreeMap::new(),
            })),
        }
    }

    pub fn type_id(&self) -> Option<TypeId> {
        self.inner.read().type_id
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.write().fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.read().fields.get(name).cloned()
    }

    /// The object's own fields, in stable (sorted) order.
    pub fn fields_snapshot(&self) -> Vec<(String, Value)> {
        self.inner
            .read()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Cell identity, for visited-set bookkeeping.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn same_object(a: &ObjRef, b: &ObjRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.inner.read();
        match body.type_id {
            Some(ty) => write!(f, "ObjRef({}, {} fields)", ty, body.fields.len()),
            None => write!(f, "ObjRef(plain, {} fields)", body.fields.len()),
        }
    }
}

/// A shared, mutable list cell.
#[derive(Clone)]
pub struct ListRef {
    inner: Arc<RwLock<Vec<Value>>>,
}

impl ListRef {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.read().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) {
        let mut items = self.inner.write();
        if index < items.len() {
            items[index] = value;
        }
    }

    pub fn push(&self, value: Value) {
        self.inner.write().push(value);
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.read().clone()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for ListRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListRef({} items)", self.len())
    }
}

struct StructBody {
    type_id: TypeId,
    buf: ByteBuf,
    extra: BTreeMap<String, Value>,
}

/// An instance of a fixed-layout struct type: a backing buffer holding the
/// layout bytes plus any extra (non-layout) fields.
#[derive(Clone)]
pub struct StructRef {
    inner: Arc<RwLock<StructBody>>,
}

impl StructRef {
    pub fn new(type_id: TypeId, buf: ByteBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StructBody {
                type_id,
                buf,
                extra: BTreeMap::new(),
            })),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.inner.read().type_id
    }

    /// Handle to the backing buffer. Cloning the handle never copies bytes.
    pub fn buffer(&self) -> ByteBuf {
        self.inner.read().buf.clone()
    }

    pub fn set_extra(&self, name: impl Into<String>, value: Value) {
        self.inner.write().extra.insert(name.into(), value);
    }

    pub fn get_extra(&self, name: &str) -> Option<Value> {
        self.inner.read().extra.get(name).cloned()
    }

    pub fn extra_snapshot(&self) -> Vec<(String, Value)> {
        self.inner
            .read()
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl std::fmt::Debug for StructRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.inner.read();
        write!(
            f,
            "StructRef({}, {:?}, {} extra)",
            body.type_id,
            body.buf,
            body.extra.len()
        )
    }
}

/// A dynamic value crossing (or living near) the context boundary.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Built-in map, passed through by native copy.
    Map(Vec<(Value, Value)>),
    Bytes(ByteBuf),
    Region(SharedRegion),
    List(ListRef),
    Instance(ObjRef),
    Struct(StructRef),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn bytes(b: Vec<u8>) -> Self {
        Self::Bytes(ByteBuf::owned(b))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Self::List(ListRef::new(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&ByteBuf> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_region(&self) -> Option<&SharedRegion> {
        match self {
            Self::Region(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjRef> {
        match self {
            Self::Instance(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructRef> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value's shape, for error messages.
    pub fn shape_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Map(_) => "map",
            Self::Bytes(_) => "bytes",
            Self::Region(_) => "region",
            Self::List(_) => "list",
            Self::Instance(_) => "instance",
            Self::Struct(_) => "struct",
        }
    }
}

impl PartialEq for Value {
    /// Content equality. Regions compare by identity (the handle is the
    /// identity); floats compare by bit pattern. Only meaningful for
    /// acyclic values.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a.snapshot() == b.snapshot(),
            (Value::Region(a), Value::Region(b)) => SharedRegion::same_region(a, b),
            (Value::List(a), Value::List(b)) => a.snapshot() == b.snapshot(),
            (Value::Instance(a), Value::Instance(b)) => {
                a.type_id() == b.type_id() && a.fields_snapshot() == b.fields_snapshot()
            }
            (Value::Struct(a), Value::Struct(b)) => {
                a.type_id() == b.type_id()
                    && a.buffer().snapshot() == b.buffer().snapshot()
                    && a.extra_snapshot() == b.extra_snapshot()
            }
            _ => false,
        }
    }
}
