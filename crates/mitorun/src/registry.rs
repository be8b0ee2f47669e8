//! # Runtime registry
//!
//! The process-wide type table: classes, struct layouts, and unit
//! registrations, populated during an explicit registration phase and
//! read-only from the moment the first session opens. Every descriptor is
//! resolved into an immutable record here, once, so encode and decode can
//! never disagree on shape.
//!
//! The registry is itself the metadata provider and the struct provider
//! consumed by the codec; a macro- or codegen-based provider could replace
//! it without touching anything downstream.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use mitopack::BindError;
use mitopack::ByteBuf;
use mitopack::Codec;
use mitopack::Descriptor;
use mitopack::MetadataProvider;
use mitopack::Position;
use mitopack::StructProvider;
use mitopack::StructRef;
use mitopack::TypeId;
use mitopack::TypeKind;
use mitopack::CallKind;

use crate::unit::Unit;
use crate::unit::UnitFactory;
use crate::unit::UnitInit;

#[derive(Debug)]
pub enum Error {
    /// Registration attempted after the first session opened.
    Sealed,
    DuplicateName(String),
    AlreadyDefined(String),
    NameMismatch { declared: String, defined: String },
    /// The id was never declared.
    UnknownType(TypeId),
    /// Declared but never defined.
    UndefinedType(TypeId),
    NotAUnit(TypeId),
    MissingFactory(String),
    /// A shareable constructor parameter's type has no shared segments.
    UnshareableType { unit: String, index: usize },
    Scan(mitoshm::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sealed => write!(f, "registry is sealed; register types before opening sessions"),
            Self::DuplicateName(name) => write!(f, "type '{}' is already registered", name),
            Self::AlreadyDefined(name) => write!(f, "type '{}' is already defined", name),
            Self::NameMismatch { declared, defined } => {
                write!(f, "declared as '{}' but defined as '{}'", declared, defined)
            }
            Self::UnknownType(ty) => write!(f, "{} was never declared", ty),
            Self::UndefinedType(ty) => write!(f, "{} is declared but not defined", ty),
            Self::NotAUnit(ty) => write!(f, "{} is not registered as a unit", ty),
            Self::MissingFactory(name) => write!(f, "unit '{}' has no factory", name),
            Self::UnshareableType { unit, index } => write!(
                f,
                "constructor parameter {} of unit '{}' is designated shareable but its type has no shared segments",
                index, unit
            ),
            Self::Scan(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<mitoshm::Error> for Error {
    fn from(e: mitoshm::Error) -> Self {
        Self::Scan(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Factory override hook for struct types whose concrete construction is
/// non-standard. Installed once at registration.
pub type StructFactory =
    Arc<dyn Fn(ByteBuf) -> std::result::Result<StructRef, String> + Send + Sync>;

/// Fixed binary layout of a struct type.
#[derive(Clone)]
pub struct StructLayout {
    pub size: usize,
    /// Field names stored inside the layout buffer, excluded from extra
    /// encoding.
    pub fields: BTreeSet<String>,
    pub factory_override: Option<StructFactory>,
}

impl StructLayout {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            fields: BTreeSet::new(),
            factory_override: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into());
        self
    }

    pub fn factory(
        mut self,
        f: impl Fn(ByteBuf) -> std::result::Result<StructRef, String> + Send + Sync + 'static,
    ) -> Self {
        self.factory_override = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for StructLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructLayout")
            .field("size", &self.size)
            .field("fields", &self.fields)
            .field("factory_override", &self.factory_override.is_some())
            .finish()
    }
}

/// Resolved signature of a remotely or callback-callable method.
#[derive(Clone, Debug)]
pub struct MethodSig {
    pub params: Vec<Descriptor>,
    pub ret: Descriptor,
}

#[derive(Clone, Debug)]
pub struct CtorParam {
    pub desc: Descriptor,
    /// Designated shareable at registration; validated against the
    /// shareability scan before any context exists.
    pub shared: bool,
}

/// What it takes to start a context for a unit type.
#[derive(Clone, Debug)]
pub struct UnitRegistration {
    pub id: TypeId,
    pub entry_location: String,
    pub struct_layout: Option<StructLayout>,
}

/// Immutable record of a defined type. All descriptors in here were
/// resolved exactly once, at registration.
pub struct TypeRecord {
    pub id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub layout: Option<StructLayout>,
    pub props: BTreeMap<String, Descriptor>,
    pub remote: HashMap<String, MethodSig>,
    pub callback: HashMap<String, MethodSig>,
    pub ctor: Vec<CtorParam>,
    pub unit: Option<UnitRegistration>,
    pub factory: Option<UnitFactory>,
}

enum TypeEntry {
    Declared(String),
    Defined(Arc<TypeRecord>),
}

/// Specification of a value class (optionally with a fixed layout).
pub struct ClassSpec {
    name: String,
    props: Vec<(String, Descriptor)>,
    layout: Option<StructLayout>,
}

impl ClassSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: Vec::new(),
            layout: None,
        }
    }

    pub fn prop(mut self, name: impl Into<String>, desc: Descriptor) -> Self {
        self.props.push((name.into(), desc));
        self
    }

    pub fn layout(mut self, layout: StructLayout) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Specification of a unit type: a class plus entry location, constructor
/// parameters, method tables, and a factory.
pub struct UnitSpec {
    name: String,
    entry_location: String,
    props: Vec<(String, Descriptor)>,
    layout: Option<StructLayout>,
    ctor: Vec<CtorParam>,
    remote: Vec<(String, MethodSig)>,
    callback: Vec<(String, MethodSig)>,
    factory: Option<UnitFactory>,
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, entry_location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_location: entry_location.into(),
            props: Vec::new(),
            layout: None,
            ctor: Vec::new(),
            remote: Vec::new(),
            callback: Vec::new(),
            factory: None,
        }
    }

    pub fn prop(mut self, name: impl Into<String>, desc: Descriptor) -> Self {
        self.props.push((name.into(), desc));
        self
    }

    pub fn layout(mut self, layout: StructLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn ctor_param(mut self, desc: Descriptor) -> Self {
        self.ctor.push(CtorParam { desc, shared: false });
        self
    }

    /// A constructor parameter whose backing bytes should cross by
    /// reference. Its type must pass the shareability scan.
    pub fn shared_ctor_param(mut self, desc: Descriptor) -> Self {
        self.ctor.push(CtorParam { desc, shared: true });
        self
    }

    pub fn remote_method(
        mut self,
        name: impl Into<String>,
        params: Vec<Descriptor>,
        ret: Descriptor,
    ) -> Self {
        self.remote.push((name.into(), MethodSig { params, ret }));
        self
    }

    pub fn callback_method(
        mut self,
        name: impl Into<String>,
        params: Vec<Descriptor>,
        ret: Descriptor,
    ) -> Self {
        self.callback.push((name.into(), MethodSig { params, ret }));
        self
    }

    pub fn factory(
        mut self,
        f: impl Fn(UnitInit) -> std::result::Result<Box<dyn Unit>, String> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Arc::new(f));
        self
    }
}

/// The central registry for types, units, and their descriptors.
pub struct Runtime {
    types: DashMap<TypeId, TypeEntry>,
    names: DashMap<String, TypeId>,
    next_type_id: AtomicU64,
    sealed: AtomicBool,
    bytes_type: TypeId,
    region_type: TypeId,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        let runtime = Self {
            types: DashMap::new(),
            names: DashMap::new(),
            next_type_id: AtomicU64::new(1),
            sealed: AtomicBool::new(false),
            bytes_type: TypeId(0),
            region_type: TypeId(0),
        };
        let mut runtime = runtime;
        runtime.bytes_type = runtime.seed("bytes", TypeKind::Bytes);
        runtime.region_type = runtime.seed("region", TypeKind::Region);
        Arc::new(runtime)
    }

    fn seed(&self, name: &str, kind: TypeKind) -> TypeId {
        let id = self.next_id();
        self.names.insert(name.to_string(), id);
        self.types.insert(
            id,
            TypeEntry::Defined(Arc::new(TypeRecord {
                id,
                name: name.to_string(),
                kind,
                layout: None,
                props: BTreeMap::new(),
                remote: HashMap::new(),
                callback: HashMap::new(),
                ctor: Vec::new(),
                unit: None,
                factory: None,
            })),
        );
        id
    }

    fn next_id(&self) -> TypeId {
        TypeId(self.next_type_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The well-known raw-buffer type.
    pub fn bytes_type(&self) -> TypeId {
        self.bytes_type
    }

    /// The well-known shared-region type.
    pub fn region_type(&self) -> TypeId {
        self.region_type
    }

    /// No registration is accepted once any session has opened.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Sealed);
        }
        Ok(())
    }

    /// Reserves an id for a name so mutually referential types can point at
    /// each other before either is defined.
    pub fn declare(&self, name: &str) -> Result<TypeId> {
        self.ensure_open()?;
        if self.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        let id = self.next_id();
        self.names.insert(name.to_string(), id);
        self.types.insert(id, TypeEntry::Declared(name.to_string()));
        Ok(id)
    }

    /// Fills in a previously declared class.
    pub fn define_class(&self, id: TypeId, spec: ClassSpec) -> Result<()> {
        self.ensure_open()?;
        match self.types.get(&id).as_deref() {
            Some(TypeEntry::Declared(name)) if *name == spec.name => {}
            Some(TypeEntry::Declared(name)) => {
                return Err(Error::NameMismatch {
                    declared: name.clone(),
                    defined: spec.name,
                });
            }
            Some(TypeEntry::Defined(_)) => return Err(Error::AlreadyDefined(spec.name)),
            None => return Err(Error::UnknownType(id)),
        }
        let kind = if spec.layout.is_some() { TypeKind::Struct } else { TypeKind::Class };
        self.types.insert(
            id,
            TypeEntry::Defined(Arc::new(TypeRecord {
                id,
                name: spec.name,
                kind,
                layout: spec.layout,
                props: spec.props.into_iter().collect(),
                remote: HashMap::new(),
                callback: HashMap::new(),
                ctor: Vec::new(),
                unit: None,
                factory: None,
            })),
        );
        Ok(())
    }

    /// Declares and defines a class in one step.
    pub fn register_class(&self, spec: ClassSpec) -> Result<TypeId> {
        let id = self.declare(&spec.name)?;
        self.define_class(id, spec)?;
        Ok(id)
    }

    /// Registers a unit type: resolves and memoizes every descriptor,
    /// records the entry location and layout, and validates each
    /// shareable constructor parameter against the shareability scan.
    pub fn register_unit(&self, spec: UnitSpec) -> Result<TypeId> {
        self.ensure_open()?;
        let factory = spec
            .factory
            .clone()
            .ok_or_else(|| Error::MissingFactory(spec.name.clone()))?;
        let name = spec.name.clone();
        let id = self.declare(&name)?;

        let kind = if spec.layout.is_some() { TypeKind::Struct } else { TypeKind::Class };
        let record = TypeRecord {
            id,
            name: name.clone(),
            kind,
            layout: spec.layout.clone(),
            props: spec.props.into_iter().collect(),
            remote: spec.remote.into_iter().collect(),
            callback: spec.callback.into_iter().collect(),
            ctor: spec.ctor,
            unit: Some(UnitRegistration {
                id,
                entry_location: spec.entry_location,
                struct_layout: spec.layout,
            }),
            factory: Some(factory),
        };
        let ctor = record.ctor.clone();
        self.types.insert(id, TypeEntry::Defined(Arc::new(record)));

        // Shareable parameters are a registration-time contract; a failure
        // here must leave the type unusable.
        for (index, param) in ctor.iter().enumerate() {
            if !param.shared {
                continue;
            }
            let shareable = match &param.desc {
                Descriptor::Typed { target, .. } => {
                    match mitoshm::has_shared_segments(self, *target) {
                        Ok(found) => found,
                        Err(e) => {
                            self.unregister(id, &name);
                            return Err(e.into());
                        }
                    }
                }
                _ => false,
            };
            if !shareable {
                self.unregister(id, &name);
                return Err(Error::UnshareableType { unit: name, index });
            }
        }

        Ok(id)
    }

    fn unregister(&self, id: TypeId, name: &str) {
        self.types.remove(&id);
        self.names.remove(name);
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.names.get(name).map(|entry| *entry.value())
    }

    pub fn record(&self, id: TypeId) -> Result<Arc<TypeRecord>> {
        match self.types.get(&id).as_deref() {
            Some(TypeEntry::Defined(record)) => Ok(record.clone()),
            Some(TypeEntry::Declared(_)) => Err(Error::UndefinedType(id)),
            None => Err(Error::UnknownType(id)),
        }
    }

    /// A codec wired to this registry's metadata.
    pub fn codec(self: &Arc<Self>) -> Codec {
        Codec::new(self.clone(), self.clone())
    }
}

impl MetadataProvider for Runtime {
    fn kind(&self, ty: TypeId) -> Option<TypeKind> {
        self.record(ty).ok().map(|record| record.kind)
    }

    fn resolve(&self, ty: TypeId, position: &Position<'_>) -> Descriptor {
        let Ok(record) = self.record(ty) else {
            return Descriptor::None;
        };
        let table = |kind: &CallKind| match kind {
            CallKind::Remote => &record.remote,
            CallKind::Callback => &record.callback,
        };
        match position {
            Position::Property(name) => record.props.get(*name).cloned(),
            Position::Param { kind, method, index } => table(kind)
                .get(*method)
                .and_then(|sig| sig.params.get(*index).cloned()),
            Position::Return { kind, method } => table(kind).get(*method).map(|sig| sig.ret.clone()),
            Position::CtorParam { index } => record.ctor.get(*index).map(|p| p.desc.clone()),
        }
        .unwrap_or(Descriptor::None)
    }

    fn properties(&self, ty: TypeId) -> Vec<(String, Descriptor)> {
        match self.record(ty) {
            Ok(record) => record
                .props
                .iter()
                .map(|(name, desc)| (name.clone(), desc.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl StructProvider for Runtime {
    fn is_struct_type(&self, ty: TypeId) -> bool {
        self.record(ty).map(|r| r.layout.is_some()).unwrap_or(false)
    }

    fn struct_byte_size(&self, ty: TypeId) -> Option<usize> {
        self.record(ty).ok()?.layout.as_ref().map(|l| l.size)
    }

    fn struct_field_names(&self, ty: TypeId) -> Option<BTreeSet<String>> {
        self.record(ty).ok()?.layout.as_ref().map(|l| l.fields.clone())
    }

    fn bind_to_buffer(
        &self,
        ty: TypeId,
        buf: ByteBuf,
        copy: bool,
    ) -> std::result::Result<StructRef, BindError> {
        let record = self.record(ty).map_err(|_| BindError::NotAStruct(ty))?;
        let layout = record.layout.as_ref().ok_or(BindError::NotAStruct(ty))?;
        if buf.len() < layout.size {
            return Err(BindError::InvalidBufferSize {
                type_id: ty,
                need: layout.size,
                got: buf.len(),
            });
        }
        let buf = if copy { ByteBuf::owned(buf.snapshot()) } else { buf };
        match &layout.factory_override {
            Some(factory) => factory(buf).map_err(BindError::Factory),
            None => Ok(StructRef::new(ty, buf)),
        }
    }

    fn raw_buffer_of(&self, value: &StructRef) -> ByteBuf {
        value.buffer()
    }
}
