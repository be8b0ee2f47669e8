//! Codec tests against a small hand-rolled provider pair.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand::RngCore;

use crate::codec::Codec;
use crate::codec::Error;
use crate::descriptor::CustomCodec;
use crate::descriptor::Descriptor;
use crate::descriptor::Position;
use crate::descriptor::TypeId;
use crate::descriptor::TypeKind;
use crate::encoded::EncodedBuffer;
use crate::encoded::EncodedValue;
use crate::provider::BindError;
use crate::provider::MetadataProvider;
use crate::provider::StructProvider;
use crate::region::SharedRegion;
use crate::value::ByteBuf;
use crate::value::ObjRef;
use crate::value::StructRef;
use crate::value::Value;

/// Table-backed provider pair for tests.
#[derive(Default)]
struct TestWorld {
    kinds: HashMap<TypeId, TypeKind>,
    props: HashMap<TypeId, Vec<(String, Descriptor)>>,
    layouts: HashMap<TypeId, (usize, BTreeSet<String>)>,
}

impl TestWorld {
    fn class(&mut self, id: u64, props: Vec<(&str, Descriptor)>) -> TypeId {
        let ty = TypeId(id);
        self.kinds.insert(ty, TypeKind::Class);
        self.props.insert(
            ty,
            props.into_iter().map(|(n, d)| (n.to_string(), d)).collect(),
        );
        ty
    }

    fn strukt(
        &mut self,
        id: u64,
        size: usize,
        layout_fields: &[&str],
        props: Vec<(&str, Descriptor)>,
    ) -> TypeId {
        let ty = TypeId(id);
        self.kinds.insert(ty, TypeKind::Struct);
        self.props.insert(
            ty,
            props.into_iter().map(|(n, d)| (n.to_string(), d)).collect(),
        );
        self.layouts.insert(
            ty,
            (size, layout_fields.iter().map(|s| s.to_string()).collect()),
        );
        ty
    }

    fn codec(self) -> Codec {
        let world = Arc::new(self);
        Codec::new(world.clone(), world)
    }
}

impl MetadataProvider for TestWorld {
    fn kind(&self, ty: TypeId) -> Option<TypeKind> {
        self.kinds.get(&ty).copied()
    }

    fn resolve(&self, ty: TypeId, position: &Position<'_>) -> Descriptor {
        let Position::Property(name) = position else {
            return Descriptor::None;
        };
        self.props
            .get(&ty)
            .and_then(|props| props.iter().find(|(n, _)| n == name))
            .map(|(_, d)| d.clone())
            .unwrap_or(Descriptor::None)
    }

    fn properties(&self, ty: TypeId) -> Vec<(String, Descriptor)> {
        self.props.get(&ty).cloned().unwrap_or_default()
    }
}

impl StructProvider for TestWorld {
    fn is_struct_type(&self, ty: TypeId) -> bool {
        self.layouts.contains_key(&ty)
    }

    fn struct_byte_size(&self, ty: TypeId) -> Option<usize> {
        self.layouts.get(&ty).map(|(size, _)| *size)
    }

    fn struct_field_names(&self, ty: TypeId) -> Option<BTreeSet<String>> {
        self.layouts.get(&ty).map(|(_, fields)| fields.clone())
    }

    fn bind_to_buffer(&self, ty: TypeId, buf: ByteBuf, copy: bool) -> Result<StructRef, BindError> {
        let (size, _) = self.layouts.get(&ty).ok_or(BindError::NotAStruct(ty))?;
        if buf.len() < *size {
            return Err(BindError::InvalidBufferSize {
                type_id: ty,
                need: *size,
                got: buf.len(),
            });
        }
        let buf = if copy { ByteBuf::owned(buf.snapshot()) } else { buf };
        Ok(StructRef::new(ty, buf))
    }

    fn raw_buffer_of(&self, value: &StructRef) -> ByteBuf {
        value.buffer()
    }
}

fn roundtrip(codec: &Codec, value: &Value, desc: &Descriptor) -> Value {
    let encoded = codec.encode(value, desc).expect("encode failed");
    codec.decode(encoded, desc).expect("decode failed")
}

#[test]
fn primitives_pass_through_raw() {
    let codec = TestWorld::default().codec();
    for value in [
        Value::Null,
        Value::Bool(true),
        Value::Int(-42),
        Value::Float(1.25),
        Value::text("hello"),
        Value::Map(vec![(Value::text("k"), Value::Int(1))]),
    ] {
        assert_eq!(roundtrip(&codec, &value, &Descriptor::None), value);
    }
}

#[test]
fn plain_object_is_left_to_the_native_copy() {
    let codec = TestWorld::default().codec();
    let obj = ObjRef::plain();
    obj.set("anything", Value::Int(7));

    let encoded = codec
        .encode(&Value::Instance(obj.clone()), &Descriptor::None)
        .unwrap();
    assert!(matches!(encoded, EncodedValue::Raw(_)));

    let out = codec.decode(encoded, &Descriptor::None).unwrap();
    let decoded = out.as_instance().expect("instance");
    assert!(ObjRef::same_object(&obj, decoded));
}

#[test]
fn typed_instance_roundtrips_without_a_constructor() {
    let mut world = TestWorld::default();
    let inner = world.class(1, vec![]);
    let outer = world.class(2, vec![("child", Descriptor::typed(inner))]);
    let codec = world.codec();

    let child = ObjRef::typed(inner);
    child.set("n", Value::Int(3));
    let parent = ObjRef::typed(outer);
    parent.set("child", Value::Instance(child.clone()));
    parent.set("label", Value::text("root"));

    let out = roundtrip(&codec, &Value::Instance(parent.clone()), &Descriptor::None);
    let out = out.as_instance().expect("instance");
    assert_eq!(out.type_id(), Some(outer));
    assert!(!ObjRef::same_object(out, &parent));
    assert_eq!(out.get("label"), Some(Value::text("root")));

    let out_child = out.get("child").unwrap();
    let out_child = out_child.as_instance().expect("child instance");
    assert_eq!(out_child.type_id(), Some(inner));
    assert_eq!(out_child.get("n"), Some(Value::Int(3)));
}

#[test]
fn typed_array_recurses_elementwise() {
    let mut world = TestWorld::default();
    let item = world.class(1, vec![]);
    let codec = world.codec();

    let mk = |n: i64| {
        let obj = ObjRef::typed(item);
        obj.set("n", Value::Int(n));
        Value::Instance(obj)
    };
    let list = Value::list(vec![mk(1), mk(2), mk(3)]);

    let out = roundtrip(&codec, &list, &Descriptor::typed_array(item));
    let out = out.as_list().expect("list");
    assert_eq!(out.len(), 3);
    for i in 0..3 {
        let elem = out.get(i).unwrap();
        let elem = elem.as_instance().unwrap();
        assert_eq!(elem.type_id(), Some(item));
        assert_eq!(elem.get("n"), Some(Value::Int(i as i64 + 1)));
    }
}

#[test]
fn owned_buffer_crosses_by_copy() {
    let codec = TestWorld::default().codec();
    let buf = ByteBuf::owned(vec![1, 2, 3]);

    let encoded = codec.encode(&Value::Bytes(buf.clone()), &Descriptor::None).unwrap();
    let EncodedValue::Buffer(EncodedBuffer::Owned(_)) = &encoded else {
        panic!("owned buffer should encode as an owned copy");
    };

    // Mutating the source after encode must not leak into the copy.
    buf.with_bytes_mut(|b| b[0] = 0xFF);

    let out = codec.decode(encoded, &Descriptor::None).unwrap();
    let out = out.as_bytes().unwrap();
    assert_eq!(out.snapshot(), vec![1, 2, 3]);
    assert!(!ByteBuf::same_buffer(out, &buf));
}

#[test]
fn shared_buffer_crosses_by_reference() {
    let codec = TestWorld::default().codec();
    let region = SharedRegion::from_bytes(&[10, 20, 30, 40]);
    let view = ByteBuf::region_view(region.clone(), 1, 2).unwrap();

    let encoded = codec.encode(&Value::Bytes(view.clone()), &Descriptor::None).unwrap();
    let EncodedValue::Buffer(EncodedBuffer::Shared { offset, len, .. }) = &encoded else {
        panic!("shared buffer should encode as a region reference");
    };
    assert_eq!((*offset, *len), (1, 2));

    let out = codec.decode(encoded, &Descriptor::None).unwrap();
    let out = out.as_bytes().unwrap();

    // Zero-copy aliasing: a write through the decoded buffer is visible
    // through the original view and the region itself.
    out.with_bytes_mut(|b| b[0] = 0x7E);
    assert_eq!(view.snapshot(), vec![0x7E, 30]);
    assert_eq!(region.snapshot(), vec![10, 0x7E, 30, 40]);
}

#[test]
fn bare_region_keeps_identity() {
    let codec = TestWorld::default().codec();
    let region = SharedRegion::allocate(8);

    let out = roundtrip(&codec, &Value::Region(region.clone()), &Descriptor::None);
    let out = out.as_region().unwrap();
    assert!(SharedRegion::same_region(out, &region));
}

#[test]
fn struct_with_extra_fields_roundtrips() {
    let mut world = TestWorld::default();
    let cell = world.strukt(1, 4, &["value"], vec![("note", Descriptor::None)]);
    let codec = world.codec();

    let s = StructRef::new(cell, ByteBuf::owned(vec![9, 8, 7, 6]));
    s.set_extra("note", Value::text("scratch"));

    let out = roundtrip(&codec, &Value::Struct(s.clone()), &Descriptor::None);
    let out = out.as_struct().unwrap();
    assert_eq!(out.type_id(), cell);
    assert_eq!(out.buffer().snapshot(), vec![9, 8, 7, 6]);
    assert_eq!(out.get_extra("note"), Some(Value::text("scratch")));

    // Owned transit: the decoded instance has private storage.
    out.buffer().with_bytes_mut(|b| b[0] = 0);
    assert_eq!(s.buffer().snapshot(), vec![9, 8, 7, 6]);
}

#[test]
fn struct_on_shared_region_stays_aliased() {
    let mut world = TestWorld::default();
    let cell = world.strukt(1, 1, &["value"], vec![]);
    let codec = world.codec();

    let region = SharedRegion::from_bytes(&[0x10]);
    let s = StructRef::new(cell, ByteBuf::whole_region(region.clone()));

    let out = roundtrip(&codec, &Value::Struct(s), &Descriptor::None);
    let out = out.as_struct().unwrap();
    out.buffer().with_bytes_mut(|b| b[0] = 0x7F);
    assert_eq!(region.snapshot(), vec![0x7F]);
}

#[test]
fn undersized_struct_buffer_is_rejected() {
    let mut world = TestWorld::default();
    let cell = world.strukt(1, 4, &["value"], vec![]);
    let codec = world.codec();

    let encoded = EncodedValue::Struct {
        type_id: cell,
        buf: EncodedBuffer::Owned(vec![1, 2]),
        extra: Vec::new(),
    };
    match codec.decode(encoded, &Descriptor::None) {
        Err(Error::Bind(BindError::InvalidBufferSize { need: 4, got: 2, .. })) => {}
        other => panic!("expected InvalidBufferSize, got {:?}", other),
    }
}

#[test]
fn suppressed_never_crosses() {
    let codec = TestWorld::default().codec();
    let encoded = codec
        .encode(&Value::text("secret"), &Descriptor::Suppressed)
        .unwrap();
    assert!(encoded.is_absent());
    let out = codec
        .decode(EncodedValue::Raw(Value::text("leak")), &Descriptor::Suppressed)
        .unwrap();
    assert!(out.is_null());
}

#[test]
fn custom_codec_is_opaque() {
    let codec = TestWorld::default().codec();
    let desc = Descriptor::Custom(CustomCodec::new(
        |value| match value {
            Value::Int(n) => Ok(EncodedValue::Raw(Value::Int(n * 2))),
            other => Err(format!("expected int, got {}", other.shape_name())),
        },
        |encoded| match encoded {
            EncodedValue::Raw(Value::Int(n)) => Ok(Value::Int(n / 2)),
            _ => Err("expected raw int".to_string()),
        },
    ));

    let encoded = codec.encode(&Value::Int(21), &desc).unwrap();
    assert!(matches!(encoded, EncodedValue::Raw(Value::Int(42))));
    assert_eq!(codec.decode(encoded, &desc).unwrap(), Value::Int(21));

    match codec.encode(&Value::text("nope"), &desc) {
        Err(Error::Custom(_)) => {}
        other => panic!("expected Custom error, got {:?}", other),
    }
}

#[test]
fn mutual_references_fail_the_whole_encode() {
    let mut world = TestWorld::default();
    let node = world.class(1, vec![]);
    let codec = world.codec();

    let a = ObjRef::typed(node);
    let b = ObjRef::typed(node);
    a.set("next", Value::Instance(b.clone()));
    b.set("next", Value::Instance(a.clone()));

    match codec.encode(&Value::Instance(a), &Descriptor::None) {
        Err(Error::CircularReference) => {}
        other => panic!("expected CircularReference, got {:?}", other),
    }
}

#[test]
fn self_containing_list_fails() {
    let codec = TestWorld::default().codec();
    let list = crate::value::ListRef::new(vec![]);
    list.push(Value::List(list.clone()));

    match codec.encode(&Value::List(list), &Descriptor::None) {
        Err(Error::CircularReference) => {}
        other => panic!("expected CircularReference, got {:?}", other),
    }
}

#[test]
fn unknown_target_type_is_an_error() {
    let codec = TestWorld::default().codec();
    let obj = ObjRef::plain();
    match codec.encode(&Value::Instance(obj), &Descriptor::typed(TypeId(99))) {
        Err(Error::UnknownType(TypeId(99))) => {}
        other => panic!("expected UnknownType, got {:?}", other),
    }
}

#[test]
fn random_buffers_roundtrip() {
    let codec = TestWorld::default().codec();
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let mut bytes = vec![0u8; rng.gen_range(0..256)];
        rng.fill_bytes(&mut bytes);
        let out = roundtrip(&codec, &Value::bytes(bytes.clone()), &Descriptor::None);
        assert_eq!(out.as_bytes().unwrap().snapshot(), bytes);
    }
}
