pub mod codec;
pub mod descriptor;
pub mod encoded;
pub mod provider;
pub mod region;
pub mod value;

pub use codec::Codec;
pub use descriptor::CallKind;
pub use descriptor::CustomCodec;
pub use descriptor::Descriptor;
pub use descriptor::Position;
pub use descriptor::TypeId;
pub use descriptor::TypeKind;
pub use encoded::EncodedBuffer;
pub use encoded::EncodedValue;
pub use provider::BindError;
pub use provider::MetadataProvider;
pub use provider::StructProvider;
pub use region::RegionId;
pub use region::SharedRegion;
pub use value::ByteBuf;
pub use value::ListRef;
pub use value::ObjRef;
pub use value::StructRef;
pub use value::Value;

#[cfg(test)]
mod tests;
