//! Serializer runtime.
//!
//! A [`Serializer`] owns the operation collections a builder produced and
//! drives them against a wire encoder/decoder. Ordered operations run
//! positionally over an array; named operations are keyed by member name
//! over a map. Both backends hand their compiled operations to this one
//! runtime, so wire behavior is identical whichever backend built them.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::context::{EnumSerializationMethod, SerializationContext};
use crate::error::CodecError;
use crate::format::{Decoder, Encoder, WireKind};
use crate::msgpack::{MsgPackDecoder, MsgPackEncoder};
use crate::target::{EnumDescriptor, PolymorphismSchema, SelfPack};
use crate::value::{Value, ValueType};

/// Compiled pack operation for one member.
pub type PackOp = Arc<dyn Fn(&mut dyn Encoder, &Value) -> Result<(), CodecError> + Send + Sync>;

/// Compiled unpack operation for one member, storing into the object under
/// construction.
pub type UnpackOp =
    Arc<dyn Fn(&mut dyn Decoder, &mut Value) -> Result<(), CodecError> + Send + Sync>;

/// What a successful build produces: a constructor binding compiled
/// operations to a serialization context.
pub type SerializerFactory = Arc<dyn Fn(Arc<SerializationContext>) -> Serializer + Send + Sync>;

pub(crate) type EnumPackFn = Arc<dyn Fn(&mut dyn Encoder, i64) -> Result<(), CodecError> + Send + Sync>;
pub(crate) type EnumUnpackFn = Arc<dyn Fn(&Value) -> Result<i64, CodecError> + Send + Sync>;

enum Kind {
    Object {
        member_names: Vec<String>,
        pack_ordered: Vec<PackOp>,
        pack_named: Option<IndexMap<String, PackOp>>,
        unpack_ordered: Vec<UnpackOp>,
        unpack_named: Option<IndexMap<String, UnpackOp>>,
        tuple_like: bool,
        schema: Option<Arc<PolymorphismSchema>>,
    },
    Enum {
        desc: Arc<EnumDescriptor>,
        method: EnumSerializationMethod,
        pack_underlying: EnumPackFn,
        unpack_underlying: EnumUnpackFn,
    },
    SelfDescribed(SelfPack),
}

pub struct Serializer {
    kind: Kind,
}

impl Serializer {
    pub(crate) fn object(
        member_names: Vec<String>,
        pack_ordered: Vec<PackOp>,
        pack_named: Option<IndexMap<String, PackOp>>,
        unpack_ordered: Vec<UnpackOp>,
        unpack_named: Option<IndexMap<String, UnpackOp>>,
        tuple_like: bool,
        schema: Option<Arc<PolymorphismSchema>>,
    ) -> Self {
        Serializer {
            kind: Kind::Object {
                member_names,
                pack_ordered,
                pack_named,
                unpack_ordered,
                unpack_named,
                tuple_like,
                schema,
            },
        }
    }

    pub(crate) fn enumeration(
        desc: Arc<EnumDescriptor>,
        method: EnumSerializationMethod,
        pack_underlying: EnumPackFn,
        unpack_underlying: EnumUnpackFn,
    ) -> Self {
        Serializer {
            kind: Kind::Enum {
                desc,
                method,
                pack_underlying,
                unpack_underlying,
            },
        }
    }

    pub(crate) fn self_described(routines: SelfPack) -> Self {
        Serializer {
            kind: Kind::SelfDescribed(routines),
        }
    }

    /// Polymorphism rules threaded through from the target, if any.
    pub fn schema(&self) -> Option<&Arc<PolymorphismSchema>> {
        match &self.kind {
            Kind::Object { schema, .. } => schema.as_ref(),
            _ => None,
        }
    }

    /// Member names in declaration order. Empty for enums and self-described
    /// targets.
    pub fn member_names(&self) -> &[String] {
        match &self.kind {
            Kind::Object { member_names, .. } => member_names,
            _ => &[],
        }
    }

    pub fn pack(&self, enc: &mut dyn Encoder, value: &Value) -> Result<(), CodecError> {
        match &self.kind {
            Kind::SelfDescribed(routines) => (routines.pack)(enc, value),
            Kind::Enum {
                desc,
                method,
                pack_underlying,
                ..
            } => {
                let name = value.as_str().ok_or_else(|| CodecError::TypeMismatch {
                    expected: ValueType::Str,
                    found: value.type_of(),
                })?;
                let underlying = desc.value_of(name)?;
                match method {
                    EnumSerializationMethod::ByName => enc.write_str(name),
                    EnumSerializationMethod::ByUnderlyingValue => {
                        pack_underlying(enc, underlying)
                    }
                }
            }
            Kind::Object {
                pack_ordered,
                pack_named,
                tuple_like,
                ..
            } => {
                let use_named = !tuple_like && pack_named.is_some();
                if use_named {
                    let named = pack_named.as_ref().ok_or_else(|| {
                        CodecError::Message("named operations missing".to_owned())
                    })?;
                    enc.write_map_header(named.len() as u32)?;
                    for (name, op) in named {
                        enc.write_str(name)?;
                        op(enc, value)?;
                    }
                } else {
                    enc.write_array_header(pack_ordered.len() as u32)?;
                    for op in pack_ordered {
                        op(enc, value)?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn unpack(&self, dec: &mut dyn Decoder) -> Result<Value, CodecError> {
        match &self.kind {
            Kind::SelfDescribed(routines) => (routines.unpack)(dec),
            Kind::Enum {
                desc,
                unpack_underlying,
                ..
            } => {
                // Either wire form is accepted regardless of how this
                // serializer itself packs.
                let wire = dec.read_value()?;
                match &wire {
                    Value::Str(name) => {
                        desc.value_of(name)?;
                        Ok(Value::Str(name.clone()))
                    }
                    Value::Int(_) | Value::Uint(_) => {
                        let underlying = unpack_underlying(&wire)?;
                        Ok(Value::Str(desc.name_of(underlying)?.to_owned()))
                    }
                    other => Err(CodecError::TypeMismatch {
                        expected: ValueType::Str,
                        found: other.type_of(),
                    }),
                }
            }
            Kind::Object {
                member_names,
                unpack_ordered,
                unpack_named,
                ..
            } => {
                let mut object = Value::Seq(vec![Value::Nil; member_names.len()]);
                match dec.peek_kind()? {
                    WireKind::Array => {
                        let len = dec.read_array_header()? as usize;
                        if len > unpack_ordered.len() {
                            return Err(CodecError::Message(format!(
                                "wire array has {len} elements, target has {}",
                                unpack_ordered.len()
                            )));
                        }
                        // A shorter array leaves the trailing members nil.
                        for op in unpack_ordered.iter().take(len) {
                            op(dec, &mut object)?;
                        }
                    }
                    WireKind::Map => {
                        let named = unpack_named.as_ref().ok_or_else(|| {
                            CodecError::Message(
                                "map form is not supported for this target".to_owned(),
                            )
                        })?;
                        let len = dec.read_map_header()?;
                        for _ in 0..len {
                            let key = dec.read_str()?;
                            match named.get(&key) {
                                Some(op) => op(dec, &mut object)?,
                                // Unknown keys are skipped, not an error.
                                None => {
                                    dec.read_value()?;
                                }
                            }
                        }
                    }
                    other => {
                        return Err(CodecError::TypeMismatch {
                            expected: ValueType::Seq,
                            found: match other {
                                WireKind::Nil => ValueType::Nil,
                                _ => ValueType::Any,
                            },
                        })
                    }
                }
                Ok(object)
            }
        }
    }

    /// Pack into a fresh MessagePack buffer.
    pub fn pack_to_vec(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        let mut enc = MsgPackEncoder::new(&mut buf);
        self.pack(&mut enc, value)?;
        Ok(buf)
    }

    /// Unpack from a MessagePack buffer.
    pub fn unpack_from_slice(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let mut dec = MsgPackDecoder::new(bytes);
        self.unpack(&mut dec)
    }
}
