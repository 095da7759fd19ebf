//! Resolved type descriptions handed in by the reflection layer.
//!
//! Member discovery, attribute scanning and accessor resolution happen
//! outside this core; a [`SerializationTarget`] arrives fully resolved and
//! is the only thing the builders walk.

use std::fmt;
use std::sync::Arc;

use crate::error::CodecError;
use crate::format::{Decoder, Encoder};
use crate::value::{Value, ValueType};

/// Resolved member getter: reads the member's value out of an object.
pub type Getter = Arc<dyn Fn(&Value) -> Result<Value, CodecError> + Send + Sync>;

/// Resolved member setter: writes a value into an object under construction.
pub type Setter = Arc<dyn Fn(&mut Value, Value) -> Result<(), CodecError> + Send + Sync>;

/// One member of a serialization target, with its resolved accessor pair.
#[derive(Clone)]
pub struct MemberDescriptor {
    pub name: String,
    pub value_type: ValueType,
    pub get: Getter,
    pub set: Setter,
    /// Present when the member is collection-shaped; drives loop lowering.
    pub collection: Option<Arc<CollectionTraits>>,
    /// Opaque polymorphism rules, threaded through without interpretation.
    pub schema: Option<Arc<PolymorphismSchema>>,
}

impl fmt::Debug for MemberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberDescriptor")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .finish_non_exhaustive()
    }
}

/// Resolved description of a target type: ordered members plus shape flags.
pub struct SerializationTarget {
    pub type_name: String,
    pub members: Vec<MemberDescriptor>,
    /// Tuple-like targets have no named operation collections.
    pub tuple_like: bool,
    /// Set when the type packs and unpacks itself; the builders then
    /// substitute empty operation sets and defer to these routines.
    pub self_pack: Option<SelfPack>,
}

impl SerializationTarget {
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

impl fmt::Debug for SerializationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationTarget")
            .field("type_name", &self.type_name)
            .field("tuple_like", &self.tuple_like)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

/// Self-packing capability of a target type.
#[derive(Clone)]
pub struct SelfPack {
    pub pack: Arc<dyn Fn(&mut dyn Encoder, &Value) -> Result<(), CodecError> + Send + Sync>,
    pub unpack: Arc<dyn Fn(&mut dyn Decoder) -> Result<Value, CodecError> + Send + Sync>,
}

/// Runtime enumerator over a collection-shaped value.
pub trait Enumerator: Send {
    /// Advance; returns false when exhausted.
    fn move_next(&mut self) -> bool;
    /// The element the last successful `move_next` bound.
    fn current(&self) -> Value;
}

/// Resolved description of how to enumerate and rebuild a collection.
#[derive(Clone)]
pub struct CollectionTraits {
    pub element_type: ValueType,
    pub count: Arc<dyn Fn(&Value) -> Result<usize, CodecError> + Send + Sync>,
    pub acquire: Arc<dyn Fn(&Value) -> Result<Box<dyn Enumerator>, CodecError> + Send + Sync>,
    pub assemble: Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>,
}

impl fmt::Debug for CollectionTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionTraits")
            .field("element_type", &self.element_type)
            .finish_non_exhaustive()
    }
}

struct SeqEnumerator {
    items: Vec<Value>,
    index: usize,
}

impl Enumerator for SeqEnumerator {
    fn move_next(&mut self) -> bool {
        if self.index < self.items.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn current(&self) -> Value {
        self.items[self.index - 1].clone()
    }
}

impl CollectionTraits {
    /// Traits for a plain `Value::Seq` collection.
    pub fn for_seq(element_type: ValueType) -> Self {
        CollectionTraits {
            element_type,
            count: Arc::new(|v| match v {
                Value::Seq(items) => Ok(items.len()),
                other => Err(CodecError::TypeMismatch {
                    expected: ValueType::Seq,
                    found: other.type_of(),
                }),
            }),
            acquire: Arc::new(|v| match v {
                Value::Seq(items) => Ok(Box::new(SeqEnumerator {
                    items: items.clone(),
                    index: 0,
                }) as Box<dyn Enumerator>),
                other => Err(CodecError::TypeMismatch {
                    expected: ValueType::Seq,
                    found: other.type_of(),
                }),
            }),
            assemble: Arc::new(Value::Seq),
        }
    }
}

/// Resolved description of an enum-shaped target. Enum instances are
/// `Value::Str(member_name)` at runtime.
#[derive(Debug, Clone)]
pub struct EnumDescriptor {
    pub type_name: String,
    /// Ordered `(member name, underlying value)` pairs.
    pub members: Vec<(String, i64)>,
}

impl EnumDescriptor {
    pub fn value_of(&self, name: &str) -> Result<i64, CodecError> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| CodecError::UnknownEnumMember(name.to_owned()))
    }

    pub fn name_of(&self, value: i64) -> Result<&str, CodecError> {
        self.members
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
            .ok_or_else(|| CodecError::UnknownEnumMember(value.to_string()))
    }
}

/// Rules for selecting a concrete implementation type for a polymorphic
/// member. Consumed opaquely: this core only threads it to the compiled
/// factory and exposes it on the serializer.
#[derive(Debug, Clone, Default)]
pub struct PolymorphismSchema {
    pub label: String,
}
