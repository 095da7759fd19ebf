//! Dynamic value model.
//!
//! Compiled serializers operate on `Value`, the runtime representation of
//! the objects being packed and unpacked. The policy layer decides how a
//! concrete type maps onto `Value` (by convention, objects are `Seq` records
//! whose slots are addressed through member accessors); this core only needs
//! the accessors handed to it in a `SerializationTarget`.

use std::fmt;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bin(Vec<u8>),
    Seq(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

/// Semantic type tag carried by member descriptors and graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Nil,
    Bool,
    Int,
    Uint,
    F32,
    F64,
    Str,
    Bin,
    Seq,
    Map,
    /// Dynamic wildcard: any runtime value.
    Any,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Nil => "nil",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Uint => "uint",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Str => "str",
            ValueType::Bin => "bin",
            ValueType::Seq => "seq",
            ValueType::Map => "map",
            ValueType::Any => "any",
        };
        write!(f, "{name}")
    }
}

impl Value {
    /// The runtime type tag of this value.
    pub fn type_of(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Uint(_) => ValueType::Uint,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Str(_) => ValueType::Str,
            Value::Bin(_) => ValueType::Bin,
            Value::Seq(_) => ValueType::Seq,
            Value::Map(_) => ValueType::Map,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Signed view of a numeric value. `Uint` values above `i64::MAX` are
    /// not representable and yield `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    /// Unsigned view of a numeric value. Negative `Int` values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// The neutral value of a given type, used for `default-of-type`
    /// literals and for unset member slots.
    pub fn default_of(ty: ValueType) -> Value {
        match ty {
            ValueType::Nil | ValueType::Any => Value::Nil,
            ValueType::Bool => Value::Bool(false),
            ValueType::Int => Value::Int(0),
            ValueType::Uint => Value::Uint(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::Str => Value::Str(String::new()),
            ValueType::Bin => Value::Bin(Vec::new()),
            ValueType::Seq => Value::Seq(Vec::new()),
            ValueType::Map => Value::Map(Vec::new()),
        }
    }
}
