//! Wire-format collaborator boundary.
//!
//! The physical encoding of integers, headers and strings is not this
//! core's business: compiled operations talk to whatever `Encoder` /
//! `Decoder` pair the caller supplies. A reference MessagePack
//! implementation lives in [`crate::msgpack`].

use crate::error::CodecError;
use crate::value::Value;

/// Coarse classification of the next wire item, used to pick between the
/// ordered (array) and named (map) unpack paths without consuming input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Array,
    Map,
    Nil,
    Other,
}

/// Wire-format encode primitives.
pub trait Encoder {
    fn write_nil(&mut self) -> Result<(), CodecError>;
    fn write_bool(&mut self, v: bool) -> Result<(), CodecError>;
    fn write_int(&mut self, v: i64) -> Result<(), CodecError>;
    fn write_uint(&mut self, v: u64) -> Result<(), CodecError>;
    fn write_f32(&mut self, v: f32) -> Result<(), CodecError>;
    fn write_f64(&mut self, v: f64) -> Result<(), CodecError>;
    fn write_str(&mut self, v: &str) -> Result<(), CodecError>;
    fn write_bin(&mut self, v: &[u8]) -> Result<(), CodecError>;
    fn write_array_header(&mut self, len: u32) -> Result<(), CodecError>;
    fn write_map_header(&mut self, len: u32) -> Result<(), CodecError>;
}

/// Wire-format decode primitives.
pub trait Decoder {
    /// Classify the next item without consuming it.
    fn peek_kind(&mut self) -> Result<WireKind, CodecError>;
    /// Consume a nil if one is next; returns whether it did.
    fn try_read_nil(&mut self) -> Result<bool, CodecError>;
    fn read_bool(&mut self) -> Result<bool, CodecError>;
    fn read_int(&mut self) -> Result<i64, CodecError>;
    fn read_uint(&mut self) -> Result<u64, CodecError>;
    fn read_f32(&mut self) -> Result<f32, CodecError>;
    fn read_f64(&mut self) -> Result<f64, CodecError>;
    fn read_str(&mut self) -> Result<String, CodecError>;
    fn read_bin(&mut self) -> Result<Vec<u8>, CodecError>;
    fn read_array_header(&mut self) -> Result<u32, CodecError>;
    fn read_map_header(&mut self) -> Result<u32, CodecError>;
    /// Decode whatever comes next into a dynamic [`Value`]. Also used to
    /// skip unknown map entries.
    fn read_value(&mut self) -> Result<Value, CodecError>;
}
