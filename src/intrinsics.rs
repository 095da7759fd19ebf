//! Runtime primitives shared by both code-generation backends.
//!
//! Every compiled pack/unpack operation bottoms out here: a [`Machine`]
//! carries the live wire collaborator, [`pack_as`] / [`unpack_as`] do the
//! typed transfers, and the intrinsic [`REGISTRY`] is the method table the
//! expression-graph builder resolves calls against.

use crate::error::{BuildError, CodecError};
use crate::format::{Decoder, Encoder};
use crate::graph::ExprType;
use crate::value::{Value, ValueType};

/// The wire side a compiled operation is currently driving.
pub enum Machine<'rt> {
    Idle,
    Pack(&'rt mut dyn Encoder),
    Unpack(&'rt mut dyn Decoder),
}

impl<'rt> Machine<'rt> {
    pub fn encoder(&mut self) -> Result<&mut dyn Encoder, CodecError> {
        match self {
            Machine::Pack(enc) => Ok(&mut **enc),
            _ => Err(CodecError::Message(
                "pack intrinsic invoked outside a pack operation".to_owned(),
            )),
        }
    }

    pub fn decoder(&mut self) -> Result<&mut dyn Decoder, CodecError> {
        match self {
            Machine::Unpack(dec) => Ok(&mut **dec),
            _ => Err(CodecError::Message(
                "unpack intrinsic invoked outside an unpack operation".to_owned(),
            )),
        }
    }
}

/// Write `v` to the wire as `ty`. Integer values cross the signed/unsigned
/// line when they fit; everything else must match the declared type exactly.
pub fn pack_as(enc: &mut dyn Encoder, v: &Value, ty: ValueType) -> Result<(), CodecError> {
    let mismatch = || CodecError::TypeMismatch {
        expected: ty,
        found: v.type_of(),
    };
    match ty {
        ValueType::Nil => enc.write_nil(),
        ValueType::Bool => enc.write_bool(v.as_bool().ok_or_else(mismatch)?),
        ValueType::Int => match v {
            Value::Int(n) => enc.write_int(*n),
            Value::Uint(n) if *n <= i64::MAX as u64 => enc.write_int(*n as i64),
            _ => Err(mismatch()),
        },
        ValueType::Uint => match v {
            Value::Uint(n) => enc.write_uint(*n),
            Value::Int(n) if *n >= 0 => enc.write_uint(*n as u64),
            _ => Err(mismatch()),
        },
        ValueType::F32 => match v {
            Value::F32(x) => enc.write_f32(*x),
            _ => Err(mismatch()),
        },
        ValueType::F64 => match v {
            Value::F64(x) => enc.write_f64(*x),
            _ => Err(mismatch()),
        },
        ValueType::Str => enc.write_str(v.as_str().ok_or_else(mismatch)?),
        ValueType::Bin => match v {
            Value::Bin(bytes) => enc.write_bin(bytes),
            _ => Err(mismatch()),
        },
        ValueType::Seq => match v {
            Value::Seq(items) => {
                enc.write_array_header(items.len() as u32)?;
                for item in items {
                    pack_as(enc, item, ValueType::Any)?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        },
        ValueType::Map => match v {
            Value::Map(entries) => {
                enc.write_map_header(entries.len() as u32)?;
                for (k, val) in entries {
                    pack_as(enc, k, ValueType::Any)?;
                    pack_as(enc, val, ValueType::Any)?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        },
        ValueType::Any => match v {
            Value::Nil => enc.write_nil(),
            Value::Bool(_) => pack_as(enc, v, ValueType::Bool),
            Value::Int(_) => pack_as(enc, v, ValueType::Int),
            Value::Uint(_) => pack_as(enc, v, ValueType::Uint),
            Value::F32(_) => pack_as(enc, v, ValueType::F32),
            Value::F64(_) => pack_as(enc, v, ValueType::F64),
            Value::Str(_) => pack_as(enc, v, ValueType::Str),
            Value::Bin(_) => pack_as(enc, v, ValueType::Bin),
            Value::Seq(_) => pack_as(enc, v, ValueType::Seq),
            Value::Map(_) => pack_as(enc, v, ValueType::Map),
        },
    }
}

/// Read the next wire item as `ty`. A nil on the wire always decodes to
/// [`Value::Nil`], whatever type was expected.
pub fn unpack_as(dec: &mut dyn Decoder, ty: ValueType) -> Result<Value, CodecError> {
    if dec.try_read_nil()? {
        return Ok(Value::Nil);
    }
    match ty {
        ValueType::Nil => Err(CodecError::TypeMismatch {
            expected: ValueType::Nil,
            found: ValueType::Any,
        }),
        ValueType::Bool => Ok(Value::Bool(dec.read_bool()?)),
        ValueType::Int => Ok(Value::Int(dec.read_int()?)),
        ValueType::Uint => Ok(Value::Uint(dec.read_uint()?)),
        ValueType::F32 => Ok(Value::F32(dec.read_f32()?)),
        ValueType::F64 => Ok(Value::F64(dec.read_f64()?)),
        ValueType::Str => Ok(Value::Str(dec.read_str()?)),
        ValueType::Bin => Ok(Value::Bin(dec.read_bin()?)),
        ValueType::Seq => {
            let n = dec.read_array_header()?;
            // Headers are attacker-controlled; never trust them for sizing.
            let mut items = Vec::with_capacity((n as usize).min(64));
            for _ in 0..n {
                items.push(dec.read_value()?);
            }
            Ok(Value::Seq(items))
        }
        ValueType::Map => {
            let n = dec.read_map_header()?;
            let mut entries = Vec::with_capacity((n as usize).min(64));
            for _ in 0..n {
                let k = dec.read_value()?;
                let v = dec.read_value()?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        ValueType::Any => dec.read_value(),
    }
}

/// One entry in the intrinsic method table.
pub struct IntrinsicDef {
    pub name: &'static str,
    pub args: &'static [ExprType],
    pub ret: ExprType,
    pub run: fn(&mut Machine, &[Value]) -> Result<Value, CodecError>,
}

const VOID: ExprType = ExprType::Void;
const NIL: ExprType = ExprType::Value(ValueType::Nil);
const BOOL: ExprType = ExprType::Value(ValueType::Bool);
const INT: ExprType = ExprType::Value(ValueType::Int);
const UINT: ExprType = ExprType::Value(ValueType::Uint);
const F32: ExprType = ExprType::Value(ValueType::F32);
const F64: ExprType = ExprType::Value(ValueType::F64);
const STR: ExprType = ExprType::Value(ValueType::Str);
const BIN: ExprType = ExprType::Value(ValueType::Bin);
const ANY: ExprType = ExprType::Value(ValueType::Any);

fn run_pack(m: &mut Machine, args: &[Value], ty: ValueType) -> Result<Value, CodecError> {
    pack_as(m.encoder()?, &args[0], ty)?;
    Ok(Value::Nil)
}

fn run_unpack(m: &mut Machine, ty: ValueType) -> Result<Value, CodecError> {
    unpack_as(m.decoder()?, ty)
}

/// The intrinsic method table. `pack_int` deliberately carries two
/// overloads, one per integer signedness, so name-only resolution of it is
/// ambiguous and callers must supply argument types.
pub const REGISTRY: &[IntrinsicDef] = &[
    IntrinsicDef {
        name: "pack_nil",
        args: &[NIL],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Nil),
    },
    IntrinsicDef {
        name: "pack_bool",
        args: &[BOOL],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Bool),
    },
    IntrinsicDef {
        name: "pack_int",
        args: &[INT],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Int),
    },
    IntrinsicDef {
        name: "pack_int",
        args: &[UINT],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Uint),
    },
    IntrinsicDef {
        name: "pack_uint",
        args: &[UINT],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Uint),
    },
    IntrinsicDef {
        name: "pack_f32",
        args: &[F32],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::F32),
    },
    IntrinsicDef {
        name: "pack_f64",
        args: &[F64],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::F64),
    },
    IntrinsicDef {
        name: "pack_str",
        args: &[STR],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Str),
    },
    IntrinsicDef {
        name: "pack_bin",
        args: &[BIN],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Bin),
    },
    IntrinsicDef {
        name: "pack_value",
        args: &[ANY],
        ret: VOID,
        run: |m, args| run_pack(m, args, ValueType::Any),
    },
    IntrinsicDef {
        name: "pack_array_header",
        args: &[UINT],
        ret: VOID,
        run: |m, args| {
            let n = args[0].as_u64().ok_or(CodecError::NumberOutOfRange)?;
            if n > u32::MAX as u64 {
                return Err(CodecError::NumberOutOfRange);
            }
            m.encoder()?.write_array_header(n as u32)?;
            Ok(Value::Nil)
        },
    },
    IntrinsicDef {
        name: "pack_map_header",
        args: &[UINT],
        ret: VOID,
        run: |m, args| {
            let n = args[0].as_u64().ok_or(CodecError::NumberOutOfRange)?;
            if n > u32::MAX as u64 {
                return Err(CodecError::NumberOutOfRange);
            }
            m.encoder()?.write_map_header(n as u32)?;
            Ok(Value::Nil)
        },
    },
    IntrinsicDef {
        name: "unpack_bool",
        args: &[],
        ret: BOOL,
        run: |m, _| run_unpack(m, ValueType::Bool),
    },
    IntrinsicDef {
        name: "unpack_int",
        args: &[],
        ret: INT,
        run: |m, _| run_unpack(m, ValueType::Int),
    },
    IntrinsicDef {
        name: "unpack_uint",
        args: &[],
        ret: UINT,
        run: |m, _| run_unpack(m, ValueType::Uint),
    },
    IntrinsicDef {
        name: "unpack_f32",
        args: &[],
        ret: F32,
        run: |m, _| run_unpack(m, ValueType::F32),
    },
    IntrinsicDef {
        name: "unpack_f64",
        args: &[],
        ret: F64,
        run: |m, _| run_unpack(m, ValueType::F64),
    },
    IntrinsicDef {
        name: "unpack_str",
        args: &[],
        ret: STR,
        run: |m, _| run_unpack(m, ValueType::Str),
    },
    IntrinsicDef {
        name: "unpack_bin",
        args: &[],
        ret: BIN,
        run: |m, _| run_unpack(m, ValueType::Bin),
    },
    IntrinsicDef {
        name: "unpack_value",
        args: &[],
        ret: ANY,
        run: |m, _| run_unpack(m, ValueType::Any),
    },
    IntrinsicDef {
        name: "unpack_array_header",
        args: &[],
        ret: UINT,
        run: |m, _| Ok(Value::Uint(m.decoder()?.read_array_header()? as u64)),
    },
    IntrinsicDef {
        name: "unpack_map_header",
        args: &[],
        ret: UINT,
        run: |m, _| Ok(Value::Uint(m.decoder()?.read_map_header()? as u64)),
    },
    IntrinsicDef {
        name: "as_int",
        args: &[ANY],
        ret: INT,
        run: |_, args| match &args[0] {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Uint(n) if *n <= i64::MAX as u64 => Ok(Value::Int(*n as i64)),
            other => Err(CodecError::TypeMismatch {
                expected: ValueType::Int,
                found: other.type_of(),
            }),
        },
    },
];

/// Resolve an intrinsic by name, optionally narrowed by argument types.
/// Name-only resolution of an overloaded name is an [`BuildError::AmbiguousMember`].
pub fn resolve(
    name: &str,
    args: Option<&[ExprType]>,
) -> Result<&'static IntrinsicDef, BuildError> {
    let by_name: Vec<&'static IntrinsicDef> =
        REGISTRY.iter().filter(|def| def.name == name).collect();
    if by_name.is_empty() {
        return Err(BuildError::UnresolvedMember {
            name: name.to_owned(),
        });
    }
    let candidates: Vec<&'static IntrinsicDef> = match args {
        None => by_name,
        Some(given) => by_name
            .into_iter()
            .filter(|def| {
                def.args.len() == given.len()
                    && def.args.iter().zip(given).all(|(want, got)| want.accepts(got))
            })
            .collect(),
    };
    match candidates.len() {
        0 => Err(BuildError::UnresolvedMember {
            name: name.to_owned(),
        }),
        1 => Ok(candidates[0]),
        n => Err(BuildError::AmbiguousMember {
            name: name.to_owned(),
            candidates: n,
        }),
    }
}

/// Pack intrinsic handling a member declared as `ty`.
pub fn pack_intrinsic_name(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Nil => "pack_nil",
        ValueType::Bool => "pack_bool",
        ValueType::Int => "pack_int",
        ValueType::Uint => "pack_uint",
        ValueType::F32 => "pack_f32",
        ValueType::F64 => "pack_f64",
        ValueType::Str => "pack_str",
        ValueType::Bin => "pack_bin",
        ValueType::Seq | ValueType::Map | ValueType::Any => "pack_value",
    }
}

/// Unpack intrinsic producing a member declared as `ty`.
pub fn unpack_intrinsic_name(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Bool => "unpack_bool",
        ValueType::Int => "unpack_int",
        ValueType::Uint => "unpack_uint",
        ValueType::F32 => "unpack_f32",
        ValueType::F64 => "unpack_f64",
        ValueType::Str => "unpack_str",
        ValueType::Bin => "unpack_bin",
        ValueType::Nil | ValueType::Seq | ValueType::Map | ValueType::Any => "unpack_value",
    }
}
