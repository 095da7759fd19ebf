//! Op-list programs produced by the low-level emitter.
//!
//! A [`Program`] is a flat instruction sequence over a small operand-stack
//! machine, plus a constant pool. Programs are immutable once installed in
//! a container; the dispatch loop in [`run`] executes them against a wire
//! machine and an object reference.

use std::fmt;
use std::sync::Arc;

use crate::compile::ThisRef;
use crate::emitter::EmitterFlavor;
use crate::error::CodecError;
use crate::intrinsics::{pack_as, unpack_as, Machine};
use crate::target::{CollectionTraits, EnumDescriptor, Enumerator, Getter, MemberDescriptor, Setter};
use crate::value::{Value, ValueType};

/// Constant-pool entry.
pub enum ProgConst {
    Enum(Arc<EnumDescriptor>),
    Traits(Arc<CollectionTraits>),
    /// Resolved member accessor pair, baked in by field-based emission.
    Accessor(Getter, Setter),
}

impl fmt::Debug for ProgConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgConst::Enum(e) => write!(f, "enum {}", e.type_name),
            ProgConst::Traits(t) => write!(f, "traits<{}>", t.element_type),
            ProgConst::Accessor(..) => write!(f, "accessor"),
        }
    }
}

/// One instruction. Jump targets are absolute instruction indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push a clone of the bound object.
    PushThis,
    /// Return; the top of the operand stack, if any, is the result.
    Ret,
    /// Push a member read through the accessor pair at the constant index.
    LoadMemberField(u16),
    StoreMemberField(u16),
    /// Push a member read through the runtime member table.
    LoadMemberCtx(u16),
    StoreMemberCtx(u16),
    LoadLocal(u8),
    StoreLocal(u8),
    DecLocal(u8),
    /// Pop; jump when zero or false.
    JumpIfZero(u32),
    Jump(u32),
    /// Pop a value and write it to the wire as the given type.
    PackAs(ValueType),
    /// Pop an unsigned count and write an array header.
    PackArrayHeader,
    UnpackAs(ValueType),
    /// Read an array header and push its length.
    UnpackArrayHeader,
    /// Pop a collection and open a cursor over it.
    CursorBegin(u16),
    /// Advance the innermost cursor; push its element, or close it and jump.
    CursorNextOrJump(u32),
    /// Pop a collection and push its element count.
    PushCount(u16),
    /// Open a sequence accumulator.
    BeginSeq,
    /// Pop a value into the innermost accumulator.
    SeqPush,
    /// Close the innermost accumulator and push the assembled collection.
    EndSeq(u16),
    /// Pop an enum name and push its underlying value.
    EnumToUnderlying(u16),
    /// Pop a wire value (name or underlying) and push the validated name.
    EnumFromWire(u16),
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::PushThis => write!(f, "push_this"),
            Op::Ret => write!(f, "ret"),
            Op::LoadMemberField(c) => write!(f, "load_member.f  [{c}]"),
            Op::StoreMemberField(c) => write!(f, "store_member.f [{c}]"),
            Op::LoadMemberCtx(m) => write!(f, "load_member.c  #{m}"),
            Op::StoreMemberCtx(m) => write!(f, "store_member.c #{m}"),
            Op::LoadLocal(l) => write!(f, "load_local     %{l}"),
            Op::StoreLocal(l) => write!(f, "store_local    %{l}"),
            Op::DecLocal(l) => write!(f, "dec_local      %{l}"),
            Op::JumpIfZero(t) => write!(f, "jz             @{t}"),
            Op::Jump(t) => write!(f, "jmp            @{t}"),
            Op::PackAs(ty) => write!(f, "pack_as        {ty}"),
            Op::PackArrayHeader => write!(f, "pack_array_header"),
            Op::UnpackAs(ty) => write!(f, "unpack_as      {ty}"),
            Op::UnpackArrayHeader => write!(f, "unpack_array_header"),
            Op::CursorBegin(c) => write!(f, "cursor_begin   [{c}]"),
            Op::CursorNextOrJump(t) => write!(f, "cursor_next    @{t}"),
            Op::PushCount(c) => write!(f, "push_count     [{c}]"),
            Op::BeginSeq => write!(f, "begin_seq"),
            Op::SeqPush => write!(f, "seq_push"),
            Op::EndSeq(c) => write!(f, "end_seq        [{c}]"),
            Op::EnumToUnderlying(c) => write!(f, "enum_to_underlying [{c}]"),
            Op::EnumFromWire(c) => write!(f, "enum_from_wire [{c}]"),
        }
    }
}

/// A finished, immutable op-list program.
pub struct Program {
    pub name: String,
    pub flavor: EmitterFlavor,
    pub ops: Vec<Op>,
    pub consts: Vec<ProgConst>,
    pub n_locals: u8,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}, {} local(s)):", self.name, self.flavor, self.n_locals)?;
        for (i, op) in self.ops.iter().enumerate() {
            writeln!(f, "  @{i:<4} {op}")?;
        }
        for (i, c) in self.consts.iter().enumerate() {
            writeln!(f, "  [{i}] = {c:?}")?;
        }
        Ok(())
    }
}

fn err(msg: impl Into<String>) -> CodecError {
    CodecError::Message(msg.into())
}

fn is_zero(v: &Value) -> Result<bool, CodecError> {
    match v {
        Value::Bool(b) => Ok(!b),
        Value::Int(n) => Ok(*n == 0),
        Value::Uint(n) => Ok(*n == 0),
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Uint,
            found: other.type_of(),
        }),
    }
}

fn const_at(program: &Program, ix: u16) -> Result<&ProgConst, CodecError> {
    program
        .consts
        .get(ix as usize)
        .ok_or_else(|| err(format!("constant {ix} out of range in {}", program.name)))
}

fn traits_at(program: &Program, ix: u16) -> Result<&Arc<CollectionTraits>, CodecError> {
    match const_at(program, ix)? {
        ProgConst::Traits(t) => Ok(t),
        _ => Err(err(format!("constant {ix} is not collection traits"))),
    }
}

fn enum_at(program: &Program, ix: u16) -> Result<&Arc<EnumDescriptor>, CodecError> {
    match const_at(program, ix)? {
        ProgConst::Enum(e) => Ok(e),
        _ => Err(err(format!("constant {ix} is not an enum descriptor"))),
    }
}

fn accessor_at(program: &Program, ix: u16) -> Result<(&Getter, &Setter), CodecError> {
    match const_at(program, ix)? {
        ProgConst::Accessor(get, set) => Ok((get, set)),
        _ => Err(err(format!("constant {ix} is not an accessor"))),
    }
}

fn member_at<'m>(
    members: Option<&'m [MemberDescriptor]>,
    ix: u16,
) -> Result<&'m MemberDescriptor, CodecError> {
    members
        .ok_or_else(|| err("context-based program run without a member table"))?
        .get(ix as usize)
        .ok_or_else(|| err(format!("member {ix} out of range")))
}

/// Execute `program`. The member table is required by context-based
/// programs and ignored by field-based ones.
pub(crate) fn run(
    program: &Program,
    mut this: ThisRef<'_>,
    machine: &mut Machine<'_>,
    members: Option<&[MemberDescriptor]>,
) -> Result<Option<Value>, CodecError> {
    let mut stack: Vec<Value> = Vec::new();
    let mut locals: Vec<Value> = vec![Value::Nil; program.n_locals as usize];
    let mut cursors: Vec<Box<dyn Enumerator>> = Vec::new();
    let mut seqs: Vec<Vec<Value>> = Vec::new();
    let mut pc: usize = 0;

    loop {
        let op = *program
            .ops
            .get(pc)
            .ok_or_else(|| err(format!("fell off the end of {}", program.name)))?;
        pc += 1;
        match op {
            Op::PushThis => {
                let v = match &this {
                    ThisRef::Read(v) => (*v).clone(),
                    ThisRef::Write(v) => (**v).clone(),
                    ThisRef::None => return Err(err("no object bound")),
                };
                stack.push(v);
            }
            Op::Ret => return Ok(stack.pop()),
            Op::LoadMemberField(c) => {
                let (get, _) = accessor_at(program, c)?;
                let obj = match &this {
                    ThisRef::Read(v) => *v,
                    ThisRef::Write(v) => &**v,
                    ThisRef::None => return Err(err("no object bound")),
                };
                stack.push(get(obj)?);
            }
            Op::StoreMemberField(c) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let (_, set) = accessor_at(program, c)?;
                match &mut this {
                    ThisRef::Write(obj) => set(obj, v)?,
                    _ => return Err(err("object is not writable")),
                }
            }
            Op::LoadMemberCtx(m) => {
                let get = member_at(members, m)?.get.clone();
                let obj = match &this {
                    ThisRef::Read(v) => *v,
                    ThisRef::Write(v) => &**v,
                    ThisRef::None => return Err(err("no object bound")),
                };
                stack.push(get(obj)?);
            }
            Op::StoreMemberCtx(m) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let set = member_at(members, m)?.set.clone();
                match &mut this {
                    ThisRef::Write(obj) => set(obj, v)?,
                    _ => return Err(err("object is not writable")),
                }
            }
            Op::LoadLocal(l) => {
                let v = locals
                    .get(l as usize)
                    .cloned()
                    .ok_or_else(|| err(format!("local %{l} out of range")))?;
                stack.push(v);
            }
            Op::StoreLocal(l) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                *locals
                    .get_mut(l as usize)
                    .ok_or_else(|| err(format!("local %{l} out of range")))? = v;
            }
            Op::DecLocal(l) => {
                match locals.get_mut(l as usize) {
                    Some(Value::Uint(n)) if *n > 0 => *n -= 1,
                    Some(Value::Int(n)) => *n -= 1,
                    _ => return Err(err(format!("local %{l} is not a positive integer"))),
                }
            }
            Op::JumpIfZero(t) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                if is_zero(&v)? {
                    pc = t as usize;
                }
            }
            Op::Jump(t) => pc = t as usize,
            Op::PackAs(ty) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                pack_as(machine.encoder()?, &v, ty)?;
            }
            Op::PackArrayHeader => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let n = v.as_u64().ok_or(CodecError::NumberOutOfRange)?;
                if n > u32::MAX as u64 {
                    return Err(CodecError::NumberOutOfRange);
                }
                machine.encoder()?.write_array_header(n as u32)?;
            }
            Op::UnpackAs(ty) => {
                let v = unpack_as(machine.decoder()?, ty)?;
                stack.push(v);
            }
            Op::UnpackArrayHeader => {
                let n = machine.decoder()?.read_array_header()?;
                stack.push(Value::Uint(n as u64));
            }
            Op::CursorBegin(c) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let cursor = (traits_at(program, c)?.acquire)(&v)?;
                cursors.push(cursor);
            }
            Op::CursorNextOrJump(t) => {
                let cursor = cursors
                    .last_mut()
                    .ok_or_else(|| err("no open cursor"))?;
                if cursor.move_next() {
                    stack.push(cursor.current());
                } else {
                    cursors.pop();
                    pc = t as usize;
                }
            }
            Op::PushCount(c) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let n = (traits_at(program, c)?.count)(&v)?;
                stack.push(Value::Uint(n as u64));
            }
            Op::BeginSeq => seqs.push(Vec::new()),
            Op::SeqPush => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                seqs.last_mut()
                    .ok_or_else(|| err("no open sequence accumulator"))?
                    .push(v);
            }
            Op::EndSeq(c) => {
                let items = seqs
                    .pop()
                    .ok_or_else(|| err("no open sequence accumulator"))?;
                stack.push((traits_at(program, c)?.assemble)(items));
            }
            Op::EnumToUnderlying(c) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let name = v.as_str().ok_or_else(|| CodecError::TypeMismatch {
                    expected: ValueType::Str,
                    found: v.type_of(),
                })?;
                stack.push(Value::Int(enum_at(program, c)?.value_of(name)?));
            }
            Op::EnumFromWire(c) => {
                let v = stack.pop().ok_or_else(|| err("stack underflow"))?;
                let desc = enum_at(program, c)?;
                let name = match &v {
                    Value::Str(name) => {
                        desc.value_of(name)?;
                        name.clone()
                    }
                    Value::Int(n) => desc.name_of(*n)?.to_owned(),
                    Value::Uint(n) if *n <= i64::MAX as u64 => {
                        desc.name_of(*n as i64)?.to_owned()
                    }
                    other => {
                        return Err(CodecError::TypeMismatch {
                            expected: ValueType::Str,
                            found: other.type_of(),
                        })
                    }
                };
                stack.push(Value::Str(name));
            }
        }
    }
}
