//! Low-level serializer emission.
//!
//! An [`Emitter`] assembles op-list programs method by method and installs
//! them into its container. [`OpcodeBuilder`] is the backend built on top:
//! it emits one pack and one unpack program per member and wires them into
//! the same operation collections the expression-graph backend produces.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::builder::SerializerBuilder;
use crate::compile::ThisRef;
use crate::container::{CodeContainer, ContainerManager, ContainerMode};
use crate::context::BuilderConfig;
use crate::error::{BuildError, CodecError};
use crate::intrinsics::Machine;
use crate::program::{run, Op, ProgConst, Program};
use crate::serializer::{
    EnumPackFn, EnumUnpackFn, PackOp, Serializer, SerializerFactory, UnpackOp,
};
use crate::target::{EnumDescriptor, MemberDescriptor, PolymorphismSchema, SerializationTarget};
use crate::value::{Value, ValueType};

/// How emitted programs reach members of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterFlavor {
    /// Accessors are baked into each program's constant pool.
    FieldBased,
    /// Members are looked up in the runtime member table on each access.
    ContextBased,
}

impl fmt::Display for EmitterFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitterFlavor::FieldBased => write!(f, "field-based"),
            EmitterFlavor::ContextBased => write!(f, "context-based"),
        }
    }
}

/// Forward-referenceable jump target inside one method assembly.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

/// Assembles one program. Jumps may target labels that are bound later;
/// `finish` patches them and rejects any label left unbound.
pub struct MethodAssembler {
    name: String,
    flavor: EmitterFlavor,
    ops: Vec<Op>,
    consts: Vec<ProgConst>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    n_locals: u8,
}

impl MethodAssembler {
    fn new(name: String, flavor: EmitterFlavor) -> Self {
        MethodAssembler {
            name,
            flavor,
            ops: Vec::new(),
            consts: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            n_locals: 0,
        }
    }

    pub fn op(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn const_(&mut self, c: ProgConst) -> u16 {
        let ix = self.consts.len() as u16;
        self.consts.push(c);
        ix
    }

    /// Allocate a fresh local slot.
    pub fn local(&mut self) -> u8 {
        let l = self.n_locals;
        self.n_locals += 1;
        l
    }

    pub fn new_label(&mut self) -> Label {
        let l = Label(self.labels.len());
        self.labels.push(None);
        l
    }

    /// Bind `label` to the next instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.ops.len() as u32);
    }

    pub fn jump(&mut self, label: Label) {
        self.fixups.push((self.ops.len(), label));
        self.ops.push(Op::Jump(u32::MAX));
    }

    pub fn jump_if_zero(&mut self, label: Label) {
        self.fixups.push((self.ops.len(), label));
        self.ops.push(Op::JumpIfZero(u32::MAX));
    }

    pub fn cursor_next_or_jump(&mut self, label: Label) {
        self.fixups.push((self.ops.len(), label));
        self.ops.push(Op::CursorNextOrJump(u32::MAX));
    }

    pub fn finish(mut self) -> Result<Program, BuildError> {
        for (ix, label) in &self.fixups {
            let target = self.labels[label.0].ok_or_else(|| {
                BuildError::Compilation(format!("unbound label in {}", self.name))
            })?;
            self.ops[*ix] = match self.ops[*ix] {
                Op::Jump(_) => Op::Jump(target),
                Op::JumpIfZero(_) => Op::JumpIfZero(target),
                Op::CursorNextOrJump(_) => Op::CursorNextOrJump(target),
                other => {
                    return Err(BuildError::Compilation(format!(
                        "fixup over non-jump {other:?} in {}",
                        self.name
                    )))
                }
            };
        }
        Ok(Program {
            name: self.name,
            flavor: self.flavor,
            ops: self.ops,
            consts: self.consts,
            n_locals: self.n_locals,
        })
    }
}

/// Hands out method assemblers for one target and installs the results.
/// Carries the process-unique sequence number the manager assigned it.
pub struct Emitter {
    seq: u32,
    flavor: EmitterFlavor,
    container: Arc<CodeContainer>,
    target_name: String,
}

impl Emitter {
    pub(crate) fn new(
        seq: u32,
        flavor: EmitterFlavor,
        container: Arc<CodeContainer>,
        target_name: String,
    ) -> Self {
        Emitter {
            seq,
            flavor,
            container,
            target_name,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// The flavor actually in use, after any substitution by the manager.
    pub fn flavor(&self) -> EmitterFlavor {
        self.flavor
    }

    pub fn container(&self) -> &Arc<CodeContainer> {
        &self.container
    }

    pub fn method(&self, name: &str) -> MethodAssembler {
        MethodAssembler::new(
            format!("{}${}::{name}", self.target_name, self.seq),
            self.flavor,
        )
    }

    pub fn install(&self, asm: MethodAssembler) -> Result<Arc<Program>, BuildError> {
        let program = Arc::new(asm.finish()?);
        self.container.install(program.clone());
        Ok(program)
    }
}

/// The low-level backend: one op-list program per member and operation.
pub struct OpcodeBuilder {
    manager: Arc<ContainerManager>,
    mode: ContainerMode,
    flavor: EmitterFlavor,
    config: BuilderConfig,
}

impl OpcodeBuilder {
    pub fn new(manager: Arc<ContainerManager>, mode: ContainerMode, flavor: EmitterFlavor) -> Self {
        Self::with_config(manager, mode, flavor, BuilderConfig::default())
    }

    pub fn with_config(
        manager: Arc<ContainerManager>,
        mode: ContainerMode,
        flavor: EmitterFlavor,
        config: BuilderConfig,
    ) -> Self {
        OpcodeBuilder {
            manager,
            mode,
            flavor,
            config,
        }
    }

    fn member_load(&self, asm: &mut MethodAssembler, desc: &MemberDescriptor, member: usize) -> Op {
        match asm.flavor {
            EmitterFlavor::FieldBased => {
                let c = asm.const_(ProgConst::Accessor(desc.get.clone(), desc.set.clone()));
                Op::LoadMemberField(c)
            }
            EmitterFlavor::ContextBased => Op::LoadMemberCtx(member as u16),
        }
    }

    fn member_store(&self, asm: &mut MethodAssembler, desc: &MemberDescriptor, member: usize) -> Op {
        match asm.flavor {
            EmitterFlavor::FieldBased => {
                let c = asm.const_(ProgConst::Accessor(desc.get.clone(), desc.set.clone()));
                Op::StoreMemberField(c)
            }
            EmitterFlavor::ContextBased => Op::StoreMemberCtx(member as u16),
        }
    }

    fn assemble_pack(
        &self,
        emitter: &Emitter,
        desc: &MemberDescriptor,
        member: usize,
    ) -> Result<Arc<Program>, BuildError> {
        let mut asm = emitter.method(&format!("pack_{}", desc.name));
        let load = self.member_load(&mut asm, desc, member);
        match &desc.collection {
            Some(traits) => {
                let tc = asm.const_(ProgConst::Traits(traits.clone()));
                let elem = traits.element_type;
                asm.op(load);
                asm.op(Op::PushCount(tc));
                asm.op(Op::PackArrayHeader);
                asm.op(load);
                asm.op(Op::CursorBegin(tc));
                let top = asm.new_label();
                let done = asm.new_label();
                asm.bind(top);
                asm.cursor_next_or_jump(done);
                asm.op(Op::PackAs(elem));
                asm.jump(top);
                asm.bind(done);
                asm.op(Op::Ret);
            }
            None => {
                asm.op(load);
                asm.op(Op::PackAs(desc.value_type));
                asm.op(Op::Ret);
            }
        }
        emitter.install(asm)
    }

    fn assemble_unpack(
        &self,
        emitter: &Emitter,
        desc: &MemberDescriptor,
        member: usize,
    ) -> Result<Arc<Program>, BuildError> {
        let mut asm = emitter.method(&format!("unpack_{}", desc.name));
        let store = self.member_store(&mut asm, desc, member);
        match &desc.collection {
            Some(traits) => {
                let tc = asm.const_(ProgConst::Traits(traits.clone()));
                let elem = traits.element_type;
                let remaining = asm.local();
                asm.op(Op::UnpackArrayHeader);
                asm.op(Op::StoreLocal(remaining));
                asm.op(Op::BeginSeq);
                let top = asm.new_label();
                let done = asm.new_label();
                asm.bind(top);
                asm.op(Op::LoadLocal(remaining));
                asm.jump_if_zero(done);
                asm.op(Op::UnpackAs(elem));
                asm.op(Op::SeqPush);
                asm.op(Op::DecLocal(remaining));
                asm.jump(top);
                asm.bind(done);
                asm.op(Op::EndSeq(tc));
                asm.op(store);
                asm.op(Op::Ret);
            }
            None => {
                asm.op(Op::UnpackAs(desc.value_type));
                asm.op(store);
                asm.op(Op::Ret);
            }
        }
        emitter.install(asm)
    }
}

fn wrap_pack(program: Arc<Program>, table: Option<Arc<SerializationTarget>>) -> PackOp {
    Arc::new(move |enc, value| {
        let mut machine = Machine::Pack(enc);
        let members = table.as_ref().map(|t| t.members.as_slice());
        run(&program, ThisRef::Read(value), &mut machine, members).map(|_| ())
    })
}

fn wrap_unpack(program: Arc<Program>, table: Option<Arc<SerializationTarget>>) -> UnpackOp {
    Arc::new(move |dec, object| {
        let mut machine = Machine::Unpack(dec);
        let members = table.as_ref().map(|t| t.members.as_slice());
        run(&program, ThisRef::Write(object), &mut machine, members).map(|_| ())
    })
}

impl SerializerBuilder for OpcodeBuilder {
    fn build_serializer(
        &self,
        target: Arc<SerializationTarget>,
        schema: Option<Arc<PolymorphismSchema>>,
    ) -> Result<SerializerFactory, BuildError> {
        if let Some(self_pack) = target.self_pack.clone() {
            return Ok(Arc::new(move |_cx| {
                Serializer::self_described(self_pack.clone())
            }));
        }

        let container = self.manager.container(self.mode)?;
        let emitter = self
            .manager
            .emitter(&container, &target.type_name, self.flavor)?;
        let table = match emitter.flavor() {
            EmitterFlavor::FieldBased => None,
            EmitterFlavor::ContextBased => Some(target.clone()),
        };

        let mut pack_ordered = Vec::with_capacity(target.members.len());
        let mut unpack_ordered = Vec::with_capacity(target.members.len());
        for (i, desc) in target.members.iter().enumerate() {
            let pack = self.assemble_pack(&emitter, desc, i)?;
            let unpack = self.assemble_unpack(&emitter, desc, i)?;
            pack_ordered.push(wrap_pack(pack, table.clone()));
            unpack_ordered.push(wrap_unpack(unpack, table.clone()));
        }

        let member_names = target.member_names();
        let (pack_named, unpack_named) = if target.tuple_like {
            (None, None)
        } else {
            let pack_named: IndexMap<String, PackOp> = member_names
                .iter()
                .cloned()
                .zip(pack_ordered.iter().cloned())
                .collect();
            let unpack_named: IndexMap<String, UnpackOp> = member_names
                .iter()
                .cloned()
                .zip(unpack_ordered.iter().cloned())
                .collect();
            (Some(pack_named), Some(unpack_named))
        };
        let tuple_like = target.tuple_like;

        Ok(Arc::new(move |_cx| {
            Serializer::object(
                member_names.clone(),
                pack_ordered.clone(),
                pack_named.clone(),
                unpack_ordered.clone(),
                unpack_named.clone(),
                tuple_like,
                schema.clone(),
            )
        }))
    }

    fn build_enum_serializer(
        &self,
        desc: Arc<EnumDescriptor>,
    ) -> Result<SerializerFactory, BuildError> {
        let container = self.manager.container(self.mode)?;
        let emitter = self
            .manager
            .emitter(&container, &desc.type_name, self.flavor)?;

        let mut asm = emitter.method("pack_underlying");
        asm.op(Op::PushThis);
        asm.op(Op::PackAs(ValueType::Int));
        asm.op(Op::Ret);
        let pack_program = emitter.install(asm)?;

        let mut asm = emitter.method("unpack_underlying");
        let e = asm.const_(ProgConst::Enum(desc.clone()));
        asm.op(Op::PushThis);
        asm.op(Op::EnumFromWire(e));
        asm.op(Op::EnumToUnderlying(e));
        asm.op(Op::Ret);
        let unpack_program = emitter.install(asm)?;

        let pack_underlying: EnumPackFn = Arc::new(move |enc, v| {
            let value = Value::Int(v);
            let mut machine = Machine::Pack(enc);
            run(&pack_program, ThisRef::Read(&value), &mut machine, None).map(|_| ())
        });
        let unpack_underlying: EnumUnpackFn = Arc::new(move |wire| {
            let mut machine = Machine::Idle;
            match run(&unpack_program, ThisRef::Read(wire), &mut machine, None)? {
                Some(Value::Int(n)) => Ok(n),
                _ => Err(CodecError::NumberOutOfRange),
            }
        });

        let configured = self.config.enum_method;
        Ok(Arc::new(move |cx| {
            Serializer::enumeration(
                desc.clone(),
                cx.enum_method.unwrap_or(configured),
                pack_underlying.clone(),
                unpack_underlying.clone(),
            )
        }))
    }
}
