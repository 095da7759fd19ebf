//! Expression-graph serializer builder.
//!
//! The high-level backend: per-member pack/unpack routines are emitted as
//! typed graph nodes into a [`GenContext`], sealed, then handed to the host
//! compiler in [`crate::compile`]. No code container is involved, which is
//! what makes this the fallback when dynamic containers are unavailable.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::builder::SerializerBuilder;
use crate::compile::{Compiler, RtVal, ThisRef};
use crate::context::BuilderConfig;
use crate::error::BuildError;
use crate::gen_context::GenContext;
use crate::graph::{ExprNode, ExprType, LocalId, MetaRef, MethodRef, NodeId, TypedNode};
use crate::intrinsics::{self, pack_intrinsic_name, unpack_intrinsic_name, Machine};
use crate::serializer::{PackOp, Serializer, SerializerFactory, UnpackOp};
use crate::target::{EnumDescriptor, PolymorphismSchema, SerializationTarget};
use crate::value::{Value, ValueType};

const INT: ExprType = ExprType::Value(ValueType::Int);
const ANY: ExprType = ExprType::Value(ValueType::Any);

pub struct GraphBuilder {
    config: BuilderConfig,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

impl GraphBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        GraphBuilder { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    fn meta(&self, name: &str) -> MetaRef {
        if self.config.dump_metadata {
            MetaRef::Named(name.to_owned())
        } else {
            // Stable small handle; only ever displayed.
            let mut h: u32 = 2166136261;
            for b in name.bytes() {
                h = (h ^ b as u32).wrapping_mul(16777619);
            }
            MetaRef::Handle(h)
        }
    }

    fn push(
        &self,
        ctx: &mut GenContext,
        expr: ExprNode,
        ty: ExprType,
    ) -> Result<NodeId, BuildError> {
        ctx.push_node(TypedNode { expr, ty })
    }

    // ─── Emit surface ─────────────────────────────────────────────────────

    pub fn emit_constant(&self, ctx: &mut GenContext, v: Value) -> Result<NodeId, BuildError> {
        let ty = ExprType::Value(v.type_of());
        self.push(ctx, ExprNode::Const(v), ty)
    }

    pub fn emit_nil(&self, ctx: &mut GenContext, ty: ValueType) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::NilOf(ty), ExprType::Value(ty))
    }

    pub fn emit_default_of(
        &self,
        ctx: &mut GenContext,
        ty: ValueType,
    ) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::DefaultOf(ty), ExprType::Value(ty))
    }

    pub fn emit_enum_constant(
        &self,
        ctx: &mut GenContext,
        desc: usize,
        member: &str,
    ) -> Result<NodeId, BuildError> {
        let descriptor = ctx.enum_desc(desc)?;
        if descriptor.value_of(member).is_err() {
            return Err(BuildError::UnresolvedMember {
                name: format!("{}::{member}", descriptor.type_name),
            });
        }
        self.push(
            ctx,
            ExprNode::EnumConst {
                desc,
                member: member.to_owned(),
            },
            ExprType::Value(ValueType::Str),
        )
    }

    pub fn emit_this(&self, ctx: &mut GenContext) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::This, ANY)
    }

    pub fn emit_local(&self, ctx: &mut GenContext, local: LocalId) -> Result<NodeId, BuildError> {
        let ty = ctx.local_ty(local)?;
        if !matches!(ty, ExprType::Value(_)) {
            return Err(BuildError::Compilation(format!(
                "local {local} is {ty}, only value locals can be read directly"
            )));
        }
        self.push(ctx, ExprNode::Local(local), ty)
    }

    pub fn emit_param(&self, ctx: &mut GenContext, index: usize) -> Result<NodeId, BuildError> {
        let ty = ctx.param_ty(index)?;
        self.push(ctx, ExprNode::Param(index), ty)
    }

    pub fn emit_get_member(
        &self,
        ctx: &mut GenContext,
        object: NodeId,
        member: usize,
        ty: ValueType,
    ) -> Result<NodeId, BuildError> {
        self.require_value(ctx, object, "member access object")?;
        self.push(
            ctx,
            ExprNode::GetMember { object, member },
            ExprType::Value(ty),
        )
    }

    pub fn emit_set_member(
        &self,
        ctx: &mut GenContext,
        object: NodeId,
        member: usize,
        value: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_value(ctx, object, "member store object")?;
        self.require_value(ctx, value, "member store value")?;
        self.push(
            ctx,
            ExprNode::SetMember {
                object,
                member,
                value,
            },
            ExprType::Void,
        )
    }

    pub fn emit_set_indexed(
        &self,
        ctx: &mut GenContext,
        map_local: LocalId,
        key: NodeId,
        value: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_value(ctx, key, "map key")?;
        self.require_value(ctx, value, "map value")?;
        self.push(
            ctx,
            ExprNode::SetIndexed {
                map_local,
                key,
                value,
            },
            ExprType::Void,
        )
    }

    /// Emit a block. `stmts` entries that are `None` are dropped, so callers
    /// can emit optional steps without branching at the call site. Locals
    /// declared since the previous block emission are adopted by this one.
    pub fn emit_sequential_statements(
        &self,
        ctx: &mut GenContext,
        result_type: ExprType,
        stmts: Vec<Option<NodeId>>,
    ) -> Result<NodeId, BuildError> {
        let stmts: Vec<NodeId> = stmts.into_iter().flatten().collect();
        if result_type != ExprType::Void {
            match stmts.last() {
                Some(&last) => {
                    let got = ctx.node(last).ty;
                    if !result_type.accepts(&got) {
                        return Err(BuildError::Compilation(format!(
                            "block result is {got}, declared {result_type}"
                        )));
                    }
                }
                None => {
                    return Err(BuildError::Compilation(
                        "empty block cannot produce a value".to_owned(),
                    ))
                }
            }
        }
        let locals = ctx.take_pending_block_locals();
        self.push(ctx, ExprNode::Block { locals, stmts }, result_type)
    }

    fn block(
        &self,
        ctx: &mut GenContext,
        locals: Vec<LocalId>,
        stmts: Vec<NodeId>,
        ty: ExprType,
    ) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::Block { locals, stmts }, ty)
    }

    pub fn emit_conditional(
        &self,
        ctx: &mut GenContext,
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    ) -> Result<NodeId, BuildError> {
        self.require_bool(ctx, cond, "condition")?;
        let ty = match else_branch {
            Some(e) if ctx.node(e).ty == ctx.node(then_branch).ty => ctx.node(then_branch).ty,
            _ => ExprType::Void,
        };
        self.push(
            ctx,
            ExprNode::If {
                cond,
                then_branch,
                else_branch,
            },
            ty,
        )
    }

    pub fn emit_and_also(
        &self,
        ctx: &mut GenContext,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_bool(ctx, lhs, "short-circuit operand")?;
        self.require_bool(ctx, rhs, "short-circuit operand")?;
        self.push(
            ctx,
            ExprNode::AndAlso { lhs, rhs },
            ExprType::Value(ValueType::Bool),
        )
    }

    pub fn emit_try_finally(
        &self,
        ctx: &mut GenContext,
        body: NodeId,
        finalizer: NodeId,
    ) -> Result<NodeId, BuildError> {
        let ty = ctx.node(body).ty;
        self.push(ctx, ExprNode::TryFinally { body, finalizer }, ty)
    }

    pub fn emit_equal(
        &self,
        ctx: &mut GenContext,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_value(ctx, lhs, "comparison operand")?;
        self.require_value(ctx, rhs, "comparison operand")?;
        self.push(
            ctx,
            ExprNode::Eq { lhs, rhs },
            ExprType::Value(ValueType::Bool),
        )
    }

    pub fn emit_less(
        &self,
        ctx: &mut GenContext,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_int(ctx, lhs, "comparison operand")?;
        self.require_int(ctx, rhs, "comparison operand")?;
        self.push(
            ctx,
            ExprNode::Lt { lhs, rhs },
            ExprType::Value(ValueType::Bool),
        )
    }

    pub fn emit_not(&self, ctx: &mut GenContext, operand: NodeId) -> Result<NodeId, BuildError> {
        self.require_bool(ctx, operand, "negation operand")?;
        self.push(ctx, ExprNode::Not(operand), ExprType::Value(ValueType::Bool))
    }

    pub fn emit_increment(
        &self,
        ctx: &mut GenContext,
        local: LocalId,
    ) -> Result<NodeId, BuildError> {
        match ctx.local_ty(local)? {
            ExprType::Value(ValueType::Int) | ExprType::Value(ValueType::Uint) => {}
            other => {
                return Err(BuildError::Compilation(format!(
                    "cannot increment a {other} local"
                )))
            }
        }
        self.push(ctx, ExprNode::Increment(local), ExprType::Void)
    }

    pub fn emit_store_local(
        &self,
        ctx: &mut GenContext,
        local: LocalId,
        value: NodeId,
    ) -> Result<NodeId, BuildError> {
        let declared = ctx.local_ty(local)?;
        let given = ctx.node(value).ty;
        if !declared.accepts(&given) {
            return Err(BuildError::Compilation(format!(
                "cannot store {given} into a {declared} local"
            )));
        }
        self.push(ctx, ExprNode::StoreLocal { local, value }, ExprType::Void)
    }

    /// Emit iteration over a collection: acquire a cursor, then run `body`
    /// once per element with the current element bound. Lowered to a loop
    /// that advances the cursor and breaks when it is exhausted.
    pub fn emit_for_each<F>(
        &self,
        ctx: &mut GenContext,
        traits: usize,
        collection: NodeId,
        body: F,
    ) -> Result<NodeId, BuildError>
    where
        F: FnOnce(&Self, &mut GenContext, NodeId) -> Result<NodeId, BuildError>,
    {
        self.require_value(ctx, collection, "collection")?;
        let element_type = ctx.traits(traits)?.element_type;
        let cursor_name = format!("cursor{}", ctx.local_count());
        let (cursor, _) = ctx.declare_local(&cursor_name, ExprType::Cursor)?;
        let acquire = self.push(
            ctx,
            ExprNode::AcquireCursor { collection, traits },
            ExprType::Cursor,
        )?;
        let store = self.push(
            ctx,
            ExprNode::StoreLocal {
                local: cursor,
                value: acquire,
            },
            ExprType::Void,
        )?;
        let advance = self.push(
            ctx,
            ExprNode::CursorMoveNext(cursor),
            ExprType::Value(ValueType::Bool),
        )?;
        let current = self.push(
            ctx,
            ExprNode::CursorCurrent(cursor),
            ExprType::Value(element_type),
        )?;
        let step = body(self, ctx, current)?;
        let brk = self.push(ctx, ExprNode::Break, ExprType::Void)?;
        let arm = self.push(
            ctx,
            ExprNode::If {
                cond: advance,
                then_branch: step,
                else_branch: Some(brk),
            },
            ExprType::Void,
        )?;
        let looped = self.push(ctx, ExprNode::Loop { body: arm }, ExprType::Void)?;
        // The cursor belongs to this loop's block; an unrelated block emitted
        // later must not adopt it.
        ctx.claim_block_local(cursor);
        self.block(ctx, vec![cursor], vec![store, looped], ExprType::Void)
    }

    /// Emit an intrinsic call, resolved by name and argument types.
    pub fn emit_call(
        &self,
        ctx: &mut GenContext,
        name: &str,
        args: Vec<NodeId>,
    ) -> Result<NodeId, BuildError> {
        let arg_types: Vec<ExprType> = args.iter().map(|&a| ctx.node(a).ty).collect();
        let def = intrinsics::resolve(name, Some(&arg_types))?;
        let method = MethodRef {
            def,
            display: self.meta(name),
        };
        let ty = def.ret;
        self.push(ctx, ExprNode::CallIntrinsic { method, args }, ty)
    }

    /// Emit a method metadata literal, resolved by name alone. Overloaded
    /// names cannot be resolved this way.
    pub fn emit_method_of(&self, ctx: &mut GenContext, name: &str) -> Result<NodeId, BuildError> {
        intrinsics::resolve(name, None)?;
        self.push(ctx, ExprNode::MethodOf(self.meta(name)), ExprType::Meta)
    }

    pub fn emit_type_of(&self, ctx: &mut GenContext, name: &str) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::TypeOf(self.meta(name)), ExprType::Meta)
    }

    pub fn emit_field_of(&self, ctx: &mut GenContext, name: &str) -> Result<NodeId, BuildError> {
        self.push(ctx, ExprNode::FieldOf(self.meta(name)), ExprType::Meta)
    }

    pub fn emit_new_array(
        &self,
        ctx: &mut GenContext,
        elem: ExprType,
        items: Vec<NodeId>,
    ) -> Result<NodeId, BuildError> {
        for &item in &items {
            let got = ctx.node(item).ty;
            if !elem.accepts(&got) {
                return Err(BuildError::Compilation(format!(
                    "array element is {got}, declared {elem}"
                )));
            }
        }
        self.push(
            ctx,
            ExprNode::NewArray { elem, items },
            ExprType::Value(ValueType::Seq),
        )
    }

    pub fn emit_array_index(
        &self,
        ctx: &mut GenContext,
        array: NodeId,
        index: NodeId,
    ) -> Result<NodeId, BuildError> {
        self.require_value(ctx, array, "indexing target")?;
        self.require_int(ctx, index, "array index")?;
        self.push(ctx, ExprNode::ArrayIndex { array, index }, ANY)
    }

    pub fn emit_construct(
        &self,
        ctx: &mut GenContext,
        members: Vec<NodeId>,
    ) -> Result<NodeId, BuildError> {
        for &m in &members {
            self.require_value(ctx, m, "constructor argument")?;
        }
        self.push(ctx, ExprNode::Construct { members }, ANY)
    }

    pub fn emit_invoke_delegate(
        &self,
        ctx: &mut GenContext,
        delegate: NodeId,
        args: Vec<NodeId>,
        ret: ExprType,
    ) -> Result<NodeId, BuildError> {
        if ctx.node(delegate).ty != ExprType::Delegate {
            return Err(BuildError::Compilation(
                "invocation target is not a delegate".to_owned(),
            ));
        }
        for &a in &args {
            self.require_value(ctx, a, "delegate argument")?;
        }
        self.push(ctx, ExprNode::InvokeDelegate { delegate, args }, ret)
    }

    /// Reference a previously defined private method as a delegate.
    pub fn emit_get_private_method_delegate(
        &self,
        ctx: &mut GenContext,
        name: &str,
    ) -> Result<NodeId, BuildError> {
        if ctx.private_method(name).is_none() {
            return Err(BuildError::UnresolvedMember {
                name: name.to_owned(),
            });
        }
        self.push(
            ctx,
            ExprNode::LoadDelegate {
                name: name.to_owned(),
                meta: self.meta(name),
            },
            ExprType::Delegate,
        )
    }

    /// Define a private method and reference it in one step.
    pub fn emit_new_private_method_delegate(
        &self,
        ctx: &mut GenContext,
        name: &str,
        params: Vec<ExprType>,
        ret: ExprType,
        body: NodeId,
    ) -> Result<NodeId, BuildError> {
        ctx.define_private_method(name, params, ret, body)?;
        self.emit_get_private_method_delegate(ctx, name)
    }

    /// Reference a static delegate field. The field must be backed by a
    /// private method of the same name by the time the context is compiled.
    pub fn emit_get_static_delegate(
        &self,
        ctx: &mut GenContext,
        name: &str,
    ) -> Result<NodeId, BuildError> {
        if !ctx.has_delegate_field(name) {
            ctx.register_delegate_field(name)?;
        }
        self.push(
            ctx,
            ExprNode::LoadDelegate {
                name: name.to_owned(),
                meta: self.meta(name),
            },
            ExprType::Delegate,
        )
    }

    fn require_value(
        &self,
        ctx: &GenContext,
        id: NodeId,
        what: &str,
    ) -> Result<(), BuildError> {
        match ctx.node(id).ty {
            ExprType::Value(_) => Ok(()),
            other => Err(BuildError::Compilation(format!(
                "{what} must be a value, found {other}"
            ))),
        }
    }

    fn require_bool(&self, ctx: &GenContext, id: NodeId, what: &str) -> Result<(), BuildError> {
        match ctx.node(id).ty {
            ExprType::Value(ValueType::Bool) => Ok(()),
            other => Err(BuildError::Compilation(format!(
                "{what} must be bool, found {other}"
            ))),
        }
    }

    fn require_int(&self, ctx: &GenContext, id: NodeId, what: &str) -> Result<(), BuildError> {
        match ctx.node(id).ty {
            ExprType::Value(ValueType::Int)
            | ExprType::Value(ValueType::Uint)
            | ExprType::Value(ValueType::Any) => Ok(()),
            other => Err(BuildError::Compilation(format!(
                "{what} must be an integer, found {other}"
            ))),
        }
    }

    // ─── Per-member routine emission ──────────────────────────────────────

    fn emit_pack_method(
        &self,
        ctx: &mut GenContext,
        target: &SerializationTarget,
        member: usize,
        traits: Option<usize>,
    ) -> Result<(), BuildError> {
        let desc = &target.members[member];
        let name = format!("pack_{}", desc.name);
        let this = self.emit_this(ctx)?;
        let field = self.emit_get_member(ctx, this, member, desc.value_type)?;
        let body = match traits {
            Some(traits_ix) => {
                let element_type = ctx.traits(traits_ix)?.element_type;
                let count = self.push(
                    ctx,
                    ExprNode::CollectionCount {
                        collection: field,
                        traits: traits_ix,
                    },
                    ExprType::Value(ValueType::Uint),
                )?;
                let header = self.emit_call(ctx, "pack_array_header", vec![count])?;
                let each = self.emit_for_each(ctx, traits_ix, field, |gb, ctx, current| {
                    gb.emit_call(ctx, pack_intrinsic_name(element_type), vec![current])
                })?;
                self.block(ctx, vec![], vec![header, each], ExprType::Void)?
            }
            None => self.emit_call(ctx, pack_intrinsic_name(desc.value_type), vec![field])?,
        };
        ctx.define_private_method(&name, vec![], ExprType::Void, body)
    }

    fn emit_unpack_method(
        &self,
        ctx: &mut GenContext,
        target: &SerializationTarget,
        member: usize,
        traits: Option<usize>,
    ) -> Result<(), BuildError> {
        let desc = &target.members[member];
        let name = format!("unpack_{}", desc.name);
        let body = match traits {
            Some(traits_ix) => {
                let element_type = ctx.traits(traits_ix)?.element_type;
                let (len, _) =
                    ctx.declare_local(&format!("len_{}", desc.name), ExprType::Value(ValueType::Uint))?;
                let (i, _) =
                    ctx.declare_local(&format!("i_{}", desc.name), ExprType::Value(ValueType::Uint))?;
                let (acc, _) =
                    ctx.declare_local(&format!("acc_{}", desc.name), ExprType::Value(ValueType::Seq))?;
                ctx.claim_block_local(len);
                ctx.claim_block_local(i);
                ctx.claim_block_local(acc);

                let header = self.emit_call(ctx, "unpack_array_header", vec![])?;
                let store_len = self.push(
                    ctx,
                    ExprNode::StoreLocal {
                        local: len,
                        value: header,
                    },
                    ExprType::Void,
                )?;
                let zero = self.emit_constant(ctx, Value::Uint(0))?;
                let store_i = self.push(
                    ctx,
                    ExprNode::StoreLocal {
                        local: i,
                        value: zero,
                    },
                    ExprType::Void,
                )?;
                let empty = self.emit_constant(ctx, Value::Seq(Vec::new()))?;
                let store_acc = self.push(
                    ctx,
                    ExprNode::StoreLocal {
                        local: acc,
                        value: empty,
                    },
                    ExprType::Void,
                )?;

                let i_read = self.push(ctx, ExprNode::Local(i), ExprType::Value(ValueType::Uint))?;
                let len_read =
                    self.push(ctx, ExprNode::Local(len), ExprType::Value(ValueType::Uint))?;
                let cond = self.push(
                    ctx,
                    ExprNode::Lt {
                        lhs: i_read,
                        rhs: len_read,
                    },
                    ExprType::Value(ValueType::Bool),
                )?;
                let element = self.emit_call(ctx, unpack_intrinsic_name(element_type), vec![])?;
                let append = self.push(
                    ctx,
                    ExprNode::SeqAppend {
                        seq: acc,
                        value: element,
                    },
                    ExprType::Void,
                )?;
                let bump = self.push(ctx, ExprNode::Increment(i), ExprType::Void)?;
                let step = self.block(ctx, vec![], vec![append, bump], ExprType::Void)?;
                let brk = self.push(ctx, ExprNode::Break, ExprType::Void)?;
                let arm = self.push(
                    ctx,
                    ExprNode::If {
                        cond,
                        then_branch: step,
                        else_branch: Some(brk),
                    },
                    ExprType::Void,
                )?;
                let looped = self.push(ctx, ExprNode::Loop { body: arm }, ExprType::Void)?;

                let assembled = self.push(
                    ctx,
                    ExprNode::AssembleCollection {
                        seq: acc,
                        traits: traits_ix,
                    },
                    ExprType::Value(desc.value_type),
                )?;
                let this = self.emit_this(ctx)?;
                let store_member = self.emit_set_member(ctx, this, member, assembled)?;
                self.block(
                    ctx,
                    vec![len, i, acc],
                    vec![store_len, store_i, store_acc, looped, store_member],
                    ExprType::Void,
                )?
            }
            None => {
                let value = self.emit_call(ctx, unpack_intrinsic_name(desc.value_type), vec![])?;
                let this = self.emit_this(ctx)?;
                self.emit_set_member(ctx, this, member, value)?
            }
        };
        ctx.define_private_method(&name, vec![], ExprType::Void, body)
    }

    // ─── Terminal constructors ────────────────────────────────────────────

    /// Seal the context, compile the four operation collections and produce
    /// the serializer constructor for an object-shaped target.
    pub fn create_serializer_constructor(
        &self,
        mut ctx: GenContext,
        target: Arc<SerializationTarget>,
        schema: Option<Arc<PolymorphismSchema>>,
    ) -> Result<SerializerFactory, BuildError> {
        if let Some(self_pack) = target.self_pack.clone() {
            // Self-packing targets get empty operation collections and
            // defer entirely to their own routines.
            ctx.finish()?;
            ctx.mark_compiled();
            return Ok(Arc::new(move |_cx| {
                Serializer::self_described(self_pack.clone())
            }));
        }

        let mut traits_slots = Vec::with_capacity(target.members.len());
        for desc in &target.members {
            traits_slots.push(
                desc.collection
                    .as_ref()
                    .map(|traits| ctx.register_traits(traits.clone())),
            );
        }
        for member in 0..target.members.len() {
            self.emit_pack_method(&mut ctx, &target, member, traits_slots[member])?;
            self.emit_unpack_method(&mut ctx, &target, member, traits_slots[member])?;
        }

        let mut pack_refs = Vec::with_capacity(target.members.len());
        let mut unpack_refs = Vec::with_capacity(target.members.len());
        for desc in &target.members {
            pack_refs
                .push(self.emit_get_private_method_delegate(&mut ctx, &format!("pack_{}", desc.name))?);
            unpack_refs.push(
                self.emit_get_private_method_delegate(&mut ctx, &format!("unpack_{}", desc.name))?,
            );
        }
        let pack_ordered_root =
            self.emit_new_array(&mut ctx, ExprType::Delegate, pack_refs.clone())?;
        let unpack_ordered_root =
            self.emit_new_array(&mut ctx, ExprType::Delegate, unpack_refs.clone())?;
        let named_roots = if target.tuple_like {
            None
        } else {
            Some((
                self.emit_new_array(&mut ctx, ExprType::Delegate, pack_refs)?,
                self.emit_new_array(&mut ctx, ExprType::Delegate, unpack_refs)?,
            ))
        };

        ctx.finish()?;

        let mut compiler = Compiler::new(&ctx, Some(&target));
        // Every registered static delegate field must have a backing method;
        // compiling it here validates that and shares the result with any
        // reference compiled below.
        for name in ctx.delegate_field_names() {
            compiler.compile_private_method(name)?;
        }
        let pack_ordered = delegates_of(&mut compiler, pack_ordered_root)?;
        let unpack_ordered = delegates_of(&mut compiler, unpack_ordered_root)?;
        let named = match named_roots {
            Some((pack_root, unpack_root)) => Some((
                delegates_of(&mut compiler, pack_root)?,
                delegates_of(&mut compiler, unpack_root)?,
            )),
            None => None,
        };
        drop(compiler);
        ctx.mark_compiled();

        let member_names = target.member_names();
        let pack_ordered: Vec<PackOp> = pack_ordered.into_iter().map(wrap_pack).collect();
        let unpack_ordered: Vec<UnpackOp> = unpack_ordered.into_iter().map(wrap_unpack).collect();
        let named = named.map(|(packs, unpacks)| {
            let pack_named: IndexMap<String, PackOp> = member_names
                .iter()
                .cloned()
                .zip(packs.into_iter().map(wrap_pack))
                .collect();
            let unpack_named: IndexMap<String, UnpackOp> = member_names
                .iter()
                .cloned()
                .zip(unpacks.into_iter().map(wrap_unpack))
                .collect();
            (pack_named, unpack_named)
        });
        let (pack_named, unpack_named) = match named {
            Some((p, u)) => (Some(p), Some(u)),
            None => (None, None),
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

    /// Seal the context and produce the serializer constructor for an
    /// enum-shaped target. Default underlying-value routines are supplied
    /// when the context does not define its own.
    pub fn create_enum_serializer_constructor(
        &self,
        mut ctx: GenContext,
        desc: Arc<EnumDescriptor>,
    ) -> Result<SerializerFactory, BuildError> {
        if ctx.private_method("pack_underlying").is_none() {
            ctx.set_params(vec![INT])?;
            let arg = self.emit_param(&mut ctx, 0)?;
            let body = self.emit_call(&mut ctx, "pack_int", vec![arg])?;
            ctx.define_private_method("pack_underlying", vec![INT], ExprType::Void, body)?;
        }
        if ctx.private_method("unpack_underlying").is_none() {
            ctx.set_params(vec![ANY])?;
            let arg = self.emit_param(&mut ctx, 0)?;
            let body = self.emit_call(&mut ctx, "as_int", vec![arg])?;
            ctx.define_private_method("unpack_underlying", vec![ANY], INT, body)?;
        }
        let pack_root = self.emit_get_private_method_delegate(&mut ctx, "pack_underlying")?;
        let unpack_root = self.emit_get_private_method_delegate(&mut ctx, "unpack_underlying")?;

        ctx.finish()?;

        let mut compiler = Compiler::new(&ctx, None);
        for name in ctx.delegate_field_names() {
            compiler.compile_private_method(name)?;
        }
        let pack_method = delegate_of(&mut compiler, pack_root)?;
        let unpack_method = delegate_of(&mut compiler, unpack_root)?;
        drop(compiler);
        ctx.mark_compiled();

        let pack_underlying: crate::serializer::EnumPackFn = Arc::new(move |enc, v| {
            pack_method
                .run(ThisRef::None, Machine::Pack(enc), vec![Value::Int(v)])
                .map(|_| ())
        });
        let unpack_underlying: crate::serializer::EnumUnpackFn = Arc::new(move |wire| {
            match unpack_method.run(ThisRef::None, Machine::Idle, vec![wire.clone()])? {
                RtVal::Val(Value::Int(n)) => Ok(n),
                _ => Err(crate::error::CodecError::NumberOutOfRange),
            }
        });

        let configured = ctx.config.enum_method;
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

fn wrap_pack(method: Arc<crate::compile::CompiledMethod>) -> PackOp {
    Arc::new(move |enc, value| {
        method
            .run(ThisRef::Read(value), Machine::Pack(enc), vec![])
            .map(|_| ())
    })
}

fn wrap_unpack(method: Arc<crate::compile::CompiledMethod>) -> UnpackOp {
    Arc::new(move |dec, object| {
        method
            .run(ThisRef::Write(object), Machine::Unpack(dec), vec![])
            .map(|_| ())
    })
}

fn delegate_of(
    compiler: &mut Compiler<'_>,
    root: NodeId,
) -> Result<Arc<crate::compile::CompiledMethod>, BuildError> {
    let method = compiler.compile_root(root)?;
    match method
        .run(ThisRef::None, Machine::Idle, vec![])
        .map_err(|e| BuildError::Compilation(format!("constructor evaluation failed: {e}")))?
    {
        RtVal::Delegate(m) => Ok(m),
        _ => Err(BuildError::Compilation(
            "constructor root did not evaluate to a delegate".to_owned(),
        )),
    }
}

fn delegates_of(
    compiler: &mut Compiler<'_>,
    root: NodeId,
) -> Result<Vec<Arc<crate::compile::CompiledMethod>>, BuildError> {
    let method = compiler.compile_root(root)?;
    match method
        .run(ThisRef::None, Machine::Idle, vec![])
        .map_err(|e| BuildError::Compilation(format!("constructor evaluation failed: {e}")))?
    {
        RtVal::Array(items) => items
            .into_iter()
            .map(|item| match item {
                RtVal::Delegate(m) => Ok(m),
                _ => Err(BuildError::Compilation(
                    "operation collection entry is not a delegate".to_owned(),
                )),
            })
            .collect(),
        _ => Err(BuildError::Compilation(
            "constructor root did not evaluate to an operation collection".to_owned(),
        )),
    }
}

impl SerializerBuilder for GraphBuilder {
    fn build_serializer(
        &self,
        target: Arc<SerializationTarget>,
        schema: Option<Arc<PolymorphismSchema>>,
    ) -> Result<SerializerFactory, BuildError> {
        let ctx = GenContext::new(self.config.clone());
        self.create_serializer_constructor(ctx, target, schema)
    }

    fn build_enum_serializer(
        &self,
        desc: Arc<EnumDescriptor>,
    ) -> Result<SerializerFactory, BuildError> {
        let ctx = GenContext::new(self.config.clone());
        self.create_enum_serializer_constructor(ctx, desc)
    }
}
