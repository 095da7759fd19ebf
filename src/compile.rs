//! Host compilation of finished expression graphs.
//!
//! Lowers each graph node to a closure over an execution [`Frame`], with
//! full type re-checking along the way. A type inconsistency in the graph
//! surfaces here as [`BuildError::Compilation`]; runtime failures inside a
//! compiled operation are [`CodecError`]s.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BuildError, CodecError};
use crate::gen_context::GenContext;
use crate::graph::{ExprNode, ExprType, MetaRef, NodeId};
use crate::intrinsics::Machine;
use crate::target::{Enumerator, SerializationTarget};
use crate::value::{Value, ValueType};

/// Runtime value inside the closure interpreter.
pub enum RtVal {
    Unit,
    Val(Value),
    Delegate(Arc<CompiledMethod>),
    Array(Vec<RtVal>),
    Cursor(Box<dyn Enumerator>),
}

/// Statement outcome: fall through with a value, or unwind to the nearest loop.
pub enum Flow {
    Next(RtVal),
    Break,
}

/// Storage for one local slot.
pub enum Slot {
    Empty,
    Val(Value),
    Cursor(Box<dyn Enumerator>),
}

/// How the current frame sees the object under (de)serialization.
pub enum ThisRef<'rt> {
    None,
    Read(&'rt Value),
    Write(&'rt mut Value),
}

/// Execution frame for one compiled method activation.
pub struct Frame<'rt> {
    this: ThisRef<'rt>,
    locals: Vec<Slot>,
    params: Vec<Value>,
    machine: Machine<'rt>,
}

type Thunk = Arc<dyn Fn(&mut Frame<'_>) -> Result<Flow, CodecError> + Send + Sync>;

/// A compiled method: a closure tree plus its frame layout.
pub struct CompiledMethod {
    arity: usize,
    n_locals: usize,
    thunk: Thunk,
}

impl CompiledMethod {
    /// Run this method in a fresh frame.
    pub fn run<'rt>(
        &self,
        this: ThisRef<'rt>,
        machine: Machine<'rt>,
        params: Vec<Value>,
    ) -> Result<RtVal, CodecError> {
        if params.len() != self.arity {
            return Err(CodecError::Message(format!(
                "delegate expected {} argument(s), got {}",
                self.arity,
                params.len()
            )));
        }
        let mut frame = Frame {
            this,
            locals: fresh_locals(self.n_locals),
            params,
            machine,
        };
        match (self.thunk)(&mut frame)? {
            Flow::Next(v) => Ok(v),
            Flow::Break => Err(CodecError::Message(
                "break escaped a method body".to_owned(),
            )),
        }
    }

    /// Run this method as a callee of `parent`, borrowing its wire machine
    /// and object reference for the duration of the call.
    fn invoke_in(&self, parent: &mut Frame<'_>, params: Vec<Value>) -> Result<RtVal, CodecError> {
        if params.len() != self.arity {
            return Err(CodecError::Message(format!(
                "delegate expected {} argument(s), got {}",
                self.arity,
                params.len()
            )));
        }
        let machine = std::mem::replace(&mut parent.machine, Machine::Idle);
        let this = std::mem::replace(&mut parent.this, ThisRef::None);
        let mut child = Frame {
            this,
            locals: fresh_locals(self.n_locals),
            params,
            machine,
        };
        let result = (self.thunk)(&mut child);
        parent.machine = child.machine;
        parent.this = child.this;
        match result? {
            Flow::Next(v) => Ok(v),
            Flow::Break => Err(CodecError::Message(
                "break escaped a method body".to_owned(),
            )),
        }
    }
}

fn fresh_locals(n: usize) -> Vec<Slot> {
    let mut locals = Vec::with_capacity(n);
    for _ in 0..n {
        locals.push(Slot::Empty);
    }
    locals
}

fn expect_val(rt: RtVal) -> Result<Value, CodecError> {
    match rt {
        RtVal::Val(v) => Ok(v),
        _ => Err(CodecError::Message(
            "expected a runtime value".to_owned(),
        )),
    }
}

fn as_i128(v: &Value) -> Result<i128, CodecError> {
    match v {
        Value::Int(n) => Ok(*n as i128),
        Value::Uint(n) => Ok(*n as i128),
        other => Err(CodecError::TypeMismatch {
            expected: ValueType::Int,
            found: other.type_of(),
        }),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_i128(a), as_i128(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn read_this<'a>(this: &'a ThisRef<'_>) -> Result<&'a Value, CodecError> {
    match this {
        ThisRef::Read(v) => Ok(v),
        ThisRef::Write(v) => Ok(v),
        ThisRef::None => Err(CodecError::Message(
            "no object bound to this operation".to_owned(),
        )),
    }
}

// Evaluate a statement, propagating loop unwinds to the enclosing lowering.
macro_rules! flow_val {
    ($e:expr) => {
        match $e {
            Flow::Break => return Ok(Flow::Break),
            Flow::Next(v) => v,
        }
    };
}

fn meta_value(meta: &MetaRef) -> Value {
    match meta {
        MetaRef::Handle(h) => Value::Uint(*h as u64),
        MetaRef::Named(s) => Value::Str(s.clone()),
    }
}

enum MethodSlot {
    InProgress,
    Done(Arc<CompiledMethod>),
}

/// One compilation session over a finished context. Private methods are
/// compiled on first reference and shared across every root compiled in the
/// same session.
pub(crate) struct Compiler<'a> {
    ctx: &'a GenContext,
    target: Option<&'a Arc<SerializationTarget>>,
    methods: HashMap<String, MethodSlot>,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(ctx: &'a GenContext, target: Option<&'a Arc<SerializationTarget>>) -> Self {
        Compiler {
            ctx,
            target,
            methods: HashMap::new(),
        }
    }

    pub(crate) fn compile_root(&mut self, root: NodeId) -> Result<Arc<CompiledMethod>, BuildError> {
        let thunk = self.compile_node(root)?;
        Ok(Arc::new(CompiledMethod {
            arity: 0,
            n_locals: self.ctx.local_count(),
            thunk,
        }))
    }

    pub(crate) fn compile_private_method(
        &mut self,
        name: &str,
    ) -> Result<Arc<CompiledMethod>, BuildError> {
        match self.methods.get(name) {
            Some(MethodSlot::Done(m)) => return Ok(m.clone()),
            Some(MethodSlot::InProgress) => {
                return Err(BuildError::Compilation(format!(
                    "private method \"{name}\" is recursive"
                )))
            }
            None => {}
        }
        let method = self
            .ctx
            .private_method(name)
            .ok_or_else(|| BuildError::UnresolvedMember {
                name: name.to_owned(),
            })?;
        let arity = method.params.len();
        let body = method.body;
        self.methods
            .insert(name.to_owned(), MethodSlot::InProgress);
        let thunk = self.compile_node(body)?;
        let compiled = Arc::new(CompiledMethod {
            arity,
            n_locals: self.ctx.local_count(),
            thunk,
        });
        self.methods
            .insert(name.to_owned(), MethodSlot::Done(compiled.clone()));
        Ok(compiled)
    }

    fn node_ty(&self, id: NodeId) -> ExprType {
        self.ctx.node(id).ty
    }

    fn require_bool(&self, id: NodeId, what: &str) -> Result<(), BuildError> {
        match self.node_ty(id) {
            ExprType::Value(ValueType::Bool) => Ok(()),
            other => Err(BuildError::Compilation(format!(
                "{what} must be bool, found {other}"
            ))),
        }
    }

    fn require_value(&self, id: NodeId, what: &str) -> Result<(), BuildError> {
        match self.node_ty(id) {
            ExprType::Value(_) => Ok(()),
            other => Err(BuildError::Compilation(format!(
                "{what} must be a value, found {other}"
            ))),
        }
    }

    fn target(&self) -> Result<&Arc<SerializationTarget>, BuildError> {
        self.target.ok_or_else(|| {
            BuildError::Compilation("member access without a bound target".to_owned())
        })
    }

    fn member_accessors(
        &self,
        member: usize,
    ) -> Result<(crate::target::Getter, crate::target::Setter), BuildError> {
        let target = self.target()?;
        let desc = target.members.get(member).ok_or_else(|| {
            BuildError::Compilation(format!("member index {member} out of range"))
        })?;
        Ok((desc.get.clone(), desc.set.clone()))
    }

    fn compile_args(&mut self, args: &[NodeId]) -> Result<Vec<Thunk>, BuildError> {
        args.iter().map(|&a| self.compile_node(a)).collect()
    }

    fn compile_node(&mut self, id: NodeId) -> Result<Thunk, BuildError> {
        let node = self.ctx.node(id).clone();
        match node.expr {
            ExprNode::Const(v) => Ok(Arc::new(move |_| Ok(Flow::Next(RtVal::Val(v.clone()))))),
            ExprNode::NilOf(_) => Ok(Arc::new(|_| Ok(Flow::Next(RtVal::Val(Value::Nil))))),
            ExprNode::DefaultOf(ty) => {
                Ok(Arc::new(move |_| Ok(Flow::Next(RtVal::Val(Value::default_of(ty))))))
            }
            ExprNode::EnumConst { desc, member } => {
                let descriptor = self.ctx.enum_desc(desc)?;
                if descriptor.value_of(&member).is_err() {
                    return Err(BuildError::UnresolvedMember {
                        name: format!("{}::{member}", descriptor.type_name),
                    });
                }
                Ok(Arc::new(move |_| {
                    Ok(Flow::Next(RtVal::Val(Value::Str(member.clone()))))
                }))
            }
            ExprNode::This => Ok(Arc::new(|frame| {
                Ok(Flow::Next(RtVal::Val(read_this(&frame.this)?.clone())))
            })),
            ExprNode::Local(local) => Ok(Arc::new(move |frame| {
                match frame.locals.get(local) {
                    Some(Slot::Val(v)) => Ok(Flow::Next(RtVal::Val(v.clone()))),
                    Some(Slot::Empty) => Err(CodecError::Message(format!(
                        "local {local} read before store"
                    ))),
                    Some(Slot::Cursor(_)) => Err(CodecError::Message(format!(
                        "local {local} holds a cursor, not a value"
                    ))),
                    None => Err(CodecError::Message(format!("unknown local {local}"))),
                }
            })),
            ExprNode::Param(ix) => Ok(Arc::new(move |frame| {
                frame
                    .params
                    .get(ix)
                    .cloned()
                    .map(|v| Flow::Next(RtVal::Val(v)))
                    .ok_or_else(|| CodecError::Message(format!("missing parameter {ix}")))
            })),
            ExprNode::GetMember { object, member } => {
                let (get, _) = self.member_accessors(member)?;
                if matches!(self.ctx.node(object).expr, ExprNode::This) {
                    // Read straight through the bound reference; the common
                    // pack path never clones the whole object.
                    Ok(Arc::new(move |frame| {
                        Ok(Flow::Next(RtVal::Val(get(read_this(&frame.this)?)?)))
                    }))
                } else {
                    self.require_value(object, "member access object")?;
                    let obj = self.compile_node(object)?;
                    Ok(Arc::new(move |frame| {
                        let v = expect_val(flow_val!(obj(frame)?))?;
                        Ok(Flow::Next(RtVal::Val(get(&v)?)))
                    }))
                }
            }
            ExprNode::SetMember {
                object,
                member,
                value,
            } => {
                if !matches!(self.ctx.node(object).expr, ExprNode::This) {
                    return Err(BuildError::Compilation(
                        "member stores are only valid on the object under construction"
                            .to_owned(),
                    ));
                }
                let (_, set) = self.member_accessors(member)?;
                self.require_value(value, "member store value")?;
                let value = self.compile_node(value)?;
                Ok(Arc::new(move |frame| {
                    let v = expect_val(flow_val!(value(frame)?))?;
                    match &mut frame.this {
                        ThisRef::Write(obj) => {
                            set(obj, v)?;
                            Ok(Flow::Next(RtVal::Unit))
                        }
                        _ => Err(CodecError::Message(
                            "object is not writable in this operation".to_owned(),
                        )),
                    }
                }))
            }
            ExprNode::SetIndexed {
                map_local,
                key,
                value,
            } => {
                self.require_value(key, "map key")?;
                self.require_value(value, "map value")?;
                let key = self.compile_node(key)?;
                let value = self.compile_node(value)?;
                Ok(Arc::new(move |frame| {
                    let k = expect_val(flow_val!(key(frame)?))?;
                    let v = expect_val(flow_val!(value(frame)?))?;
                    match frame.locals.get_mut(map_local) {
                        Some(Slot::Val(Value::Map(entries))) => {
                            match entries.iter_mut().find(|(ek, _)| values_equal(ek, &k)) {
                                Some(entry) => entry.1 = v,
                                None => entries.push((k, v)),
                            }
                            Ok(Flow::Next(RtVal::Unit))
                        }
                        _ => Err(CodecError::Message(format!(
                            "local {map_local} does not hold a map"
                        ))),
                    }
                }))
            }
            ExprNode::Block { locals, stmts } => {
                let stmts = self.compile_args(&stmts)?;
                Ok(Arc::new(move |frame| {
                    for &local in &locals {
                        if let Some(slot) = frame.locals.get_mut(local) {
                            *slot = Slot::Empty;
                        }
                    }
                    let mut last = RtVal::Unit;
                    for stmt in &stmts {
                        last = flow_val!(stmt(frame)?);
                    }
                    Ok(Flow::Next(last))
                }))
            }
            ExprNode::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.require_bool(cond, "condition")?;
                let cond = self.compile_node(cond)?;
                let then_branch = self.compile_node(then_branch)?;
                let else_branch = match else_branch {
                    Some(e) => Some(self.compile_node(e)?),
                    None => None,
                };
                Ok(Arc::new(move |frame| {
                    let c = expect_val(flow_val!(cond(frame)?))?;
                    match c {
                        Value::Bool(true) => then_branch(frame),
                        Value::Bool(false) => match &else_branch {
                            Some(e) => e(frame),
                            None => Ok(Flow::Next(RtVal::Unit)),
                        },
                        other => Err(CodecError::TypeMismatch {
                            expected: ValueType::Bool,
                            found: other.type_of(),
                        }),
                    }
                }))
            }
            ExprNode::AndAlso { lhs, rhs } => {
                self.require_bool(lhs, "short-circuit operand")?;
                self.require_bool(rhs, "short-circuit operand")?;
                let lhs = self.compile_node(lhs)?;
                let rhs = self.compile_node(rhs)?;
                Ok(Arc::new(move |frame| {
                    match expect_val(flow_val!(lhs(frame)?))? {
                        Value::Bool(false) => Ok(Flow::Next(RtVal::Val(Value::Bool(false)))),
                        Value::Bool(true) => rhs(frame),
                        other => Err(CodecError::TypeMismatch {
                            expected: ValueType::Bool,
                            found: other.type_of(),
                        }),
                    }
                }))
            }
            ExprNode::Loop { body } => {
                let body = self.compile_node(body)?;
                Ok(Arc::new(move |frame| loop {
                    match body(frame)? {
                        Flow::Break => return Ok(Flow::Next(RtVal::Unit)),
                        Flow::Next(_) => {}
                    }
                }))
            }
            ExprNode::Break => Ok(Arc::new(|_| Ok(Flow::Break))),
            ExprNode::TryFinally { body, finalizer } => {
                let body = self.compile_node(body)?;
                let finalizer = self.compile_node(finalizer)?;
                Ok(Arc::new(move |frame| {
                    let result = body(frame);
                    let cleanup = finalizer(frame);
                    match result {
                        Err(e) => Err(e),
                        Ok(flow) => {
                            cleanup?;
                            Ok(flow)
                        }
                    }
                }))
            }
            ExprNode::Eq { lhs, rhs } => {
                self.require_value(lhs, "comparison operand")?;
                self.require_value(rhs, "comparison operand")?;
                let lhs = self.compile_node(lhs)?;
                let rhs = self.compile_node(rhs)?;
                Ok(Arc::new(move |frame| {
                    let a = expect_val(flow_val!(lhs(frame)?))?;
                    let b = expect_val(flow_val!(rhs(frame)?))?;
                    Ok(Flow::Next(RtVal::Val(Value::Bool(values_equal(&a, &b)))))
                }))
            }
            ExprNode::Lt { lhs, rhs } => {
                self.require_value(lhs, "comparison operand")?;
                self.require_value(rhs, "comparison operand")?;
                let lhs = self.compile_node(lhs)?;
                let rhs = self.compile_node(rhs)?;
                Ok(Arc::new(move |frame| {
                    let a = expect_val(flow_val!(lhs(frame)?))?;
                    let b = expect_val(flow_val!(rhs(frame)?))?;
                    Ok(Flow::Next(RtVal::Val(Value::Bool(
                        as_i128(&a)? < as_i128(&b)?,
                    ))))
                }))
            }
            ExprNode::Not(operand) => {
                self.require_bool(operand, "negation operand")?;
                let operand = self.compile_node(operand)?;
                Ok(Arc::new(move |frame| {
                    match expect_val(flow_val!(operand(frame)?))? {
                        Value::Bool(b) => Ok(Flow::Next(RtVal::Val(Value::Bool(!b)))),
                        other => Err(CodecError::TypeMismatch {
                            expected: ValueType::Bool,
                            found: other.type_of(),
                        }),
                    }
                }))
            }
            ExprNode::Increment(local) => Ok(Arc::new(move |frame| {
                match frame.locals.get_mut(local) {
                    Some(Slot::Val(Value::Int(n))) => {
                        *n += 1;
                        Ok(Flow::Next(RtVal::Unit))
                    }
                    Some(Slot::Val(Value::Uint(n))) => {
                        *n += 1;
                        Ok(Flow::Next(RtVal::Unit))
                    }
                    _ => Err(CodecError::Message(format!(
                        "local {local} is not an integer"
                    ))),
                }
            })),
            ExprNode::StoreLocal { local, value } => {
                let declared = self.ctx.local_ty(local)?;
                let given = self.node_ty(value);
                if !declared.accepts(&given) && declared != ExprType::Cursor {
                    return Err(BuildError::Compilation(format!(
                        "cannot store {given} into a {declared} local"
                    )));
                }
                let value = self.compile_node(value)?;
                Ok(Arc::new(move |frame| {
                    let rt = flow_val!(value(frame)?);
                    let slot = match rt {
                        RtVal::Val(v) => Slot::Val(v),
                        RtVal::Cursor(c) => Slot::Cursor(c),
                        _ => {
                            return Err(CodecError::Message(
                                "only values and cursors can be stored in locals".to_owned(),
                            ))
                        }
                    };
                    match frame.locals.get_mut(local) {
                        Some(dest) => {
                            *dest = slot;
                            Ok(Flow::Next(RtVal::Unit))
                        }
                        None => Err(CodecError::Message(format!("unknown local {local}"))),
                    }
                }))
            }
            ExprNode::AcquireCursor { collection, traits } => {
                self.require_value(collection, "collection")?;
                let acquire = self.ctx.traits(traits)?.acquire.clone();
                let collection = self.compile_node(collection)?;
                Ok(Arc::new(move |frame| {
                    let v = expect_val(flow_val!(collection(frame)?))?;
                    Ok(Flow::Next(RtVal::Cursor(acquire(&v)?)))
                }))
            }
            ExprNode::CursorMoveNext(local) => Ok(Arc::new(move |frame| {
                match frame.locals.get_mut(local) {
                    Some(Slot::Cursor(cursor)) => Ok(Flow::Next(RtVal::Val(Value::Bool(
                        cursor.move_next(),
                    )))),
                    _ => Err(CodecError::Message(format!(
                        "local {local} does not hold a cursor"
                    ))),
                }
            })),
            ExprNode::CursorCurrent(local) => Ok(Arc::new(move |frame| {
                match frame.locals.get(local) {
                    Some(Slot::Cursor(cursor)) => Ok(Flow::Next(RtVal::Val(cursor.current()))),
                    _ => Err(CodecError::Message(format!(
                        "local {local} does not hold a cursor"
                    ))),
                }
            })),
            ExprNode::CollectionCount { collection, traits } => {
                self.require_value(collection, "collection")?;
                let count = self.ctx.traits(traits)?.count.clone();
                let collection = self.compile_node(collection)?;
                Ok(Arc::new(move |frame| {
                    let v = expect_val(flow_val!(collection(frame)?))?;
                    Ok(Flow::Next(RtVal::Val(Value::Uint(count(&v)? as u64))))
                }))
            }
            ExprNode::SeqAppend { seq, value } => {
                self.require_value(value, "appended element")?;
                let value = self.compile_node(value)?;
                Ok(Arc::new(move |frame| {
                    let v = expect_val(flow_val!(value(frame)?))?;
                    match frame.locals.get_mut(seq) {
                        Some(Slot::Val(Value::Seq(items))) => {
                            items.push(v);
                            Ok(Flow::Next(RtVal::Unit))
                        }
                        _ => Err(CodecError::Message(format!(
                            "local {seq} does not hold a sequence"
                        ))),
                    }
                }))
            }
            ExprNode::AssembleCollection { seq, traits } => {
                let assemble = self.ctx.traits(traits)?.assemble.clone();
                Ok(Arc::new(move |frame| {
                    match frame.locals.get_mut(seq) {
                        Some(Slot::Val(Value::Seq(items))) => {
                            let items = std::mem::take(items);
                            Ok(Flow::Next(RtVal::Val(assemble(items))))
                        }
                        _ => Err(CodecError::Message(format!(
                            "local {seq} does not hold a sequence"
                        ))),
                    }
                }))
            }
            ExprNode::CallIntrinsic { method, args } => {
                let def = method.def;
                if args.len() != def.args.len() {
                    return Err(BuildError::Compilation(format!(
                        "{} expects {} argument(s), got {}",
                        def.name,
                        def.args.len(),
                        args.len()
                    )));
                }
                for (&arg, want) in args.iter().zip(def.args) {
                    let got = self.node_ty(arg);
                    if !want.accepts(&got) {
                        return Err(BuildError::Compilation(format!(
                            "{} argument type mismatch: expected {want}, got {got}",
                            def.name
                        )));
                    }
                }
                let is_void = def.ret == ExprType::Void;
                let args = self.compile_args(&args)?;
                Ok(Arc::new(move |frame| {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in &args {
                        values.push(expect_val(flow_val!(arg(frame)?))?);
                    }
                    let out = (def.run)(&mut frame.machine, &values)?;
                    if is_void {
                        Ok(Flow::Next(RtVal::Unit))
                    } else {
                        Ok(Flow::Next(RtVal::Val(out)))
                    }
                }))
            }
            ExprNode::InvokeDelegate { delegate, args } => {
                if self.node_ty(delegate) != ExprType::Delegate {
                    return Err(BuildError::Compilation(
                        "invocation target is not a delegate".to_owned(),
                    ));
                }
                let delegate = self.compile_node(delegate)?;
                let args = self.compile_args(&args)?;
                Ok(Arc::new(move |frame| {
                    let callee = match flow_val!(delegate(frame)?) {
                        RtVal::Delegate(m) => m,
                        _ => {
                            return Err(CodecError::Message(
                                "invocation target is not a delegate".to_owned(),
                            ))
                        }
                    };
                    let mut values = Vec::with_capacity(args.len());
                    for arg in &args {
                        values.push(expect_val(flow_val!(arg(frame)?))?);
                    }
                    Ok(Flow::Next(callee.invoke_in(frame, values)?))
                }))
            }
            ExprNode::Construct { members } => {
                let (n_members, type_name) = {
                    let target = self.target()?;
                    (target.members.len(), target.type_name.clone())
                };
                if members.len() != n_members {
                    return Err(BuildError::Compilation(format!(
                        "{type_name} takes {n_members} member(s), got {}",
                        members.len()
                    )));
                }
                let members = self.compile_args(&members)?;
                Ok(Arc::new(move |frame| {
                    let mut fields = Vec::with_capacity(members.len());
                    for member in &members {
                        fields.push(expect_val(flow_val!(member(frame)?))?);
                    }
                    Ok(Flow::Next(RtVal::Val(Value::Seq(fields))))
                }))
            }
            ExprNode::NewArray { elem, items } => {
                for &item in &items {
                    let got = self.node_ty(item);
                    if !elem.accepts(&got) {
                        return Err(BuildError::Compilation(format!(
                            "array element type mismatch: expected {elem}, got {got}"
                        )));
                    }
                }
                let items = self.compile_args(&items)?;
                if elem == ExprType::Delegate {
                    Ok(Arc::new(move |frame| {
                        let mut out = Vec::with_capacity(items.len());
                        for item in &items {
                            out.push(flow_val!(item(frame)?));
                        }
                        Ok(Flow::Next(RtVal::Array(out)))
                    }))
                } else {
                    Ok(Arc::new(move |frame| {
                        let mut out = Vec::with_capacity(items.len());
                        for item in &items {
                            out.push(expect_val(flow_val!(item(frame)?))?);
                        }
                        Ok(Flow::Next(RtVal::Val(Value::Seq(out))))
                    }))
                }
            }
            ExprNode::ArrayIndex { array, index } => {
                self.require_value(index, "array index")?;
                let array = self.compile_node(array)?;
                let index = self.compile_node(index)?;
                Ok(Arc::new(move |frame| {
                    let ix = as_i128(&expect_val(flow_val!(index(frame)?))?)?;
                    if ix < 0 {
                        return Err(CodecError::NumberOutOfRange);
                    }
                    let ix = ix as usize;
                    match flow_val!(array(frame)?) {
                        RtVal::Array(items) => match items.into_iter().nth(ix) {
                            Some(item) => Ok(Flow::Next(item)),
                            None => Err(CodecError::NumberOutOfRange),
                        },
                        RtVal::Val(Value::Seq(items)) => match items.into_iter().nth(ix) {
                            Some(item) => Ok(Flow::Next(RtVal::Val(item))),
                            None => Err(CodecError::NumberOutOfRange),
                        },
                        _ => Err(CodecError::Message(
                            "indexing target is not an array".to_owned(),
                        )),
                    }
                }))
            }
            ExprNode::LoadDelegate { name, meta: _ } => {
                let compiled = self.compile_private_method(&name)?;
                Ok(Arc::new(move |_| {
                    Ok(Flow::Next(RtVal::Delegate(compiled.clone())))
                }))
            }
            ExprNode::TypeOf(meta) | ExprNode::MethodOf(meta) | ExprNode::FieldOf(meta) => {
                let v = meta_value(&meta);
                Ok(Arc::new(move |_| Ok(Flow::Next(RtVal::Val(v.clone())))))
            }
        }
    }
}
