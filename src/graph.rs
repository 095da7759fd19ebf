//! Typed expression-graph IR.
//!
//! Nodes live in a per-context [`Arena`] and reference each other through
//! typed [`Id`]s. Every node carries its static [`ExprType`]; the builder
//! checks types at emission time and the closure compiler re-checks them
//! while lowering, so a type inconsistency can never survive into a
//! compiled operation.

use std::fmt;
use std::marker::PhantomData;

use crate::intrinsics::IntrinsicDef;
use crate::value::{Value, ValueType};

// ─── Arena and ID types ──────────────────────────────────────────────────────

/// Typed index into an [`Arena`]. Generic over the element type for type safety.
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

// Manual impls to avoid requiring T: Clone/Copy/Debug/PartialEq/Eq/Hash.
// The derived versions would propagate T's bounds, but Id<T> equality
// depends only on the index, not on T.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// The raw index into the arena.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Append-only arena of graph nodes.
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Id<T> {
        let id = Id::new(self.items.len() as u32);
        self.items.push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }
}

impl<T> std::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

// ─── Node types ──────────────────────────────────────────────────────────────

/// Static type of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprType {
    /// Statement position: produces nothing.
    Void,
    /// A runtime value of the given shape.
    Value(ValueType),
    /// A live collection enumerator.
    Cursor,
    /// A compiled method reference.
    Delegate,
    /// A metadata literal (type/method/field reference).
    Meta,
}

impl ExprType {
    /// Whether a slot declared as `self` can take a node typed `given`.
    /// `Value(Any)` takes any value; everything else is exact.
    pub fn accepts(&self, given: &ExprType) -> bool {
        match (self, given) {
            (ExprType::Value(ValueType::Any), ExprType::Value(_)) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Void => write!(f, "void"),
            ExprType::Value(ty) => write!(f, "{ty}"),
            ExprType::Cursor => write!(f, "cursor"),
            ExprType::Delegate => write!(f, "delegate"),
            ExprType::Meta => write!(f, "meta"),
        }
    }
}

/// Reference to reflection metadata. Raw handles are the fast path; named
/// references survive dumps and keep persisted listings readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRef {
    Handle(u32),
    Named(String),
}

/// A resolved intrinsic call target together with its displayable identity.
#[derive(Clone)]
pub struct MethodRef {
    pub def: &'static IntrinsicDef,
    pub display: MetaRef,
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.def.name, self.display)
    }
}

/// Index of a declared local within its context.
pub type LocalId = usize;

/// A graph node paired with its static type.
#[derive(Debug, Clone)]
pub struct TypedNode {
    pub expr: ExprNode,
    pub ty: ExprType,
}

pub type NodeId = Id<TypedNode>;

/// Expression-graph node shapes.
#[derive(Debug, Clone)]
pub enum ExprNode {
    Const(Value),
    /// Typed nil literal.
    NilOf(ValueType),
    /// Zero value of a type.
    DefaultOf(ValueType),
    /// Enum member literal, resolved against a registered descriptor.
    EnumConst { desc: usize, member: String },
    /// The object being packed or constructed.
    This,
    Local(LocalId),
    Param(usize),
    GetMember { object: NodeId, member: usize },
    SetMember { object: NodeId, member: usize, value: NodeId },
    SetIndexed { map_local: LocalId, key: NodeId, value: NodeId },
    Block { locals: Vec<LocalId>, stmts: Vec<NodeId> },
    If { cond: NodeId, then_branch: NodeId, else_branch: Option<NodeId> },
    AndAlso { lhs: NodeId, rhs: NodeId },
    /// Infinite loop; exits only through `Break`.
    Loop { body: NodeId },
    Break,
    TryFinally { body: NodeId, finalizer: NodeId },
    Eq { lhs: NodeId, rhs: NodeId },
    Lt { lhs: NodeId, rhs: NodeId },
    Not(NodeId),
    Increment(LocalId),
    StoreLocal { local: LocalId, value: NodeId },
    AcquireCursor { collection: NodeId, traits: usize },
    CursorMoveNext(LocalId),
    CursorCurrent(LocalId),
    CollectionCount { collection: NodeId, traits: usize },
    SeqAppend { seq: LocalId, value: NodeId },
    AssembleCollection { seq: LocalId, traits: usize },
    CallIntrinsic { method: MethodRef, args: Vec<NodeId> },
    InvokeDelegate { delegate: NodeId, args: Vec<NodeId> },
    /// Build a target instance out of per-member values, in member order.
    Construct { members: Vec<NodeId> },
    NewArray { elem: ExprType, items: Vec<NodeId> },
    ArrayIndex { array: NodeId, index: NodeId },
    /// Reference to a private method or registered static delegate field,
    /// resolved to a compiled method at lowering time.
    LoadDelegate { name: String, meta: MetaRef },
    TypeOf(MetaRef),
    MethodOf(MetaRef),
    FieldOf(MetaRef),
}
