//! Per-build code-generation context.
//!
//! One context accumulates everything a single serializer build produces:
//! graph nodes, locals, private methods, delegate fields and registered
//! metadata. It moves through three states, `Open` while emitting,
//! `Finished` once sealed, `Compiled` after the host compiler has run.
//! Emission against a sealed context is rejected, never silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::context::BuilderConfig;
use crate::error::BuildError;
use crate::graph::{Arena, ExprType, LocalId, NodeId, TypedNode};
use crate::target::{CollectionTraits, EnumDescriptor};

/// Lifecycle state of a [`GenContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Open,
    Finished,
    Compiled,
}

impl BuildState {
    fn name(self) -> &'static str {
        match self {
            BuildState::Open => "open",
            BuildState::Finished => "finished",
            BuildState::Compiled => "compiled",
        }
    }
}

/// A named local slot with its declared type.
#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub name: String,
    pub ty: ExprType,
}

/// A private method defined during the build, callable through delegates.
#[derive(Debug, Clone)]
pub struct PrivateMethod {
    pub params: Vec<ExprType>,
    pub ret: ExprType,
    pub body: NodeId,
}

pub struct GenContext {
    state: BuildState,
    pub(crate) nodes: Arena<TypedNode>,
    locals: Vec<LocalDecl>,
    locals_by_name: HashMap<String, LocalId>,
    /// Locals declared since the last block emission; the next
    /// sequential-statements emission adopts them as its block locals.
    pending_block_locals: Vec<LocalId>,
    params: Vec<ExprType>,
    private_methods: IndexMap<String, PrivateMethod>,
    delegate_fields: IndexSet<String>,
    traits_table: Vec<Arc<CollectionTraits>>,
    enums: Vec<Arc<EnumDescriptor>>,
    pub config: BuilderConfig,
}

impl GenContext {
    pub fn new(config: BuilderConfig) -> Self {
        GenContext {
            state: BuildState::Open,
            nodes: Arena::new(),
            locals: Vec::new(),
            locals_by_name: HashMap::new(),
            pending_block_locals: Vec::new(),
            params: Vec::new(),
            private_methods: IndexMap::new(),
            delegate_fields: IndexSet::new(),
            traits_table: Vec::new(),
            enums: Vec::new(),
            config,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), BuildError> {
        if self.state == BuildState::Open {
            Ok(())
        } else {
            Err(BuildError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    pub(crate) fn push_node(&mut self, node: TypedNode) -> Result<NodeId, BuildError> {
        self.ensure_open("emit")?;
        Ok(self.nodes.push(node))
    }

    pub fn node(&self, id: NodeId) -> &TypedNode {
        &self.nodes[id]
    }

    /// Declare a local, or return the existing slot when the name was
    /// declared before. The flag reports whether the slot is fresh; a fresh
    /// slot is adopted by the next block emission.
    pub fn declare_local(
        &mut self,
        name: &str,
        ty: ExprType,
    ) -> Result<(LocalId, bool), BuildError> {
        self.ensure_open("declare_local")?;
        if let Some(&existing) = self.locals_by_name.get(name) {
            if self.locals[existing].ty != ty {
                return Err(BuildError::Compilation(format!(
                    "local \"{name}\" redeclared as {ty}, was {}",
                    self.locals[existing].ty
                )));
            }
            return Ok((existing, false));
        }
        let id = self.locals.len();
        self.locals.push(LocalDecl {
            name: name.to_owned(),
            ty,
        });
        self.locals_by_name.insert(name.to_owned(), id);
        self.pending_block_locals.push(id);
        Ok((id, true))
    }

    pub fn local_ty(&self, local: LocalId) -> Result<ExprType, BuildError> {
        self.locals
            .get(local)
            .map(|decl| decl.ty)
            .ok_or_else(|| BuildError::Compilation(format!("unknown local slot {local}")))
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Take the locals declared since the last block, for attachment to the
    /// block being emitted.
    pub(crate) fn take_pending_block_locals(&mut self) -> Vec<LocalId> {
        std::mem::take(&mut self.pending_block_locals)
    }

    /// Remove a local from the pending set; the caller attaches it to a
    /// block of its own instead.
    pub(crate) fn claim_block_local(&mut self, local: LocalId) {
        self.pending_block_locals.retain(|&l| l != local);
    }

    pub fn set_params(&mut self, params: Vec<ExprType>) -> Result<(), BuildError> {
        self.ensure_open("set_params")?;
        self.params = params;
        Ok(())
    }

    pub fn param_ty(&self, index: usize) -> Result<ExprType, BuildError> {
        self.params
            .get(index)
            .copied()
            .ok_or_else(|| BuildError::Compilation(format!("unknown parameter {index}")))
    }

    pub fn define_private_method(
        &mut self,
        name: &str,
        params: Vec<ExprType>,
        ret: ExprType,
        body: NodeId,
    ) -> Result<(), BuildError> {
        self.ensure_open("define_private_method")?;
        if self.private_methods.contains_key(name) {
            return Err(BuildError::Compilation(format!(
                "private method \"{name}\" defined twice"
            )));
        }
        self.private_methods
            .insert(name.to_owned(), PrivateMethod { params, ret, body });
        Ok(())
    }

    pub fn private_method(&self, name: &str) -> Option<&PrivateMethod> {
        self.private_methods.get(name)
    }

    pub fn private_method_names(&self) -> impl Iterator<Item = &str> {
        self.private_methods.keys().map(String::as_str)
    }

    pub fn register_delegate_field(&mut self, name: &str) -> Result<(), BuildError> {
        self.ensure_open("register_delegate_field")?;
        self.delegate_fields.insert(name.to_owned());
        Ok(())
    }

    pub fn has_delegate_field(&self, name: &str) -> bool {
        self.delegate_fields.contains(name)
    }

    /// Registered delegate fields, in registration order. Each name must be
    /// backed by a private method of the same name by the time the context
    /// is compiled.
    pub fn delegate_field_names(&self) -> impl Iterator<Item = &str> {
        self.delegate_fields.iter().map(String::as_str)
    }

    pub fn register_traits(&mut self, traits: Arc<CollectionTraits>) -> usize {
        let ix = self.traits_table.len();
        self.traits_table.push(traits);
        ix
    }

    pub fn traits(&self, ix: usize) -> Result<&Arc<CollectionTraits>, BuildError> {
        self.traits_table
            .get(ix)
            .ok_or_else(|| BuildError::Compilation(format!("unknown traits slot {ix}")))
    }

    pub fn register_enum(&mut self, desc: Arc<EnumDescriptor>) -> usize {
        let ix = self.enums.len();
        self.enums.push(desc);
        ix
    }

    pub fn enum_desc(&self, ix: usize) -> Result<&Arc<EnumDescriptor>, BuildError> {
        self.enums
            .get(ix)
            .ok_or_else(|| BuildError::Compilation(format!("unknown enum slot {ix}")))
    }

    /// Seal the context. Valid exactly once, from `Open`.
    pub fn finish(&mut self) -> Result<(), BuildError> {
        self.ensure_open("finish")?;
        self.state = BuildState::Finished;
        Ok(())
    }

    pub(crate) fn mark_compiled(&mut self) {
        self.state = BuildState::Compiled;
    }
}
