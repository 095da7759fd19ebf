//! Dynamic code container management.
//!
//! Containers are append-only homes for emitted programs, one singleton per
//! mode. The manager hands out emitters with process-unique sequence
//! numbers and can drop its singletons so later builds start fresh;
//! programs already wired into live serializers keep working because the
//! serializers hold their own references.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use crate::emitter::{Emitter, EmitterFlavor};
use crate::error::BuildError;
use crate::program::Program;

/// Container generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    /// No debug support, cheapest to run.
    Fast,
    /// Carries debug symbols; its programs can be persisted for inspection.
    Debuggable,
    /// Reclaimable once every program in it is unreferenced.
    Collectable,
}

impl ContainerMode {
    fn slot(self) -> usize {
        match self {
            ContainerMode::Fast => 0,
            ContainerMode::Debuggable => 1,
            ContainerMode::Collectable => 2,
        }
    }
}

/// What the host environment permits.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub dynamic_containers: bool,
    pub field_emitters: bool,
    pub context_emitters: bool,
}

impl Capabilities {
    /// Everything is available in-process.
    pub fn host_default() -> Self {
        Capabilities {
            dynamic_containers: true,
            field_emitters: true,
            context_emitters: true,
        }
    }
}

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

/// An append-only home for emitted programs.
pub struct CodeContainer {
    name: String,
    mode: ContainerMode,
    debug_symbols: bool,
    programs: Mutex<Vec<Arc<Program>>>,
}

impl CodeContainer {
    fn new(mode: ContainerMode) -> Self {
        // Names are never reused, even across refreshes.
        let n = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
        CodeContainer {
            name: format!("packgen.GeneratedSerializers{n}"),
            mode,
            debug_symbols: mode == ContainerMode::Debuggable,
            programs: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ContainerMode {
        self.mode
    }

    pub fn has_debug_symbols(&self) -> bool {
        self.debug_symbols
    }

    pub fn program_count(&self) -> usize {
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn install(&self, program: Arc<Program>) {
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(program);
    }

    /// Write the listings of every installed program to `path`. Only
    /// debuggable containers carry enough symbol information for this.
    pub fn persist(&self, path: &Path) -> Result<(), BuildError> {
        if self.mode != ContainerMode::Debuggable {
            return Err(BuildError::InvalidState {
                operation: "persist",
                state: "non-debuggable container",
            });
        }
        let programs = self
            .programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut out = String::new();
        out.push_str(&format!("; {}\n", self.name));
        for program in &programs {
            out.push_str(&format!("\n{program}"));
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

/// Singleton containers plus the shared emitter sequence counter.
///
/// The counter lives here rather than on the containers so a refresh can
/// never reissue a number an earlier emitter already carries.
pub struct ContainerManager {
    caps: Capabilities,
    slots: RwLock<[Option<Arc<CodeContainer>>; 3]>,
    emitter_seq: AtomicU32,
}

impl ContainerManager {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::host_default())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        ContainerManager {
            caps,
            slots: RwLock::new([None, None, None]),
            emitter_seq: AtomicU32::new(0),
        }
    }

    /// The process-wide manager.
    pub fn global() -> &'static Arc<ContainerManager> {
        static GLOBAL: OnceLock<Arc<ContainerManager>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ContainerManager::new()))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// The singleton container for `mode`, created on first use.
    pub fn container(&self, mode: ContainerMode) -> Result<Arc<CodeContainer>, BuildError> {
        if !self.caps.dynamic_containers {
            return Err(BuildError::PlatformUnsupported("dynamic code containers"));
        }
        let slot = mode.slot();
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(container) = &slots[slot] {
                return Ok(container.clone());
            }
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        // Someone may have created it between the read and the write lock.
        if let Some(container) = &slots[slot] {
            return Ok(container.clone());
        }
        let container = Arc::new(CodeContainer::new(mode));
        slots[slot] = Some(container.clone());
        Ok(container)
    }

    /// Drop every singleton so subsequent builds get fresh containers.
    /// Existing serializers are unaffected; they own their programs.
    pub fn refresh(&self) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        *slots = [None, None, None];
    }

    /// Create an emitter over `container`. When the requested flavor is
    /// unavailable but the other one is, the supported flavor is
    /// substituted; the emitter reports which one it actually uses.
    pub fn emitter(
        &self,
        container: &Arc<CodeContainer>,
        target_name: &str,
        flavor: EmitterFlavor,
    ) -> Result<Emitter, BuildError> {
        let supported = |f: EmitterFlavor| match f {
            EmitterFlavor::FieldBased => self.caps.field_emitters,
            EmitterFlavor::ContextBased => self.caps.context_emitters,
        };
        let actual = if supported(flavor) {
            flavor
        } else {
            let other = match flavor {
                EmitterFlavor::FieldBased => EmitterFlavor::ContextBased,
                EmitterFlavor::ContextBased => EmitterFlavor::FieldBased,
            };
            if supported(other) {
                other
            } else {
                return Err(BuildError::UnsupportedFlavor(flavor));
            }
        };
        let seq = self.emitter_seq.fetch_add(1, Ordering::Relaxed);
        Ok(Emitter::new(
            seq,
            actual,
            container.clone(),
            target_name.to_owned(),
        ))
    }
}

impl Default for ContainerManager {
    fn default() -> Self {
        Self::new()
    }
}
