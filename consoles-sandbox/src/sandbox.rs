//! Sandbox handle: the host-facing lifecycle of one instance

use crate::error::{Result, SandboxError};
use crate::interrupt::InterruptController;
use crate::program::Program;
use crate::registry::{CapabilityRegistry, Library};
use crate::runtime::{ChunkId, EngineInstance, LiveGuard};
use crate::value::ScriptValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique sandbox identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub uuid::Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally observable lifecycle of a sandbox.
///
/// `Ready -> Unrestricted` is one-way, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Ready,
    Unrestricted,
    Closed,
}

/// An isolated, finalized interpreter namespace with its I/O and interrupt wiring.
pub struct Sandbox {
    id: SandboxId,
    engine: &'static str,
    instance: Box<dyn EngineInstance>,
    interrupt: Arc<InterruptController>,
    state: SandboxState,
    live: Option<LiveGuard>,
}

impl Sandbox {
    pub(crate) fn new(
        engine: &'static str,
        instance: Box<dyn EngineInstance>,
        interrupt: Arc<InterruptController>,
        live: LiveGuard,
    ) -> Self {
        Self {
            id: SandboxId::new(),
            engine,
            instance,
            interrupt,
            state: SandboxState::Ready,
            live: Some(live),
        }
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn engine(&self) -> &'static str {
        self.engine
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.interrupt.is_tripped()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.state == SandboxState::Closed {
            return Err(SandboxError::InvalidState(format!(
                "cannot {} sandbox {}: it is closed",
                operation, self.id
            )));
        }
        Ok(())
    }

    /// Compile `program` into the namespace.
    pub fn load(&mut self, program: &Program) -> Result<ChunkId> {
        self.ensure_open("load into")?;
        self.instance.load(program)
    }

    /// Run a loaded chunk.
    ///
    /// A run that trips the interrupt controller always reports
    /// [`SandboxError::Terminated`], even if the script caught the abort.
    pub fn call(&mut self, chunk: ChunkId, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>> {
        self.ensure_open("run")?;
        if self.interrupt.is_tripped() {
            return Err(SandboxError::Terminated);
        }

        let result = self.instance.call(chunk, args);
        if self.interrupt.is_tripped() {
            tracing::warn!(
                sandbox_id = %self.id,
                checks = self.interrupt.checks(),
                "Program terminated"
            );
            return Err(SandboxError::Terminated);
        }
        result
    }

    /// Load and run in one step. The chunk is released afterwards.
    pub fn run(&mut self, program: &Program, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>> {
        let chunk = self.load(program)?;
        tracing::debug!(sandbox_id = %self.id, program = program.name(), "Running program");
        let result = self.call(chunk, args);
        let unloaded = self.instance.unload(chunk);
        let values = result?;
        unloaded?;
        Ok(values)
    }

    /// Release a chunk returned by [`Sandbox::load`].
    pub fn unload(&mut self, chunk: ChunkId) -> Result<()> {
        self.ensure_open("unload from")?;
        self.instance.unload(chunk)
    }

    pub fn loaded_chunks(&self) -> Result<usize> {
        self.ensure_open("inspect")?;
        Ok(self.instance.loaded_chunks())
    }

    pub fn attach_library(&mut self, library: &Library) -> Result<()> {
        self.ensure_open("attach a library to")?;
        self.instance.attach_library(library)?;
        tracing::debug!(sandbox_id = %self.id, library = library.name(), "Attached library");
        Ok(())
    }

    /// Look up `name` in `registry` and attach it.
    pub fn attach(&mut self, registry: &CapabilityRegistry, name: &str) -> Result<()> {
        self.ensure_open("attach a library to")?;
        let library = registry.get(name)?;
        self.attach_library(&library)
    }

    /// Re-arm the interrupt controller. The capability surface is unchanged.
    pub fn reset_interrupt(&mut self) -> Result<()> {
        self.ensure_open("reset")?;
        self.instance.reset_interrupt();
        self.interrupt.reset();
        Ok(())
    }

    /// Grant the withheld libraries. Idempotent and irreversible.
    pub fn remove_restrictions(&mut self) -> Result<()> {
        self.ensure_open("lift restrictions on")?;
        if self.state == SandboxState::Unrestricted {
            return Ok(());
        }
        self.instance.remove_restrictions()?;
        self.state = SandboxState::Unrestricted;
        tracing::info!(sandbox_id = %self.id, "Lifted sandbox restrictions");
        Ok(())
    }

    pub fn global_names(&self) -> Result<Vec<String>> {
        self.ensure_open("inspect")?;
        self.instance.global_names()
    }

    pub fn global(&self, name: &str) -> Result<ScriptValue> {
        self.ensure_open("inspect")?;
        self.instance.global(name)
    }

    /// Release the instance. Every later operation fails with `InvalidState`.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open("close")?;
        self.state = SandboxState::Closed;
        self.live = None;
        let result = self.instance.close();
        tracing::debug!(sandbox_id = %self.id, engine = self.engine, "Closed sandbox");
        result
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state != SandboxState::Closed {
            if let Err(e) = self.instance.close() {
                tracing::debug!(sandbox_id = %self.id, error = %e, "Failed to close dropped sandbox");
            }
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("state", &self.state)
            .field("interrupt", &self.interrupt)
            .finish()
    }
}
