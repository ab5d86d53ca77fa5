//! Script engine abstraction and the process-wide engine selection

#[cfg(feature = "lua")]
pub mod lua;

use crate::error::{Result, SandboxError};
use crate::function::FunctionPool;
use crate::interrupt::InterruptController;
use crate::io::{InputSource, OutputSink};
use crate::limits::SandboxLimits;
use crate::program::Program;
use crate::registry::Library;
use crate::value::ScriptValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

#[cfg(feature = "lua")]
pub use lua::LuaEngine;

/// Everything a backend needs to populate one isolated namespace.
pub struct InstanceSetup {
    pub pool: FunctionPool,
    /// Capability libraries attached before the namespace is finalized
    pub libraries: Vec<Arc<Library>>,
    pub interrupt: Arc<InterruptController>,
    pub input: InputSource,
    pub output: OutputSink,
    pub limits: SandboxLimits,
}

/// Handle to source loaded into one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Interpreter backend
pub trait ScriptEngine: Send + Sync {
    /// Backend name, also exposed to scripts through the `__impl` global
    fn name(&self) -> &'static str;

    /// Global names the backend owns, including ones it withholds until
    /// restrictions are lifted. Function pools and libraries may not use them.
    fn reserved_globals(&self) -> &'static [&'static str];

    /// Build, populate, wire and finalize a new namespace.
    fn new_instance(&self, setup: InstanceSetup) -> Result<Box<dyn EngineInstance>>;
}

/// One populated and finalized namespace owned by a backend.
pub trait EngineInstance: Send {
    /// Compile source text into the namespace without running it.
    fn load(&mut self, program: &Program) -> Result<ChunkId>;

    /// Run a loaded chunk with `args` as its varargs.
    fn call(&mut self, chunk: ChunkId, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>>;

    /// Release a loaded chunk. Its id is never handed out again.
    fn unload(&mut self, chunk: ChunkId) -> Result<()>;

    /// Number of chunks currently loaded.
    fn loaded_chunks(&self) -> usize;

    /// Install a capability library as a global table and module-cache entry.
    fn attach_library(&mut self, library: &Library) -> Result<()>;

    /// Return the interrupt controller to armed for the next run.
    fn reset_interrupt(&mut self);

    /// Attach the withheld libraries. Called at most once per instance.
    fn remove_restrictions(&mut self) -> Result<()>;

    /// Sorted top-level names visible to scripts.
    fn global_names(&self) -> Result<Vec<String>>;

    /// Read one top-level global.
    fn global(&self, name: &str) -> Result<ScriptValue>;

    /// Release native resources. No other method is called afterwards.
    fn close(&mut self) -> Result<()>;
}

#[derive(Default)]
struct RegistryInner {
    active: RwLock<Option<Arc<dyn ScriptEngine>>>,
    live: Arc<AtomicUsize>,
}

/// Init-once selection of the active backend.
///
/// Exactly one engine is active at a time. Replacing it is refused while any
/// sandbox built from it is still alive.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    inner: Arc<RegistryInner>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `engine` already installed.
    pub fn with_engine(engine: impl ScriptEngine + 'static) -> Self {
        let registry = Self::new();
        if let Ok(mut active) = registry.inner.active.write() {
            *active = Some(Arc::new(engine));
        }
        registry
    }

    /// The process-wide registry.
    pub fn global() -> EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::new).clone()
    }

    pub fn install(&self, engine: impl ScriptEngine + 'static) -> Result<()> {
        let mut active = self
            .inner
            .active
            .write()
            .map_err(|_| SandboxError::InvalidState("engine registry poisoned".into()))?;

        if let Some(current) = active.as_ref() {
            let live = self.live_instances();
            if live > 0 {
                return Err(SandboxError::Configuration(format!(
                    "cannot replace script engine '{}' while {} sandbox(es) are live",
                    current.name(),
                    live
                )));
            }
            tracing::info!(
                previous = current.name(),
                engine = engine.name(),
                "Replacing idle script engine"
            );
        } else {
            tracing::info!(engine = engine.name(), "Installed script engine");
        }

        *active = Some(Arc::new(engine));
        Ok(())
    }

    pub fn active(&self) -> Result<Arc<dyn ScriptEngine>> {
        self.inner
            .active
            .read()
            .map_err(|_| SandboxError::InvalidState("engine registry poisoned".into()))?
            .clone()
            .ok_or_else(|| SandboxError::Configuration("no script engine installed".into()))
    }

    pub fn is_installed(&self) -> bool {
        self.inner
            .active
            .read()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    pub fn live_instances(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub(crate) fn live_guard(&self) -> LiveGuard {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        LiveGuard(Arc::clone(&self.inner.live))
    }
}

/// Counts one live sandbox until dropped.
pub(crate) struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
