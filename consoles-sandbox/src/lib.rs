//! Consoles Sandbox - embedded script sandbox for untrusted programs
//!
//! Builds isolated interpreter instances whose namespace holds a fixed set
//! of base subsystems plus exactly the host functions and capability
//! libraries the host allowlisted. Runs can be stopped cooperatively from
//! any thread through a termination predicate.
//!
//! ```no_run
//! use consoles_sandbox::{
//!     EngineRegistry, FunctionPool, LuaEngine, Program, SandboxBuilder, ScriptValue,
//! };
//!
//! # fn main() -> consoles_sandbox::Result<()> {
//! let engines = EngineRegistry::with_engine(LuaEngine::new());
//! let pool = FunctionPool::new().with("answer", |_| Ok(ScriptValue::Integer(42)))?;
//! let mut sandbox = SandboxBuilder::new(pool).output(std::io::stdout()).build(&engines)?;
//! sandbox.run(&Program::inline("print(answer())"), vec![])?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod error;
mod execution;
mod function;
mod interrupt;
mod io;
mod limits;
mod program;
mod registry;
mod runtime;
mod sandbox;
mod service;
mod types;
mod value;

pub use builder::{build, SandboxBuilder};
pub use config::{EngineKind, ProgramSettings, SandboxConfig, ServiceSettings};
pub use error::{ErrorKind, Result, SandboxError, ScriptFailure};
pub use execution::{ExecutionId, ExecutionState, ExecutionStatus};
pub use function::{FunctionPool, HostArgs, HostError, HostFunction};
pub use interrupt::{
    any_of, deadline, InterruptController, InterruptState, Terminated, TerminationFlag,
    TerminationPredicate,
};
pub use io::{CaptureBuffer, InputSource, OutputSink};
pub use limits::SandboxLimits;
pub use program::{Program, ProgramLoader};
pub use registry::{CapabilityRegistry, Library, NamedFunction};
#[cfg(feature = "lua")]
pub use runtime::LuaEngine;
pub use runtime::{ChunkId, EngineInstance, EngineRegistry, InstanceSetup, ScriptEngine};
pub use sandbox::{Sandbox, SandboxId, SandboxState};
pub use service::SandboxService;
pub use types::{ExecutionRequest, ExecutionResult, ExecutionStream};
pub use value::{HostObject, ScriptValue};

/// Registry with the engine `config` selects already installed.
pub fn engines_for(config: &SandboxConfig) -> EngineRegistry {
    match config.engine {
        #[cfg(feature = "lua")]
        EngineKind::Lua => EngineRegistry::with_engine(LuaEngine::new()),
        #[cfg(not(feature = "lua"))]
        EngineKind::Lua => EngineRegistry::new(),
    }
}
