//! Lua 5.4 backend using mlua
//!
//! Each instance owns its own `Lua` state. The namespace is populated in a
//! fixed order (base, package, bit32, table, string with interruptible
//! pattern matching, math plus host extensions, interrupt guards, console
//! I/O), stripped of the raw loading primitives, extended with the host's
//! functions and libraries, and then finalized. The instruction hook is
//! installed last so building never consumes termination checks.

mod convert;
mod globals;
mod pattern;
mod stdlib;

use crate::error::{Result, SandboxError};
use crate::interrupt::InterruptController;
use crate::program::Program;
use crate::registry::Library;
use crate::runtime::{ChunkId, EngineInstance, InstanceSetup, ScriptEngine};
use crate::value::ScriptValue;
use mlua::{ChunkMode, Error as LuaError, Function, HookTriggers, Lua, LuaOptions, Value, Variadic, VmState};
use std::collections::HashMap;
use std::sync::Arc;

pub const ENGINE_NAME: &str = "lua54";

/// Lua 5.4 script engine
#[derive(Debug, Clone, Copy, Default)]
pub struct LuaEngine;

impl LuaEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for LuaEngine {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn reserved_globals(&self) -> &'static [&'static str] {
        globals::RESERVED
    }

    fn new_instance(&self, setup: InstanceSetup) -> Result<Box<dyn EngineInstance>> {
        Ok(Box::new(LuaInstance::new(setup)?))
    }
}

fn setup_error(stage: &str, err: LuaError) -> SandboxError {
    SandboxError::Configuration(format!("failed to {}: {}", stage, err))
}

fn install_hook(lua: &Lua, interrupt: &Arc<InterruptController>, every: u32) {
    let interrupt = Arc::clone(interrupt);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(every.max(1)),
        move |_lua, _debug| {
            interrupt.check().map_err(LuaError::external)?;
            Ok(VmState::Continue)
        },
    );
}

/// One isolated Lua state
pub struct LuaInstance {
    lua: Option<Lua>,
    chunks: HashMap<usize, Function>,
    next_chunk: usize,
    interrupt: Arc<InterruptController>,
    instructions_per_check: u32,
    restricted: bool,
}

impl LuaInstance {
    pub fn new(setup: InstanceSetup) -> Result<Self> {
        let InstanceSetup {
            pool,
            libraries,
            interrupt,
            input,
            output,
            limits,
        } = setup;

        let lua = Lua::new_with(globals::base_libs(), LuaOptions::default())
            .map_err(|e| setup_error("create interpreter", e))?;
        let g = lua.globals();

        // Populated
        globals::restrict_loading(&lua, &g).map_err(|e| setup_error("restrict loading", e))?;
        globals::install_math_and_bits(&lua, &g)
            .map_err(|e| setup_error("load math extensions", e))?;
        globals::install_patterns(&lua, &g, &interrupt, limits.instructions_per_check)
            .map_err(|e| setup_error("install pattern matching", e))?;
        globals::install_interrupt_guards(&lua, &g, &interrupt)
            .map_err(|e| setup_error("install interrupt library", e))?;
        globals::install_console(&lua, &g, &output, &input)
            .map_err(|e| setup_error("wire standard streams", e))?;
        g.raw_set("__impl", ENGINE_NAME)
            .map_err(|e| setup_error("mark implementation", e))?;

        // Extended
        for (name, function) in pool.iter() {
            let existing: Value = g.raw_get(name).map_err(|e| setup_error("inspect globals", e))?;
            if !existing.is_nil() {
                return Err(SandboxError::Configuration(format!(
                    "function '{}' collides with a base global",
                    name
                )));
            }
            let function = convert::host_function(&lua, function)
                .map_err(|e| setup_error("bind host function", e))?;
            g.raw_set(name, function)
                .map_err(|e| setup_error("bind host function", e))?;
        }
        for library in &libraries {
            let existing: Value = g
                .raw_get(library.name())
                .map_err(|e| setup_error("inspect globals", e))?;
            if !existing.is_nil() {
                return Err(SandboxError::Configuration(format!(
                    "library '{}' collides with an existing global",
                    library.name()
                )));
            }
            globals::install_library(&lua, &g, library)
                .map_err(|e| setup_error("attach library", e))?;
        }

        // Finalized
        globals::finalize(&lua).map_err(|e| setup_error("finalize globals", e))?;

        if let Some(bytes) = limits.max_memory_bytes {
            lua.set_memory_limit(bytes)
                .map_err(|e| setup_error("apply heap limit", e))?;
        }
        install_hook(&lua, &interrupt, limits.instructions_per_check);

        tracing::debug!(
            engine = ENGINE_NAME,
            functions = pool.len(),
            libraries = libraries.len(),
            heap_limit = ?limits.max_memory_bytes,
            instructions_per_check = limits.instructions_per_check,
            "Populated Lua namespace"
        );

        Ok(Self {
            lua: Some(lua),
            chunks: HashMap::new(),
            next_chunk: 0,
            interrupt,
            instructions_per_check: limits.instructions_per_check,
            restricted: true,
        })
    }

    fn lua(&self) -> Result<&Lua> {
        self.lua
            .as_ref()
            .ok_or_else(|| SandboxError::InvalidState("Lua state already released".to_string()))
    }
}

impl EngineInstance for LuaInstance {
    fn load(&mut self, program: &Program) -> Result<ChunkId> {
        let function = self
            .lua()?
            .load(program.source())
            .set_name(format!("={}", program.name()))
            .set_mode(ChunkMode::Text)
            .into_function()
            .map_err(|e| convert::classify(&e))?;
        self.next_chunk += 1;
        self.chunks.insert(self.next_chunk, function);
        Ok(ChunkId::new(self.next_chunk))
    }

    fn call(&mut self, chunk: ChunkId, args: Vec<ScriptValue>) -> Result<Vec<ScriptValue>> {
        let lua = self.lua()?;
        let function = self.chunks.get(&chunk.index()).ok_or_else(|| {
            SandboxError::InvalidState(format!("unknown chunk {}", chunk.index()))
        })?;

        let args = args
            .iter()
            .map(|arg| convert::to_lua(lua, arg))
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(|e| convert::classify(&e))?;
        let results: Variadic<Value> = function
            .call(Variadic::from(args))
            .map_err(|e| convert::classify(&e))?;

        Ok(results.iter().map(convert::from_lua_lossy).collect())
    }

    fn unload(&mut self, chunk: ChunkId) -> Result<()> {
        self.chunks
            .remove(&chunk.index())
            .map(drop)
            .ok_or_else(|| SandboxError::InvalidState(format!("unknown chunk {}", chunk.index())))
    }

    fn loaded_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn attach_library(&mut self, library: &Library) -> Result<()> {
        let lua = self.lua()?;
        let sealed = globals::sealed(lua).map_err(|e| setup_error("locate globals", e))?;
        let existing: Value = sealed
            .raw_get(library.name())
            .map_err(|e| setup_error("inspect globals", e))?;
        if !existing.is_nil() {
            return Err(SandboxError::Configuration(format!(
                "library '{}' collides with an existing global",
                library.name()
            )));
        }
        // a script global of the same name would shadow the locked binding
        let script_globals = lua.globals();
        let shadow: Value = script_globals
            .raw_get(library.name())
            .map_err(|e| setup_error("inspect globals", e))?;
        if !shadow.is_nil() {
            tracing::debug!(
                library = library.name(),
                "Replacing script global with attached library"
            );
            script_globals
                .raw_set(library.name(), Value::Nil)
                .map_err(|e| setup_error("clear script global", e))?;
        }
        globals::install_library(lua, &sealed, library)
            .map_err(|e| setup_error("attach library", e))?;
        Ok(())
    }

    fn reset_interrupt(&mut self) {
        self.interrupt.reset();
    }

    fn remove_restrictions(&mut self) -> Result<()> {
        if !self.restricted {
            return Ok(());
        }
        let lua = self.lua()?;
        // the lock metamethods run Lua code; keep them clear of the step hook
        lua.remove_hook();
        let lifted = globals::lift_restrictions(lua, &self.interrupt);
        install_hook(lua, &self.interrupt, self.instructions_per_check);
        lifted.map_err(|e| setup_error("lift restrictions", e))?;
        self.restricted = false;
        Ok(())
    }

    fn global_names(&self) -> Result<Vec<String>> {
        globals::visible_names(self.lua()?).map_err(|e| convert::classify(&e))
    }

    fn global(&self, name: &str) -> Result<ScriptValue> {
        let value: Value = self
            .lua()?
            .globals()
            .get(name)
            .map_err(|e| convert::classify(&e))?;
        Ok(convert::from_lua_lossy(&value))
    }

    fn close(&mut self) -> Result<()> {
        // chunk references must go before the state they point into
        self.chunks.clear();
        if let Some(lua) = self.lua.take() {
            lua.remove_hook();
            drop(lua);
        }
        Ok(())
    }
}
