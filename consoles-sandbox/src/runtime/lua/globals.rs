//! Construction, finalization and extension of the Lua global namespace

use super::convert;
use super::pattern;
use super::stdlib;
use crate::interrupt::InterruptController;
use crate::io::{InputSource, OutputSink};
use crate::registry::Library;
use mlua::{Function, Lua, StdLib, Table, Value};
use std::sync::Arc;

/// Registry slot holding the table that finalized globals live in.
const SEALED_GLOBALS: &str = "consoles.sandbox.sealed_globals";

/// Names populated at build time plus the ones withheld until restrictions
/// are lifted. Host pools and libraries may not claim any of them.
pub(super) const RESERVED: &[&str] = &[
    "_G",
    "_VERSION",
    "__impl",
    "assert",
    "bit32",
    "collectgarbage",
    "coroutine",
    "debug",
    "dofile",
    "error",
    "getmetatable",
    "io",
    "ipairs",
    "load",
    "loadfile",
    "math",
    "next",
    "os",
    "package",
    "pairs",
    "pcall",
    "print",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "require",
    "select",
    "setmetatable",
    "string",
    "table",
    "tonumber",
    "tostring",
    "type",
    "utf8",
    "warn",
    "xpcall",
];

/// Libraries withheld from a restricted instance.
pub(super) const WITHHELD: &[&str] = &["coroutine", "os"];

/// Lock the globals table. Existing bindings move to a hidden backing table;
/// the globals table keeps only script-defined names.
const LOCK_GLOBALS: &str = r#"
local G, B = ...
local error, rawequal, rawget, rawset, setmetatable, tostring =
  B.error, B.rawequal, B.rawget, B.rawset, B.setmetatable, B.tostring

local function refuse(k)
  error("cannot reassign sandbox global '" .. tostring(k) .. "'", 3)
end

setmetatable(G, {
  __index = B,
  __newindex = function(t, k, v)
    if rawget(B, k) ~= nil then
      refuse(k)
    end
    rawset(t, k, v)
  end,
  __metatable = false,
})

B.rawset = function(t, k, v)
  if rawequal(t, G) and rawget(B, k) ~= nil then
    refuse(k)
  end
  return rawset(t, k, v)
end
"#;

/// Base subsystems loaded by the interpreter itself, before host additions.
pub(super) fn base_libs() -> StdLib {
    StdLib::PACKAGE | StdLib::TABLE | StdLib::STRING | StdLib::MATH
}

/// Strip the raw source- and file-loading primitives.
pub(super) fn restrict_loading(lua: &Lua, globals: &Table) -> mlua::Result<()> {
    for name in ["load", "loadfile", "dofile"] {
        globals.raw_set(name, Value::Nil)?;
    }

    let package: Table = globals.raw_get("package")?;
    package.set("loadlib", Value::Nil)?;
    package.set("path", "")?;
    package.set("cpath", "")?;

    // keep only the preload searcher
    let searchers: Table = package.get("searchers")?;
    let preload: Function = searchers.raw_get(1)?;
    let restricted = lua.create_table()?;
    restricted.raw_set(1, preload)?;
    package.set("searchers", restricted)?;
    Ok(())
}

pub(super) fn install_console(
    lua: &Lua,
    globals: &Table,
    output: &OutputSink,
    input: &InputSource,
) -> mlua::Result<()> {
    globals.raw_set("print", stdlib::print(lua, output.clone())?)?;
    // Lua's default warning handler writes to the process stderr
    globals.raw_set("warn", lua.create_function(|_, _: mlua::Variadic<Value>| Ok(()))?)?;
    globals.raw_set("io", stdlib::console_io(lua, output.clone(), input.clone())?)?;
    Ok(())
}

pub(super) fn install_math_and_bits(lua: &Lua, globals: &Table) -> mlua::Result<()> {
    globals.raw_set("bit32", stdlib::bit32(lua)?)?;
    let math: Table = globals.raw_get("math")?;
    stdlib::extend_math(lua, &math)
}

/// Swap the string library's matching functions for ones the interrupt
/// controller can stop.
pub(super) fn install_patterns(
    lua: &Lua,
    globals: &Table,
    interrupt: &Arc<InterruptController>,
    every: u32,
) -> mlua::Result<()> {
    let string: Table = globals.raw_get("string")?;
    pattern::install(lua, &string, interrupt, every)
}

pub(super) fn install_interrupt_guards(
    lua: &Lua,
    globals: &Table,
    interrupt: &Arc<InterruptController>,
) -> mlua::Result<()> {
    let pcall: Function = globals.raw_get("pcall")?;
    globals.raw_set("pcall", stdlib::guard_protected(lua, pcall, interrupt)?)?;
    let xpcall: Function = globals.raw_get("xpcall")?;
    globals.raw_set("xpcall", stdlib::guard_xpcall(lua, xpcall, interrupt)?)?;
    Ok(())
}

/// Build a library table and register it as a global and in `package.loaded`.
pub(super) fn install_library(lua: &Lua, target: &Table, library: &Library) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, library.functions().len())?;
    for function in library.functions() {
        table.raw_set(
            function.name.as_str(),
            convert::host_function(lua, &function.function)?,
        )?;
    }
    target.raw_set(library.name(), table.clone())?;

    let package: Table = target.raw_get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.set(library.name(), table.clone())?;
    Ok(table)
}

fn move_all(from: &Table, to: &Table) -> mlua::Result<()> {
    let entries: Vec<(Value, Value)> = from
        .clone()
        .pairs::<Value, Value>()
        .collect::<mlua::Result<_>>()?;
    for (key, value) in entries {
        to.raw_set(key.clone(), value)?;
        from.raw_set(key, Value::Nil)?;
    }
    Ok(())
}

fn move_named(from: &Table, to: &Table, keys: &[&str]) -> mlua::Result<()> {
    for key in keys {
        let value: Value = from.raw_get(*key)?;
        if !value.is_nil() {
            to.raw_set(*key, value)?;
            from.raw_set(*key, Value::Nil)?;
        }
    }
    Ok(())
}

/// Freeze the current top-level bindings. Permanent for the instance.
pub(super) fn finalize(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let sealed = lua.create_table()?;
    move_all(&globals, &sealed)?;
    lua.set_named_registry_value(SEALED_GLOBALS, sealed.clone())?;

    lua.load(LOCK_GLOBALS)
        .set_name("=sandbox")
        .call::<()>((globals, sealed))
}

/// Table holding the finalized bindings.
pub(super) fn sealed(lua: &Lua) -> mlua::Result<Table> {
    lua.named_registry_value(SEALED_GLOBALS)
}

/// Load the withheld libraries into an already finalized namespace.
pub(super) fn lift_restrictions(
    lua: &Lua,
    interrupt: &Arc<InterruptController>,
) -> mlua::Result<()> {
    lua.load_std_libs(StdLib::COROUTINE | StdLib::OS)?;

    let globals = lua.globals();
    let sealed = sealed(lua)?;
    move_named(&globals, &sealed, WITHHELD)?;

    // these act on the host process, not on the program
    let os: Table = sealed.raw_get("os")?;
    os.raw_set("exit", Value::Nil)?;
    os.raw_set("execute", Value::Nil)?;

    let coroutine: Table = sealed.raw_get("coroutine")?;
    let resume: Function = coroutine.raw_get("resume")?;
    coroutine.raw_set("resume", stdlib::guard_protected(lua, resume, interrupt)?)?;
    Ok(())
}

/// Sorted names visible at the top level: finalized bindings plus script globals.
pub(super) fn visible_names(lua: &Lua) -> mlua::Result<Vec<String>> {
    let mut names = Vec::new();
    for table in [sealed(lua)?, lua.globals()] {
        for pair in table.pairs::<Value, Value>() {
            let (key, _) = pair?;
            if let Value::String(key) = key {
                names.push(key.to_str()?.to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}
