//! Host-provided pieces of the Lua base subsystems

use crate::interrupt::InterruptController;
use crate::io::{InputSource, OutputSink};
use mlua::{Error as LuaError, Function, Lua, Table, Value, Variadic};
use std::sync::Arc;

/// Re-raises a caught error when it is the termination signal, so protected
/// calls cannot swallow an abort. Expects the raw function and a `tripped`
/// check as chunk arguments and returns the guarded replacement.
const GUARD_PROTECTED_CALL: &str = r#"
local raw, tripped = ...
local error = error
local function settle(ok, ...)
  if not ok and tripped() then
    error((...), 0)
  end
  return ok, ...
end
return function(...)
  return settle(raw(...))
end
"#;

const GUARD_XPCALL: &str = r#"
local raw, tripped = ...
local error = error
local function settle(ok, ...)
  if not ok and tripped() then
    error((...), 0)
  end
  return ok, ...
end
return function(f, handler, ...)
  return settle(raw(f, function(e)
    if tripped() then
      return e
    end
    return handler(e)
  end, ...))
end
"#;

fn write_err(e: std::io::Error) -> LuaError {
    LuaError::RuntimeError(format!("output stream failed: {}", e))
}

fn read_err(e: std::io::Error) -> LuaError {
    LuaError::RuntimeError(format!("input stream failed: {}", e))
}

/// `print` bound to the sandbox's output sink.
pub(super) fn print(lua: &Lua, output: OutputSink) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut line = Vec::new();
        for (i, value) in args.iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            let text: mlua::String = tostring.call(value.clone())?;
            line.extend_from_slice(&text.as_bytes());
        }
        line.push(b'\n');
        output.write(&line).map_err(write_err)
    })
}

/// Console `io` table: `write` and `read` over the wired streams only.
pub(super) fn console_io(lua: &Lua, output: OutputSink, input: InputSource) -> mlua::Result<Table> {
    let io = lua.create_table()?;

    io.set(
        "write",
        lua.create_function(move |lua, args: Variadic<Value>| {
            for (i, value) in args.iter().enumerate() {
                let text = match value {
                    Value::String(_) | Value::Integer(_) | Value::Number(_) => {
                        lua.coerce_string(value.clone())?
                    }
                    _ => None,
                };
                let Some(text) = text else {
                    return Err(LuaError::RuntimeError(format!(
                        "bad argument #{} to 'write' (string expected, got {})",
                        i + 1,
                        value.type_name()
                    )));
                };
                output.write(&text.as_bytes()).map_err(write_err)?;
            }
            Ok(())
        })?,
    )?;

    io.set(
        "read",
        lua.create_function(move |lua, format: Option<Value>| {
            let bytes = match format {
                None => input.read_line(false),
                Some(Value::Integer(count)) => input.read_bytes(count.max(0) as usize),
                Some(Value::Number(count)) => input.read_bytes(count.max(0.0) as usize),
                Some(Value::String(fmt)) => {
                    let fmt = fmt.to_str()?.trim_start_matches('*').to_string();
                    match fmt.chars().next() {
                        Some('l') => input.read_line(false),
                        Some('L') => input.read_line(true),
                        Some('a') => input.read_all().map(Some),
                        _ => {
                            return Err(LuaError::RuntimeError(format!(
                                "bad argument #1 to 'read' (invalid format '{}')",
                                fmt
                            )))
                        }
                    }
                }
                Some(other) => {
                    return Err(LuaError::RuntimeError(format!(
                        "bad argument #1 to 'read' (string expected, got {})",
                        other.type_name()
                    )))
                }
            }
            .map_err(read_err)?;

            bytes.map(|b| lua.create_string(&b)).transpose()
        })?,
    )?;

    Ok(io)
}

fn shift_left(x: u32, n: i64) -> u32 {
    if n <= -32 || n >= 32 {
        0
    } else if n >= 0 {
        x << n
    } else {
        x >> -n
    }
}

/// `bit32` on unsigned 32-bit integers; arguments wrap modulo 2^32.
pub(super) fn bit32(lua: &Lua) -> mlua::Result<Table> {
    let bit = lua.create_table()?;

    bit.set(
        "band",
        lua.create_function(|_, args: Variadic<i64>| {
            Ok(args.iter().fold(u32::MAX, |acc, x| acc & *x as u32) as i64)
        })?,
    )?;
    bit.set(
        "bor",
        lua.create_function(|_, args: Variadic<i64>| {
            Ok(args.iter().fold(0u32, |acc, x| acc | *x as u32) as i64)
        })?,
    )?;
    bit.set(
        "bxor",
        lua.create_function(|_, args: Variadic<i64>| {
            Ok(args.iter().fold(0u32, |acc, x| acc ^ *x as u32) as i64)
        })?,
    )?;
    bit.set(
        "btest",
        lua.create_function(|_, args: Variadic<i64>| {
            Ok(args.iter().fold(u32::MAX, |acc, x| acc & *x as u32) != 0)
        })?,
    )?;
    bit.set(
        "bnot",
        lua.create_function(|_, x: i64| Ok(!(x as u32) as i64))?,
    )?;
    bit.set(
        "lshift",
        lua.create_function(|_, (x, n): (i64, i64)| Ok(shift_left(x as u32, n) as i64))?,
    )?;
    bit.set(
        "rshift",
        lua.create_function(|_, (x, n): (i64, i64)| {
            Ok(shift_left(x as u32, n.saturating_neg()) as i64)
        })?,
    )?;
    bit.set(
        "arshift",
        lua.create_function(|_, (x, n): (i64, i64)| {
            let x = x as u32 as i32;
            let shifted = if n >= 32 {
                if x < 0 {
                    -1
                } else {
                    0
                }
            } else if n >= 0 {
                x >> n
            } else {
                return Ok(shift_left(x as u32, -n) as i64);
            };
            Ok(shifted as u32 as i64)
        })?,
    )?;

    Ok(bit)
}

/// Add the functions Lua's math library lacks.
pub(super) fn extend_math(lua: &Lua, math: &Table) -> mlua::Result<()> {
    math.set(
        "round",
        lua.create_function(|_, x: f64| {
            let rounded = (x + 0.5).floor();
            if rounded.is_finite() && rounded.abs() < i64::MAX as f64 {
                Ok(Value::Integer(rounded as i64))
            } else {
                Ok(Value::Number(rounded))
            }
        })?,
    )?;

    math.set(
        "clamp",
        lua.create_function(|_, (x, lo, hi): (Value, Value, Value)| {
            match (&x, &lo, &hi) {
                (Value::Integer(x), Value::Integer(lo), Value::Integer(hi)) => {
                    if lo > hi {
                        return Err(LuaError::RuntimeError(
                            "bad argument #2 to 'clamp' (min is greater than max)".to_string(),
                        ));
                    }
                    Ok(Value::Integer((*x).clamp(*lo, *hi)))
                }
                _ => {
                    let number = |v: &Value, pos: usize| match v {
                        Value::Integer(i) => Ok(*i as f64),
                        Value::Number(n) => Ok(*n),
                        other => Err(LuaError::RuntimeError(format!(
                            "bad argument #{} to 'clamp' (number expected, got {})",
                            pos,
                            other.type_name()
                        ))),
                    };
                    let (x, lo, hi) = (number(&x, 1)?, number(&lo, 2)?, number(&hi, 3)?);
                    if lo > hi {
                        return Err(LuaError::RuntimeError(
                            "bad argument #2 to 'clamp' (min is greater than max)".to_string(),
                        ));
                    }
                    Ok(Value::Number(x.max(lo).min(hi)))
                }
            }
        })?,
    )?;

    Ok(())
}

/// Tripped check scripts cannot reach directly; only the guard closures capture it.
fn tripped_check(lua: &Lua, interrupt: &Arc<InterruptController>) -> mlua::Result<Function> {
    let interrupt = Arc::clone(interrupt);
    lua.create_function(move |_, ()| Ok(interrupt.is_tripped()))
}

/// Wrap a protected-call style function so it re-raises the termination signal.
pub(super) fn guard_protected(
    lua: &Lua,
    raw: Function,
    interrupt: &Arc<InterruptController>,
) -> mlua::Result<Function> {
    lua.load(GUARD_PROTECTED_CALL)
        .set_name("=sandbox")
        .call((raw, tripped_check(lua, interrupt)?))
}

pub(super) fn guard_xpcall(
    lua: &Lua,
    raw: Function,
    interrupt: &Arc<InterruptController>,
) -> mlua::Result<Function> {
    lua.load(GUARD_XPCALL)
        .set_name("=sandbox")
        .call((raw, tripped_check(lua, interrupt)?))
}
