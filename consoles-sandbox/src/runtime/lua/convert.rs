//! Marshaling between `ScriptValue` and mlua values

use crate::error::SandboxError;
use crate::function::{HostError, HostFunction};
use crate::interrupt::Terminated;
use crate::value::{HostObject, ScriptValue};
use mlua::{Error as LuaError, Function, Lua, UserData, Value, Variadic};

/// Userdata wrapper carrying a host object through script code.
pub(super) struct HostHandle(pub HostObject);

impl UserData for HostHandle {}

pub(super) fn to_lua(lua: &Lua, value: &ScriptValue) -> mlua::Result<Value> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Boolean(b) => Value::Boolean(*b),
        ScriptValue::Integer(i) => Value::Integer(*i),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::String(s) => Value::String(lua.create_string(s)?),
        ScriptValue::Bytes(b) => Value::String(lua.create_string(b)?),
        ScriptValue::Host(h) => Value::UserData(lua.create_userdata(HostHandle(h.clone()))?),
    })
}

/// Strict conversion used for host function arguments.
pub(super) fn from_lua(value: &Value) -> mlua::Result<ScriptValue> {
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Boolean(*b),
        Value::Integer(i) => ScriptValue::Integer(*i),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => ScriptValue::from(s.as_bytes().to_vec()),
        Value::UserData(ud) => match ud.borrow::<HostHandle>() {
            Ok(handle) => ScriptValue::Host(handle.0.clone()),
            Err(_) => {
                return Err(LuaError::RuntimeError(
                    "cannot pass foreign userdata to a host function".to_string(),
                ))
            }
        },
        other => {
            return Err(LuaError::RuntimeError(format!(
                "cannot pass a {} to a host function",
                other.type_name()
            )))
        }
    })
}

/// Lossy conversion used for values a chunk returns to the host.
pub(super) fn from_lua_lossy(value: &Value) -> ScriptValue {
    from_lua(value).unwrap_or_else(|_| ScriptValue::String(format!("<{}>", value.type_name())))
}

/// Adapt a host binding to a native Lua function.
pub(super) fn host_function(lua: &Lua, function: &HostFunction) -> mlua::Result<Function> {
    let function = function.clone();
    lua.create_function(move |lua, args: Variadic<Value>| {
        let args = args
            .iter()
            .map(from_lua)
            .collect::<mlua::Result<Vec<_>>>()?;
        let result = function.call(args).map_err(LuaError::external)?;
        to_lua(lua, &result)
    })
}

fn find_external<T: std::error::Error + 'static>(err: &LuaError) -> Option<&T> {
    match err {
        LuaError::ExternalError(inner) => inner.downcast_ref::<T>(),
        LuaError::CallbackError { cause, .. } => find_external(cause),
        _ => None,
    }
}

/// Map an interpreter error onto the sandbox error kinds.
pub(super) fn classify(err: &LuaError) -> SandboxError {
    if find_external::<Terminated>(err).is_some() {
        return SandboxError::Terminated;
    }
    if let Some(host) = find_external::<HostError>(err) {
        return SandboxError::Host(host.message.clone());
    }
    match err {
        LuaError::SyntaxError { message, .. } => {
            SandboxError::ScriptRuntime(format!("syntax error: {}", message))
        }
        LuaError::RuntimeError(message) => SandboxError::ScriptRuntime(message.clone()),
        LuaError::MemoryError(message) => {
            SandboxError::ScriptRuntime(format!("out of memory: {}", message))
        }
        LuaError::CallbackError { cause, .. } => classify(cause),
        other => SandboxError::ScriptRuntime(other.to_string()),
    }
}
