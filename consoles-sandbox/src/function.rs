//! Host function bindings and the per-instance function pool

use crate::error::{Result, SandboxError};
use crate::value::ScriptValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a host function; scripts observe it as a raised error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn bad_argument(position: usize, expected: &str, got: &ScriptValue) -> Self {
        Self::new(format!(
            "bad argument #{} ({} expected, got {})",
            position,
            expected,
            got.type_name()
        ))
    }
}

type HostFn = dyn Fn(Vec<ScriptValue>) -> std::result::Result<ScriptValue, HostError> + Send + Sync;

/// A host-callable binding: marshaled arguments in, marshaled result or [`HostError`] out.
#[derive(Clone)]
pub struct HostFunction {
    func: Arc<HostFn>,
}

impl HostFunction {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<ScriptValue>) -> std::result::Result<ScriptValue, HostError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    pub fn call(&self, args: Vec<ScriptValue>) -> std::result::Result<ScriptValue, HostError> {
        (self.func)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunction")
    }
}

/// Typed access to host function arguments, 1-based like Lua's own messages.
pub trait HostArgs {
    fn arg(&self, position: usize) -> &ScriptValue;
    fn int_arg(&self, position: usize) -> std::result::Result<i64, HostError>;
    fn number_arg(&self, position: usize) -> std::result::Result<f64, HostError>;
    fn string_arg(&self, position: usize) -> std::result::Result<&str, HostError>;
    fn bool_arg(&self, position: usize) -> std::result::Result<bool, HostError>;
}

static NIL: ScriptValue = ScriptValue::Nil;

impl HostArgs for [ScriptValue] {
    fn arg(&self, position: usize) -> &ScriptValue {
        position
            .checked_sub(1)
            .and_then(|i| self.get(i))
            .unwrap_or(&NIL)
    }

    fn int_arg(&self, position: usize) -> std::result::Result<i64, HostError> {
        let value = self.arg(position);
        value
            .as_i64()
            .ok_or_else(|| HostError::bad_argument(position, "integer", value))
    }

    fn number_arg(&self, position: usize) -> std::result::Result<f64, HostError> {
        let value = self.arg(position);
        value
            .as_f64()
            .ok_or_else(|| HostError::bad_argument(position, "number", value))
    }

    fn string_arg(&self, position: usize) -> std::result::Result<&str, HostError> {
        let value = self.arg(position);
        value
            .as_str()
            .ok_or_else(|| HostError::bad_argument(position, "string", value))
    }

    fn bool_arg(&self, position: usize) -> std::result::Result<bool, HostError> {
        let value = self.arg(position);
        value
            .as_bool()
            .ok_or_else(|| HostError::bad_argument(position, "boolean", value))
    }
}

/// Named host functions injected as bare globals into one sandbox instance.
///
/// Cloning is cheap; bindings are shared behind `Arc`s, so a host can keep a
/// template pool and hand a clone to every sandbox it builds.
#[derive(Debug, Clone, Default)]
pub struct FunctionPool {
    functions: BTreeMap<String, HostFunction>,
}

impl FunctionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one callable under `name`.
    pub fn bind(&mut self, name: impl Into<String>, function: HostFunction) -> Result<()> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(SandboxError::DuplicateBinding { name });
        }
        self.functions.insert(name, function);
        Ok(())
    }

    /// Builder-style [`FunctionPool::bind`] for closures.
    pub fn with<F>(mut self, name: impl Into<String>, func: F) -> Result<Self>
    where
        F: Fn(Vec<ScriptValue>) -> std::result::Result<ScriptValue, HostError>
            + Send
            + Sync
            + 'static,
    {
        self.bind(name, HostFunction::new(func))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostFunction)> {
        self.functions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
