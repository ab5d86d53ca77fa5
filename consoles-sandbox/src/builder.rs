//! Sandbox environment builder

use crate::error::{Result, SandboxError};
use crate::function::FunctionPool;
use crate::interrupt::{InterruptController, TerminationFlag, TerminationPredicate};
use crate::io::{InputSource, OutputSink};
use crate::limits::SandboxLimits;
use crate::registry::CapabilityRegistry;
use crate::runtime::{EngineRegistry, InstanceSetup};
use crate::sandbox::Sandbox;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;

/// Collects everything one sandbox needs, validates it, and hands it to the
/// active engine. Nothing is allocated in the engine until validation passes.
pub struct SandboxBuilder {
    pool: FunctionPool,
    predicate: Option<TerminationPredicate>,
    input: InputSource,
    output: OutputSink,
    limits: SandboxLimits,
    libraries: Vec<String>,
    capabilities: Option<CapabilityRegistry>,
}

impl SandboxBuilder {
    pub fn new(pool: FunctionPool) -> Self {
        Self {
            pool,
            predicate: None,
            input: InputSource::empty(),
            output: OutputSink::discard(),
            limits: SandboxLimits::default(),
            libraries: Vec::new(),
            capabilities: None,
        }
    }

    /// Predicate polled by the interrupt controller. Defaults to never firing.
    pub fn terminate_when(mut self, predicate: TerminationPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn terminate_on(self, flag: &TerminationFlag) -> Self {
        self.terminate_when(flag.predicate())
    }

    pub fn input(mut self, reader: impl Read + Send + 'static) -> Self {
        self.input = InputSource::stream(reader);
        self
    }

    pub fn input_source(mut self, input: InputSource) -> Self {
        self.input = input;
        self
    }

    pub fn output(mut self, writer: impl Write + Send + 'static) -> Self {
        self.output = OutputSink::stream(writer);
        self
    }

    pub fn output_sink(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn heap_limit(mut self, bytes: usize) -> Self {
        self.limits.max_memory_bytes = Some(bytes);
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Some(registry);
        self
    }

    /// Attach a published library while the namespace is still open.
    pub fn library(mut self, name: impl Into<String>) -> Self {
        self.libraries.push(name.into());
        self
    }

    pub fn build(self, engines: &EngineRegistry) -> Result<Sandbox> {
        // counted before the engine is read, so it cannot be swapped mid-build
        let live = engines.live_guard();
        let engine = engines.active()?;
        let reserved: HashSet<&str> = engine.reserved_globals().iter().copied().collect();

        for name in self.pool.names() {
            if reserved.contains(name) {
                return Err(SandboxError::Configuration(format!(
                    "function '{}' collides with a {} base global",
                    name,
                    engine.name()
                )));
            }
        }

        let mut libraries = Vec::with_capacity(self.libraries.len());
        if !self.libraries.is_empty() {
            let registry = self.capabilities.as_ref().ok_or_else(|| {
                SandboxError::Configuration(
                    "libraries requested without a capability registry".to_string(),
                )
            })?;
            let mut seen = HashSet::new();
            for name in &self.libraries {
                if reserved.contains(name.as_str()) || self.pool.contains(name) {
                    return Err(SandboxError::Configuration(format!(
                        "library '{}' collides with an existing global",
                        name
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(SandboxError::Configuration(format!(
                        "library '{}' requested twice",
                        name
                    )));
                }
                libraries.push(registry.get(name)?);
            }
        }

        let interrupt = Arc::new(match self.predicate {
            Some(predicate) => InterruptController::new(predicate),
            None => InterruptController::never(),
        });

        let pool_size = self.pool.len();
        let setup = InstanceSetup {
            pool: self.pool,
            libraries,
            interrupt: Arc::clone(&interrupt),
            input: self.input,
            output: self.output,
            limits: self.limits,
        };

        let instance = engine.new_instance(setup)?;
        let sandbox = Sandbox::new(engine.name(), instance, interrupt, live);

        tracing::info!(
            sandbox_id = %sandbox.id(),
            engine = engine.name(),
            functions = pool_size,
            libraries = self.libraries.len(),
            "Built sandbox"
        );

        Ok(sandbox)
    }
}

/// Build a sandbox from the positional contract: pool, termination predicate,
/// optional streams and a heap bound in bytes (zero leaves the heap unbounded).
pub fn build(
    engines: &EngineRegistry,
    pool: FunctionPool,
    is_terminated: TerminationPredicate,
    input: Option<InputSource>,
    output: Option<OutputSink>,
    heap_limit: usize,
) -> Result<Sandbox> {
    let mut limits = SandboxLimits::default();
    limits.max_memory_bytes = (heap_limit > 0).then_some(heap_limit);

    SandboxBuilder::new(pool)
        .terminate_when(is_terminated)
        .input_source(input.unwrap_or_default())
        .output_sink(output.unwrap_or_default())
        .limits(limits)
        .build(engines)
}
