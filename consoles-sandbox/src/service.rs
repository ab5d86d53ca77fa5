//! Sandbox service - async entry point for hosts
//!
//! Each execution gets a fresh sandbox on Tokio's blocking pool. Output is
//! streamed back over a bounded channel; callers must drain it or the
//! program blocks on its next write.

use crate::builder::SandboxBuilder;
use crate::config::{SandboxConfig, ServiceSettings};
use crate::error::{Result, SandboxError};
use crate::execution::{ExecutionId, ExecutionState, ExecutionStatus};
use crate::function::FunctionPool;
use crate::interrupt::TerminationFlag;
use crate::io::{InputSource, OutputSink};
use crate::limits::SandboxLimits;
use crate::registry::CapabilityRegistry;
use crate::runtime::EngineRegistry;
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStream};
use crate::value::ScriptValue;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Wait between attempts to hand a chunk to a full output channel.
const OUTPUT_RETRY: Duration = Duration::from_millis(5);

/// `Write` adapter feeding an execution's output channel from the blocking pool.
///
/// A full channel is retried until the reader catches up or the execution's
/// termination flag trips, so an undrained stream cannot outlive a stop or a
/// timeout.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
    flag: TerminationFlag,
    written: Arc<AtomicU64>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut chunk = buf.to_vec();
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) => break,
                // a dropped receiver means nobody is listening; keep the program running
                Err(TrySendError::Closed(_)) => break,
                Err(TrySendError::Full(back)) => {
                    if self.flag.is_tripped() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "execution stopped while output was blocked",
                        ));
                    }
                    chunk = back;
                    std::thread::sleep(OUTPUT_RETRY);
                }
            }
        }
        self.written.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct Tracked {
    state: Arc<RwLock<ExecutionState>>,
    flag: TerminationFlag,
    stdout_bytes: Arc<AtomicU64>,
}

impl Tracked {
    async fn snapshot(&self) -> ExecutionState {
        let mut state = self.state.read().await.clone();
        state.stdout_bytes = self.stdout_bytes.load(Ordering::Relaxed);
        state
    }
}

/// Everything one blocking run needs, detached from the service.
struct Job {
    engines: EngineRegistry,
    capabilities: CapabilityRegistry,
    pool: FunctionPool,
    limits: SandboxLimits,
    request: ExecutionRequest,
    flag: TerminationFlag,
    output: OutputSink,
}

impl Job {
    fn run(self) -> ExecutionResult {
        let started = Instant::now();
        let flag = self.flag.clone();
        let outcome = self.execute();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(values) => ExecutionResult {
                status: ExecutionStatus::Completed,
                duration_ms,
                timed_out: false,
                failure: None,
                values: values.iter().map(ScriptValue::to_string).collect(),
            },
            // a tripped flag can surface as an output error before the interpreter sees it
            Err(err) if err.is_termination() || flag.is_tripped() => ExecutionResult {
                status: ExecutionStatus::Terminated,
                duration_ms,
                timed_out: false,
                failure: Some(SandboxError::Terminated.to_failure()),
                values: Vec::new(),
            },
            Err(err) => ExecutionResult {
                status: ExecutionStatus::Failed,
                duration_ms,
                timed_out: false,
                failure: Some(err.to_failure()),
                values: Vec::new(),
            },
        }
    }

    fn execute(self) -> Result<Vec<ScriptValue>> {
        let mut builder = SandboxBuilder::new(self.pool)
            .terminate_on(&self.flag)
            .output_sink(self.output)
            .limits(self.limits)
            .capabilities(self.capabilities);
        if let Some(stdin) = &self.request.stdin {
            builder = builder.input_source(InputSource::from_bytes(stdin.as_bytes()));
        }
        for library in &self.request.libraries {
            builder = builder.library(library);
        }

        let mut sandbox = builder.build(&self.engines)?;
        if self.request.unrestricted {
            sandbox.remove_restrictions()?;
        }

        let args = self
            .request
            .args
            .iter()
            .map(|arg| ScriptValue::from(arg.as_str()))
            .collect();
        let result = sandbox.run(&self.request.program(), args);
        sandbox.close()?;
        result
    }
}

/// Async execution service running one sandbox per request
pub struct SandboxService {
    engines: EngineRegistry,
    capabilities: CapabilityRegistry,
    pool: FunctionPool,
    limits: SandboxLimits,
    settings: ServiceSettings,
    executions: Arc<RwLock<HashMap<ExecutionId, Tracked>>>,
}

impl SandboxService {
    pub fn new(engines: EngineRegistry, capabilities: CapabilityRegistry) -> Self {
        Self {
            engines,
            capabilities,
            pool: FunctionPool::new(),
            limits: SandboxLimits::default(),
            settings: ServiceSettings::default(),
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(
        engines: EngineRegistry,
        capabilities: CapabilityRegistry,
        config: &SandboxConfig,
    ) -> Self {
        Self::new(engines, capabilities)
            .with_limits(config.limits.clone())
            .with_settings(config.service.clone())
    }

    /// Function pool every execution's namespace is extended with
    pub fn with_pool(mut self, pool: FunctionPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Start a program and return its output stream
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionStream> {
        self.execute_with_id(ExecutionId::new(), request).await
    }

    pub async fn execute_with_id(
        &self,
        id: ExecutionId,
        request: ExecutionRequest,
    ) -> Result<ExecutionStream> {
        let engine = self.engines.active()?;
        if self.executions.read().await.contains_key(&id) {
            return Err(SandboxError::InvalidState(format!(
                "execution {} already exists",
                id
            )));
        }

        let timeout = request.timeout.or(self.settings.default_timeout);
        tracing::info!(
            execution_id = %id,
            engine = engine.name(),
            program = %request.name,
            code_len = request.source.len(),
            timeout = ?timeout,
            "Executing program"
        );

        let flag = TerminationFlag::new();
        let stdout_bytes = Arc::new(AtomicU64::new(0));
        let tracked = Tracked {
            state: Arc::new(RwLock::new(ExecutionState::new(id, request.name.clone()))),
            flag: flag.clone(),
            stdout_bytes: Arc::clone(&stdout_bytes),
        };
        self.executions.write().await.insert(id, tracked.clone());

        let (stdout_tx, stdout_rx) = mpsc::channel(self.settings.stdout_capacity.max(1));
        let (result_tx, result_rx) = oneshot::channel();

        let job = Job {
            engines: self.engines.clone(),
            capabilities: self.capabilities.clone(),
            pool: self.pool.clone(),
            limits: self.limits.clone(),
            request,
            flag: flag.clone(),
            output: OutputSink::stream(ChannelWriter {
                tx: stdout_tx,
                flag: flag.clone(),
                written: stdout_bytes,
            }),
        };

        tokio::spawn(async move {
            let mut handle = tokio::task::spawn_blocking(move || job.run());

            let mut timed_out = false;
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(execution_id = %id, timeout = ?limit, "Execution timed out");
                        timed_out = true;
                        flag.trip();
                        handle.await
                    }
                },
                None => handle.await,
            };

            let mut result = match joined {
                Ok(result) => result,
                Err(err) => ExecutionResult {
                    status: ExecutionStatus::Failed,
                    duration_ms: 0,
                    timed_out: false,
                    failure: Some(
                        SandboxError::InvalidState(format!("execution task failed: {}", err))
                            .to_failure(),
                    ),
                    values: Vec::new(),
                },
            };
            result.timed_out = timed_out && result.status == ExecutionStatus::Terminated;

            tracing::info!(
                execution_id = %id,
                status = ?result.status,
                duration_ms = result.duration_ms,
                "Execution finished"
            );
            tracked.state.write().await.finish(result.clone());
            let _ = result_tx.send(result);
        });

        Ok(ExecutionStream {
            id,
            stdout: stdout_rx,
            result: result_rx,
        })
    }

    /// Trip the termination flag of a running execution
    pub async fn stop(&self, id: ExecutionId) -> Result<()> {
        let executions = self.executions.read().await;
        let tracked = executions
            .get(&id)
            .ok_or_else(|| SandboxError::NotFound(format!("execution {}", id)))?;
        tracing::info!(execution_id = %id, "Stopping execution");
        tracked.flag.trip();
        Ok(())
    }

    /// Get execution state by ID
    pub async fn get_execution(&self, id: ExecutionId) -> Option<ExecutionState> {
        let tracked = self.executions.read().await.get(&id)?.clone();
        Some(tracked.snapshot().await)
    }

    /// List all tracked executions
    pub async fn list_executions(&self) -> Vec<ExecutionState> {
        let tracked: Vec<Tracked> = self.executions.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(tracked.len());
        for entry in tracked {
            states.push(entry.snapshot().await);
        }
        states
    }

    /// Forget finished executions
    pub async fn cleanup_completed(&self) {
        let mut executions = self.executions.write().await;
        executions.retain(|_, tracked| {
            tracked
                .state
                .try_read()
                .map(|s| !s.status.is_finished())
                .unwrap_or(true)
        });
    }

    pub fn engine_name(&self) -> Result<&'static str> {
        Ok(self.engines.active()?.name())
    }
}
