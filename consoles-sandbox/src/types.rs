//! Request and result types for the execution service

use crate::error::ScriptFailure;
use crate::execution::{ExecutionId, ExecutionStatus};
use crate::program::Program;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Request to run one program in a fresh sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Name the program is reported under
    pub name: String,

    /// Program source
    pub source: String,

    /// Passed to the program as varargs
    #[serde(default)]
    pub args: Vec<String>,

    /// Published capability libraries to attach
    #[serde(default)]
    pub libraries: Vec<String>,

    /// Optional stdin input
    pub stdin: Option<String>,

    /// Overrides the service's default timeout
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Load the withheld libraries before running
    #[serde(default)]
    pub unrestricted: bool,
}

impl ExecutionRequest {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            args: Vec::new(),
            libraries: Vec::new(),
            stdin: None,
            timeout: None,
            unrestricted: false,
        }
    }

    pub fn from_program(program: &Program) -> Self {
        Self::new(program.name(), program.source())
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.libraries.push(library.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn unrestricted(mut self) -> Self {
        self.unrestricted = true;
        self
    }

    pub fn program(&self) -> Program {
        Program::new(&self.name, &self.source)
    }
}

/// Streaming execution output
pub struct ExecutionStream {
    /// Handle for `SandboxService::stop`
    pub id: ExecutionId,

    /// Output chunks as the program writes them
    pub stdout: mpsc::Receiver<Vec<u8>>,

    /// Final result when execution completes
    pub result: tokio::sync::oneshot::Receiver<ExecutionResult>,
}

impl ExecutionStream {
    /// Drain the output and wait for the result.
    pub async fn collect(mut self) -> (Vec<u8>, Option<ExecutionResult>) {
        let mut stdout = Vec::new();
        while let Some(chunk) = self.stdout.recv().await {
            stdout.extend(chunk);
        }
        (stdout, self.result.await.ok())
    }
}

/// Result of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,

    /// Execution duration in milliseconds
    pub duration_ms: u64,

    /// Whether the timeout watchdog stopped the run
    pub timed_out: bool,

    /// Structured failure for failed and terminated runs
    pub failure: Option<ScriptFailure>,

    /// The program's return values, stringified
    #[serde(default)]
    pub values: Vec<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}
