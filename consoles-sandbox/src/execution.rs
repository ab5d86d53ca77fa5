//! Execution tracking records

use crate::types::ExecutionResult;
use serde::{Deserialize, Serialize};

/// Unique execution identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    /// Stopped by the interrupt controller (timeout or `stop`)
    Terminated,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Snapshot of one tracked execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub program: String,
    pub status: ExecutionStatus,
    pub result: Option<ExecutionResult>,
    /// Bytes of output produced so far
    pub stdout_bytes: u64,
}

impl ExecutionState {
    pub fn new(id: ExecutionId, program: impl Into<String>) -> Self {
        Self {
            id,
            program: program.into(),
            status: ExecutionStatus::Running,
            result: None,
            stdout_bytes: 0,
        }
    }

    pub fn finish(&mut self, result: ExecutionResult) {
        self.status = result.status;
        self.result = Some(result);
    }
}
