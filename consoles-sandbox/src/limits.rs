//! Resource limits for sandbox instances

use serde::{Deserialize, Serialize};

/// Heap and step-check limits applied to one sandbox instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Maximum interpreter heap in bytes (None = unbounded)
    pub max_memory_bytes: Option<usize>,

    /// Interpreted instructions between two termination checks
    pub instructions_per_check: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: Some(64 * 1024 * 1024), // 64 MB default
            instructions_per_check: 1_000,
        }
    }
}

impl SandboxLimits {
    /// No heap bound (dangerous!)
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: None,
            instructions_per_check: 10_000,
        }
    }

    /// Tight limits for untrusted programs
    pub fn strict() -> Self {
        Self {
            max_memory_bytes: Some(8 * 1024 * 1024), // 8 MB
            instructions_per_check: 100,
        }
    }

    /// Loose limits for trusted programs
    pub fn permissive() -> Self {
        Self {
            max_memory_bytes: Some(512 * 1024 * 1024), // 512 MB
            instructions_per_check: 10_000,
        }
    }

    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Zero is treated as one: every instruction is checked.
    pub fn with_instructions_per_check(mut self, instructions: u32) -> Self {
        self.instructions_per_check = instructions.max(1);
        self
    }
}
