use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the supervisor killed an execution. The first violation detected wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    MemoryLimit { observed: u64 },
    OutputLimit,
    Cancelled,
}

/// Outcome of one execution. Script failures, timeouts and limit violations
/// are reported here rather than as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    /// Bytes.
    pub memory_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<KillReason>,
}

/// Snapshot of one registered execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExecution {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub temp_dir: PathBuf,
}
