use async_trait::async_trait;

use crate::config::{SandboxConfig, SandboxConfigOverride};
use crate::error::Result;
use crate::types::{ActiveExecution, SandboxResult};

/// Runs untrusted scripts under a sandbox policy.
///
/// Callers hold this as `Arc<dyn ScriptExecutor>` so the backend can be
/// swapped (or faked in tests) without touching the call sites.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Human-readable name for this backend (e.g. "python").
    fn name(&self) -> &str;

    // -- policy --
    fn config(&self) -> SandboxConfig;
    /// Merge `overrides` into the default policy used by later executions.
    fn update_config(&self, overrides: &SandboxConfigOverride) -> Result<()>;

    // -- operations --
    /// Validate, run and clean up one script under `base config + overrides`.
    async fn execute_script_with_id(
        &self,
        session_id: &str,
        script: &str,
        overrides: &SandboxConfigOverride,
    ) -> Result<SandboxResult>;
    /// Terminate a registered execution. `false` if the id is unknown.
    async fn kill_execution(&self, session_id: &str) -> bool;
    fn active_executions(&self) -> Vec<ActiveExecution>;
}
