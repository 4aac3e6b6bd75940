use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox::{
    ActiveExecution, ProcessTreeKiller, SandboxConfig, SandboxConfigOverride, SandboxError,
    SandboxResult, ScriptExecutor,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{ExecutionContext, validate_session_id};
use crate::harness::{self, HarnessPolicy};
use crate::platform::Platform;
use crate::registry::ExecutionRegistry;
use crate::sanitize::OutputSanitizer;
use crate::supervisor::{build_result, supervise};
use crate::validate::{DenyRule, default_rules, validate_script};

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Removes the execution from the registry and deletes its workspace on every
/// exit path, including the caller dropping the future mid-run.
struct ExecutionGuard<'a> {
    ctx: &'a Arc<ExecutionContext>,
    registry: &'a ExecutionRegistry,
    killer: &'a dyn ProcessTreeKiller,
    armed: bool,
}

impl ExecutionGuard<'_> {
    async fn finish(mut self) {
        self.armed = false;
        self.registry.remove_if_same(self.ctx);
        self.ctx.cleanup().await;
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(session_id = %self.ctx.session_id(), "execution abandoned, cleaning up");
        self.ctx.kill(self.killer);
        self.registry.remove_if_same(self.ctx);
        self.ctx.cleanup_blocking();
    }
}

/// Runs untrusted Python scripts, one isolated workspace and process group
/// per execution.
///
/// Share via `Arc<SandboxManager>`. Dropping the last reference kills and
/// cleans up anything still registered.
pub struct SandboxManager {
    config: RwLock<SandboxConfig>,
    platform: Platform,
    registry: ExecutionRegistry,
    sanitizer: OutputSanitizer,
    rules: Vec<DenyRule>,
    shutdown: CancellationToken,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, platform: Platform) -> sandbox::Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            platform,
            registry: ExecutionRegistry::new(),
            sanitizer: OutputSanitizer::new(),
            rules: default_rules().to_vec(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the pre-flight rules.
    pub fn with_rules(mut self, rules: Vec<DenyRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    // -- policy --

    pub fn config(&self) -> SandboxConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Merge `overrides` into the default policy. Executions already running
    /// keep the policy they started with.
    pub fn update_config(&self, overrides: &SandboxConfigOverride) -> sandbox::Result<()> {
        let mut config = self
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let updated = overrides.apply(&config);
        updated.validate()?;
        info!(timeout_ms = updated.timeout_ms, max_memory = updated.max_memory, "sandbox config updated");
        *config = updated;
        Ok(())
    }

    // -- operations --

    /// Run `script` under a fresh session id.
    pub async fn execute_script(
        &self,
        script: &str,
        overrides: &SandboxConfigOverride,
    ) -> sandbox::Result<SandboxResult> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.execute_script_with_id(&session_id, script, overrides)
            .await
    }

    /// Run `script` under a caller-chosen session id, which can be passed to
    /// [`kill_execution`](Self::kill_execution) from another task.
    ///
    /// Rejected scripts and host failures are errors. Anything that happens to
    /// a script once it runs is reported in the result.
    pub async fn execute_script_with_id(
        &self,
        session_id: &str,
        script: &str,
        overrides: &SandboxConfigOverride,
    ) -> sandbox::Result<SandboxResult> {
        let started = Instant::now();
        if self.shutdown.is_cancelled() {
            return Err(SandboxError::BackendNotAvailable(
                "sandbox manager is shutting down".into(),
            ));
        }

        let config = overrides.apply(&self.config());
        config.validate()?;
        validate_session_id(session_id)?;
        if let Err(e) = validate_script(script, &config, &self.rules) {
            info!(session_id, error = %e, "script rejected");
            return Err(e);
        }
        if self.registry.contains(session_id) {
            return Err(SandboxError::SessionExists(session_id.to_owned()));
        }

        let source = harness::wrap(script, &HarnessPolicy::from_config(&config));
        let ctx = Arc::new(
            ExecutionContext::create(
                session_id,
                &config.temp_directory,
                &source,
                config.timeout(),
            )
            .await?,
        );
        if let Err(e) = self.registry.insert(Arc::clone(&ctx)) {
            ctx.cleanup().await;
            return Err(e);
        }

        let guard = ExecutionGuard {
            ctx: &ctx,
            registry: &self.registry,
            killer: self.platform.killer().as_ref(),
            armed: true,
        };
        let outcome = supervise(&ctx, &config, &self.platform).await;
        guard.finish().await;

        let outcome = outcome?;
        let result = build_result(&outcome, &config, &self.sanitizer, started.elapsed());
        info!(
            session_id,
            success = result.success,
            execution_time_ms = result.execution_time_ms,
            memory_used = result.memory_used,
            "execution complete"
        );
        Ok(result)
    }

    /// Terminate a registered execution and delete its workspace.
    ///
    /// Returns `false` for unknown or already finished ids; calling it twice
    /// is harmless.
    pub async fn kill_execution(&self, session_id: &str) -> bool {
        let Some(ctx) = self.registry.remove(session_id) else {
            return false;
        };
        info!(session_id, "killing execution on request");
        ctx.cancel();
        ctx.kill(self.platform.killer().as_ref());
        ctx.cleanup().await;
        true
    }

    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        self.registry.snapshot()
    }

    /// Kill and clean up executions older than twice their timeout.
    pub async fn reap_stale(&self) -> usize {
        let stale = self.registry.drain_stale();
        for ctx in &stale {
            warn!(
                session_id = %ctx.session_id(),
                age_ms = ctx.elapsed().as_millis(),
                "reaping stale execution"
            );
            ctx.cancel();
            ctx.kill(self.platform.killer().as_ref());
            ctx.cleanup().await;
        }
        stale.len()
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval` until the
    /// manager shuts down or is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // The first tick fires immediately; nothing can be stale yet.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        let reaped = manager.reap_stale().await;
                        if reaped > 0 {
                            info!(reaped, "stale executions reaped");
                        }
                    }
                }
            }
        })
    }

    /// Kill and clean up everything still registered, and refuse new work.
    ///
    /// Blocking, so it can run from `Drop` and signal handlers.
    pub fn cleanup_all(&self) -> usize {
        self.shutdown.cancel();
        let contexts = self.registry.drain_all();
        for ctx in &contexts {
            ctx.cancel();
            ctx.kill(self.platform.killer().as_ref());
            ctx.cleanup_blocking();
        }
        if !contexts.is_empty() {
            info!(count = contexts.len(), "cleaned up active executions");
        }
        contexts.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

#[async_trait]
impl ScriptExecutor for SandboxManager {
    fn name(&self) -> &str {
        "python"
    }

    fn config(&self) -> SandboxConfig {
        SandboxManager::config(self)
    }

    fn update_config(&self, overrides: &SandboxConfigOverride) -> sandbox::Result<()> {
        SandboxManager::update_config(self, overrides)
    }

    async fn execute_script_with_id(
        &self,
        session_id: &str,
        script: &str,
        overrides: &SandboxConfigOverride,
    ) -> sandbox::Result<SandboxResult> {
        SandboxManager::execute_script_with_id(self, session_id, script, overrides).await
    }

    async fn kill_execution(&self, session_id: &str) -> bool {
        SandboxManager::kill_execution(self, session_id).await
    }

    fn active_executions(&self) -> Vec<ActiveExecution> {
        SandboxManager::active_executions(self)
    }
}
