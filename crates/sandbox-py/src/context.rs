use std::io::ErrorKind;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sandbox::{ActiveExecution, ProcessTreeKiller, SandboxError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::paths::{WorkspacePaths, WorkspaceRoot};

const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids become directory names, so only a conservative alphabet is
/// accepted.
pub fn validate_session_id(session_id: &str) -> sandbox::Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidConfig(format!(
            "invalid session id: {session_id:?}"
        )))
    }
}

/// State for one in-flight execution.
///
/// Owns its workspace directory exclusively. The workspace is removed by
/// whichever of [`cleanup`](Self::cleanup) or
/// [`cleanup_blocking`](Self::cleanup_blocking) runs first; later calls are
/// no-ops.
pub struct ExecutionContext {
    session_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    paths: WorkspacePaths,
    pid: Mutex<Option<u32>>,
    cancel: CancellationToken,
    cleaned: AtomicBool,
}

impl ExecutionContext {
    /// Create a fresh workspace under `root` and write `source` into it.
    ///
    /// Fails if the workspace already exists: two executions never share a
    /// directory.
    pub async fn create(
        session_id: &str,
        root: &Path,
        source: &str,
        timeout: Duration,
    ) -> sandbox::Result<Self> {
        validate_session_id(session_id)?;
        let root = WorkspaceRoot::new(root.to_path_buf());
        tokio::fs::create_dir_all(root.dir()).await.map_err(|e| {
            SandboxError::Workspace(format!("create {}: {e}", root.dir().display()))
        })?;

        let paths = WorkspacePaths::new(root.workspace(session_id));
        tokio::fs::create_dir(paths.workspace()).await.map_err(|e| {
            SandboxError::Workspace(format!("create {}: {e}", paths.workspace().display()))
        })?;

        let ctx = Self {
            session_id: session_id.to_owned(),
            started_at: Utc::now(),
            started: Instant::now(),
            timeout,
            paths,
            pid: Mutex::new(None),
            cancel: CancellationToken::new(),
            cleaned: AtomicBool::new(false),
        };

        if let Err(e) = tokio::fs::write(ctx.paths.script(), source).await {
            ctx.cleanup().await;
            return Err(SandboxError::Workspace(format!(
                "write {}: {e}",
                ctx.paths.script().display()
            )));
        }
        debug!(session_id = %ctx.session_id, dir = %ctx.paths.workspace().display(), "workspace created");
        Ok(ctx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Older than twice its own timeout. The supervisor should have finished
    /// it long ago.
    pub fn is_stale(&self) -> bool {
        self.elapsed() > self.timeout.saturating_mul(2)
    }

    // -- process handle --

    pub fn attach_pid(&self, pid: u32) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = Some(pid);
        }
    }

    pub fn detach_pid(&self) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = None;
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.lock().ok().and_then(|slot| *slot)
    }

    /// Kill the attached process tree, if any.
    pub fn kill(&self, killer: &dyn ProcessTreeKiller) {
        if let Some(pid) = self.pid()
            && let Err(e) = killer.kill_tree(pid)
        {
            warn!(session_id = %self.session_id, pid, error = %e, "failed to kill process tree");
        }
    }

    // -- cancellation --

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    // -- cleanup --

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::fs::remove_dir_all(self.paths.workspace()).await {
            Ok(()) => debug!(session_id = %self.session_id, "workspace removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to remove workspace");
            }
        }
    }

    /// Blocking variant for `Drop` and signal paths with no runtime.
    pub fn cleanup_blocking(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        match std::fs::remove_dir_all(self.paths.workspace()) {
            Ok(()) => debug!(session_id = %self.session_id, "workspace removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to remove workspace");
            }
        }
    }

    pub fn snapshot(&self) -> ActiveExecution {
        ActiveExecution {
            session_id: self.session_id.clone(),
            start_time: self.started_at,
            duration_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            temp_dir: self.paths.workspace().to_path_buf(),
        }
    }
}
