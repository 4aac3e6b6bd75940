use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sandbox::{SandboxConfigOverride, SandboxResult};
use tokio::io::AsyncWriteExt;

use crate::error::{RunnerError, RunnerResult};

/// ISO 8601 with millisecond precision, matching JS `Date.toISOString()`.
pub(crate) fn iso(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Per-execution log file. Every line is prefixed with a timestamp; script
/// errors additionally carry `ERROR:`.
pub struct ExecutionLog {
    path: PathBuf,
    file: tokio::fs::File,
}

impl ExecutionLog {
    /// Create `<dir>/<script>_<timestamp>_<session>.log`. Never reuses an
    /// existing file.
    pub async fn create(dir: &Path, script_name: &str, session_id: &str) -> RunnerResult<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| RunnerError::Internal(format!("create {}: {e}", dir.display())))?;
        let stamp = iso(&Utc::now()).replace([':', '.'], "-");
        let path = dir.join(format!("{script_name}_{stamp}_{session_id}.log"));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| RunnerError::Internal(format!("create {}: {e}", path.display())))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, text: &str) -> RunnerResult<()> {
        let line = format!("[{}] {text}\n", iso(&Utc::now()));
        self.file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn header(
        &mut self,
        user: &str,
        role: &str,
        overrides: &SandboxConfigOverride,
        script_name: &str,
    ) -> RunnerResult<()> {
        let config = serde_json::to_string(overrides)
            .map_err(|e| RunnerError::Internal(format!("serialize config: {e}")))?;
        self.write("Starting secure script execution").await?;
        self.write(&format!("User: {user} ({role})")).await?;
        self.write(&format!("Sandbox Config: {config}")).await?;
        self.write(&format!("Script: {script_name}")).await
    }

    pub async fn warning(&mut self, message: &str) -> RunnerResult<()> {
        self.write(&format!("WARNING: {message}")).await
    }

    pub async fn error(&mut self, message: &str) -> RunnerResult<()> {
        for line in message.split('\n').filter(|l| !l.trim().is_empty()) {
            self.write(&format!("ERROR: {line}")).await?;
        }
        Ok(())
    }

    /// Append the script's output and errors, blank lines dropped.
    pub async fn record(&mut self, result: &SandboxResult) -> RunnerResult<()> {
        for line in result.output.split('\n').filter(|l| !l.trim().is_empty()) {
            self.write(line).await?;
        }
        if let Some(error) = &result.error {
            self.error(error).await?;
        }
        self.write(&format!(
            "Finished: success={} exit_code={} runtime_ms={} memory_used={}",
            result.success,
            result
                .exit_code
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            result.execution_time_ms,
            result.memory_used,
        ))
        .await
    }

    pub async fn close(mut self) -> RunnerResult<()> {
        self.file.flush().await?;
        Ok(())
    }
}
