mod check;
mod init;
mod run;

use std::path::{Path, PathBuf};

pub use check::{CheckArgs, run_check};
pub use init::{InitArgs, run_init};
pub use run::{RunArgs, run_run};

use crate::config::{self, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};

/// A script read from disk, named after its file stem.
struct ScriptFile {
    path: PathBuf,
    name: String,
    source: String,
}

async fn read_script(path: &Path) -> RunnerResult<ScriptFile> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Script {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string());
    Ok(ScriptFile {
        path: path.to_path_buf(),
        name,
        source,
    })
}

async fn load_config(path: Option<&Path>) -> RunnerResult<RunnerConfig> {
    match path {
        Some(path) => config::load(path).await,
        None => Ok(RunnerConfig::default()),
    }
}
