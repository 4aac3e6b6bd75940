use std::path::PathBuf;

use clap::Args;
use sandbox::SandboxConfigOverride;
use tracing::info;

use crate::config::{self, RunnerConfig};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct InitArgs {
    /// Directory to write runner.yaml into
    #[arg(default_value = ".")]
    dir: PathBuf,
    /// Overwrite an existing runner.yaml
    #[arg(long)]
    force: bool,
}

/// Starting config. Paths are relative so the directory can be moved.
fn starter_config() -> RunnerConfig {
    RunnerConfig {
        log_dir: Some(PathBuf::from("logs")),
        status_file: Some(PathBuf::from("status.json")),
        sandbox: SandboxConfigOverride {
            temp_directory: Some(PathBuf::from("work")),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn run_init(args: InitArgs) -> RunnerResult<()> {
    let path = config::generate(&starter_config(), &args.dir, args.force).await?;
    info!(path = %path.display(), "config written");
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        run_init(InitArgs {
            dir: dir.path().to_path_buf(),
            force: false,
        })
        .await
        .unwrap();

        let loaded = config::load(&dir.path().join("runner.yaml")).await.unwrap();
        assert_eq!(loaded.log_dir, Some(dir.path().join("logs")));
        assert_eq!(loaded.status_file, Some(dir.path().join("status.json")));
        assert_eq!(loaded.sandbox_config().temp_directory, dir.path().join("work"));
        assert_eq!(loaded.roles.len(), 3);
    }
}
