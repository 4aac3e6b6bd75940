use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sandbox::{SandboxConfig, SandboxConfigOverride};
use sandbox_py::Platform;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
/// Role used when none is given or the given one is unknown.
pub(crate) const FALLBACK_ROLE: &str = "viewer";
pub(crate) const CONFIG_FILE_NAME: &str = "runner.yaml";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Interpreter to run scripts with. Detected from the PATH when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PathBuf>,
    /// Directory for per-execution log files. No logs are written when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// JSON file listing the sessions currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// Applied on top of the built-in defaults for every execution.
    #[serde(default)]
    pub sandbox: SandboxConfigOverride,
    /// Per-role limits, layered on top of `sandbox`.
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, SandboxConfigOverride>,
}

fn default_reap_interval() -> u64 {
    DEFAULT_REAP_INTERVAL_SECS
}

fn role(timeout_ms: u64, max_memory: u64, max_output_size: usize) -> SandboxConfigOverride {
    SandboxConfigOverride {
        timeout_ms: Some(timeout_ms),
        max_memory: Some(max_memory),
        max_output_size: Some(max_output_size),
        ..Default::default()
    }
}

fn default_roles() -> BTreeMap<String, SandboxConfigOverride> {
    const MIB: u64 = 1024 * 1024;
    BTreeMap::from([
        ("admin".to_string(), role(60_000, 256 * MIB, 2 * 1024 * 1024)),
        ("user".to_string(), role(30_000, 128 * MIB, 1024 * 1024)),
        (FALLBACK_ROLE.to_string(), role(15_000, 64 * MIB, 512 * 1024)),
    ])
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: None,
            log_dir: None,
            status_file: None,
            reap_interval_secs: DEFAULT_REAP_INTERVAL_SECS,
            sandbox: SandboxConfigOverride::default(),
            roles: default_roles(),
        }
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Write `config` as `runner.yaml` inside `dir`, refusing to replace an
/// existing file unless `force` is set. Returns the path written.
pub async fn generate(config: &RunnerConfig, dir: &Path, force: bool) -> RunnerResult<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RunnerError::Config(format!("create {}: {e}", dir.display())))?;

    let config_path = dir.join(CONFIG_FILE_NAME);
    if !force
        && tokio::fs::try_exists(&config_path)
            .await
            .map_err(|e| RunnerError::Config(format!("check {}: {e}", config_path.display())))?
    {
        return Err(RunnerError::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| RunnerError::Config(format!("serialize config: {e}")))?;
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| RunnerError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    ///
    /// A bare interpreter name such as `python3` is left for PATH lookup.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        if let Some(python) = &mut self.python
            && python.components().count() > 1
        {
            resolve(python);
        }
        if let Some(dir) = &mut self.log_dir {
            resolve(dir);
        }
        if let Some(file) = &mut self.status_file {
            resolve(file);
        }
        if let Some(dir) = &mut self.sandbox.temp_directory {
            resolve(dir);
        }
        for over in self.roles.values_mut() {
            if let Some(dir) = &mut over.temp_directory {
                resolve(dir);
            }
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.reap_interval_secs == 0 {
            return Err(RunnerError::Config(
                "reap_interval_secs must be greater than zero".into(),
            ));
        }
        let base = self.sandbox_config();
        base.validate()
            .map_err(|e| RunnerError::Config(format!("sandbox: {e}")))?;
        for (name, over) in &self.roles {
            over.apply(&base)
                .validate()
                .map_err(|e| RunnerError::Config(format!("roles.{name}: {e}")))?;
        }
        Ok(())
    }

    /// Built-in defaults with the `sandbox` section applied.
    pub fn sandbox_config(&self) -> SandboxConfig {
        self.sandbox.apply(&SandboxConfig::default())
    }

    /// Limits for `role`. Unknown roles get the most restrictive built-in
    /// role rather than the base policy.
    pub fn role_override(&self, role: &str) -> SandboxConfigOverride {
        if let Some(over) = self.roles.get(role) {
            return over.clone();
        }
        warn!(role, fallback = FALLBACK_ROLE, "unknown role");
        self.roles
            .get(FALLBACK_ROLE)
            .cloned()
            .unwrap_or_else(|| default_roles().remove(FALLBACK_ROLE).unwrap_or_default())
    }

    pub fn platform(&self) -> RunnerResult<Platform> {
        match &self.python {
            Some(python) => Ok(Platform::with_interpreter(python.clone())),
            None => Ok(Platform::detect()?),
        }
    }
}
