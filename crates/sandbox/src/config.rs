use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_MEMORY: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_CPU: u8 = 50;
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

/// Modules a user script may import in addition to the harness's vetted
/// standard-library set.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "pandas",
    "numpy",
    "matplotlib",
    "seaborn",
    "scipy",
    "sklearn",
    "plotly",
    "math",
    "json",
    "csv",
    "re",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "operator",
];

/// Policy for a single execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    /// Address-space ceiling in bytes.
    pub max_memory: u64,
    /// CPU share in percent. Advisory only.
    pub max_cpu: u8,
    pub allowed_modules: Vec<String>,
    /// Root under which per-execution workspaces are created.
    pub temp_directory: PathBuf,
    /// Ceiling for each of stdout and stderr, in bytes.
    pub max_output_size: usize,
    /// Maximum script size in bytes.
    pub max_file_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_memory: DEFAULT_MAX_MEMORY,
            max_cpu: DEFAULT_MAX_CPU,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            temp_directory: cwd.join("temp").join("sandbox"),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SandboxError::InvalidConfig(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_output_size == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_size must be greater than zero".into(),
            ));
        }
        if self.temp_directory.as_os_str().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "temp_directory must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Partial policy. Unset fields inherit from the base config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfigOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<usize>,
}

impl SandboxConfigOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Produce the effective config: fields set here win over `base`.
    pub fn apply(&self, base: &SandboxConfig) -> SandboxConfig {
        SandboxConfig {
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_memory: self.max_memory.unwrap_or(base.max_memory),
            max_cpu: self.max_cpu.unwrap_or(base.max_cpu),
            allowed_modules: self
                .allowed_modules
                .clone()
                .unwrap_or_else(|| base.allowed_modules.clone()),
            temp_directory: self
                .temp_directory
                .clone()
                .unwrap_or_else(|| base.temp_directory.clone()),
            max_output_size: self.max_output_size.unwrap_or(base.max_output_size),
            max_file_size: self.max_file_size.unwrap_or(base.max_file_size),
        }
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(&self, other: &SandboxConfigOverride) -> SandboxConfigOverride {
        SandboxConfigOverride {
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            max_memory: other.max_memory.or(self.max_memory),
            max_cpu: other.max_cpu.or(self.max_cpu),
            allowed_modules: other
                .allowed_modules
                .clone()
                .or_else(|| self.allowed_modules.clone()),
            temp_directory: other
                .temp_directory
                .clone()
                .or_else(|| self.temp_directory.clone()),
            max_output_size: other.max_output_size.or(self.max_output_size),
            max_file_size: other.max_file_size.or(self.max_file_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_memory, 134_217_728);
        assert_eq!(config.max_cpu, 50);
        assert_eq!(config.max_output_size, 1_048_576);
        assert_eq!(config.max_file_size, 104_857_600);
        assert!(config.allowed_modules.iter().any(|m| m == "pandas"));
        assert!(config.temp_directory.ends_with("temp/sandbox"));
        config.validate().unwrap();
    }

    #[test]
    fn apply_overrides_only_set_fields() {
        let base = SandboxConfig::default();
        let over = SandboxConfigOverride {
            timeout_ms: Some(1_000),
            max_output_size: Some(64),
            ..Default::default()
        };

        let effective = over.apply(&base);
        assert_eq!(effective.timeout_ms, 1_000);
        assert_eq!(effective.max_output_size, 64);
        assert_eq!(effective.max_memory, base.max_memory);
        assert_eq!(effective.temp_directory, base.temp_directory);
    }

    #[test]
    fn merge_prefers_later_layer() {
        let role = SandboxConfigOverride {
            timeout_ms: Some(15_000),
            max_memory: Some(64 * 1024 * 1024),
            ..Default::default()
        };
        let cli = SandboxConfigOverride {
            timeout_ms: Some(500),
            ..Default::default()
        };

        let merged = role.merge(&cli);
        assert_eq!(merged.timeout_ms, Some(500));
        assert_eq!(merged.max_memory, Some(64 * 1024 * 1024));
        assert!(merged.max_output_size.is_none());
    }

    #[test]
    fn empty_override_is_identity() {
        let base = SandboxConfig::default();
        let over = SandboxConfigOverride::default();
        assert!(over.is_empty());
        assert_eq!(over.apply(&base), base);
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let config = SandboxConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms"), "got: {err}");
    }

    #[test]
    fn validate_rejects_zero_output_ceiling() {
        let config = SandboxConfig {
            max_output_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SandboxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn override_rejects_unknown_fields() {
        let json = r#"{"timeout_ms": 10, "bogus": true}"#;
        let result: std::result::Result<SandboxConfigOverride, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
