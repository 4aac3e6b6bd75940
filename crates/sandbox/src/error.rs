#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("script size {size} exceeds maximum allowed size of {limit} bytes")]
    ScriptTooLarge { size: usize, limit: usize },

    #[error("script rejected ({rule}) at line {line}: matched {pattern}")]
    ScriptRejected {
        rule: String,
        pattern: String,
        line: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session already registered: {0}")]
    SessionExists(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// The script itself was refused; nothing was written or spawned.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SandboxError::ScriptTooLarge { .. } | SandboxError::ScriptRejected { .. }
        )
    }

    /// Host-side failure unrelated to the script's content.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            SandboxError::Workspace(_)
                | SandboxError::SpawnFailed(_)
                | SandboxError::BackendNotAvailable(_)
                | SandboxError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_script_is_validation_error() {
        let err = SandboxError::ScriptRejected {
            rule: "disallowed import".into(),
            pattern: "import os".into(),
            line: 3,
        };
        assert!(err.is_validation());
        assert!(!err.is_system());
        assert_eq!(
            err.to_string(),
            "script rejected (disallowed import) at line 3: matched import os"
        );
    }

    #[test]
    fn spawn_failure_is_system_error() {
        let err = SandboxError::SpawnFailed("python3: not found".into());
        assert!(err.is_system());
        assert!(!err.is_validation());
    }
}
