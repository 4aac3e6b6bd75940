use std::path::{Path, PathBuf};

/// Root under which per-execution workspaces are created.
pub struct WorkspaceRoot {
    base_dir: PathBuf,
}

impl WorkspaceRoot {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn workspace(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }
}

/// Per-execution workspace layout. The directory is owned by exactly one
/// execution and removed when it finishes.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    workspace: PathBuf,
}

impl WorkspacePaths {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The wrapped program handed to the interpreter.
    pub fn script(&self) -> PathBuf {
        self.workspace.join("script.py")
    }

    /// Scratch file the script may write to. Removed with the workspace.
    pub fn output(&self) -> PathBuf {
        self.workspace.join("output.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_named_after_session() {
        let root = WorkspaceRoot::new(PathBuf::from("/srv/sandbox"));
        assert_eq!(root.workspace("abc"), PathBuf::from("/srv/sandbox/abc"));
    }

    #[test]
    fn files_live_inside_workspace() {
        let paths = WorkspacePaths::new(PathBuf::from("/srv/sandbox/abc"));
        assert_eq!(paths.script(), PathBuf::from("/srv/sandbox/abc/script.py"));
        assert_eq!(paths.output(), PathBuf::from("/srv/sandbox/abc/output.txt"));
    }
}
