use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox::{MemoryProbe, ProcessTreeKiller, SandboxError};
use tracing::info;

use crate::process::{DirectKiller, GroupKiller, NoMemoryProbe, ProcMemoryProbe};

/// Interpreter names tried in order by [`Platform::detect`].
const INTERPRETER_CANDIDATES: &[&str] = &["python3", "python"];

/// Host capabilities the supervisor depends on.
#[derive(Clone)]
pub struct Platform {
    interpreter: PathBuf,
    killer: Arc<dyn ProcessTreeKiller>,
    probe: Arc<dyn MemoryProbe>,
}

impl Platform {
    /// Locate a Python interpreter on the PATH and pick the best available
    /// kill and memory strategies.
    pub fn detect() -> sandbox::Result<Self> {
        let interpreter = INTERPRETER_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                SandboxError::BackendNotAvailable(format!(
                    "no Python interpreter found (tried {})",
                    INTERPRETER_CANDIDATES.join(", ")
                ))
            })?;
        Ok(Self::with_interpreter(interpreter))
    }

    /// Use an explicit interpreter with the default host strategies.
    pub fn with_interpreter(interpreter: PathBuf) -> Self {
        Self::with_capabilities(
            interpreter,
            GroupKiller::available(),
            ProcMemoryProbe::available(),
        )
    }

    /// Pick strategies for a host with the given capabilities. Without group
    /// signalling only the tracked process is killed.
    fn with_capabilities(interpreter: PathBuf, group_kill: bool, proc_status: bool) -> Self {
        let killer: Arc<dyn ProcessTreeKiller> = if group_kill {
            Arc::new(GroupKiller::new())
        } else {
            Arc::new(DirectKiller)
        };
        let probe: Arc<dyn MemoryProbe> = if proc_status {
            Arc::new(ProcMemoryProbe)
        } else {
            Arc::new(NoMemoryProbe)
        };
        let platform = Self {
            interpreter,
            killer,
            probe,
        };
        info!(
            interpreter = %platform.interpreter.display(),
            killer = platform.killer.name(),
            memory_probe = platform.probe.is_supported(),
            "sandbox platform"
        );
        platform
    }

    pub fn with_killer(mut self, killer: Arc<dyn ProcessTreeKiller>) -> Self {
        self.killer = killer;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn killer(&self) -> &Arc<dyn ProcessTreeKiller> {
        &self.killer
    }

    pub fn probe(&self) -> &Arc<dyn MemoryProbe> {
        &self.probe
    }
}
