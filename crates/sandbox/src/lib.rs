mod config;
mod error;
mod executor;
mod process;
mod types;

pub use config::{
    DEFAULT_ALLOWED_MODULES, DEFAULT_MAX_CPU, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_MEMORY,
    DEFAULT_MAX_OUTPUT_SIZE, DEFAULT_TIMEOUT_MS, SandboxConfig, SandboxConfigOverride,
};
pub use error::{Result, SandboxError};
pub use executor::ScriptExecutor;
pub use process::{MemoryProbe, ProcessTreeKiller};
pub use types::{ActiveExecution, KillReason, SandboxResult};
