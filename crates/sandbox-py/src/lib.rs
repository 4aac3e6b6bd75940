mod command;
mod context;
mod harness;
mod hooks;
mod manager;
mod paths;
mod platform;
mod process;
mod registry;
mod sanitize;
mod supervisor;
mod validate;

pub use context::{ExecutionContext, validate_session_id};
pub use harness::{
    DEFAULT_BLOCKED_IMPORTS, DEFAULT_DENIED_EVENTS, DEFAULT_GUARDED_IMPORTS,
    DEFAULT_USER_FILE_EVENTS, HarnessOutput, HarnessPolicy, SAFE_STDLIB_IMPORTS, Stub,
    split_output, wrap,
};
pub use hooks::{ShutdownSignal, shutdown_on_signal};
pub use manager::{DEFAULT_REAP_INTERVAL, SandboxManager};
pub use paths::{WorkspacePaths, WorkspaceRoot};
pub use platform::Platform;
pub use process::{DirectKiller, GroupKiller, NoMemoryProbe, ProcMemoryProbe};
pub use registry::ExecutionRegistry;
pub use sanitize::{ERROR_TRUNCATED, OUTPUT_TRUNCATED, OutputSanitizer, clamp};
pub use validate::{DenyRule, default_rules, validate_script};
