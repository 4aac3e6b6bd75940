use crate::error::Result;

/// Terminates a process together with every descendant it spawned.
pub trait ProcessTreeKiller: Send + Sync {
    /// Human-readable name for this strategy (e.g. "process-group").
    fn name(&self) -> &str;
    /// Kill `pid` and its descendants. A process that already exited is not
    /// an error.
    fn kill_tree(&self, pid: u32) -> Result<()>;
}

/// Reads the resident memory of a running process.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the process is gone or the platform has no way to tell.
    fn resident_bytes(&self, pid: u32) -> Option<u64>;
    /// `false` disables memory polling entirely.
    fn is_supported(&self) -> bool;
}
