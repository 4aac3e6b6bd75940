use std::collections::HashSet;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sandbox::{MemoryProbe, ProcessTreeKiller, SandboxError};
use tracing::{debug, trace};

use crate::command::exec;

/// Upper bound on descendants collected per kill; guards against a fork bomb
/// outrunning the walk.
const MAX_DESCENDANTS: usize = 4096;

fn to_pid(pid: u32) -> sandbox::Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| SandboxError::InvalidConfig(format!("pid out of range: {pid}")))
}

/// Send `sig`, treating "no such process" as success.
fn send(result: nix::Result<()>) -> sandbox::Result<()> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SandboxError::Io(std::io::Error::from(e))),
    }
}

/// Children of `pid` as reported by `pgrep -P`. Empty when there are none.
fn children_of(pid: u32) -> Vec<u32> {
    let pid_str = pid.to_string();
    match exec("pgrep", &["-P", &pid_str]) {
        Ok(stdout) => stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
        // pgrep exits 1 when nothing matches.
        Err(_) => Vec::new(),
    }
}

/// Breadth-first walk of the process tree rooted at `pid` (root excluded).
fn collect_descendants(pid: u32) -> Vec<u32> {
    let mut seen = HashSet::from([pid]);
    let mut queue = vec![pid];
    let mut out = Vec::new();
    while let Some(parent) = queue.pop() {
        for child in children_of(parent) {
            if out.len() >= MAX_DESCENDANTS {
                return out;
            }
            if seen.insert(child) {
                out.push(child);
                queue.push(child);
            }
        }
    }
    out
}

/// Kills the process group led by the child, plus any descendant that moved
/// to another group.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID.
pub struct GroupKiller {
    walk_descendants: bool,
}

impl GroupKiller {
    /// Descendant walking is enabled when `pgrep` is on the PATH.
    pub fn new() -> Self {
        Self {
            walk_descendants: which::which("pgrep").is_ok(),
        }
    }

    /// Whether this host lets us signal a whole process group. Checked by
    /// sending signal 0 to our own group.
    pub fn available() -> bool {
        signal::killpg(nix::unistd::getpgrp(), None).is_ok()
    }
}

impl Default for GroupKiller {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTreeKiller for GroupKiller {
    fn name(&self) -> &str {
        "process-group"
    }

    fn kill_tree(&self, pid: u32) -> sandbox::Result<()> {
        let root = to_pid(pid)?;
        // Collect first: once the leader dies its children are reparented
        // and `pgrep -P` can no longer find them.
        let descendants = if self.walk_descendants {
            collect_descendants(pid)
        } else {
            Vec::new()
        };

        send(signal::killpg(root, Signal::SIGKILL))?;
        for child in &descendants {
            let child = to_pid(*child)?;
            send(signal::kill(child, Signal::SIGKILL))?;
        }
        debug!(pid, descendants = descendants.len(), "killed process tree");
        Ok(())
    }
}

/// Signals the tracked process only. Used where process groups are not
/// available.
pub struct DirectKiller;

impl ProcessTreeKiller for DirectKiller {
    fn name(&self) -> &str {
        "direct"
    }

    fn kill_tree(&self, pid: u32) -> sandbox::Result<()> {
        send(signal::kill(to_pid(pid)?, Signal::SIGKILL))
    }
}

/// Resident set size from `/proc/<pid>/status`.
pub struct ProcMemoryProbe;

impl ProcMemoryProbe {
    pub fn available() -> bool {
        Path::new("/proc/self/status").exists()
    }
}

/// Parse the `VmRSS:` line (reported in kB) into bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kb.saturating_mul(1024))
}

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        let path = format!("/proc/{pid}/status");
        match std::fs::read_to_string(&path) {
            Ok(content) => parse_vm_rss(&content),
            Err(e) => {
                trace!(pid, error = %e, "memory probe read failed");
                None
            }
        }
    }

    fn is_supported(&self) -> bool {
        true
    }
}

/// Probe for platforms without a way to read another process's memory.
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn resident_bytes(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn is_supported(&self) -> bool {
        false
    }
}
