use std::process::Stdio;
use std::time::Duration;

use sandbox::{KillReason, SandboxConfig, SandboxError, SandboxResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::harness::split_output;
use crate::platform::Platform;
use crate::sanitize::{ERROR_TRUNCATED, OUTPUT_TRUNCATED, OutputSanitizer, clamp};

const READ_CHUNK: usize = 8 * 1024;
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to keep draining pipes and waiting for exit after a kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Byte buffer with a hard ceiling.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `chunk`, dropping whatever exceeds the ceiling. Returns `true`
    /// only on the call that first crosses it.
    fn push(&mut self, chunk: &[u8]) -> bool {
        if self.truncated {
            return false;
        }
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() <= room {
            self.buf.extend_from_slice(chunk);
            return false;
        }
        self.buf.extend_from_slice(chunk.get(..room).unwrap_or_default());
        self.truncated = true;
        true
    }
}

/// What the supervisor observed, before parsing and sanitization.
#[derive(Debug, Default)]
pub struct RawOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// `None` when the process died from a signal or could not be reaped.
    pub exit_code: Option<i32>,
    pub kill_reason: Option<KillReason>,
    /// Peak resident memory seen by the OS probe.
    pub peak_memory: Option<u64>,
}

/// Kill bookkeeping. The first reason recorded wins.
struct KillState {
    reason: Option<KillReason>,
    grace_until: Option<Instant>,
}

impl KillState {
    fn trigger(&mut self, reason: KillReason, ctx: &ExecutionContext, platform: &Platform) {
        if self.reason.is_some() {
            return;
        }
        warn!(session_id = %ctx.session_id(), reason = ?reason, "killing script");
        self.reason = Some(reason);
        self.grace_until = Some(Instant::now() + KILL_GRACE);
        ctx.kill(platform.killer().as_ref());
    }
}

/// Read one chunk, or pend forever once the pipe is gone.
async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Sleep until `at`, or pend forever if unset.
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawn the wrapped script in `ctx`'s workspace and watch it until it exits
/// or is killed.
///
/// Only spawn failures are errors; everything that happens to a running
/// script is reported in the outcome.
pub async fn supervise(
    ctx: &ExecutionContext,
    config: &SandboxConfig,
    platform: &Platform,
) -> sandbox::Result<RawOutcome> {
    if ctx.cancellation().is_cancelled() {
        return Ok(RawOutcome {
            kill_reason: Some(KillReason::Cancelled),
            ..Default::default()
        });
    }

    let mut child = Command::new(platform.interpreter())
        .arg("-I")
        .arg("-B")
        .arg("-u")
        .arg(ctx.paths().script())
        .current_dir(ctx.paths().workspace())
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
        .map_err(|e| {
            SandboxError::SpawnFailed(format!("{}: {e}", platform.interpreter().display()))
        })?;

    let pid = child
        .id()
        .ok_or_else(|| SandboxError::SpawnFailed("child exited before pid was read".into()))?;
    ctx.attach_pid(pid);
    info!(session_id = %ctx.session_id(), pid, "script started");

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out = Capture::new(config.max_output_size);
    let mut err = Capture::new(config.max_output_size);
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];

    let deadline = Instant::now() + config.timeout();
    let mut memory_tick = tokio::time::interval(MEMORY_POLL_INTERVAL);
    memory_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let probe_enabled = platform.probe().is_supported() && config.max_memory > 0;
    let mut peak_memory: Option<u64> = None;
    let mut kill = KillState {
        reason: None,
        grace_until: None,
    };

    // Phase 1: pump both pipes until they close.
    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut out_buf) => match n {
                Ok(n) if n > 0 => {
                    let chunk = out_buf.get(..n).unwrap_or_default();
                    if out.push(chunk) && !matches!(child.try_wait(), Ok(Some(_))) {
                        kill.trigger(KillReason::OutputLimit, ctx, platform);
                    }
                }
                Ok(_) => stdout = None,
                Err(e) => {
                    warn!(session_id = %ctx.session_id(), error = %e, "stdout read failed");
                    stdout = None;
                }
            },
            n = read_chunk(&mut stderr, &mut err_buf) => match n {
                Ok(n) if n > 0 => {
                    let chunk = err_buf.get(..n).unwrap_or_default();
                    if err.push(chunk) && !matches!(child.try_wait(), Ok(Some(_))) {
                        kill.trigger(KillReason::OutputLimit, ctx, platform);
                    }
                }
                Ok(_) => stderr = None,
                Err(e) => {
                    warn!(session_id = %ctx.session_id(), error = %e, "stderr read failed");
                    stderr = None;
                }
            },
            _ = tokio::time::sleep_until(deadline), if kill.reason.is_none() => {
                kill.trigger(KillReason::Timeout, ctx, platform);
            }
            _ = memory_tick.tick(), if probe_enabled && kill.reason.is_none() => {
                if let Some(rss) = platform.probe().resident_bytes(pid) {
                    peak_memory = Some(peak_memory.map_or(rss, |p| p.max(rss)));
                    if rss > config.max_memory {
                        kill.trigger(KillReason::MemoryLimit { observed: rss }, ctx, platform);
                    }
                }
            }
            _ = ctx.cancellation().cancelled(), if kill.reason.is_none() => {
                kill.trigger(KillReason::Cancelled, ctx, platform);
            }
            _ = sleep_until_opt(kill.grace_until) => {
                // An escaped descendant is holding the pipes open.
                debug!(session_id = %ctx.session_id(), "pipes still open after kill, giving up");
                break;
            }
        }
    }

    // Phase 2: reap. The deadline still applies to a process that closed its
    // pipes but kept running.
    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            _ = tokio::time::sleep_until(deadline), if kill.reason.is_none() => {
                kill.trigger(KillReason::Timeout, ctx, platform);
            }
            _ = ctx.cancellation().cancelled(), if kill.reason.is_none() => {
                kill.trigger(KillReason::Cancelled, ctx, platform);
            }
            _ = sleep_until_opt(kill.grace_until) => {
                warn!(session_id = %ctx.session_id(), pid, "process did not exit after kill");
                break None;
            }
        }
    };
    ctx.detach_pid();
    // The kill can close the pipes and reap the child before the select
    // above ever polls the cancellation branch.
    if kill.reason.is_none() && ctx.cancellation().is_cancelled() {
        kill.reason = Some(KillReason::Cancelled);
    }

    let exit_code = status.and_then(|s| s.code());
    info!(
        session_id = %ctx.session_id(),
        exit_code = ?exit_code,
        killed = kill.reason.is_some(),
        "script finished"
    );

    Ok(RawOutcome {
        stdout: out.buf,
        stderr: err.buf,
        stdout_truncated: out.truncated,
        stderr_truncated: err.truncated,
        exit_code,
        kill_reason: kill.reason,
        peak_memory,
    })
}

/// Sanitize `text`, then enforce the ceiling. A stream that was already cut
/// while reading always carries the marker.
fn finish_stream(
    sanitizer: &OutputSanitizer,
    text: &str,
    limit: usize,
    truncated: bool,
    marker: &str,
) -> String {
    let mut out = clamp(&sanitizer.sanitize(text), limit, marker);
    if truncated && !out.ends_with(marker) {
        out.push_str(marker);
    }
    out
}

fn kill_message(reason: KillReason, config: &SandboxConfig) -> String {
    match reason {
        KillReason::Timeout => format!("Execution timed out after {}ms", config.timeout_ms),
        KillReason::MemoryLimit { observed } => format!(
            "Memory limit exceeded: {observed} bytes (limit {} bytes)",
            config.max_memory
        ),
        KillReason::OutputLimit => format!(
            "Output size limit exceeded ({} bytes)",
            config.max_output_size
        ),
        KillReason::Cancelled => "Execution killed on request".to_string(),
    }
}

/// Turn a raw outcome into the caller-facing result.
pub fn build_result(
    outcome: &RawOutcome,
    config: &SandboxConfig,
    sanitizer: &OutputSanitizer,
    elapsed: Duration,
) -> SandboxResult {
    let report = split_output(&String::from_utf8_lossy(&outcome.stdout));
    let limit = config.max_output_size;

    let output = finish_stream(
        sanitizer,
        &report.stdout,
        limit,
        outcome.stdout_truncated,
        OUTPUT_TRUNCATED,
    );

    let mut script_errors = report.stderr;
    let interpreter_errors = String::from_utf8_lossy(&outcome.stderr);
    if !interpreter_errors.trim().is_empty() {
        if !script_errors.is_empty() && !script_errors.ends_with('\n') {
            script_errors.push('\n');
        }
        script_errors.push_str(&interpreter_errors);
    }
    let script_errors = finish_stream(
        sanitizer,
        script_errors.trim_end(),
        limit,
        outcome.stderr_truncated,
        ERROR_TRUNCATED,
    );

    let killed = outcome.kill_reason.is_some();
    let timed_out = matches!(outcome.kill_reason, Some(KillReason::Timeout));
    let success = outcome.exit_code == Some(0) && !killed;

    let mut parts = Vec::new();
    if let Some(reason) = outcome.kill_reason {
        parts.push(kill_message(reason, config));
    }
    if !script_errors.is_empty() {
        parts.push(script_errors);
    } else if !success && !killed {
        parts.push(match outcome.exit_code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process terminated by signal".to_string(),
        });
    }
    let error = (!parts.is_empty()).then(|| parts.join("\n"));

    SandboxResult {
        success,
        output,
        error,
        execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        memory_used: outcome.peak_memory.or(report.memory_used).unwrap_or(0),
        exit_code: outcome.exit_code,
        killed,
        timed_out,
        kill_reason: outcome.kill_reason,
    }
}
