use std::process::{Command, Stdio};

use tracing::trace;

/// Error from a failed helper command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn format_command_display(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run a short-lived helper command and return its trimmed stdout.
///
/// Synchronous: process-tree teardown also runs from `Drop`.
pub fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_display_joins_args() {
        let display = format_command_display("pgrep", &["-P", "1234"]);
        assert_eq!(display, "pgrep -P 1234");
    }

    #[test]
    fn exec_returns_trimmed_stdout() {
        let output = exec("echo", &["hello"]).unwrap();
        assert_eq!(output, "hello");
    }

    #[test]
    fn exec_returns_error_on_failure() {
        let err = exec("false", &[]).unwrap_err();
        assert!(err.command.contains("false"), "command was: {}", err.command);
    }

    #[test]
    fn exec_error_contains_stderr() {
        let err = exec("sh", &["-c", "echo oops >&2; exit 1"]).unwrap_err();
        assert!(err.detail.contains("oops"), "detail was: {}", err.detail);
    }

    #[test]
    fn exec_reports_missing_program() {
        let err = exec("/nonexistent/program", &[]).unwrap_err();
        assert!(!err.detail.is_empty());
    }
}
