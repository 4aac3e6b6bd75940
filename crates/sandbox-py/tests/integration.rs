// These tests run real scripts and need a Python 3 interpreter on the PATH.
// When none is found they return early instead of failing.
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox::{KillReason, MemoryProbe, SandboxConfig, SandboxConfigOverride, SandboxError};
use sandbox_py::{OUTPUT_TRUNCATED, Platform, SandboxManager};

fn config(root: &Path) -> SandboxConfig {
    SandboxConfig {
        temp_directory: root.to_path_buf(),
        ..Default::default()
    }
}

fn python_manager(root: &Path) -> Option<SandboxManager> {
    let platform = match Platform::detect() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("skipping: {e}");
            return None;
        }
    };
    Some(SandboxManager::new(config(root), platform).unwrap())
}

fn no_override() -> SandboxConfigOverride {
    SandboxConfigOverride::default()
}

fn timeout_ms(ms: u64) -> SandboxConfigOverride {
    SandboxConfigOverride {
        timeout_ms: Some(ms),
        ..Default::default()
    }
}

/// Workspace root must hold nothing once an execution has resolved.
fn assert_no_workspaces(root: &Path) {
    if !root.exists() {
        return;
    }
    let left: Vec<PathBuf> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(left.is_empty(), "leftover workspaces: {left:?}");
}

async fn wait_until_registered(manager: &SandboxManager, session_id: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager
        .active_executions()
        .iter()
        .any(|e| e.session_id == session_id)
    {
        assert!(Instant::now() < deadline, "{session_id} never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =========================================================================
// Group 1: basic outcomes
// =========================================================================

#[tokio::test]
async fn hello_world_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let result = manager
        .execute_script("print('hello')", &no_override())
        .await
        .unwrap();

    assert!(result.success, "result: {result:?}");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.output.contains("hello"));
    assert!(!result.timed_out);
    assert!(!result.killed);
    assert!(result.memory_used > 0);
    assert_no_workspaces(&root);
}

#[tokio::test]
async fn uncaught_exception_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let result = manager
        .execute_script("raise ValueError('boom at /home/alice/data.csv')", &no_override())
        .await
        .unwrap();

    assert!(!result.success);
    assert_ne!(result.exit_code, Some(0));
    assert!(!result.killed);
    assert!(!result.timed_out);
    let error = result.error.unwrap();
    assert!(error.contains("ValueError: boom"), "error: {error}");
    assert!(error.contains("[PATH_REDACTED]"), "error: {error}");
    assert!(!error.contains("alice"), "error: {error}");
    assert_no_workspaces(&root);
}

#[tokio::test]
async fn system_exit_code_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let result = manager
        .execute_script("print('partial')\nraise SystemExit(3)", &no_override())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.output.contains("partial"));
    assert!(!result.killed);
}

#[tokio::test]
async fn output_is_sanitized() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let result = manager
        .execute_script(
            "print('host 10.1.2.3 mail ops@example.com dir /var/lib/data')",
            &no_override(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        result.output.trim_end(),
        "host [IP_REDACTED] mail [EMAIL_REDACTED] dir [PATH_REDACTED]"
    );
}

// =========================================================================
// Group 2: limits
// =========================================================================

#[tokio::test]
async fn infinite_loop_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let started = Instant::now();
    let result = manager
        .execute_script("while True:\n    pass\n", &timeout_ms(500))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(result.timed_out);
    assert!(result.killed);
    assert_eq!(result.kill_reason, Some(KillReason::Timeout));
    assert!(elapsed >= Duration::from_millis(500), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed: {elapsed:?}");
    assert!(result.error.unwrap().contains("timed out after 500ms"));
    assert_no_workspaces(&root);
}

#[tokio::test]
async fn oversized_output_is_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let over = SandboxConfigOverride {
        max_output_size: Some(1000),
        ..Default::default()
    };

    let result = manager
        .execute_script("for _ in range(2000):\n    print('x' * 100)\n", &over)
        .await
        .unwrap();

    assert!(result.output.len() <= 1000 + OUTPUT_TRUNCATED.len());
    assert!(result.output.ends_with(OUTPUT_TRUNCATED), "output: {}", result.output);
    assert!(!result.timed_out);
    assert_no_workspaces(&root);
}

struct HugeProbe;

impl MemoryProbe for HugeProbe {
    fn resident_bytes(&self, _pid: u32) -> Option<u64> {
        Some(1 << 40)
    }

    fn is_supported(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn memory_violation_kills_script() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Ok(platform) = Platform::detect() else {
        return;
    };
    let manager =
        SandboxManager::new(config(&root), platform.with_probe(Arc::new(HugeProbe))).unwrap();

    let result = manager
        .execute_script("import time\ntime.sleep(10)\n", &no_override())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.killed);
    assert!(!result.timed_out);
    assert_eq!(
        result.kill_reason,
        Some(KillReason::MemoryLimit { observed: 1 << 40 })
    );
    assert_eq!(result.memory_used, 1 << 40);
    assert!(result.error.unwrap().contains("Memory limit exceeded"));
    assert_no_workspaces(&root);
}

// =========================================================================
// Group 3: harness restrictions (pre-flight rules disabled)
// =========================================================================

#[tokio::test]
async fn harness_blocks_denied_imports_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = manager.with_rules(Vec::new());

    let result = manager
        .execute_script("import subprocess\n", &no_override())
        .await
        .unwrap();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("ImportError"), "error: {error}");
    assert!(error.contains("subprocess"), "error: {error}");
}

#[tokio::test]
async fn harness_allows_safe_library_imports() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let result = manager
        .execute_script(
            "import json, math\n\
             from collections import namedtuple\n\
             Point = namedtuple('Point', 'x y')\n\
             print(json.dumps({'r': round(math.sqrt(16)), 'x': Point(1, 2).x}))\n",
            &no_override(),
        )
        .await
        .unwrap();

    assert!(result.success, "result: {result:?}");
    assert_eq!(result.output.trim_end(), r#"{"r": 4, "x": 1}"#);
}

/// Run `script` with pre-flight rules disabled and assert it neither
/// succeeded nor created `marker`.
async fn assert_escape_contained(script: &str, marker: &Path, expected_error: &str) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = manager.with_rules(Vec::new());

    let result = manager.execute_script(script, &no_override()).await.unwrap();

    assert!(!result.success, "result: {result:?}");
    assert!(!result.output.contains("ran"), "output: {}", result.output);
    let error = result.error.unwrap_or_default();
    assert!(error.contains(expected_error), "error: {error}");
    assert!(!marker.exists(), "{} was created", marker.display());
}

#[tokio::test]
async fn harness_refuses_unlisted_low_level_modules() {
    let host = tempfile::tempdir().unwrap();
    let marker = host.path().join("created_by_posix");
    let script = format!(
        "import posix\nposix.system('touch {}')\nprint('ran')\n",
        marker.display()
    );

    assert_escape_contained(&script, &marker, "ImportError").await;
}

#[tokio::test]
async fn harness_checks_every_module_in_an_import_list() {
    let host = tempfile::tempdir().unwrap();
    let marker = host.path().join("created_by_sys");
    let script = format!(
        "import math, sys\nsys.modules['os'].system('touch {}')\nprint('ran')\n",
        marker.display()
    );

    assert_escape_contained(&script, &marker, "Import of module 'sys'").await;
}

#[tokio::test]
async fn harness_denies_process_launch_reached_through_attributes() {
    let host = tempfile::tempdir().unwrap();
    let marker = host.path().join("created_by_reach");
    let script = format!(
        "import collections\n\
         collections._sys.modules['os'].system('touch {}')\n\
         print('ran')\n",
        marker.display()
    );

    assert_escape_contained(&script, &marker, "PermissionError").await;
}

#[tokio::test]
async fn harness_blocks_host_file_reads() {
    let host = tempfile::tempdir().unwrap();
    let secret = host.path().join("secret.txt");
    std::fs::write(&secret, "TOPSECRET").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = manager.with_rules(Vec::new());

    let attempts = [
        (
            format!("import pathlib\nprint(pathlib.Path('{}').read_text())\n", secret.display()),
            "ImportError",
        ),
        (
            format!(
                "import collections\n\
                 io = collections._sys.modules['io']\n\
                 print(io.open('{}').read())\n",
                secret.display()
            ),
            "PermissionError",
        ),
        (
            format!(
                "import collections\n\
                 codecs = collections._sys.modules['codecs']\n\
                 print(codecs.open('{}').read())\n",
                secret.display()
            ),
            "PermissionError",
        ),
    ];
    for (script, expected_error) in attempts {
        let result = manager.execute_script(&script, &no_override()).await.unwrap();

        assert!(!result.success, "result: {result:?}");
        assert!(!result.output.contains("TOPSECRET"), "output: {}", result.output);
        let error = result.error.unwrap_or_default();
        assert!(error.contains(expected_error), "error: {error}");
    }
    assert_no_workspaces(&root);
}

#[tokio::test]
async fn harness_neuters_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = manager.with_rules(Vec::new());

    let result = manager
        .execute_script(
            "print(open('/etc/hostname'))\nprint(repr(input()))\nprint(eval('1+1'))\n",
            &no_override(),
        )
        .await
        .unwrap();

    assert!(result.success, "result: {result:?}");
    let lines: Vec<&str> = result.output.lines().collect();
    assert_eq!(lines, vec!["None", "''", "None"]);
}

// =========================================================================
// Group 4: registry, cancellation, cleanup
// =========================================================================

#[tokio::test]
async fn rejected_script_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    // The interpreter does not exist, so any spawn attempt would surface as
    // SpawnFailed instead of a validation error.
    let manager = SandboxManager::new(
        config(&root),
        Platform::with_interpreter(PathBuf::from("/nonexistent/python3")),
    )
    .unwrap();

    let err = manager
        .execute_script("import os; os.system('echo hi')", &no_override())
        .await
        .unwrap_err();

    match err {
        SandboxError::ScriptRejected { rule, .. } => assert_eq!(rule, "disallowed import"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(!root.exists());
}

#[tokio::test]
async fn spawn_failure_is_an_error_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let manager = SandboxManager::new(
        config(&root),
        Platform::with_interpreter(PathBuf::from("/nonexistent/python3")),
    )
    .unwrap();

    let err = manager
        .execute_script("print(1)", &no_override())
        .await
        .unwrap_err();

    assert!(matches!(err, SandboxError::SpawnFailed(_)), "got: {err}");
    assert!(manager.active_executions().is_empty());
    assert_no_workspaces(&root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kill_execution_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = Arc::new(manager);

    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .execute_script_with_id("victim", "while True:\n    pass\n", &timeout_ms(20_000))
                .await
        })
    };
    wait_until_registered(&manager, "victim").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(manager.kill_execution("victim").await);
    assert!(!manager.kill_execution("victim").await);

    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(result.killed);
    assert!(!result.timed_out);
    assert!(!result.success);
    assert_eq!(result.kill_reason, Some(KillReason::Cancelled));
    assert!(manager.active_executions().is_empty());
    assert_no_workspaces(&root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_executions_lists_running_script() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = Arc::new(manager);

    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .execute_script_with_id("listed", "import time\ntime.sleep(1)\n", &no_override())
                .await
        })
    };
    wait_until_registered(&manager, "listed").await;

    let active = manager.active_executions();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, "listed");
    assert_eq!(active[0].temp_dir, root.join("listed"));

    let err = manager
        .execute_script_with_id("listed", "print(1)", &no_override())
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::SessionExists(_)), "got: {err}");

    let result = runner.await.unwrap().unwrap();
    assert!(result.success, "result: {result:?}");
    assert!(manager.active_executions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };
    let manager = Arc::new(manager);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..4 {
        let manager = Arc::clone(&manager);
        tasks.spawn(async move {
            let script = format!("import time\ntoken = 'token-{i}'\ntime.sleep(2)\nprint(token)\n");
            let result = manager
                .execute_script_with_id(&format!("iso-{i}"), &script, &no_override())
                .await;
            (i, result)
        });
    }
    for i in 0..4 {
        wait_until_registered(&manager, &format!("iso-{i}")).await;
    }

    // While all four run: distinct workspaces, each holding only its own files.
    let active = manager.active_executions();
    assert_eq!(active.len(), 4);
    let dirs: HashSet<PathBuf> = active.iter().map(|e| e.temp_dir.clone()).collect();
    assert_eq!(dirs.len(), 4);
    let mut seen_files = HashSet::new();
    for execution in &active {
        let own = format!(
            "token-{}",
            execution.session_id.trim_start_matches("iso-")
        );
        for entry in std::fs::read_dir(&execution.temp_dir).unwrap() {
            let path = entry.unwrap().path();
            assert!(seen_files.insert(path.clone()), "shared file {}", path.display());
            let content = std::fs::read_to_string(&path).unwrap_or_default();
            for i in 0..4 {
                let token = format!("token-{i}");
                assert_eq!(
                    content.contains(&token),
                    token == own && path.ends_with("script.py"),
                    "{} in {}",
                    token,
                    path.display()
                );
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        let (i, result) = joined.unwrap();
        let result = result.unwrap();
        assert!(result.success, "result {i}: {result:?}");
        assert_eq!(result.output.trim_end(), format!("token-{i}"));
    }
    assert_no_workspaces(&root);
}

#[tokio::test]
async fn dropped_execution_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sandbox");
    let Some(manager) = python_manager(&root) else {
        return;
    };

    let abandoned = tokio::time::timeout(
        Duration::from_millis(300),
        manager.execute_script("while True:\n    pass\n", &timeout_ms(20_000)),
    )
    .await;

    assert!(abandoned.is_err());
    assert!(manager.active_executions().is_empty());
    assert_no_workspaces(&root);
}
