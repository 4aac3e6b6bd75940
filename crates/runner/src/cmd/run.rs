use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use sandbox::{KillReason, SandboxConfigOverride, SandboxResult, ScriptExecutor};
use sandbox_py::SandboxManager;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{ScriptFile, load_config, read_script};
use crate::config::FALLBACK_ROLE;
use crate::error::{RunnerError, RunnerResult};
use crate::log::ExecutionLog;
use crate::scan;
use crate::status::{RunnerMode, StatusTracker};

/// How long in-flight executions get to report back after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct RunArgs {
    /// Python scripts to execute concurrently
    #[arg(required = true)]
    scripts: Vec<PathBuf>,
    /// Path to runner.yaml config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Role whose limits apply
    #[arg(long, env = "SANDBOX_ROLE", default_value = FALLBACK_ROLE)]
    role: String,
    /// User recorded in execution logs
    #[arg(long, env = "USER", default_value = "unknown")]
    user: String,
    /// Timeout for this run, overriding the role's
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScriptReport {
    script: String,
    session_id: String,
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<SandboxResult>,
    /// Set when the script never ran: empty, rejected, or a host failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl ScriptReport {
    fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.success)
    }
}

/// Everything one execution task needs, shared across tasks.
struct RunContext {
    executor: Arc<dyn ScriptExecutor>,
    status: Arc<StatusTracker>,
    overrides: SandboxConfigOverride,
    log_dir: Option<PathBuf>,
    user: String,
    role: String,
}

pub async fn run_run(args: RunArgs) -> RunnerResult<ExitCode> {
    let runner_config = load_config(args.config.as_deref()).await?;
    let platform = runner_config.platform()?;
    let manager = Arc::new(SandboxManager::new(
        runner_config.sandbox_config(),
        platform,
    )?);
    let reaper = manager.spawn_reaper(Duration::from_secs(runner_config.reap_interval_secs));

    let mut overrides = runner_config.role_override(&args.role);
    if let Some(timeout_ms) = args.timeout_ms {
        overrides.timeout_ms = Some(timeout_ms);
    }

    // Read everything up front so a missing file fails before anything runs.
    let mut scripts = Vec::with_capacity(args.scripts.len());
    for path in &args.scripts {
        scripts.push(read_script(path).await?);
    }

    let status = Arc::new(StatusTracker::new(runner_config.status_file.clone()));
    status.write_initial().await;

    let executor: Arc<dyn ScriptExecutor> = manager.clone();
    let ctx = Arc::new(RunContext {
        executor,
        status: Arc::clone(&status),
        overrides,
        log_dir: runner_config.log_dir.clone(),
        user: args.user,
        role: args.role,
    });
    info!(
        scripts = scripts.len(),
        role = %ctx.role,
        executor = ctx.executor.name(),
        "running scripts"
    );

    let mut jobs = JoinSet::new();
    for script in scripts {
        jobs.spawn(run_one(Arc::clone(&ctx), script));
    }

    let mut reports = Vec::new();
    let shutdown = sandbox_py::shutdown_on_signal(Arc::clone(&manager));
    tokio::pin!(shutdown);

    let interrupted = loop {
        tokio::select! {
            signal = &mut shutdown => break Some(signal),
            joined = jobs.join_next() => match joined {
                Some(Ok(report)) => reports.push(report),
                Some(Err(e)) => error!(error = %e, "execution task failed"),
                None => break None,
            },
        }
    };

    if let Some(signal) = interrupted {
        status.set_mode(RunnerMode::Draining).await;
        // Executions were killed by the signal handler; let them write logs.
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = jobs.join_next().await {
                if let Ok(report) = joined {
                    reports.push(report);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("executions did not finish after shutdown, abandoning");
            jobs.abort_all();
        }
        reaper.abort();
        status.set_mode(RunnerMode::Stopped).await;
        print_reports(&reports, args.json)?;
        return Ok(ExitCode::from(signal.exit_code()));
    }

    reaper.abort();
    manager.cleanup_all();
    status.set_mode(RunnerMode::Stopped).await;

    // JoinSet yields in completion order; report in command-line order.
    reports.sort_by_key(|r| {
        args.scripts
            .iter()
            .position(|p| p.display().to_string() == r.script)
    });
    print_reports(&reports, args.json)?;

    Ok(if reports.iter().all(ScriptReport::succeeded) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn open_log(
    ctx: &RunContext,
    script: &ScriptFile,
    session_id: &str,
    warnings: &[String],
) -> Option<ExecutionLog> {
    let dir = ctx.log_dir.as_deref()?;
    let opened = async {
        let mut log = ExecutionLog::create(dir, &script.name, session_id).await?;
        log.header(&ctx.user, &ctx.role, &ctx.overrides, &script.name)
            .await?;
        for warning in warnings {
            log.warning(warning).await?;
        }
        Ok::<_, RunnerError>(log)
    }
    .await;
    match opened {
        Ok(log) => Some(log),
        Err(e) => {
            warn!(script = %script.path.display(), error = %e, "execution log unavailable");
            None
        }
    }
}

async fn close_log(mut log: ExecutionLog, report: &ScriptReport) {
    let written = async {
        match (&report.result, &report.failure) {
            (Some(result), _) => log.record(result).await?,
            (None, Some(failure)) => log.error(failure).await?,
            (None, None) => {}
        }
        log.close().await
    }
    .await;
    if let Err(e) = written {
        warn!(script = %report.script, error = %e, "failed to write execution log");
    }
}

async fn run_one(ctx: Arc<RunContext>, script: ScriptFile) -> ScriptReport {
    let session_id = uuid::Uuid::new_v4().to_string();
    let scan = scan::scan(&script.source);
    let scan_passed = scan.is_valid();
    let log = open_log(&ctx, &script, &session_id, &scan.warnings).await;

    let mut report = ScriptReport {
        script: script.path.display().to_string(),
        session_id: session_id.clone(),
        warnings: scan.warnings,
        log_file: log.as_ref().map(|l| l.path().to_path_buf()),
        result: None,
        failure: None,
    };

    if !scan_passed {
        report.failure = Some(scan.errors.join("; "));
    } else {
        ctx.status.add_session(&session_id).await;
        let outcome = ctx
            .executor
            .execute_script_with_id(&session_id, &script.source, &ctx.overrides)
            .await;
        match outcome {
            Ok(result) => {
                ctx.status.finish_session(&session_id, result.success).await;
                report.result = Some(result);
            }
            Err(e) => {
                ctx.status.finish_session(&session_id, false).await;
                report.failure = Some(e.to_string());
            }
        }
    }

    if let Some(log) = log {
        close_log(log, &report).await;
    }
    report
}

fn describe(result: &SandboxResult) -> String {
    match result.kill_reason {
        _ if result.success => "ok".to_string(),
        Some(KillReason::Timeout) => "timed out".to_string(),
        Some(KillReason::MemoryLimit { .. }) => "killed (memory limit)".to_string(),
        Some(KillReason::OutputLimit) => "killed (output limit)".to_string(),
        Some(KillReason::Cancelled) => "killed".to_string(),
        None => match result.exit_code {
            Some(code) => format!("failed (exit {code})"),
            None => "failed".to_string(),
        },
    }
}

fn print_summary(report: &ScriptReport) {
    println!("== {} ({}) ==", report.script, report.session_id);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if let Some(result) = &report.result {
        if !result.output.is_empty() {
            print!("{}", result.output);
            if !result.output.ends_with('\n') {
                println!();
            }
        }
        if let Some(error) = &result.error {
            println!("error: {error}");
        }
        println!(
            "status: {} in {}ms, {} bytes",
            describe(result),
            result.execution_time_ms,
            result.memory_used
        );
    }
    if let Some(failure) = &report.failure {
        println!("status: not run: {failure}");
    }
    if let Some(log) = &report.log_file {
        println!("log: {}", log.display());
    }
}

fn print_reports(reports: &[ScriptReport], json: bool) -> RunnerResult<()> {
    if json {
        let json = serde_json::to_string_pretty(reports)
            .map_err(|e| RunnerError::Internal(format!("serialize results: {e}")))?;
        println!("{json}");
    } else {
        for report in reports {
            print_summary(report);
        }
    }
    Ok(())
}
