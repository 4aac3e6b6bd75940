use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use sandbox::SandboxConfig;
use serde::Serialize;

use super::{load_config, read_script};
use crate::config::FALLBACK_ROLE;
use crate::error::{RunnerError, RunnerResult};
use crate::scan;

#[derive(Args)]
pub struct CheckArgs {
    /// Python scripts to check
    #[arg(required = true)]
    scripts: Vec<PathBuf>,
    /// Path to runner.yaml config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Role whose limits apply (size limit)
    #[arg(long, env = "SANDBOX_ROLE", default_value = FALLBACK_ROLE)]
    role: String,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    script: String,
    errors: Vec<String>,
    warnings: Vec<String>,
    /// Why the sandbox would refuse to run it.
    #[serde(skip_serializing_if = "Option::is_none")]
    rejected: Option<String>,
}

impl CheckReport {
    fn passed(&self) -> bool {
        self.errors.is_empty() && self.rejected.is_none()
    }
}

fn check_source(script: String, source: &str, config: &SandboxConfig) -> CheckReport {
    let scan = scan::scan(source);
    let rejected = if scan.is_valid() {
        sandbox_py::validate_script(source, config, sandbox_py::default_rules())
            .err()
            .map(|e| e.to_string())
    } else {
        None
    };
    CheckReport {
        script,
        errors: scan.errors,
        warnings: scan.warnings,
        rejected,
    }
}

pub async fn run_check(args: CheckArgs) -> RunnerResult<ExitCode> {
    let runner_config = load_config(args.config.as_deref()).await?;
    let config = runner_config
        .role_override(&args.role)
        .apply(&runner_config.sandbox_config());

    let mut reports = Vec::with_capacity(args.scripts.len());
    for path in &args.scripts {
        let file = read_script(path).await?;
        reports.push(check_source(
            file.path.display().to_string(),
            &file.source,
            &config,
        ));
    }

    if args.json {
        let json = serde_json::to_string_pretty(&reports)
            .map_err(|e| RunnerError::Internal(format!("serialize report: {e}")))?;
        println!("{json}");
    } else {
        for report in &reports {
            let verdict = if report.passed() { "ok" } else { "FAILED" };
            println!("{}: {verdict}", report.script);
            for error in &report.errors {
                println!("  error: {error}");
            }
            if let Some(reason) = &report.rejected {
                println!("  rejected: {reason}");
            }
            for warning in &report.warnings {
                println!("  warning: {warning}");
            }
        }
    }

    Ok(if reports.iter().all(CheckReport::passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
