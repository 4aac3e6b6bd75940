mod cmd;
mod config;
mod error;
mod log;
mod scan;
mod status;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run Python scripts in the sandbox and report their results
    Run(cmd::RunArgs),
    /// Scan scripts and report what the sandbox would reject, without running them
    Check(cmd::CheckArgs),
    /// Write a starter runner.yaml
    Init(cmd::InitArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries results (and JSON); diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => cmd::run_run(args).await,
        Command::Check(args) => cmd::run_check(args).await,
        Command::Init(args) => cmd::run_init(args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
