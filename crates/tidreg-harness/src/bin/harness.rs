//! CLI entrypoint for the tidreg stress harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tidreg_core::{HostKernel, ReusePolicy};
use tidreg_harness::log_bridge::LogBridge;
use tidreg_harness::scenario::{self, CollisionConfig, ScenarioReport, StressConfig};
use tidreg_harness::structured_log::{self, LogEmitter};

/// Stress and collision scenarios for the thread registry.
#[derive(Debug, Parser)]
#[command(name = "tidreg-harness")]
#[command(about = "Drive tidreg scenarios and emit JSONL evidence")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Reuse {
    OnReap,
    OnExit,
}

impl From<Reuse> for ReusePolicy {
    fn from(reuse: Reuse) -> Self {
        match reuse {
            Reuse::OnReap => ReusePolicy::OnReap,
            Reuse::OnExit => ReusePolicy::OnExit,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Concurrent spawn/join load with per-thread errno checks.
    Stress {
        /// Caller threads issuing spawns in parallel.
        #[arg(long, default_value_t = 4)]
        spawners: usize,
        /// Spawns per caller.
        #[arg(long, default_value_t = 250)]
        rounds: usize,
        /// Leave every n-th thread unjoined (0 joins all).
        #[arg(long, default_value_t = 5)]
        detach_every: usize,
        /// Requested stack size in bytes (0 selects the default).
        #[arg(long, default_value_t = 0)]
        stack_size: usize,
        /// Kernel limit on simultaneously live threads.
        #[arg(long, default_value_t = HostKernel::DEFAULT_MAX_THREADS)]
        max_threads: usize,
        /// When the kernel may hand out an exited thread's identifier again.
        #[arg(long, value_enum, default_value_t = Reuse::OnReap)]
        reuse: Reuse,
        /// JSONL output path (stdout when omitted).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run identifier for trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Forced identifier reuse before the collector sees the old exit.
    Collision {
        /// Number of collision rounds.
        #[arg(long, default_value_t = 16)]
        rounds: usize,
        /// JSONL output path (stdout when omitted).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run identifier for trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Validate a JSONL log written by a previous run.
    ValidateLog {
        /// JSONL file to check.
        #[arg(long)]
        log: PathBuf,
    },
}

fn emitter(log: Option<&PathBuf>, scenario: &str, run_id: &str) -> std::io::Result<LogEmitter> {
    match log {
        Some(path) => LogEmitter::to_file(path, scenario, run_id),
        None => Ok(LogEmitter::to_stdout(scenario, run_id)),
    }
}

fn summarize(report: &ScenarioReport) -> ExitCode {
    match serde_json::to_string(report) {
        Ok(json) => eprintln!("{json}"),
        Err(err) => eprintln!("cannot serialize report: {err}"),
    }
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "{}: {} of {} checks failed: {}",
            report.scenario,
            report.failures.len(),
            report.checks,
            report.failures.join(", ")
        );
        ExitCode::FAILURE
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let bridge = LogBridge::install(log::LevelFilter::Debug);

    match cli.command {
        Command::Stress {
            spawners,
            rounds,
            detach_every,
            stack_size,
            max_threads,
            reuse,
            log,
            run_id,
        } => {
            let config = StressConfig {
                spawners,
                rounds,
                detach_every,
                stack_size,
                max_threads,
                reuse: reuse.into(),
            };
            let mut out = emitter(log.as_ref(), "stress", &run_id)?;
            let report = scenario::run_stress(&config, &mut out)?;
            bridge.forward(&mut out)?;
            out.flush()?;
            Ok(summarize(&report))
        }
        Command::Collision { rounds, log, run_id } => {
            let mut out = emitter(log.as_ref(), "collision", &run_id)?;
            let report = scenario::run_collision(&CollisionConfig { rounds }, &mut out)?;
            bridge.forward(&mut out)?;
            out.flush()?;
            Ok(summarize(&report))
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = structured_log::validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{}: {lines} lines, {} errors", log.display(), errors.len());
            Ok(if errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
