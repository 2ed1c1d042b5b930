//! Scenario runners: drive a thread subsystem, then check its invariants.
//!
//! Every check is written to the structured log as an `invariant` event; a
//! report fails when any check fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tidreg_core::{
    Diagnostics, HostKernel, Priority, ReusePolicy, StatsSnapshot, ThreadError, Threads,
    ThreadsConfig,
};

use crate::structured_log::{LogEmitter, LogLevel, Outcome};

/// How long a scenario waits for the collector to catch up.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("thread subsystem: {0}")]
    Threads(#[from] ThreadError),
    #[error("log output: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
}

/// Concurrent spawn/join load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    /// Caller threads issuing spawns in parallel.
    pub spawners: usize,
    /// Spawns per caller.
    pub rounds: usize,
    /// Every n-th spawn is left unjoined. 0 joins everything.
    pub detach_every: usize,
    /// Stack size requested per thread; 0 selects the default.
    pub stack_size: usize,
    pub max_threads: usize,
    pub reuse: ReusePolicy,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            spawners: 4,
            rounds: 250,
            detach_every: 5,
            stack_size: 0,
            max_threads: HostKernel::DEFAULT_MAX_THREADS,
            reuse: ReusePolicy::OnReap,
        }
    }
}

/// Forced identifier reuse before the collector sees the previous exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionConfig {
    pub rounds: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self { rounds: 16 }
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub checks: usize,
    pub failures: Vec<String>,
    pub stats: StatsSnapshot,
    pub duration_ms: u64,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects invariant checks and logs each one.
struct Checker<'a> {
    emitter: &'a mut LogEmitter,
    checks: usize,
    failures: Vec<String>,
}

impl<'a> Checker<'a> {
    fn new(emitter: &'a mut LogEmitter) -> Self {
        Self {
            emitter,
            checks: 0,
            failures: Vec::new(),
        }
    }

    fn check(
        &mut self,
        invariant: &str,
        held: bool,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.checks += 1;
        let level = if held { LogLevel::Info } else { LogLevel::Error };
        let entry = self
            .emitter
            .entry(level, "invariant")
            .with_check(invariant, held)
            .with_details(details);
        self.emitter.emit_entry(entry)?;
        if !held {
            self.failures.push(invariant.to_string());
        }
        Ok(())
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<(), ScenarioError> {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > SETTLE_TIMEOUT {
            return Err(ScenarioError::Timeout {
                what: what.to_string(),
                timeout: SETTLE_TIMEOUT,
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn start(kernel: HostKernel) -> Result<Threads<HostKernel>, ScenarioError> {
    // Stale collisions are the interesting events here; always log them.
    let config = ThreadsConfig::default().with_diagnostics(Diagnostics::Trace);
    Ok(Threads::start(kernel, config)?)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Run the concurrent spawn/join stress scenario.
pub fn run_stress(
    config: &StressConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioReport, ScenarioError> {
    let began = Instant::now();
    let threads = start(HostKernel::with_limits(config.reuse, config.max_threads))?;
    let entry = emitter
        .entry(LogLevel::Info, "scenario_start")
        .with_details(serde_json::json!({
            "spawners": config.spawners,
            "rounds": config.rounds,
            "detach_every": config.detach_every,
            "stack_size": config.stack_size,
            "max_threads": config.max_threads,
            "reuse": format!("{:?}", config.reuse),
        }));
    emitter.emit_entry(entry)?;

    let errno_mismatches = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));
    let joined = Arc::new(AtomicU64::new(0));
    let early_joins = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..config.spawners)
        .map(|w| {
            let threads = threads.clone();
            let errno_mismatches = Arc::clone(&errno_mismatches);
            let refused = Arc::clone(&refused);
            let joined = Arc::clone(&joined);
            let early_joins = Arc::clone(&early_joins);
            let config = *config;
            std::thread::spawn(move || {
                for i in 0..config.rounds {
                    let inner = threads.clone();
                    let mismatches = Arc::clone(&errno_mismatches);
                    let finished = Arc::new(AtomicBool::new(false));
                    let flag = Arc::clone(&finished);
                    let value = i32::try_from(w * 100_000 + i + 1).unwrap_or(i32::MAX);
                    let work = move || {
                        inner.set_errno(value);
                        std::thread::yield_now();
                        if inner.errno() != value {
                            mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                        flag.store(true, Ordering::Release);
                    };
                    let name = format!("stress-{w}-{i}");
                    match threads.spawn(&name, work, config.stack_size, Priority::DEFAULT) {
                        Ok(tid) => {
                            let detach = config.detach_every != 0 && i % config.detach_every == 0;
                            // Only `SelfJoin` can fail, and this is never the spawned thread.
                            if !detach && threads.join(tid).is_ok() {
                                joined.fetch_add(1, Ordering::Relaxed);
                                if !finished.load(Ordering::Acquire) {
                                    early_joins.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Err(_) => {
                            refused.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        if worker.join().is_err() {
            log::error!("stress spawner panicked");
        }
    }

    let expected = u64::try_from(config.spawners * config.rounds).unwrap_or(u64::MAX);
    let settled = wait_for("stress run to settle", || {
        let stats = threads.stats();
        threads.registered() == 0
            && threads.kernel().running() == 1
            && threads.kernel().pending_exits() == 0
            && stats.reaped + stats.absorbed_exits == stats.spawned
    });
    let stats = threads.stats();
    let live_contexts = threads.live_contexts();
    let refused = refused.load(Ordering::Relaxed);
    let mismatches = errno_mismatches.load(Ordering::Relaxed);
    let joined = joined.load(Ordering::Relaxed);
    let early_joins = early_joins.load(Ordering::Relaxed);

    let mut checker = Checker::new(emitter);
    checker.check(
        "collector_drained_registry",
        settled.is_ok(),
        serde_json::json!({ "registered": threads.registered() }),
    )?;
    checker.check(
        "every_spawn_accounted",
        stats.spawned + refused == expected && stats.create_failures == refused,
        serde_json::json!({ "spawned": stats.spawned, "refused": refused, "expected": expected }),
    )?;
    checker.check(
        "records_released_once",
        stats.released() == stats.registered && stats.registered == stats.spawned,
        serde_json::json!({ "registered": stats.registered, "released": stats.released() }),
    )?;
    checker.check(
        "stale_exits_absorbed",
        stats.absorbed_exits == stats.stale_evictions,
        serde_json::json!({ "stale": stats.stale_evictions, "absorbed": stats.absorbed_exits }),
    )?;
    checker.check(
        "no_unknown_exits",
        stats.unknown_exits == 0,
        serde_json::json!({ "unknown_exits": stats.unknown_exits }),
    )?;
    checker.check(
        "error_contexts_released",
        live_contexts == 0,
        serde_json::json!({ "live_contexts": live_contexts }),
    )?;
    checker.check(
        "join_waits_for_work",
        early_joins == 0,
        serde_json::json!({ "joined": joined, "early_joins": early_joins }),
    )?;
    checker.check(
        "threads_start_registered",
        stats.unconfirmed_starts == 0,
        serde_json::json!({ "unconfirmed_starts": stats.unconfirmed_starts }),
    )?;
    checker.check(
        "errno_isolated",
        mismatches == 0,
        serde_json::json!({ "mismatches": mismatches }),
    )?;

    finish("stress", checker, stats, began)
}

/// Run the identifier-collision scenario.
///
/// Each round withholds exit notifications, lets a thread exit, and starts a
/// second thread that receives the same identifier. The second thread must
/// evict the stale record, survive the late exit, and remain joinable.
pub fn run_collision(
    config: &CollisionConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioReport, ScenarioError> {
    let began = Instant::now();
    let threads = start(HostKernel::with_limits(ReusePolicy::OnExit, 64))?;
    let kernel = threads.kernel().clone();
    let entry = emitter
        .entry(LogLevel::Info, "scenario_start")
        .with_details(serde_json::json!({ "rounds": config.rounds }));
    emitter.emit_entry(entry)?;

    let mut checker = Checker::new(emitter);
    for round in 0..config.rounds {
        let base = threads.stats();
        kernel.hold_exits(true);

        let first = threads.spawn("first", || {}, 0, Priority::DEFAULT)?;
        wait_for("first thread to exit", || kernel.pending_exits() == 1)?;

        let (release, parked) = mpsc::channel::<()>();
        let second = threads.spawn(
            "second",
            move || {
                let _ = parked.recv();
            },
            0,
            Priority::DEFAULT,
        )?;
        wait_for("second thread to register", || {
            threads.stats().registered == base.registered + 2
        })?;

        let details = serde_json::json!({ "round": round, "first": first.0, "second": second.0 });
        checker.check("identifier_reused", first == second, details.clone())?;
        checker.check(
            "stale_record_evicted",
            threads.stats().stale_evictions == base.stale_evictions + 1
                && threads.find(second).is_some_and(|view| view.name == "second"),
            details.clone(),
        )?;

        kernel.hold_exits(false);
        wait_for("late exit to settle", || {
            let stats = threads.stats();
            stats.absorbed_exits + stats.reaped == base.absorbed_exits + base.reaped + 1
        })?;
        checker.check(
            "second_thread_survives_late_exit",
            threads.find(second).is_some_and(|view| view.name == "second"),
            details.clone(),
        )?;

        drop(release);
        threads.join(second)?;
        wait_for("second thread to be reaped", || {
            threads.stats().reaped == base.reaped + 1
        })?;
        checker.check(
            "second_thread_joined_and_reaped",
            threads.find(second).is_none() && threads.live_contexts() == 0,
            details,
        )?;
    }

    let stats = threads.stats();
    checker.check(
        "collisions_balanced",
        stats.absorbed_exits == stats.stale_evictions && stats.unknown_exits == 0,
        serde_json::json!({
            "stale": stats.stale_evictions,
            "absorbed": stats.absorbed_exits,
            "unknown": stats.unknown_exits,
        }),
    )?;

    finish("collision", checker, stats, began)
}

fn finish(
    scenario: &'static str,
    checker: Checker<'_>,
    stats: StatsSnapshot,
    began: Instant,
) -> Result<ScenarioReport, ScenarioError> {
    let Checker {
        emitter,
        checks,
        failures,
    } = checker;
    let report = ScenarioReport {
        scenario,
        checks,
        failures,
        stats,
        duration_ms: elapsed_ms(began),
    };
    let (level, outcome) = if report.passed() {
        (LogLevel::Info, Outcome::Pass)
    } else {
        (LogLevel::Error, Outcome::Fail)
    };
    let entry = emitter
        .entry(level, "scenario_end")
        .with_outcome(outcome)
        .with_duration_ms(report.duration_ms)
        .with_stats(stats)
        .with_details(serde_json::json!({
            "checks": report.checks,
            "failures": report.failures,
        }));
    emitter.emit_entry(entry)?;
    emitter.flush()?;
    Ok(report)
}
