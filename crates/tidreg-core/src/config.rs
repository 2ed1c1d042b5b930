//! Subsystem configuration.
//!
//! The diagnostics level is set via the `TIDREG_DIAG` environment variable:
//! - `counters` (default): statistics counters only, no log output from the
//!   hot paths.
//! - `trace`: counters plus `log` records for spawn, stale collisions and
//!   reaping.
//! - `off`: counters only; stale collisions are not logged either.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::kernel::Priority;

/// How much the subsystem reports about itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Diagnostics {
    /// No log output.
    Off,
    /// Counters only.
    #[default]
    Counters,
    /// Counters and per-event log records.
    Trace,
}

impl Diagnostics {
    /// Parse from string (case-insensitive). Unknown values select the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Self::Off,
            "trace" | "verbose" | "2" => Self::Trace,
            _ => Self::Counters,
        }
    }

    /// Whether stale same-identifier registrations are logged.
    #[must_use]
    pub const fn logs_stale(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Whether every spawn/reap is logged.
    #[must_use]
    pub const fn logs_events(self) -> bool {
        matches!(self, Self::Trace)
    }
}

// 0=unresolved, 1=Off, 2=Counters, 3=Trace.
static CACHED_DIAG: AtomicU8 = AtomicU8::new(0);

const DIAG_UNRESOLVED: u8 = 0;
const DIAG_OFF: u8 = 1;
const DIAG_COUNTERS: u8 = 2;
const DIAG_TRACE: u8 = 3;

fn diag_to_u8(level: Diagnostics) -> u8 {
    match level {
        Diagnostics::Off => DIAG_OFF,
        Diagnostics::Counters => DIAG_COUNTERS,
        Diagnostics::Trace => DIAG_TRACE,
    }
}

fn u8_to_diag(v: u8) -> Diagnostics {
    match v {
        DIAG_OFF => Diagnostics::Off,
        DIAG_TRACE => Diagnostics::Trace,
        _ => Diagnostics::Counters,
    }
}

/// Diagnostics level from the environment (read on first call, cached after).
#[must_use]
pub fn diagnostics_from_env() -> Diagnostics {
    let cached = CACHED_DIAG.load(Ordering::Relaxed);
    if cached != DIAG_UNRESOLVED {
        return u8_to_diag(cached);
    }
    let level = std::env::var("TIDREG_DIAG")
        .map(|v| Diagnostics::from_str_loose(&v))
        .unwrap_or_default();
    // Racing resolvers read the same variable, so whichever store wins agrees.
    CACHED_DIAG.store(diag_to_u8(level), Ordering::Release);
    level
}

/// Knobs for one [`crate::Threads`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadsConfig {
    /// Stack size used when a spawn asks for 0 bytes.
    pub default_stack_size: usize,
    /// Stack handed to the kernel for the exit collector.
    pub collector_stack_size: usize,
    /// Kernel priority of the exit collector.
    pub collector_priority: Priority,
    /// Logging level of the subsystem.
    pub diagnostics: Diagnostics,
}

impl ThreadsConfig {
    /// Default stack for worker threads: 16 KiB.
    pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;
    /// The collector only loops over a wait call; 512 bytes suffice.
    pub const COLLECTOR_STACK_SIZE: usize = 512;

    /// Replace the diagnostics level.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Stack size to allocate for a spawn request of `requested` bytes.
    #[must_use]
    pub fn stack_size_for(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_stack_size
        } else {
            requested
        }
    }
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            default_stack_size: Self::DEFAULT_STACK_SIZE,
            collector_stack_size: Self::COLLECTOR_STACK_SIZE,
            collector_priority: Priority(4),
            diagnostics: diagnostics_from_env(),
        }
    }
}
