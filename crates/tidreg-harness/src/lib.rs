//! Stress and collision harness for tidreg.
//!
//! This crate provides:
//! - Scenario runners that drive a [`tidreg_core::Threads`] subsystem and
//!   check its invariants after the run
//! - A JSONL structured-log contract for scenario evidence
//! - A `log` bridge that captures the core's diagnostics into that log

#![forbid(unsafe_code)]

pub mod log_bridge;
pub mod scenario;
pub mod structured_log;

pub use scenario::{CollisionConfig, ScenarioError, ScenarioReport, StressConfig};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
