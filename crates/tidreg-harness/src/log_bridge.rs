//! `log` facade backend that buffers records for the JSONL emitter.
//!
//! The core logs through `log`; the harness installs [`LogBridge`] once and
//! drains the captured records into its structured log after each phase.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::structured_log::{LogEmitter, LogLevel};

/// One captured `log` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

/// Buffering logger. Records past `capacity` are counted, not kept.
#[derive(Debug)]
pub struct LogBridge {
    records: Mutex<Vec<CapturedRecord>>,
    capacity: usize,
    dropped: AtomicU64,
}

static BRIDGE: LogBridge = LogBridge::new();

impl LogBridge {
    /// Records buffered between two drains by default.
    pub const DEFAULT_CAPACITY: usize = 16 * 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Install the process-wide bridge, capturing records up to `max`.
    ///
    /// Returns the bridge even when another logger was installed first; it
    /// then simply captures nothing.
    pub fn install(max: log::LevelFilter) -> &'static LogBridge {
        if log::set_logger(&BRIDGE).is_ok() {
            log::set_max_level(max);
        }
        &BRIDGE
    }

    /// Take every record captured so far.
    pub fn drain(&self) -> Vec<CapturedRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Records discarded since the last forward because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Move captured records into `emitter` as `core_log` events.
    ///
    /// Records lost to the capacity limit are reported as one
    /// `core_log_dropped` warning.
    pub fn forward(&self, emitter: &mut LogEmitter) -> std::io::Result<usize> {
        let records = self.drain();
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        for record in &records {
            let entry = emitter
                .entry(record.level, "core_log")
                .with_details(serde_json::json!({
                    "target": record.target,
                    "message": record.message,
                }));
            emitter.emit_entry(entry)?;
        }
        if dropped > 0 {
            let entry = emitter
                .entry(LogLevel::Warn, "core_log_dropped")
                .with_details(serde_json::json!({
                    "dropped": dropped,
                    "capacity": self.capacity,
                }));
            emitter.emit_entry(entry)?;
        }
        Ok(records.len())
    }
}

impl Default for LogBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            drop(records);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        records.push(CapturedRecord {
            level: record.level().into(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}
