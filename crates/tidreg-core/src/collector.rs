//! Exit collector and the join gate it signals.
//!
//! The collector is the only consumer of the kernel's wait-any primitive. Each
//! exit it receives is settled against the registry; an evicted record has its
//! error context released and its stack freed before every joiner is woken.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::diag::bump;
use crate::error::KernelError;
use crate::kernel::{ThreadKernel, Tid};
use crate::registry::Reap;
use crate::threads::Shared;

/// Rendezvous between the collector and joiners.
///
/// The counter advances on every eviction. A joiner that read the counter
/// before checking the registry cannot miss an eviction that happens between
/// its check and its wait.
#[derive(Debug, Default)]
pub(crate) struct JoinGate {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl JoinGate {
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Block until the epoch differs from `seen`. Spurious wakeups loop here.
    pub(crate) fn wait_past(&self, seen: u64) {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            self.cond.wait(&mut epoch);
        }
    }

    /// Advance the epoch and wake every joiner.
    pub(crate) fn broadcast(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        drop(epoch);
        self.cond.notify_all();
    }
}

/// Log and abort. Used where the subsystem cannot continue.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("{args}");
    eprintln!("tidreg: fatal: {args}");
    std::process::abort()
}

/// Collector loop. Returns only when the kernel shuts down.
pub(crate) fn run<K: ThreadKernel>(shared: &Shared<K>) {
    loop {
        let tid = match shared.kernel.wait_any_exit() {
            Ok(tid) => tid,
            Err(err) if err.is_retryable() => {
                bump(&shared.stats.interrupted_waits);
                continue;
            }
            Err(KernelError::Shutdown) => {
                log::info!("exit collector stopping: kernel shut down");
                return;
            }
            Err(err) => fatal(format_args!("exit collector wait failed: {err}")),
        };
        settle(shared, tid);
    }
}

/// Settle one exit notification.
pub(crate) fn settle<K: ThreadKernel>(shared: &Shared<K>, tid: Tid) {
    match shared.registry.reap(tid) {
        Reap::Evicted(mut record) => {
            if let Some(ctx) = record.take_error_context() {
                shared.contexts.detach(ctx);
            }
            if shared.config.diagnostics.logs_events() {
                log::trace!("{tid}: reaped `{}`", record.name());
            }
            drop(record);
            bump(&shared.stats.reaped);
            shared.gate.broadcast();
        }
        Reap::Absorbed => {
            bump(&shared.stats.absorbed_exits);
            if shared.config.diagnostics.logs_events() {
                log::debug!("{tid}: exit already settled by stale eviction");
            }
        }
        Reap::Unknown => {
            bump(&shared.stats.unknown_exits);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn broadcast_releases_waiter_past_seen_epoch() {
        let gate = Arc::new(JoinGate::default());
        let seen = gate.epoch();
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_past(seen))
        };
        std::thread::sleep(Duration::from_millis(10));
        gate.broadcast();
        waiter.join().unwrap();
        assert_eq!(gate.epoch(), seen + 1);
    }

    #[test]
    fn wait_on_stale_epoch_returns_immediately() {
        let gate = JoinGate::default();
        let seen = gate.epoch();
        gate.broadcast();
        gate.wait_past(seen);
    }
}
