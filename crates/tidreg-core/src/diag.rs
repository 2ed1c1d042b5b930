//! Counters describing what the registry and collector have done.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters, bumped with relaxed ordering from every path.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) spawned: AtomicU64,
    pub(crate) create_failures: AtomicU64,
    pub(crate) registered: AtomicU64,
    pub(crate) stale_evictions: AtomicU64,
    pub(crate) unconfirmed_starts: AtomicU64,
    pub(crate) absorbed_exits: AtomicU64,
    pub(crate) reaped: AtomicU64,
    pub(crate) unknown_exits: AtomicU64,
    pub(crate) interrupted_waits: AtomicU64,
    pub(crate) joins: AtomicU64,
    pub(crate) join_waits: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            spawned: load(&self.spawned),
            create_failures: load(&self.create_failures),
            registered: load(&self.registered),
            stale_evictions: load(&self.stale_evictions),
            unconfirmed_starts: load(&self.unconfirmed_starts),
            absorbed_exits: load(&self.absorbed_exits),
            reaped: load(&self.reaped),
            unknown_exits: load(&self.unknown_exits),
            interrupted_waits: load(&self.interrupted_waits),
            joins: load(&self.joins),
            join_waits: load(&self.join_waits),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Threads the kernel accepted.
    pub spawned: u64,
    /// Spawns the kernel refused.
    pub create_failures: u64,
    /// Records published under a kernel-assigned identifier.
    pub registered: u64,
    /// Publications that found and evicted a stale record.
    pub stale_evictions: u64,
    /// Threads that started without finding their own record.
    pub unconfirmed_starts: u64,
    /// Exit notifications already settled by a stale eviction.
    pub absorbed_exits: u64,
    /// Records evicted by the collector.
    pub reaped: u64,
    /// Exit notifications with no matching record.
    pub unknown_exits: u64,
    /// Collector waits that returned `Interrupted`.
    pub interrupted_waits: u64,
    /// Completed join calls.
    pub joins: u64,
    /// Times a joiner blocked on the join gate.
    pub join_waits: u64,
}

impl StatsSnapshot {
    /// Records released so far, by either eviction path.
    #[must_use]
    pub const fn released(&self) -> u64 {
        self.reaped + self.stale_evictions
    }

    /// Registered records not yet released.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.registered.saturating_sub(self.released())
    }
}
