//! Identifier-keyed index of registered threads.
//!
//! One lock serializes every operation. Records removed from the index are
//! handed back to the caller so their stacks are freed after the lock is
//! released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::errno::ErrnoTable;
use crate::kernel::Tid;
use crate::record::{RecordView, ThreadRecord};

#[derive(Default)]
struct Index {
    records: BTreeMap<Tid, ThreadRecord>,
    /// Exit notifications already paid for by a stale eviction, per identifier.
    settled: BTreeMap<Tid, u32>,
}

impl Index {
    fn insert(&mut self, mut record: ThreadRecord, contexts: &ErrnoTable) -> Option<ThreadRecord> {
        let tid = record.tid;
        let stale = self.records.remove(&tid).map(|mut old| {
            debug_assert_eq!(old.tid, tid);
            if let Some(ctx) = old.take_error_context() {
                contexts.detach(ctx);
            }
            old
        });
        if stale.is_some() {
            *self.settled.entry(tid).or_insert(0) += 1;
        }
        record.error_context = Some(contexts.attach(tid));
        self.records.insert(tid, record);
        stale
    }
}

/// Outcome of handing an exit notification to the registry.
#[derive(Debug)]
pub enum Reap {
    /// The record was removed; the caller now owns it.
    Evicted(ThreadRecord),
    /// The exit belonged to a record already evicted as stale.
    Absorbed,
    /// No record and nothing settled under that identifier.
    Unknown,
}

/// A record made visible under the identifier the kernel assigned.
#[derive(Debug)]
pub struct Published {
    pub tid: Tid,
    /// Record that still held the identifier, evicted as stale.
    pub stale: Option<ThreadRecord>,
}

/// Registry of live and exited-but-unreaped threads.
#[derive(Default)]
pub struct Registry {
    index: Mutex<Index>,
    next_serial: AtomicU64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh spawn sequence number, never 0.
    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert `record` under its identifier and attach its error context.
    ///
    /// A record already present under the same identifier is stale: its
    /// context is detached, it is removed, and it is returned so the caller
    /// drops it outside the lock.
    pub fn register(&self, record: ThreadRecord, contexts: &ErrnoTable) -> Option<ThreadRecord> {
        self.index.lock().insert(record, contexts)
    }

    /// Run `create` under the lock and register `record` under the identifier
    /// it returns before the lock is released.
    ///
    /// Neither the new thread nor the collector can look the identifier up
    /// in between. On failure nothing is registered and `record` is dropped
    /// after the lock is released.
    pub fn publish<E>(
        &self,
        record: ThreadRecord,
        contexts: &ErrnoTable,
        create: impl FnOnce() -> Result<Tid, E>,
    ) -> Result<Published, E> {
        let mut index = self.index.lock();
        match create() {
            Ok(tid) => {
                let stale = index.insert(record.with_tid(tid), contexts);
                Ok(Published { tid, stale })
            }
            Err(err) => {
                drop(index);
                drop(record);
                Err(err)
            }
        }
    }

    /// Whether the record under `tid` is the one published with `serial`.
    ///
    /// Waits for a publication in progress, so a new thread calling this
    /// first never runs ahead of its own record.
    #[must_use]
    pub fn confirm(&self, tid: Tid, serial: u64) -> bool {
        self.index
            .lock()
            .records
            .get(&tid)
            .is_some_and(|record| record.serial == serial)
    }

    /// Read-only summary of the record registered under `tid`.
    #[must_use]
    pub fn find(&self, tid: Tid) -> Option<RecordView> {
        self.index.lock().records.get(&tid).map(ThreadRecord::view)
    }

    /// Whether a record is registered under `tid`.
    #[must_use]
    pub fn contains(&self, tid: Tid) -> bool {
        self.index.lock().records.contains_key(&tid)
    }

    /// Account for the exit of `tid`.
    pub fn reap(&self, tid: Tid) -> Reap {
        let mut index = self.index.lock();
        if let Some(pending) = index.settled.get_mut(&tid) {
            *pending -= 1;
            if *pending == 0 {
                index.settled.remove(&tid);
            }
            return Reap::Absorbed;
        }
        match index.records.remove(&tid) {
            Some(record) => Reap::Evicted(record),
            None => Reap::Unknown,
        }
    }

    /// Number of registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().records.len()
    }

    /// Whether no record is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.lock().records.is_empty()
    }

    /// Identifiers currently registered, in order.
    #[must_use]
    pub fn tids(&self) -> Vec<Tid> {
        self.index.lock().records.keys().copied().collect()
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("Registry")
            .field("records", &index.records.len())
            .field("settled", &index.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, mpsc};
    use std::time::Duration;

    use super::*;
    use crate::kernel::Priority;
    use crate::record::ThreadStack;

    fn record(tid: u32, name: &str) -> ThreadRecord {
        let stack = ThreadStack::allocate(64).unwrap();
        ThreadRecord::new(name, Priority::DEFAULT, stack).with_tid(Tid(tid))
    }

    #[test]
    fn register_find_reap() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        assert!(registry.register(record(5, "a"), &contexts).is_none());

        let view = registry.find(Tid(5)).unwrap();
        assert_eq!(view.name, "a");
        assert!(registry.contains(Tid(5)));
        assert!(registry.find(Tid(6)).is_none());

        let Reap::Evicted(mut removed) = registry.reap(Tid(5)) else {
            panic!("expected eviction");
        };
        assert!(registry.is_empty());
        contexts.detach(removed.take_error_context().unwrap());
        assert_eq!(contexts.live(), 0);
        assert!(matches!(registry.reap(Tid(5)), Reap::Unknown));
    }

    #[test]
    fn stale_registration_evicts_and_detaches_old_record() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        registry.register(record(9, "old"), &contexts);
        let stale = registry.register(record(9, "new"), &contexts).unwrap();

        assert_eq!(stale.name(), "old");
        assert!(stale.error_context().is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(Tid(9)).unwrap().name, "new");
        assert_eq!(contexts.live(), 1);
        assert!(contexts.slot(Tid(9)).is_some());
    }

    #[test]
    fn exit_of_stale_record_is_absorbed_once() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        registry.register(record(4, "old"), &contexts);
        drop(registry.register(record(4, "new"), &contexts));

        assert!(matches!(registry.reap(Tid(4)), Reap::Absorbed));
        assert!(registry.contains(Tid(4)));

        match registry.reap(Tid(4)) {
            Reap::Evicted(record) => assert_eq!(record.name(), "new"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert!(matches!(registry.reap(Tid(4)), Reap::Unknown));
    }

    #[test]
    fn reap_of_unknown_identifier_is_benign() {
        let registry = Registry::new();
        assert!(matches!(registry.reap(Tid(123)), Reap::Unknown));
        assert!(registry.is_empty());
    }

    #[test]
    fn publish_registers_under_assigned_identifier() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        let serial = registry.next_serial();
        let fresh = ThreadRecord::new("tcpip", Priority(2), ThreadStack::allocate(64).unwrap())
            .with_serial(serial);

        let published = registry
            .publish(fresh, &contexts, || Ok::<_, ()>(Tid(12)))
            .unwrap();
        assert_eq!(published.tid, Tid(12));
        assert!(published.stale.is_none());
        assert_eq!(registry.find(Tid(12)).unwrap().name, "tcpip");
        assert!(registry.confirm(Tid(12), serial));
        assert!(!registry.confirm(Tid(12), serial + 1));
        assert!(!registry.confirm(Tid(13), serial));
        assert_eq!(contexts.live(), 1);
    }

    #[test]
    fn failed_publish_registers_nothing() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        let err = registry
            .publish(record(0, "refused"), &contexts, || Err::<Tid, _>("full"))
            .unwrap_err();
        assert_eq!(err, "full");
        assert!(registry.is_empty());
        assert_eq!(contexts.live(), 0);
    }

    #[test]
    fn publish_over_stale_record_settles_its_exit() {
        let registry = Registry::new();
        let contexts = ErrnoTable::new();
        registry.register(record(3, "old"), &contexts);

        let published = registry
            .publish(record(0, "new"), &contexts, || Ok::<_, ()>(Tid(3)))
            .unwrap();
        assert_eq!(published.stale.unwrap().name(), "old");
        assert!(matches!(registry.reap(Tid(3)), Reap::Absorbed));
        assert!(matches!(registry.reap(Tid(3)), Reap::Evicted(_)));
    }

    #[test]
    fn serials_are_distinct_and_nonzero() {
        let registry = Registry::new();
        let a = registry.next_serial();
        let b = registry.next_serial();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_registrations_keep_identifiers_unique() {
        let registry = Arc::new(Registry::new());
        let contexts = Arc::new(ErrnoTable::new());
        let barrier = Arc::new(Barrier::new(8));
        let mut workers = Vec::new();
        for worker in 0..8u32 {
            let registry = Arc::clone(&registry);
            let contexts = Arc::clone(&contexts);
            let barrier = Arc::clone(&barrier);
            workers.push(std::thread::spawn(move || {
                barrier.wait();
                let mut stale = 0;
                for i in 0..64u32 {
                    // Half the identifiers collide across workers.
                    let tid = if i % 2 == 0 { i } else { worker * 1000 + i };
                    if registry.register(record(tid, "w"), &contexts).is_some() {
                        stale += 1;
                    }
                }
                stale
            }));
        }
        let stale: u32 = workers.into_iter().map(|w| w.join().unwrap()).sum();

        let tids = registry.tids();
        let mut deduped = tids.clone();
        deduped.dedup();
        assert_eq!(tids, deduped);
        // 32 shared identifiers, 8 * 32 private ones.
        assert_eq!(tids.len(), 32 + 8 * 32);
        assert_eq!(stale, 7 * 32);
        assert_eq!(contexts.live(), tids.len() as u64);
    }

    #[test]
    fn exit_reported_during_publish_waits_for_the_record() {
        let registry = Arc::new(Registry::new());
        let contexts = ErrnoTable::new();
        let (tx, rx) = mpsc::channel();
        let mut reaper = None;

        let published = registry.publish(record(0, "quick"), &contexts, || {
            let registry = Arc::clone(&registry);
            reaper = Some(std::thread::spawn(move || {
                let outcome = registry.reap(Tid(1));
                tx.send(()).unwrap();
                outcome
            }));
            std::thread::sleep(Duration::from_millis(20));
            assert!(rx.try_recv().is_err());
            Ok::<_, ()>(Tid(1))
        });
        assert_eq!(published.unwrap().tid, Tid(1));

        let outcome = reaper.unwrap().join().unwrap();
        match outcome {
            Reap::Evicted(record) => assert_eq!(record.name(), "quick"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert!(registry.is_empty());
    }
}
