//! Per-thread error slots.
//!
//! Each registered thread owns one [`ErrorContext`]; the slot it wraps is
//! found again through the thread's identifier. A reused identifier gets a new
//! generation, so releasing the context of a stale record never unbinds the
//! slot of the thread that took the identifier over.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::kernel::Tid;

/// Mutable error code of one thread.
#[derive(Debug, Default)]
pub struct ErrorSlot(AtomicI32);

impl ErrorSlot {
    /// Current error code.
    #[must_use]
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Replace the error code.
    pub fn set(&self, value: i32) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Ownership token for an attached slot. Consumed by [`ErrnoTable::detach`].
#[derive(Debug)]
pub struct ErrorContext {
    tid: Tid,
    generation: u64,
    slot: Arc<ErrorSlot>,
}

impl ErrorContext {
    /// Identifier the slot was attached for.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The slot itself.
    #[must_use]
    pub fn slot(&self) -> &Arc<ErrorSlot> {
        &self.slot
    }
}

/// Binding of identifiers to error slots.
#[derive(Debug, Default)]
pub struct ErrnoTable {
    slots: Mutex<BTreeMap<Tid, (u64, Arc<ErrorSlot>)>>,
    next_generation: AtomicU64,
    attached: AtomicU64,
    detached: AtomicU64,
}

impl ErrnoTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed slot for `tid`, replacing any binding it had.
    pub fn attach(&self, tid: Tid) -> ErrorContext {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ErrorSlot::default());
        self.slots.lock().insert(tid, (generation, Arc::clone(&slot)));
        self.attached.fetch_add(1, Ordering::Relaxed);
        ErrorContext {
            tid,
            generation,
            slot,
        }
    }

    /// Release a context. The binding is dropped only if it is still this one.
    pub fn detach(&self, ctx: ErrorContext) {
        let mut slots = self.slots.lock();
        if slots
            .get(&ctx.tid)
            .is_some_and(|(generation, _)| *generation == ctx.generation)
        {
            slots.remove(&ctx.tid);
        }
        drop(slots);
        self.detached.fetch_add(1, Ordering::Relaxed);
    }

    /// Slot currently bound to `tid`.
    #[must_use]
    pub fn slot(&self, tid: Tid) -> Option<Arc<ErrorSlot>> {
        self.slots.lock().get(&tid).map(|(_, slot)| Arc::clone(slot))
    }

    /// Contexts handed out and not yet released.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.attached
            .load(Ordering::Relaxed)
            .saturating_sub(self.detached.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_binds_fresh_zeroed_slot() {
        let table = ErrnoTable::new();
        let ctx = table.attach(Tid(7));
        ctx.slot().set(11);
        let found = table.slot(Tid(7)).unwrap();
        assert_eq!(found.get(), 11);
        assert_eq!(table.live(), 1);

        table.detach(ctx);
        assert!(table.slot(Tid(7)).is_none());
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn stale_detach_keeps_newer_binding() {
        let table = ErrnoTable::new();
        let old = table.attach(Tid(3));
        let new = table.attach(Tid(3));
        new.slot().set(5);

        table.detach(old);
        assert_eq!(table.slot(Tid(3)).unwrap().get(), 5);
        assert_eq!(table.live(), 1);

        table.detach(new);
        assert!(table.slot(Tid(3)).is_none());
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn slots_are_independent_per_thread() {
        let table = ErrnoTable::new();
        let a = table.attach(Tid(1));
        let b = table.attach(Tid(2));
        a.slot().set(4);
        assert_eq!(table.slot(Tid(2)).unwrap().get(), 0);
        assert_eq!(b.slot().get(), 0);
        table.detach(a);
        table.detach(b);
    }
}
