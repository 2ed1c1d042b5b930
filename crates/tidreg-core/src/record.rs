//! Per-thread metadata record and the stack it owns.

use core::fmt;
use core::ptr::NonNull;
use std::collections::TryReserveError;

use crate::errno::ErrorContext;
use crate::kernel::{Priority, StackRegion, Tid};

/// Heap block backing a thread's stack. Freed on drop.
///
/// The bytes are reserved but never written here; the kernel owns their
/// contents once the thread runs.
pub struct ThreadStack {
    mem: Vec<u8>,
    size: usize,
}

impl ThreadStack {
    /// Reserve `size` bytes without aborting on exhaustion.
    pub fn allocate(size: usize) -> Result<Self, TryReserveError> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(size)?;
        Ok(Self { mem, size })
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the stack has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Region to hand to the kernel. Stays valid while `self` is alive,
    /// including after `self` is moved (the block itself never moves).
    #[must_use]
    pub fn region(&mut self) -> StackRegion {
        let spare = self.mem.spare_capacity_mut();
        let base: NonNull<u8> = NonNull::from(spare).cast();
        StackRegion::new(base, self.size)
    }
}

impl fmt::Debug for ThreadStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStack")
            .field("len", &self.size)
            .finish()
    }
}

/// Metadata of one spawned thread, from spawn until eviction.
pub struct ThreadRecord {
    pub(crate) tid: Tid,
    /// Spawn sequence number; tells a thread's own record from any other
    /// record that later lands under the same identifier.
    pub(crate) serial: u64,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) stack: ThreadStack,
    pub(crate) error_context: Option<ErrorContext>,
}

impl ThreadRecord {
    /// Record for a thread that has not been started yet.
    ///
    /// The identifier is a placeholder until the kernel has assigned one.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: Priority, stack: ThreadStack) -> Self {
        Self {
            tid: Tid(0),
            serial: 0,
            name: name.into(),
            priority,
            stack,
            error_context: None,
        }
    }

    /// Same record, pre-assigned to `tid`. For registries driven without a kernel.
    #[must_use]
    pub fn with_tid(mut self, tid: Tid) -> Self {
        self.tid = tid;
        self
    }

    pub(crate) fn with_serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    /// Identifier the record is (or will be) registered under.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Diagnostic name given at spawn.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attached error context, if registered.
    #[must_use]
    pub fn error_context(&self) -> Option<&ErrorContext> {
        self.error_context.as_ref()
    }

    /// Detach the error context so it can be handed back to its table.
    pub fn take_error_context(&mut self) -> Option<ErrorContext> {
        self.error_context.take()
    }

    pub(crate) fn stack_region(&mut self) -> StackRegion {
        self.stack.region()
    }

    /// Read-only summary.
    #[must_use]
    pub fn view(&self) -> RecordView {
        RecordView {
            tid: self.tid,
            name: self.name.clone(),
            priority: self.priority,
            stack_size: self.stack.len(),
        }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("tid", &self.tid)
            .field("serial", &self.serial)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("stack", &self.stack)
            .field("error_context", &self.error_context)
            .finish()
    }
}

/// Snapshot of a registered record, safe to hold after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordView {
    pub tid: Tid,
    pub name: String,
    pub priority: Priority,
    pub stack_size: usize,
}
