//! Contract of the underlying thread kernel.
//!
//! The kernel only knows how to start a thread and how to report that *some*
//! thread exited. Everything else (join by id, errno slots, stack release) is
//! layered on top by this crate.

use core::fmt;
use core::ptr::NonNull;

use crate::error::KernelError;

/// Kernel-assigned thread identifier.
///
/// Unique among registered threads only; the kernel hands a value out again
/// once the exit of its previous owner has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl Tid {
    /// Raw identifier value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Scheduling priority forwarded verbatim to the kernel (lower runs first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Priority used for ordinary worker threads.
    pub const DEFAULT: Self = Self(4);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Function a created thread runs. Returning from it is the thread's exit.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Memory handed to the kernel as the new thread's stack.
///
/// The region stays owned by the caller; the kernel never frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    base: NonNull<u8>,
    len: usize,
}

impl StackRegion {
    pub(crate) fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Lowest address of the region.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has no usable bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Thread primitives the registry is built on.
///
/// Implementations must deliver exactly one exit notification through
/// [`ThreadKernel::wait_any_exit`] for every thread started by
/// [`ThreadKernel::create`].
pub trait ThreadKernel: Send + Sync + 'static {
    /// Start a thread running `entry` on `stack` at `priority`.
    ///
    /// The identifier of the new thread is returned; the thread may already be
    /// running (or finished) by the time this returns.
    fn create(
        &self,
        entry: Entry,
        priority: Priority,
        stack: StackRegion,
    ) -> Result<Tid, KernelError>;

    /// Block until some created thread has exited and return its identifier.
    ///
    /// [`KernelError::Interrupted`] is transient and may be retried.
    fn wait_any_exit(&self) -> Result<Tid, KernelError>;

    /// Identifier of the calling thread.
    fn current_tid(&self) -> Tid;
}
