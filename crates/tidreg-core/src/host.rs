//! Hosted [`ThreadKernel`] on top of `std::thread`.
//!
//! Reproduces the semantics of a create/wait-any kernel on a normal OS:
//! small reusable identifiers, one exit notification per thread delivered
//! through a single blocking wait, and no per-thread join handle.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::KernelError;
use crate::kernel::{Entry, Priority, StackRegion, ThreadKernel, Tid};

/// Smallest stack the host gives a thread, whatever was requested.
pub const MIN_HOSTED_STACK: usize = 64 * 1024;

/// Identifiers handed to threads the kernel did not create.
const FOREIGN_TID_BASE: u32 = 0x8000_0000;

static NEXT_FOREIGN_TID: AtomicU32 = AtomicU32::new(FOREIGN_TID_BASE);

thread_local! {
    static CURRENT_TID: Cell<Option<Tid>> = const { Cell::new(None) };
}

/// When an exited thread's identifier may be handed out again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Once `wait_any_exit` has reported the exit.
    #[default]
    OnReap,
    /// As soon as the thread exits, before its exit is reported.
    OnExit,
}

#[derive(Debug, Default)]
struct HostState {
    in_use: BTreeSet<Tid>,
    priorities: BTreeMap<Tid, Priority>,
    exits: VecDeque<Tid>,
    running: usize,
    held: bool,
    interrupts: u32,
    shutdown: bool,
}

impl HostState {
    fn lowest_free(&self) -> Tid {
        let mut candidate = 1;
        for tid in &self.in_use {
            if tid.0 != candidate {
                break;
            }
            candidate += 1;
        }
        Tid(candidate)
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<HostState>,
    exited: Condvar,
    policy: ReusePolicy,
    max_threads: usize,
}

impl Inner {
    fn thread_exited(&self, tid: Tid) {
        let mut state = self.state.lock();
        state.running -= 1;
        state.priorities.remove(&tid);
        if self.policy == ReusePolicy::OnExit {
            state.in_use.remove(&tid);
        }
        state.exits.push_back(tid);
        drop(state);
        self.exited.notify_all();
    }
}

/// Hosted kernel. Cloning yields another handle to the same kernel.
#[derive(Debug, Clone)]
pub struct HostKernel {
    inner: Arc<Inner>,
}

impl HostKernel {
    /// Default number of simultaneously live threads.
    pub const DEFAULT_MAX_THREADS: usize = 1024;

    /// Kernel that reuses identifiers once their exit has been reported.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(ReusePolicy::OnReap, Self::DEFAULT_MAX_THREADS)
    }

    /// Kernel with an explicit reuse policy and live-thread limit.
    #[must_use]
    pub fn with_limits(policy: ReusePolicy, max_threads: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HostState::default()),
                exited: Condvar::new(),
                policy,
                max_threads,
            }),
        }
    }

    /// Make one pending or future `wait_any_exit` return `Interrupted`.
    pub fn interrupt(&self) {
        self.inner.state.lock().interrupts += 1;
        self.inner.exited.notify_all();
    }

    /// Withhold (or release) delivery of exit notifications.
    pub fn hold_exits(&self, held: bool) {
        self.inner.state.lock().held = held;
        self.inner.exited.notify_all();
    }

    /// Stop delivering exits; every wait returns `Shutdown` from now on.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.exited.notify_all();
    }

    /// Exit notifications not yet reported.
    #[must_use]
    pub fn pending_exits(&self) -> usize {
        self.inner.state.lock().exits.len()
    }

    /// Threads created and not yet exited.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Priority a still-running thread was created with.
    #[must_use]
    pub fn priority_of(&self, tid: Tid) -> Option<Priority> {
        self.inner.state.lock().priorities.get(&tid).copied()
    }
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadKernel for HostKernel {
    fn create(
        &self,
        entry: Entry,
        priority: Priority,
        stack: StackRegion,
    ) -> Result<Tid, KernelError> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(KernelError::Shutdown);
        }
        if state.running >= self.inner.max_threads {
            return Err(KernelError::NoResources);
        }
        let tid = state.lowest_free();
        state.in_use.insert(tid);
        state.priorities.insert(tid, priority);
        state.running += 1;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("tid-{}", tid.0))
            .stack_size(stack.len().max(MIN_HOSTED_STACK))
            .spawn(move || {
                CURRENT_TID.with(|slot| slot.set(Some(tid)));
                // A panicking thread still exits as far as waiters are concerned.
                let _ = panic::catch_unwind(AssertUnwindSafe(entry));
                inner.thread_exited(tid);
            });

        match spawned {
            Ok(_detached) => Ok(tid),
            Err(_) => {
                let mut state = self.inner.state.lock();
                state.in_use.remove(&tid);
                state.priorities.remove(&tid);
                state.running -= 1;
                Err(KernelError::NoResources)
            }
        }
    }

    fn wait_any_exit(&self) -> Result<Tid, KernelError> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return Err(KernelError::Shutdown);
            }
            if state.interrupts > 0 {
                state.interrupts -= 1;
                return Err(KernelError::Interrupted);
            }
            if !state.held {
                if let Some(tid) = state.exits.pop_front() {
                    if self.inner.policy == ReusePolicy::OnReap {
                        state.in_use.remove(&tid);
                    }
                    return Ok(tid);
                }
            }
            self.inner.exited.wait(&mut state);
        }
    }

    fn current_tid(&self) -> Tid {
        CURRENT_TID.with(|slot| match slot.get() {
            Some(tid) => tid,
            None => {
                let tid = Tid(NEXT_FOREIGN_TID.fetch_add(1, Ordering::Relaxed));
                slot.set(Some(tid));
                tid
            }
        })
    }
}
