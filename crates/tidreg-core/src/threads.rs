//! Registry-facing API: spawn and publish, join by identifier, and
//! per-thread error slots.

use std::alloc::{Layout, handle_alloc_error};
use std::sync::Arc;

use crate::collector::{self, JoinGate, fatal};
use crate::config::ThreadsConfig;
use crate::diag::{Stats, StatsSnapshot, bump};
use crate::errno::{ErrnoTable, ErrorSlot};
use crate::error::ThreadError;
use crate::kernel::{Entry, Priority, ThreadKernel, Tid};
use crate::record::{RecordView, ThreadRecord, ThreadStack};
use crate::registry::{Published, Registry};

/// State shared by the API, every trampoline and the collector.
pub(crate) struct Shared<K: ThreadKernel> {
    pub(crate) kernel: K,
    pub(crate) registry: Registry,
    pub(crate) contexts: ErrnoTable,
    pub(crate) gate: JoinGate,
    pub(crate) stats: Stats,
    pub(crate) config: ThreadsConfig,
    /// Error slot of threads that were not spawned through this subsystem.
    fallback_errno: Arc<ErrorSlot>,
}

/// Handle to one thread subsystem. Clones share the same registry.
pub struct Threads<K: ThreadKernel> {
    shared: Arc<Shared<K>>,
    collector: Tid,
}

impl<K: ThreadKernel> Clone for Threads<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            collector: self.collector,
        }
    }
}

impl<K: ThreadKernel> std::fmt::Debug for Threads<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threads")
            .field("collector", &self.collector)
            .field("registry", &self.shared.registry)
            .field("config", &self.shared.config)
            .finish()
    }
}

fn allocate_stack(name: &str, size: usize) -> ThreadStack {
    match ThreadStack::allocate(size) {
        Ok(stack) => stack,
        Err(_) => {
            log::error!("no memory for thread: {name} ({size} byte stack)");
            match Layout::array::<u8>(size) {
                Ok(layout) => handle_alloc_error(layout),
                Err(_) => fatal(format_args!("no memory for thread: {name}")),
            }
        }
    }
}

/// First code every spawned thread runs.
///
/// Confirming the record blocks until `spawn` has published it, so the
/// thread's error slot is bound before `work` starts.
fn trampoline<K: ThreadKernel>(shared: &Shared<K>, serial: u64, work: Entry) {
    let tid = shared.kernel.current_tid();
    if !shared.registry.confirm(tid, serial) {
        bump(&shared.stats.unconfirmed_starts);
        log::error!("{tid}: started without its own record registered; running unregistered");
    }
    work();
}

impl<K: ThreadKernel> Threads<K> {
    /// Build the subsystem and start its exit collector on `kernel`.
    pub fn start(kernel: K, config: ThreadsConfig) -> Result<Self, ThreadError> {
        let shared = Arc::new(Shared {
            kernel,
            registry: Registry::new(),
            contexts: ErrnoTable::new(),
            gate: JoinGate::default(),
            stats: Stats::default(),
            config,
            fallback_errno: Arc::new(ErrorSlot::default()),
        });

        let mut stack = allocate_stack("collector", config.collector_stack_size);
        let region = stack.region();
        let worker = Arc::clone(&shared);
        let entry: Entry = Box::new(move || {
            let _stack = stack;
            collector::run(&worker);
        });
        let collector = shared
            .kernel
            .create(entry, config.collector_priority, region)
            .map_err(ThreadError::Collector)?;
        log::debug!("exit collector started as {collector}");

        Ok(Self { shared, collector })
    }

    /// Start `work` on a new kernel thread.
    ///
    /// The record is registered under the new identifier before this
    /// returns, so the identifier can be joined immediately. A `stack_size`
    /// of 0 selects the configured default. Running out of memory for the
    /// stack aborts.
    pub fn spawn<F>(
        &self,
        name: &str,
        work: F,
        stack_size: usize,
        priority: Priority,
    ) -> Result<Tid, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let size = shared.config.stack_size_for(stack_size);
        let serial = shared.registry.next_serial();
        let mut record =
            ThreadRecord::new(name, priority, allocate_stack(name, size)).with_serial(serial);
        let region = record.stack_region();

        let worker = Arc::clone(shared);
        let work: Entry = Box::new(work);
        let entry: Entry = Box::new(move || trampoline(&worker, serial, work));

        let published = shared.registry.publish(record, &shared.contexts, || {
            shared.kernel.create(entry, priority, region)
        });

        match published {
            Ok(Published { tid, stale }) => {
                bump(&shared.stats.spawned);
                bump(&shared.stats.registered);
                if let Some(stale) = stale {
                    bump(&shared.stats.stale_evictions);
                    if shared.config.diagnostics.logs_stale() {
                        log::warn!(
                            "{tid}: `{name}` reused it while `{}` was still registered; evicted stale record",
                            stale.name()
                        );
                    }
                    drop(stale);
                }
                if shared.config.diagnostics.logs_events() {
                    log::debug!("{tid}: spawned `{name}` ({size} byte stack, {priority:?})");
                }
                Ok(tid)
            }
            Err(source) => {
                bump(&shared.stats.create_failures);
                Err(ThreadError::Create {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// [`Threads::spawn`], aborting the process on any error.
    pub fn spawn_or_fail<F>(&self, name: &str, work: F, stack_size: usize, priority: Priority) -> Tid
    where
        F: FnOnce() + Send + 'static,
    {
        match self.spawn(name, work, stack_size, priority) {
            Ok(tid) => tid,
            Err(err) => fatal(format_args!("{err}")),
        }
    }

    /// Block until `tid` is no longer registered.
    ///
    /// Returns at once for identifiers that were never issued or are already
    /// reaped. Joining the calling thread fails with [`ThreadError::SelfJoin`].
    pub fn join(&self, tid: Tid) -> Result<(), ThreadError> {
        if tid == self.shared.kernel.current_tid() {
            return Err(ThreadError::SelfJoin);
        }
        loop {
            let seen = self.shared.gate.epoch();
            if !self.shared.registry.contains(tid) {
                bump(&self.shared.stats.joins);
                return Ok(());
            }
            bump(&self.shared.stats.join_waits);
            self.shared.gate.wait_past(seen);
        }
    }

    /// Error slot of the calling thread.
    #[must_use]
    pub fn errno_slot(&self) -> Arc<ErrorSlot> {
        let tid = self.shared.kernel.current_tid();
        self.shared
            .contexts
            .slot(tid)
            .unwrap_or_else(|| Arc::clone(&self.shared.fallback_errno))
    }

    /// Error code of the calling thread.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.errno_slot().get()
    }

    /// Set the error code of the calling thread.
    pub fn set_errno(&self, value: i32) {
        self.errno_slot().set(value);
    }

    /// Summary of the record registered under `tid`.
    #[must_use]
    pub fn find(&self, tid: Tid) -> Option<RecordView> {
        self.shared.registry.find(tid)
    }

    /// Number of registered (not yet reaped) threads.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.shared.registry.len()
    }

    /// Error contexts attached and not yet released.
    #[must_use]
    pub fn live_contexts(&self) -> u64 {
        self.shared.contexts.live()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Configuration the subsystem was started with.
    #[must_use]
    pub fn config(&self) -> &ThreadsConfig {
        &self.shared.config
    }

    /// Underlying kernel.
    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.shared.kernel
    }

    /// Identifier of the exit collector.
    #[must_use]
    pub fn collector_tid(&self) -> Tid {
        self.collector
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::Diagnostics;
    use crate::error::KernelError;
    use crate::host::HostKernel;

    fn subsystem() -> Threads<HostKernel> {
        let config = ThreadsConfig::default().with_diagnostics(Diagnostics::Off);
        Threads::start(HostKernel::new(), config).unwrap()
    }

    fn wait_until(label: &str, timeout: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < timeout, "timeout waiting for {label}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn spawned_work_runs_and_join_returns_after_reap() {
        let threads = subsystem();
        let ran = Arc::new(AtomicUsize::new(0));
        let tid = threads
            .spawn(
                "worker",
                {
                    let ran = Arc::clone(&ran);
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                },
                0,
                Priority::DEFAULT,
            )
            .unwrap();

        threads.join(tid).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(threads.find(tid).is_none());
        wait_until("reap accounting", Duration::from_secs(5), || {
            threads.stats().reaped == 1
        });
    }

    #[test]
    fn join_straight_after_spawn_waits_for_the_work() {
        let threads = subsystem();
        for _ in 0..500 {
            let done = Arc::new(AtomicBool::new(false));
            let tid = threads
                .spawn(
                    "quick",
                    {
                        let done = Arc::clone(&done);
                        move || {
                            std::thread::yield_now();
                            done.store(true, Ordering::SeqCst);
                        }
                    },
                    0,
                    Priority::DEFAULT,
                )
                .unwrap();
            assert!(threads.find(tid).is_some() || done.load(Ordering::SeqCst));
            threads.join(tid).unwrap();
            assert!(done.load(Ordering::SeqCst), "{tid} joined before its work ran");
        }
        assert_eq!(threads.stats().unconfirmed_starts, 0);
    }

    #[test]
    fn spawned_thread_finds_its_own_record() {
        let threads = subsystem();
        let (tx, rx) = mpsc::channel();
        let inner = threads.clone();
        let tid = threads
            .spawn(
                "self-aware",
                move || {
                    let me = inner.kernel().current_tid();
                    tx.send(inner.find(me).map(|view| view.name)).unwrap();
                },
                0,
                Priority::DEFAULT,
            )
            .unwrap();
        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen.as_deref(), Some("self-aware"));
        threads.join(tid).unwrap();
        let stats = threads.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.stale_evictions, 0);
        assert_eq!(stats.unconfirmed_starts, 0);
    }

    #[test]
    fn spawn_or_fail_returns_a_joinable_identifier() {
        let threads = subsystem();
        let ran = Arc::new(AtomicBool::new(false));
        let tid = threads.spawn_or_fail(
            "must-start",
            {
                let ran = Arc::clone(&ran);
                move || ran.store(true, Ordering::SeqCst)
            },
            0,
            Priority::DEFAULT,
        );
        threads.join(tid).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn join_of_unknown_identifier_returns_immediately() {
        let threads = subsystem();
        threads.join(Tid(4242)).unwrap();
        threads.join(Tid(4242)).unwrap();
        assert_eq!(threads.stats().join_waits, 0);
    }

    #[test]
    fn self_join_is_rejected_without_blocking() {
        let threads = subsystem();
        let me = threads.kernel().current_tid();
        assert_eq!(threads.join(me), Err(ThreadError::SelfJoin));

        let (tx, rx) = mpsc::channel();
        let inner = threads.clone();
        let tid = threads
            .spawn(
                "self-joiner",
                move || {
                    let me = inner.kernel().current_tid();
                    tx.send(inner.join(me)).unwrap();
                },
                0,
                Priority::DEFAULT,
            )
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(ThreadError::SelfJoin));
        threads.join(tid).unwrap();
    }

    #[test]
    fn registered_record_carries_spawn_metadata() {
        let threads = subsystem();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let tid = threads
            .spawn(
                "tcpip",
                move || {
                    let _ = release_rx.recv();
                },
                8192,
                Priority(2),
            )
            .unwrap();
        let view = threads.find(tid).unwrap();
        assert_eq!(view.name, "tcpip");
        assert_eq!(view.stack_size, 8192);
        assert_eq!(view.priority, Priority(2));
        assert_eq!(threads.kernel().priority_of(tid), Some(Priority(2)));

        drop(release_tx);
        threads.join(tid).unwrap();
    }

    #[test]
    fn kernel_refusal_leaves_registry_untouched() {
        // One slot: taken by the collector.
        let kernel = HostKernel::with_limits(crate::host::ReusePolicy::OnReap, 1);
        let config = ThreadsConfig::default().with_diagnostics(Diagnostics::Off);
        let threads = Threads::start(kernel, config).unwrap();

        let err = threads
            .spawn("refused", || {}, 0, Priority::DEFAULT)
            .unwrap_err();
        assert_eq!(
            err,
            ThreadError::Create {
                name: "refused".to_string(),
                source: KernelError::NoResources,
            }
        );
        assert_eq!(threads.registered(), 0);
        assert_eq!(threads.live_contexts(), 0);
        assert_eq!(threads.stats().create_failures, 1);
    }

    #[test]
    fn collector_start_failure_is_reported() {
        let kernel = HostKernel::new();
        kernel.shutdown();
        let err = Threads::start(kernel, ThreadsConfig::default()).unwrap_err();
        assert_eq!(err, ThreadError::Collector(KernelError::Shutdown));
    }

    #[test]
    fn errno_is_per_thread() {
        let threads = subsystem();
        threads.set_errno(99);

        let (tx, rx) = mpsc::channel();
        let inner = threads.clone();
        let tid = threads
            .spawn(
                "errno",
                move || {
                    let initial = inner.errno();
                    inner.set_errno(7);
                    tx.send((initial, inner.errno())).unwrap();
                },
                0,
                Priority::DEFAULT,
            )
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (0, 7));
        threads.join(tid).unwrap();
        assert_eq!(threads.errno(), 99);
    }

    #[test]
    fn interrupted_waits_are_retried() {
        let threads = subsystem();
        threads.kernel().interrupt();
        threads.kernel().interrupt();
        let tid = threads.spawn("after-eintr", || {}, 0, Priority::DEFAULT).unwrap();
        threads.join(tid).unwrap();
        wait_until("interrupt accounting", Duration::from_secs(5), || {
            threads.stats().interrupted_waits == 2
        });
    }
}
