//! ABI layer for the lwIP `sys_thread_*` port functions.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::OnceLock;

use tidreg_core::{
    HostKernel, KernelError, Priority, StatsSnapshot, ThreadError, ThreadKernel, Threads,
    ThreadsConfig, Tid, fatal,
};

/// Thread handle as seen by the networking stack.
pub type SysThread = u32;

/// Work function signature accepted by `sys_thread_new`.
pub type ThreadFn = unsafe extern "C" fn(arg: *mut c_void);

static THREADS: OnceLock<Threads<HostKernel>> = OnceLock::new();

fn threads() -> &'static Threads<HostKernel> {
    THREADS.get_or_init(|| {
        match Threads::start(HostKernel::new(), ThreadsConfig::default()) {
            Ok(threads) => threads,
            Err(err) => fatal(format_args!("init_lwip_threads: {err}")),
        }
    })
}

fn kernel_errno(err: KernelError) -> c_int {
    match err {
        KernelError::Interrupted => libc::EINTR,
        KernelError::NoResources => libc::EAGAIN,
        KernelError::InvalidArgument => libc::EINVAL,
        KernelError::Shutdown => libc::ESHUTDOWN,
        KernelError::Os(code) => code,
    }
}

/// Negative errno for `err`, the return convention of every `sys_thread_*` call.
fn neg_errno(err: &ThreadError) -> c_int {
    let code = match err {
        ThreadError::Create { source, .. } | ThreadError::Collector(source) => {
            kernel_errno(*source)
        }
        ThreadError::SelfJoin => libc::EDEADLK,
    };
    -code
}

/// Checked spawn arguments.
struct SpawnArgs {
    work: ThreadFn,
    stack_size: usize,
    priority: Priority,
}

impl SpawnArgs {
    /// `None` for a missing work function, a negative stack size or a
    /// priority outside `0..=255`.
    fn check(thread: Option<ThreadFn>, stacksize: c_int, prio: c_int) -> Option<Self> {
        Some(Self {
            work: thread?,
            stack_size: usize::try_from(stacksize).ok()?,
            priority: Priority(u8::try_from(prio).ok()?),
        })
    }

    /// Work closure calling `work(arg)` on the new thread.
    fn body(&self, arg: *mut c_void) -> impl FnOnce() + Send + 'static {
        let work = self.work;
        let arg_addr = arg as usize;
        move || {
            // SAFETY: the caller hands `arg` to `work` unchanged, as sys_arch requires.
            unsafe { work(arg_addr as *mut c_void) };
        }
    }
}

/// Read a thread name the caller may leave null or fill with non-UTF-8 bytes.
unsafe fn thread_name(name: *const c_char) -> String {
    if name.is_null() {
        return String::from("lwip");
    }
    // SAFETY: non-null `name` is a NUL-terminated string per the sys_arch contract.
    unsafe { CStr::from_ptr(name) }
        .to_string_lossy()
        .into_owned()
}

/// Start the thread subsystem and its exit collector. Idempotent.
#[unsafe(no_mangle)]
pub extern "C" fn init_lwip_threads() {
    let threads = threads();
    log::debug!("lwip threads ready, collector {}", threads.collector_tid());
}

/// Start `thread(arg)` on a new registered thread.
///
/// Writes the new handle to `id` when it is non-null. Returns `0` on success
/// or a negative errno; `-EINVAL` for a missing work function, a negative
/// stack size or a priority outside `0..=255`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sys_thread_opt_new(
    name: *const c_char,
    thread: Option<ThreadFn>,
    arg: *mut c_void,
    stacksize: c_int,
    prio: c_int,
    id: *mut SysThread,
) -> c_int {
    let Some(args) = SpawnArgs::check(thread, stacksize, prio) else {
        return -libc::EINVAL;
    };
    // SAFETY: forwarded from the caller.
    let name = unsafe { thread_name(name) };

    match threads().spawn(&name, args.body(arg), args.stack_size, args.priority) {
        Ok(tid) => {
            if !id.is_null() {
                // SAFETY: non-null `id` points to caller-owned storage.
                unsafe { *id = tid.0 };
            }
            0
        }
        Err(err) => {
            log::warn!("sys_thread_opt_new({name}): {err}");
            neg_errno(&err)
        }
    }
}

/// [`sys_thread_opt_new`] that aborts the process instead of failing.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sys_thread_new(
    name: *const c_char,
    thread: Option<ThreadFn>,
    arg: *mut c_void,
    stacksize: c_int,
    prio: c_int,
) -> SysThread {
    // SAFETY: forwarded from the caller.
    let name = unsafe { thread_name(name) };
    let Some(args) = SpawnArgs::check(thread, stacksize, prio) else {
        fatal(format_args!("sys_thread_new({name}): invalid argument"));
    };
    threads()
        .spawn_or_fail(&name, args.body(arg), args.stack_size, args.priority)
        .0
}

/// Block until thread `id` has exited and been reaped.
///
/// Returns `0` at once for unknown or already reaped handles and
/// `-EDEADLK` when a thread joins itself.
#[unsafe(no_mangle)]
pub extern "C" fn sys_thread_join(id: SysThread) -> c_int {
    match threads().join(Tid(id)) {
        Ok(()) => 0,
        Err(err) => neg_errno(&err),
    }
}

/// Error code of the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn sys_thread_errno_get() -> c_int {
    threads().errno()
}

/// Set the error code of the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn sys_thread_errno_set(value: c_int) {
    threads().set_errno(value);
}

/// Handle of the calling thread as seen by the registry.
#[unsafe(no_mangle)]
pub extern "C" fn sys_thread_self() -> SysThread {
    threads().kernel().current_tid().0
}

/// Counter snapshot of the process-wide subsystem.
pub fn sys_thread_stats_for_tests() -> StatsSnapshot {
    threads().stats()
}

/// Number of threads registered and not yet reaped.
pub fn sys_thread_registered_for_tests() -> usize {
    threads().registered()
}
