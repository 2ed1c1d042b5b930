//! # tidreg-core
//!
//! Join-by-identifier and per-thread error slots for kernels that only offer
//! "create a thread" and "wait for any thread to exit".
//!
//! # Architecture
//!
//! ```text
//! spawn ──> [registry lock: kernel.create(trampoline), publish record]
//!                                  │
//!                                  └──> trampoline: confirm record, run work, return
//!                                                        │
//! collector: kernel.wait_any_exit() ──> registry.reap ──> join gate broadcast
//!                                                        │
//! join(tid): while registry.contains(tid) { wait on join gate }
//! ```
//!
//! Identifiers are reused by the kernel once an exit has been consumed, so the
//! registry tolerates a new thread being published over a record that the
//! collector has not evicted yet.

#![deny(unsafe_code)]

pub mod collector;
pub mod config;
pub mod diag;
pub mod errno;
pub mod error;
pub mod host;
pub mod kernel;
pub mod record;
pub mod registry;
pub mod threads;

pub use collector::fatal;
pub use config::{Diagnostics, ThreadsConfig};
pub use diag::StatsSnapshot;
pub use errno::{ErrnoTable, ErrorContext, ErrorSlot};
pub use error::{KernelError, ThreadError};
pub use host::{HostKernel, ReusePolicy};
pub use kernel::{Entry, Priority, StackRegion, ThreadKernel, Tid};
pub use record::{RecordView, ThreadRecord, ThreadStack};
pub use registry::{Published, Reap, Registry};
pub use threads::Threads;
