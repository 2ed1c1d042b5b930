// Every extern "C" entry takes raw pointers straight from the networking
// stack; argument checks live in the function bodies.
#![allow(clippy::missing_safety_doc)]
//! # tidreg-abi
//!
//! `extern "C"` thread surface for the lwIP OS-abstraction layer.
//!
//! ```text
//! lwIP sys_arch -> sys_thread_* (this crate) -> tidreg-core Threads -> HostKernel
//! ```
//!
//! One process-wide [`tidreg_core::Threads`] instance backs every symbol. It is
//! created by `init_lwip_threads` or, failing that, by the first call that needs
//! it. Errors come back as negative errno values.

pub mod thread_abi;
