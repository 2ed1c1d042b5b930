//! Error types for kernel calls and the registry-facing API.

use thiserror::Error;

/// Failure reported by a [`crate::ThreadKernel`] primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A blocking wait was interrupted; the call may be retried.
    #[error("wait interrupted")]
    Interrupted,
    /// The kernel has no room for another thread.
    #[error("no resources for another thread")]
    NoResources,
    /// The kernel rejected an argument (priority, stack, ...).
    #[error("invalid argument")]
    InvalidArgument,
    /// The kernel is shutting down; no further exits will be reported.
    #[error("kernel shut down")]
    Shutdown,
    /// Any other kernel error, as the kernel's positive error number.
    #[error("kernel error {0}")]
    Os(i32),
}

impl KernelError {
    /// Whether the failed call may simply be repeated.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Failure of a registry-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The kernel refused to start the thread. Nothing was registered.
    #[error("cannot start thread `{name}`: {source}")]
    Create {
        name: String,
        #[source]
        source: KernelError,
    },
    /// A thread tried to join itself.
    #[error("thread cannot join itself")]
    SelfJoin,
    /// The exit collector could not be started.
    #[error("cannot start exit collector: {0}")]
    Collector(#[source] KernelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_interrupted_is_retryable() {
        assert!(KernelError::Interrupted.is_retryable());
        assert!(!KernelError::NoResources.is_retryable());
        assert!(!KernelError::Shutdown.is_retryable());
    }

    #[test]
    fn create_error_names_thread_and_keeps_source() {
        let err = ThreadError::Create {
            name: "tcpip".to_string(),
            source: KernelError::NoResources,
        };
        assert_eq!(
            err.to_string(),
            "cannot start thread `tcpip`: no resources for another thread"
        );
        assert_eq!(
            std::error::Error::source(&err).map(ToString::to_string),
            Some("no resources for another thread".to_string())
        );
    }
}
