//! Runtime-level errors.
//!
//! These are failures raised by the runtime itself rather than by user
//! effects. Most of them surface inside a [`Cause`](crate::Cause), either as
//! the typed error of an effect (for example [`Effect::service`]) or as the
//! message of a defect.
//!
//! [`Effect::service`]: crate::Effect::service

use std::time::Duration;

use thiserror::Error;

use crate::fiber::FiberId;

/// Errors produced by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// `run_sync` reached an asynchronous boundary that was not resolved
    /// on the calling thread.
    #[error("{0} suspended on an asynchronous boundary during run_sync")]
    SuspendedInSync(FiberId),

    /// A service was requested but not provided.
    #[error("no service of type {0} in the fiber context")]
    MissingService(&'static str),

    /// A transactional array was indexed out of range.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Array length.
        len: usize,
    },

    /// An effect did not complete in time.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// A queue or hub was shut down.
    #[error("queue has been shut down")]
    QueueShutdown,

    /// The operating system refused to start a runtime thread.
    #[error("failed to spawn {thread} thread: {message}")]
    ThreadSpawn {
        /// Which thread.
        thread: String,
        /// The OS error.
        message: String,
    },

    /// A transaction kept conflicting past the configured limit.
    #[error("transaction gave up after {retries} conflicting attempts")]
    ConflictLimit {
        /// Attempts made.
        retries: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RuntimeError::SuspendedInSync(FiberId::new(7));
        assert_eq!(
            err.to_string(),
            "Fiber(7) suspended on an asynchronous boundary during run_sync"
        );

        let err = RuntimeError::IndexOutOfBounds { index: 5, len: 3 };
        assert_eq!(err.to_string(), "index 5 out of bounds for length 3");

        let err = RuntimeError::MissingService("app::Db");
        assert!(err.to_string().contains("app::Db"));

        let err = RuntimeError::ThreadSpawn {
            thread: "skein-timer".into(),
            message: "out of resources".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to spawn skein-timer thread: out of resources"
        );
    }
}
