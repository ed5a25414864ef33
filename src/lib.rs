//! # Skein
//!
//! A fiber runtime for effectful programs. Skein provides:
//!
//! - **Effects**: lazy, re-runnable descriptions of computations with typed
//!   failures, defects and interruption tracked in a [`Cause`]
//! - **Fiber Scheduler**: M:N cooperative scheduling with work-stealing
//! - **Structured Concurrency**: every fork is supervised by a [`Scope`];
//!   closing a scope interrupts and awaits its children
//! - **Interruption**: asynchronous, with masking regions that finalizers
//!   and resource acquisition run inside
//! - **Fiber-local State**: [`FiberRef`]s with fork and join semantics, a
//!   typed service [`Context`], and structured logging
//! - **Coordination**: [`Deferred`], [`Semaphore`], [`Ref`], [`Queue`],
//!   [`Hub`]
//! - **STM**: optimistic transactions over [`TRef`], [`TArray`], [`TMap`]
//!   and [`TQueue`]
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Chase-Lev deques per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Timers and blocking hand-off**:
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Diagnostics**: [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SKEIN RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Effect    │  │  Interpreter │  │   Scheduler  │           │
//! │  │ (effect/*.rs)│─▶│(interpreter) │─▶│(scheduler.rs)│           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Scope/Fiber  │  │ Queue / Hub  │  │     STM      │           │
//! │  │ (scope.rs)   │  │ Semaphore …  │  │   (stm/)     │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use skein::{Effect, Runtime};
//!
//! let runtime = Runtime::default();
//! let program = Effect::succeed(20)
//!     .zip_par(Effect::succeed(22))
//!     .map(|(a, b)| a + b);
//! assert_eq!(runtime.run_blocking(program).value(), Some(&42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod clock;
pub mod config;
pub mod context;
pub mod continuation;
pub mod deferred;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub mod flags;
pub mod hub;
mod interpreter;
pub mod log;
pub mod queue;
pub mod refs;
pub mod runtime;
mod scheduler;
pub mod scope;
pub mod semaphore;
pub mod stm;
pub mod value;

// Re-exports
pub use cause::{Cause, Defect};
pub use clock::{Clock, Deadline, LiveClock, TestClock};
pub use config::{ConfigError, LogFormat, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use context::Context;
pub use continuation::Callback;
pub use deferred::Deferred;
pub use effect::{Effect, Restore};
pub use error::RuntimeError;
pub use exit::Exit;
pub use fiber::{Fiber, FiberId, FiberStatus};
pub use fiber_ref::FiberRef;
pub use hub::{Hub, Subscription};
pub use log::{LogEntry, Logger, MemoryLogger, TracingLogger, WriterLogger};
pub use queue::{Queue, Strategy};
pub use refs::{Ref, SynchronizedRef};
pub use runtime::{ExitFuture, Runtime, RuntimeBuilder};
pub use scope::Scope;
pub use semaphore::Semaphore;
pub use stm::{atomically, Stm, TArray, TMap, TQueue, TRef};
pub use value::{AnyValue, Value};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
