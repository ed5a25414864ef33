//! # Runtime
//!
//! A [`Runtime`] owns a scheduler, a clock, a log sink and a global scope
//! for daemon fibers. Several runtimes can live in one process; nothing is
//! shared between them.
//!
//! Entry points:
//!
//! - [`Runtime::run`] starts a fiber and returns its handle.
//! - [`Runtime::run_blocking`] blocks the calling thread until the effect
//!   finishes.
//! - [`Runtime::run_sync`] interprets the effect on the calling thread and
//!   fails fast if it ever has to wait on an asynchronous boundary.
//! - [`Runtime::run_future`] returns a `Future` resolving to the exit.
//!
//! Dropping the runtime shuts it down and joins its worker threads.

use std::fmt;
use std::future::Future;
use std::io::Write;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::clock::{Clock, LiveClock};
use crate::config::RuntimeConfig;
use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::exit::Exit;
use crate::fiber::{typed_exit, ErasedExit, Fiber, FiberId, FiberShared};
use crate::fiber_ref::FiberRefs;
use crate::flags::RuntimeFlags;
use crate::interpreter::{FiberRuntime, Slice};
use crate::log::{Logger, TracingLogger, WriterLogger};
use crate::scheduler::Scheduler;
use crate::scope::Scope;
use crate::value::Value;

/// Services shared by every fiber of one runtime.
pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) logger: Arc<dyn Logger>,
    /// Supervises daemon fibers.
    pub(crate) global_scope: Scope,
}

/// Executes effects on a pool of worker threads.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    /// Create a runtime with the live clock and the tracing log sink.
    pub fn new(config: RuntimeConfig) -> Self {
        RuntimeBuilder::new().config(config).build()
    }

    /// Create a runtime configured from `SKEIN_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    /// Create a runtime that sends effect logs to `logger`.
    pub fn with_logger(config: RuntimeConfig, logger: impl Logger) -> Self {
        RuntimeBuilder::new().config(config).logger(logger).build()
    }

    /// Create a runtime driven by `clock`.
    pub fn with_clock(config: RuntimeConfig, clock: impl Clock) -> Self {
        RuntimeBuilder::new().config(config).clock(clock).build()
    }

    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Start `effect` on a new root fiber.
    pub fn run<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        let fiber = self.root_fiber(effect);
        let handle = Fiber::from_shared(fiber.shared.clone());
        tracing::trace!(fiber = %handle.id(), "root fiber started");
        fiber.submit();
        handle
    }

    /// Run `effect` and block the calling thread until it finishes.
    pub fn run_blocking<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        self.run(effect).await_blocking()
    }

    /// Run `effect` on the calling thread.
    ///
    /// Fails with [`RuntimeError::SuspendedInSync`] as soon as the effect
    /// waits on an asynchronous boundary that was not resolved during
    /// registration; the fiber is then interrupted and left to finish on
    /// the workers. Forked fibers still run on the worker pool.
    pub fn run_sync<A: Value, E: Value>(
        &self,
        effect: Effect<A, E>,
    ) -> Result<Exit<A, E>, RuntimeError> {
        let mut fiber = self.root_fiber(effect);
        let shared = fiber.shared.clone();
        loop {
            match fiber.run_slice() {
                Slice::Yielded(next) => fiber = next,
                Slice::Done => {
                    return shared
                        .poll()
                        .map(typed_exit)
                        .ok_or(RuntimeError::SuspendedInSync(shared.id));
                }
                Slice::Suspended => {
                    tracing::debug!(fiber = %shared.id, "synchronous run suspended");
                    shared.request_interrupt(Cause::interrupt(FiberId::NONE));
                    return Err(RuntimeError::SuspendedInSync(shared.id));
                }
            }
        }
    }

    /// Start `effect` and get a future resolving to its exit.
    pub fn run_future<A: Value, E: Value>(&self, effect: Effect<A, E>) -> ExitFuture<A, E> {
        let fiber = self.run(effect);
        ExitFuture::new(fiber.shared().clone())
    }

    /// Stop the workers and the clock. Fibers still queued or suspended are
    /// dropped without running their finalizers.
    pub fn shutdown(&self) {
        self.shared.scheduler.shutdown();
        self.shared.clock.shutdown();
    }

    fn root_fiber<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Box<FiberRuntime> {
        FiberRuntime::new(
            self.shared.clone(),
            FiberRefs::default(),
            RuntimeFlags::DEFAULT,
            effect.into_node(),
        )
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.shared.scheduler.num_workers())
            .finish()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    logger: Option<Arc<dyn Logger>>,
    writer: Option<Box<dyn Write + Send>>,
}

impl RuntimeBuilder {
    /// A builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: None,
            logger: None,
            writer: None,
        }
    }

    /// Use `config`.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` instead of the live clock.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Send effect logs to `logger`.
    pub fn logger(mut self, logger: impl Logger) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Write effect logs to `writer`, one line per entry in the configured
    /// [`LogFormat`](crate::LogFormat).
    pub fn log_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    /// Start the runtime.
    ///
    /// # Panics
    ///
    /// Panics if the worker or timer threads cannot be spawned; use
    /// [`try_build`](Self::try_build) to handle that case.
    pub fn build(self) -> Runtime {
        match self.try_build() {
            Ok(runtime) => runtime,
            Err(err) => panic!("{}", err),
        }
    }

    /// Start the runtime, reporting thread spawn failures.
    pub fn try_build(self) -> Result<Runtime, RuntimeError> {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(LiveClock::new()?),
        };
        let format = self.config.log.format;
        let logger: Arc<dyn Logger> = match (self.logger, self.writer) {
            (Some(logger), _) => logger,
            (None, Some(writer)) => Arc::new(WriterLogger::new(writer, format)),
            (None, None) => Arc::new(TracingLogger),
        };
        let scheduler = match Scheduler::new(self.config.scheduler.clone()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                clock.shutdown();
                return Err(err);
            }
        };
        Ok(Runtime {
            shared: Arc::new(RuntimeShared {
                config: self.config,
                scheduler,
                clock,
                logger,
                global_scope: Scope::new(),
            }),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct FutureState {
    exit: Option<ErasedExit>,
    waker: Option<Waker>,
}

/// Future resolving to a fiber's exit.
pub struct ExitFuture<A, E> {
    state: Arc<Mutex<FutureState>>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Value, E: Value> ExitFuture<A, E> {
    fn new(fiber: Arc<FiberShared>) -> Self {
        let state = Arc::new(Mutex::new(FutureState {
            exit: None,
            waker: None,
        }));
        let on_done = state.clone();
        let observer = Box::new(move |exit: &ErasedExit| {
            let waker = {
                let mut state = on_done.lock();
                state.exit = Some(exit.clone());
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        if let Err(exit) = fiber.add_observer(observer) {
            state.lock().exit = Some(exit);
        }
        Self {
            state,
            _marker: PhantomData,
        }
    }
}

impl<A: Value, E: Value> Future for ExitFuture<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match state.exit.take() {
            Some(exit) => Poll::Ready(typed_exit(exit)),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<A, E> fmt::Debug for ExitFuture<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitFuture")
            .field("ready", &self.state.lock().exit.is_some())
            .finish()
    }
}
