//! # Fibers
//!
//! Lightweight, cooperatively-scheduled units of execution.
//!
//! ## Design
//!
//! A fiber has two halves:
//!
//! - [`FiberRuntime`](crate::interpreter::FiberRuntime): the interpreter
//!   state (continuation stack, flags, fiber refs). It is owned by exactly one
//!   place at a time: a worker running it, a run queue, or the fiber's own
//!   slot while it is suspended.
//! - [`FiberShared`]: the part other fibers may touch. Resumption,
//!   interruption and observation all go through its slot lock, never through
//!   direct access to the interpreter state.
//!
//! [`Fiber`] is the typed, cloneable handle returned by `fork`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::op::{self, ErasedCause, Node, Op};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber_ref::FiberRefs;
use crate::interpreter::{Control, FiberRuntime};
use crate::scope::Scope;
use crate::value::{AnyValue, Value};

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// The id used for interruptions that do not come from a fiber.
    pub const NONE: FiberId = FiberId(0);

    /// Create a fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub(crate) fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Coarse execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Queued or executing on a worker.
    Running,
    /// Parked on an asynchronous boundary.
    Suspended,
    /// Finished with an exit.
    Done,
}

pub(crate) type ErasedExit = Exit<AnyValue, AnyValue>;
pub(crate) type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

pub(crate) enum Phase {
    Running,
    Suspended {
        fiber: Box<FiberRuntime>,
        canceler: Option<Node>,
    },
    Done,
}

/// State guarded by the fiber's slot lock.
pub(crate) struct Slot {
    pub(crate) phase: Phase,
    /// Incremented on every asynchronous boundary.
    pub(crate) epoch: u64,
    /// The epoch whose resumption is still expected.
    pub(crate) waiting: Option<u64>,
    /// Resumption that arrived before the fiber finished suspending.
    pub(crate) early: Option<Control>,
    /// Interruption requested but not yet delivered.
    pub(crate) pending_interrupt: Option<ErasedCause>,
    pub(crate) exit: Option<ErasedExit>,
    pub(crate) final_refs: Option<FiberRefs>,
    observers: BTreeMap<u64, Observer>,
    next_observer: u64,
    /// Scope this fiber is supervised by, and its finalizer key there.
    pub(crate) supervisor: Option<(Scope, u64)>,
}

/// The cross-fiber half of a fiber.
pub(crate) struct FiberShared {
    pub(crate) id: FiberId,
    /// Fast-path hint that `pending_interrupt` is set.
    pub(crate) interrupt_flag: AtomicBool,
    pub(crate) slot: Mutex<Slot>,
}

impl FiberShared {
    pub(crate) fn new(id: FiberId) -> Arc<Self> {
        Arc::new(Self {
            id,
            interrupt_flag: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                phase: Phase::Running,
                epoch: 0,
                waiting: None,
                early: None,
                pending_interrupt: None,
                exit: None,
                final_refs: None,
                observers: BTreeMap::new(),
                next_observer: 0,
                supervisor: None,
            }),
        })
    }

    /// Open a new asynchronous boundary and return its epoch.
    pub(crate) fn begin_async(&self) -> u64 {
        let mut slot = self.slot.lock();
        slot.epoch += 1;
        slot.waiting = Some(slot.epoch);
        slot.early = None;
        slot.epoch
    }

    /// Forget an asynchronous boundary whose registration failed.
    pub(crate) fn abandon_async(&self, epoch: u64) {
        let mut slot = self.slot.lock();
        if slot.waiting == Some(epoch) {
            slot.waiting = None;
        }
        slot.early = None;
    }

    /// Resume the boundary `epoch` with a control built from `value`.
    /// Hands `value` back if the fiber is no longer waiting for it.
    pub(crate) fn resume_with<T>(
        &self,
        epoch: u64,
        value: T,
        build: impl FnOnce(T) -> Control,
    ) -> Result<(), T> {
        let mut slot = self.slot.lock();
        if slot.waiting != Some(epoch) {
            return Err(value);
        }
        slot.waiting = None;
        let control = build(value);
        match std::mem::replace(&mut slot.phase, Phase::Running) {
            Phase::Suspended { mut fiber, .. } => {
                drop(slot);
                fiber.set_control(control);
                fiber.submit();
            }
            Phase::Running => slot.early = Some(control),
            // Completion clears `waiting`, so a done fiber never gets here.
            Phase::Done => slot.phase = Phase::Done,
        }
        Ok(())
    }

    /// Request interruption on behalf of `cause`.
    pub(crate) fn request_interrupt(&self, cause: ErasedCause) {
        let mut slot = self.slot.lock();
        if matches!(slot.phase, Phase::Done) {
            return;
        }
        let pending = match slot.pending_interrupt.take() {
            Some(prev) => prev.both(cause),
            None => cause,
        };
        slot.pending_interrupt = Some(pending);
        self.interrupt_flag.store(true, Ordering::Release);

        let interruptible = match &slot.phase {
            Phase::Suspended { fiber, .. } => fiber.is_interruptible(),
            _ => false,
        };
        if !interruptible {
            return;
        }
        if let Phase::Suspended { mut fiber, canceler } =
            std::mem::replace(&mut slot.phase, Phase::Running)
        {
            slot.waiting = None;
            let cause = slot.pending_interrupt.take();
            self.interrupt_flag.store(false, Ordering::Release);
            drop(slot);
            if let Some(cause) = cause {
                fiber.cancel_async(canceler, cause);
            }
            fiber.submit();
        }
    }

    /// Take the pending interruption, if any.
    pub(crate) fn take_pending_interrupt(&self) -> Option<ErasedCause> {
        let mut slot = self.slot.lock();
        self.interrupt_flag.store(false, Ordering::Release);
        slot.pending_interrupt.take()
    }

    /// Register a completion observer, or get the exit if already done.
    pub(crate) fn add_observer(&self, observer: Observer) -> Result<u64, ErasedExit> {
        let mut slot = self.slot.lock();
        if let Some(exit) = &slot.exit {
            return Err(exit.clone());
        }
        let key = slot.next_observer;
        slot.next_observer += 1;
        slot.observers.insert(key, observer);
        Ok(key)
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.slot.lock().observers.remove(&key);
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self) -> usize {
        self.slot.lock().observers.len()
    }

    /// Record the terminal exit and notify observers.
    pub(crate) fn complete(&self, exit: ErasedExit, refs: FiberRefs) {
        let (observers, supervisor) = {
            let mut slot = self.slot.lock();
            slot.phase = Phase::Done;
            slot.waiting = None;
            slot.pending_interrupt = None;
            slot.exit = Some(exit.clone());
            slot.final_refs = Some(refs);
            (std::mem::take(&mut slot.observers), slot.supervisor.take())
        };
        self.interrupt_flag.store(false, Ordering::Release);

        if let Some((scope, key)) = supervisor {
            scope.remove_finalizer(key);
        }

        if observers.is_empty() {
            if let Exit::Failure(cause) = &exit {
                if !cause.is_interrupted_only() {
                    tracing::debug!(fiber = %self.id, "fiber failed with no observers:\n{}", cause);
                }
            }
        }
        for (_, observer) in observers {
            observer(&exit);
        }
    }

    pub(crate) fn status(&self) -> FiberStatus {
        match self.slot.lock().phase {
            Phase::Running => FiberStatus::Running,
            Phase::Suspended { .. } => FiberStatus::Suspended,
            Phase::Done => FiberStatus::Done,
        }
    }

    pub(crate) fn poll(&self) -> Option<ErasedExit> {
        self.slot.lock().exit.clone()
    }

    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.slot.lock().final_refs.clone()
    }

    /// Effect that suspends until this fiber is done and yields its exit.
    pub(crate) fn await_node(self: &Arc<Self>) -> Node {
        let shared = self.clone();
        Arc::new(Op::Async(Arc::new(move |resumer| {
            let on_done = resumer.clone();
            match shared.add_observer(Box::new(move |exit: &ErasedExit| {
                on_done.succeed(AnyValue::new(exit.clone()));
            })) {
                Ok(key) => {
                    let shared = shared.clone();
                    Some(Arc::new(Op::Sync(Arc::new(move || {
                        shared.remove_observer(key);
                        AnyValue::unit()
                    }))))
                }
                Err(exit) => {
                    resumer.succeed(AnyValue::new(exit));
                    None
                }
            }
        })))
    }

    /// Effect that requests interruption as the running fiber.
    pub(crate) fn interrupt_node(self: &Arc<Self>) -> Node {
        let shared = self.clone();
        op::with_fiber(move |fiber| {
            shared.request_interrupt(Cause::interrupt(fiber.id));
            op::unit()
        })
    }
}

impl fmt::Debug for FiberShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberShared").field("id", &self.id).finish()
    }
}

/// Convert an erased exit back to its typed form.
pub(crate) fn typed_exit<A: Value, E: Value>(exit: ErasedExit) -> Exit<A, E> {
    exit.map(AnyValue::downcast::<A>)
        .map_error(AnyValue::downcast::<E>)
}

/// Erase a typed exit.
pub(crate) fn erase_exit<A: Value, E: Value>(exit: Exit<A, E>) -> ErasedExit {
    exit.map(AnyValue::new).map_error(AnyValue::new)
}

/// Handle to a running or finished fiber.
pub struct Fiber<A, E = Infallible> {
    shared: Arc<FiberShared>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.shared.id)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl<A: Value, E: Value> Fiber<A, E> {
    pub(crate) fn from_shared(shared: Arc<FiberShared>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<FiberShared> {
        &self.shared
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.shared.id
    }

    /// Current status.
    pub fn status(&self) -> FiberStatus {
        self.shared.status()
    }

    /// Wait for the fiber to finish and get its exit without re-raising it
    /// and without inheriting its fiber refs.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Infallible> {
        Effect::from_node(self.shared.await_node()).map(|exit: ErasedExit| typed_exit(exit))
    }

    /// Wait for the fiber, merge its fiber refs into the caller, and
    /// succeed or fail exactly as it did.
    pub fn join(&self) -> Effect<A, E> {
        let me = self.clone();
        self.await_exit()
            .widen::<E>()
            .flat_map(move |exit| me.inherit_refs().widen::<E>().zip_right(Effect::from_exit(exit)))
    }

    /// Merge the finished fiber's refs into the running fiber. No-op while
    /// the fiber is still running.
    pub fn inherit_refs(&self) -> Effect<(), Infallible> {
        let shared = self.shared.clone();
        Effect::from_node(op::with_fiber(move |fiber| {
            if let Some(child) = shared.final_refs() {
                fiber.refs.join(&child);
            }
            op::unit()
        }))
    }

    /// Interrupt the fiber as the running fiber and wait for it to finish.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Infallible> {
        self.interrupt_fork().zip_right(self.await_exit())
    }

    /// Interrupt the fiber as `by` and wait for it to finish.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, Infallible> {
        let shared = self.shared.clone();
        Effect::sync(move || shared.request_interrupt(Cause::interrupt(by)))
            .zip_right(self.await_exit())
    }

    /// Request interruption without waiting.
    pub fn interrupt_fork(&self) -> Effect<(), Infallible> {
        Effect::from_node(self.shared.interrupt_node())
    }

    /// The exit, if the fiber is done.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Infallible> {
        let shared = self.shared.clone();
        Effect::sync(move || shared.poll().map(typed_exit))
    }

    /// Block the calling native thread until the fiber is done.
    ///
    /// Meant for code outside the runtime; calling it from inside a fiber
    /// blocks a worker thread.
    pub fn await_blocking(&self) -> Exit<A, E> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let observer: Observer = Box::new(move |exit: &ErasedExit| {
            let _ = tx.send(exit.clone());
        });
        let exit = match self.shared.add_observer(observer) {
            Err(exit) => exit,
            Ok(_) => match rx.recv() {
                Ok(exit) => exit,
                Err(_) => Exit::die(crate::cause::Defect::new("fiber dropped without an exit")),
            },
        };
        typed_exit(exit)
    }
}
