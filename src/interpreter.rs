//! # Fiber Interpreter
//!
//! Runs an effect description on a fiber.
//!
//! The loop is a trampoline over three controls: evaluate a node, return a
//! value to the top continuation frame, or raise a cause to the nearest
//! failure handler. Continuations live in an explicit `Vec` of frames, so a
//! chain of any depth runs in constant native stack.
//!
//! A slice of execution ends when the fiber
//!
//! - spends its step budget (and cooperative yielding is on),
//! - reaches an `Async` node that was not resolved during registration,
//! - or finishes.
//!
//! ## Interruption
//!
//! An interruption request is only delivered at checkpoints: before
//! evaluating a node and when a flag patch makes the fiber interruptible
//! again. Once delivered it is sticky: failure handlers in interruptible
//! regions are skipped while the fiber unwinds, and every later
//! interruptible checkpoint raises it again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::effect::op::{self, CauseCont, Cont, ErasedCause, ForkScope, Node, Op};
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, ErasedExit, FiberShared, Phase};
use crate::fiber_ref::FiberRefs;
use crate::flags::{FlagsPatch, RuntimeFlags};
use crate::continuation::Resumer;
use crate::runtime::RuntimeShared;
use crate::scope::{Finalizer, Scope};
use crate::value::AnyValue;

/// What the run loop does next.
pub(crate) enum Control {
    Eval(Node),
    Return(AnyValue),
    Raise(ErasedCause),
}

enum Frame {
    OnSuccess(Cont),
    Fold { on_failure: CauseCont, on_success: Cont },
    RevertFlags(FlagsPatch),
}

/// How a slice of execution ended.
pub(crate) enum Slice {
    /// Budget spent; the fiber should be queued again.
    Yielded(Box<FiberRuntime>),
    /// Parked in its slot until resumed.
    Suspended,
    /// Finished; the exit is recorded in the slot.
    Done,
}

/// Interpreter state of one fiber.
pub(crate) struct FiberRuntime {
    pub(crate) id: crate::fiber::FiberId,
    pub(crate) shared: Arc<FiberShared>,
    pub(crate) runtime: Arc<RuntimeShared>,
    pub(crate) refs: FiberRefs,
    pub(crate) flags: RuntimeFlags,
    /// Scope that supervises fibers forked with `fork`.
    pub(crate) children: Scope,
    /// Interruption already delivered to this fiber.
    interrupted: Option<ErasedCause>,
    stack: Vec<Frame>,
    control: Option<Control>,
}

impl FiberRuntime {
    /// Create a fiber that will run `body` and then close its child scope.
    pub(crate) fn new(
        runtime: Arc<RuntimeShared>,
        refs: FiberRefs,
        flags: RuntimeFlags,
        body: Node,
    ) -> Box<Self> {
        let id = next_fiber_id();
        let children = Scope::new();
        let root = supervise(body);
        Box::new(Self {
            id,
            shared: FiberShared::new(id),
            runtime,
            refs,
            flags,
            children,
            interrupted: None,
            stack: Vec::new(),
            control: Some(Control::Eval(root)),
        })
    }

    pub(crate) fn set_control(&mut self, control: Control) {
        self.control = Some(control);
    }

    pub(crate) fn is_interruptible(&self) -> bool {
        self.flags.interruptible()
    }

    pub(crate) fn mark_interrupted(&mut self, cause: ErasedCause) {
        self.interrupted = Some(match self.interrupted.take() {
            Some(prev) => prev.both(cause),
            None => cause,
        });
    }

    /// Deliver `cause` to a fiber parked at an async boundary and start its
    /// canceler. The cancel node is entered without a checkpoint so the
    /// canceler runs before the interruption is raised.
    pub(crate) fn cancel_async(&mut self, canceler: Option<Node>, cause: ErasedCause) {
        self.mark_interrupted(cause.clone());
        let control = self.eval(&op::cancel_then_fail(canceler, cause));
        self.control = Some(control);
    }

    /// Queue the fiber on its runtime's scheduler.
    pub(crate) fn submit(self: Box<Self>) {
        let runtime = self.runtime.clone();
        runtime.scheduler.submit(self);
    }

    /// The interruption to raise now, if any.
    fn checkpoint(&mut self) -> Option<ErasedCause> {
        if !self.flags.interruptible() {
            return None;
        }
        if self
            .shared
            .interrupt_flag
            .load(std::sync::atomic::Ordering::Acquire)
        {
            if let Some(cause) = self.shared.take_pending_interrupt() {
                self.mark_interrupted(cause);
            }
        }
        self.interrupted.clone()
    }

    /// Run until the fiber yields, suspends or finishes.
    pub(crate) fn run_slice(mut self: Box<Self>) -> Slice {
        let budget = self.runtime.config.scheduler.yield_budget;
        let mut steps = 0usize;
        let mut control = match self.control.take() {
            Some(control) => control,
            None => return Slice::Suspended,
        };

        loop {
            if steps >= budget && self.flags.cooperative_yielding() {
                self.control = Some(control);
                return Slice::Yielded(self);
            }
            steps += 1;

            control = match control {
                Control::Return(value) => self.on_return(value),
                Control::Raise(cause) => match self.on_raise(cause) {
                    Ok(next) => next,
                    Err(cause) => {
                        self.finish(Exit::Failure(cause));
                        return Slice::Done;
                    }
                },
                Control::Eval(node) => {
                    if let Some(cause) = self.checkpoint() {
                        control = Control::Raise(cause);
                        continue;
                    }
                    match &*node {
                        Op::Async(register) => {
                            let epoch = self.shared.begin_async();
                            let resumer = Resumer::new(self.shared.clone(), epoch);
                            let canceler = match guard(|| register(resumer)) {
                                Ok(canceler) => canceler,
                                Err(cause) => {
                                    self.shared.abandon_async(epoch);
                                    control = Control::Raise(cause);
                                    continue;
                                }
                            };
                            let shared = self.shared.clone();
                            let mut slot = shared.slot.lock();
                            if let Some(resumed) = slot.early.take() {
                                slot.waiting = None;
                                drop(slot);
                                control = resumed;
                                continue;
                            }
                            if self.flags.interruptible() {
                                if let Some(pending) = slot.pending_interrupt.take() {
                                    shared
                                        .interrupt_flag
                                        .store(false, std::sync::atomic::Ordering::Release);
                                    self.mark_interrupted(pending);
                                }
                                if let Some(cause) = self.interrupted.clone() {
                                    slot.waiting = None;
                                    drop(slot);
                                    control = self.eval(&op::cancel_then_fail(canceler, cause));
                                    continue;
                                }
                            }
                            slot.phase = Phase::Suspended {
                                fiber: self,
                                canceler,
                            };
                            return Slice::Suspended;
                        }
                        Op::Yield => {
                            self.control = Some(Control::Return(AnyValue::unit()));
                            return Slice::Yielded(self);
                        }
                        _ => self.eval(&node),
                    }
                }
            };

            if let Control::Return(_) = &control {
                if self.stack.is_empty() {
                    if let Control::Return(value) = control {
                        self.finish(Exit::Success(value));
                    }
                    return Slice::Done;
                }
            }
        }
    }

    fn eval(&mut self, node: &Node) -> Control {
        match &**node {
            Op::Succeed(value) => Control::Return(value.clone()),
            Op::Sync(thunk) => match guard(|| thunk()) {
                Ok(value) => Control::Return(value),
                Err(cause) => Control::Raise(cause),
            },
            Op::Fail(thunk) => match guard(|| thunk()) {
                Ok(cause) => Control::Raise(cause),
                Err(cause) => Control::Raise(cause),
            },
            Op::Suspend(thunk) => eval_next(guard(|| thunk())),
            Op::FlatMap(body, k) => {
                self.stack.push(Frame::OnSuccess(k.clone()));
                Control::Eval(body.clone())
            }
            Op::Fold {
                body,
                on_failure,
                on_success,
            } => {
                self.stack.push(Frame::Fold {
                    on_failure: on_failure.clone(),
                    on_success: on_success.clone(),
                });
                Control::Eval(body.clone())
            }
            Op::Fork { body, scope } => {
                let child = self.fork(body.clone(), scope.clone());
                Control::Return(AnyValue::new(child))
            }
            Op::UpdateFlags { patch, body } => {
                let old = self.flags;
                let new = old.patch(*patch);
                self.flags = new;
                match body {
                    None => {
                        if !old.interruptible() && new.interruptible() {
                            if let Some(cause) = self.checkpoint() {
                                return Control::Raise(cause);
                            }
                        }
                        Control::Return(AnyValue::unit())
                    }
                    Some(body) => {
                        let revert = new.diff(old);
                        if !revert.is_empty() {
                            self.stack.push(Frame::RevertFlags(revert));
                        }
                        eval_next(guard(|| body(old)))
                    }
                }
            }
            Op::WithFiber(access) => eval_next(guard(|| access(self))),
            // Handled by the run loop, which owns the fiber box.
            Op::Async(_) | Op::Yield => Control::Return(AnyValue::unit()),
        }
    }

    fn on_return(&mut self, value: AnyValue) -> Control {
        match self.stack.pop() {
            None => Control::Return(value),
            Some(Frame::OnSuccess(k)) => eval_next(guard(|| k(value))),
            Some(Frame::Fold { on_success, .. }) => eval_next(guard(|| on_success(value))),
            Some(Frame::RevertFlags(patch)) => {
                let old = self.flags;
                self.flags = old.patch(patch);
                if !old.interruptible() && self.flags.interruptible() {
                    if let Some(cause) = self.checkpoint() {
                        return Control::Raise(cause);
                    }
                }
                Control::Return(value)
            }
        }
    }

    /// Unwind to the nearest applicable failure handler. `Err` means the
    /// stack is exhausted.
    fn on_raise(&mut self, cause: ErasedCause) -> Result<Control, ErasedCause> {
        loop {
            match self.stack.pop() {
                None => return Err(cause),
                Some(Frame::OnSuccess(_)) => {}
                Some(Frame::Fold { on_failure, .. }) => {
                    if self.interrupted.is_some() && self.flags.interruptible() {
                        continue;
                    }
                    return Ok(eval_next(guard(|| on_failure(cause))));
                }
                Some(Frame::RevertFlags(patch)) => self.flags = self.flags.patch(patch),
            }
        }
    }

    /// Start `body` on a new fiber supervised according to `scope`.
    fn fork(&mut self, body: Node, scope: ForkScope) -> Arc<FiberShared> {
        let child = FiberRuntime::new(self.runtime.clone(), self.refs.fork(), self.flags, body);
        let shared = child.shared.clone();
        let supervisor = match scope {
            ForkScope::Child => self.children.clone(),
            ForkScope::Daemon => self.runtime.global_scope.clone(),
            ForkScope::In(scope) => scope,
        };

        let parent = self.id;
        let target = shared.clone();
        let finalizer: Finalizer = Arc::new(move |_exit: &ErasedExit| {
            let target = target.clone();
            let wait = target.await_node();
            op::flat_map(
                op::sync(move || {
                    target.request_interrupt(Cause::interrupt(parent));
                    AnyValue::unit()
                }),
                Arc::new(move |_| op::flat_map(wait.clone(), Arc::new(|_| op::unit()))),
            )
        });
        match supervisor.add_finalizer_raw(finalizer) {
            Ok(key) => shared.slot.lock().supervisor = Some((supervisor, key)),
            Err(_) => shared.request_interrupt(Cause::interrupt(parent)),
        }

        tracing::trace!(parent = %self.id, child = %shared.id, "fiber forked");
        child.submit();
        shared
    }

    fn finish(self: Box<Self>, exit: ErasedExit) {
        tracing::trace!(fiber = %self.id, success = exit.is_success(), "fiber finished");
        let FiberRuntime { shared, refs, .. } = *self;
        shared.complete(exit, refs);
    }
}

/// Wrap `body` so that the fiber closes its child scope, interrupting any
/// children still running, before it reports its exit.
fn supervise(body: Node) -> Node {
    Arc::new(Op::UpdateFlags {
        patch: FlagsPatch::disable(RuntimeFlags::INTERRUPTIBLE),
        body: Some(Arc::new(move |old: RuntimeFlags| {
            let restored = if old.interruptible() {
                Arc::new(Op::UpdateFlags {
                    patch: FlagsPatch::enable(RuntimeFlags::INTERRUPTIBLE),
                    body: Some({
                        let body = body.clone();
                        Arc::new(move |_| body.clone())
                    }),
                })
            } else {
                body.clone()
            };
            op::fold(
                restored,
                Arc::new(|cause: ErasedCause| {
                    close_children(Exit::Failure(cause.clone()), op::fail_cause(cause))
                }),
                Arc::new(|value: AnyValue| {
                    close_children(Exit::Success(value.clone()), op::succeed(value))
                }),
            )
        })),
    })
}

fn close_children(exit: ErasedExit, then: Node) -> Node {
    op::flat_map(
        op::with_fiber(move |fiber| {
            let close = fiber.children.close_node(exit.clone());
            // Child scope finalizers only interrupt; their failures are not ours.
            op::fold(close, Arc::new(|_| op::unit()), Arc::new(|_| op::unit()))
        }),
        Arc::new(move |_| then.clone()),
    )
}

fn guard<T>(f: impl FnOnce() -> T) -> Result<T, ErasedCause> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Cause::die(Defect::from_panic(payload)))
}

fn eval_next(next: Result<Node, ErasedCause>) -> Control {
    match next {
        Ok(node) => Control::Eval(node),
        Err(cause) => Control::Raise(cause),
    }
}
