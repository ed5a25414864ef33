//! # Effects
//!
//! An [`Effect<A, E>`] is an inert, reusable description of a computation
//! that succeeds with an `A`, fails with a [`Cause<E>`], or is interrupted.
//! Nothing happens until a [`Runtime`](crate::Runtime) runs it on a fiber;
//! the same effect can be run any number of times.
//!
//! ## Failure channels
//!
//! Typed failures (`E`) are recoverable with [`catch_all`](Effect::catch_all),
//! [`or_else`](Effect::or_else), [`fold`](Effect::fold) and friends. Defects
//! and interruptions are never handed to those; only the cause-level
//! combinators ([`catch_all_cause`](Effect::catch_all_cause),
//! [`fold_cause`](Effect::fold_cause), [`sandbox`](Effect::sandbox)) see them.
//!
//! ## Interruption
//!
//! Fibers are interruptible by default. [`uninterruptible`](Effect::uninterruptible)
//! defers delivery until the region ends and
//! [`uninterruptible_mask`](Effect::uninterruptible_mask) hands the region a
//! [`Restore`] to re-enable interruption for selected parts, which is how
//! [`acquire_use_release`](Effect::acquire_use_release) keeps acquire and
//! release atomic while `use` stays interruptible.

pub(crate) mod op;
mod concurrent;

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::continuation::{Callback, Resumer};
use crate::error::RuntimeError;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberId, FiberShared};
use crate::flags::{FlagsPatch, RuntimeFlags};
use crate::scope::Scope;
use crate::value::{AnyValue, Value};

use self::op::{ErasedCause, ForkScope, Node, Op};

/// A description of a computation producing `A` or failing with `E`.
pub struct Effect<A, E = Infallible> {
    node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("success", &std::any::type_name::<A>())
            .field("error", &std::any::type_name::<E>())
            .finish()
    }
}

pub(crate) fn erase_cause<E: Value>(cause: Cause<E>) -> ErasedCause {
    cause.map(AnyValue::new)
}

pub(crate) fn typed_cause<E: Value>(cause: ErasedCause) -> Cause<E> {
    cause.map(AnyValue::downcast::<E>)
}

/// A cause of a type with no failures, viewed at any failure type.
pub(crate) fn absurd_cause<E>(cause: Cause<Infallible>) -> Cause<E> {
    cause.map(|never| match never {})
}

/// The typed failure handlers may recover from: the first `Fail` leaf of a
/// cause with no defects or interruptions.
fn recoverable<E: Clone>(cause: &Cause<E>) -> Option<E> {
    if cause.is_die() || cause.is_interrupted() {
        return None;
    }
    cause.first_failure().cloned()
}

fn flatten_cause<E>(cause: Cause<Cause<E>>) -> Cause<E> {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(inner) => inner,
        Cause::Die(d) => Cause::Die(d),
        Cause::Interrupt(id) => Cause::Interrupt(id),
        Cause::Sequential(l, r) => flatten_cause(*l).then(flatten_cause(*r)),
        Cause::Parallel(l, r) => flatten_cause(*l).both(flatten_cause(*r)),
    }
}

/// Capability to re-enable the interruptibility that was in force outside
/// an [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    outer: RuntimeFlags,
}

impl Restore {
    /// Run `effect` with the outer region's interruptibility.
    pub fn apply<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        if self.outer.interruptible() {
            effect.interruptible()
        } else {
            effect
        }
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<A: Value, E: Value> Effect<A, E> {
    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_node(op::succeed(AnyValue::new(value)))
    }

    /// Fail with a typed error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Fail with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_node(op::fail_cause(erase_cause(cause)))
    }

    /// Die with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::fail_cause(Cause::die(defect))
    }

    /// Die with a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::fail_cause(Cause::die_message(message))
    }

    /// Run a side effect each time the effect is run. Panics become
    /// defects.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(op::sync(move || AnyValue::new(f())))
    }

    /// Run a fallible side effect.
    pub fn attempt(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Op::Suspend(Arc::new(move || match f() {
            Ok(a) => op::succeed(AnyValue::new(a)),
            Err(e) => op::fail_cause(Cause::fail(AnyValue::new(e))),
        }))))
    }

    /// Build the effect lazily, each time it is run.
    pub fn suspend(f: impl Fn() -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Op::Suspend(Arc::new(move || f().node))))
    }

    /// Complete exactly as `exit` says.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(c) => Self::fail_cause(c),
        }
    }

    /// Succeed or fail from a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// Suspend until `register`'s callback is completed.
    pub fn async_callback(register: impl Fn(Callback<A, E>) + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Op::Async(Arc::new(move |resumer: Resumer| {
            register(Callback::new(resumer));
            None
        }))))
    }

    /// Suspend until `register`'s callback is completed. The effect
    /// `register` returns, if any, runs uninterruptibly when the fiber is
    /// interrupted while waiting.
    pub fn async_interrupt(
        register: impl Fn(Callback<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    ) -> Self {
        Self::from_node(Arc::new(Op::Async(Arc::new(move |resumer: Resumer| {
            register(Callback::new(resumer)).map(Effect::into_node)
        }))))
    }

    /// Suspend forever. Only interruption ends it.
    pub fn never() -> Self {
        Self::from_node(Arc::new(Op::Async(Arc::new(|_| None))))
    }

    /// Interrupt the running fiber.
    pub fn interrupt() -> Self {
        Self::from_node(op::with_fiber(|fiber| {
            op::fail_cause(Cause::interrupt(fiber.id))
        }))
    }

    /// Run effects one after another, collecting their values in order.
    pub fn foreach<T: Value>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<Vec<A>, E> {
        let items: Vec<T> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::suspend(move || {
            let out = Arc::new(Mutex::new(Vec::with_capacity(items.len())));
            let mut chain = Effect::<(), E>::unit();
            for item in items.iter().cloned() {
                let f = f.clone();
                let out = out.clone();
                chain = chain.flat_map(move |_| {
                    let out = out.clone();
                    f(item.clone()).map(move |a| out.lock().push(a))
                });
            }
            chain.map(move |_| std::mem::take(&mut *out.lock()))
        })
    }

    /// Acquire a resource, use it, and release it whatever happens.
    ///
    /// Acquire and release run uninterruptibly; `use_fn` is interruptible
    /// if the caller was.
    pub fn acquire_use_release<R: Value>(
        acquire: Effect<R, E>,
        use_fn: impl Fn(R) -> Effect<A, E> + Send + Sync + 'static,
        release: impl Fn(R) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        Self::acquire_use_release_exit(acquire, use_fn, move |r, _| release(r))
    }

    /// Like [`acquire_use_release`](Self::acquire_use_release), with the
    /// release seeing how `use_fn` ended.
    pub fn acquire_use_release_exit<R: Value>(
        acquire: Effect<R, E>,
        use_fn: impl Fn(R) -> Effect<A, E> + Send + Sync + 'static,
        release: impl Fn(R, &Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let use_fn = Arc::new(use_fn);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_fn = use_fn.clone();
            let release = release.clone();
            acquire.clone().flat_map(move |r: R| {
                let release = release.clone();
                let resource = r.clone();
                restore
                    .apply(use_fn(r))
                    .on_exit(move |exit| release(resource.clone(), exit))
            })
        })
    }

    /// Run `f` uninterruptibly, handing it a [`Restore`] for the outer
    /// interruptibility.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Arc::new(Op::UpdateFlags {
            patch: FlagsPatch::disable(RuntimeFlags::INTERRUPTIBLE),
            body: Some(Arc::new(move |outer| f(Restore { outer }).node)),
        }))
    }

    /// Open a scope, run `f` in it, and close it with `f`'s exit.
    pub fn scoped(f: impl Fn(Scope) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::acquire_use_release_exit(Scope::make().widen(), f, |scope, exit| {
            scope.close(exit.clone())
        })
    }
}

impl<E: Value> Effect<(), E> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::from_node(op::unit())
    }
}

impl Effect<()> {
    /// Let other fibers run before continuing.
    pub fn yield_now() -> Effect<()> {
        Effect::from_node(Arc::new(Op::Yield))
    }

    /// Suspend the fiber for `duration` on the runtime's clock.
    pub fn sleep(duration: Duration) -> Effect<()> {
        Effect::from_node(op::with_fiber(move |fiber| {
            let clock = fiber.runtime.clock.clone();
            let deadline = clock.now() + duration;
            Arc::new(Op::Async(Arc::new(move |resumer: Resumer| {
                let wake = resumer.clone();
                let id = clock.schedule(
                    deadline,
                    Box::new(move || {
                        wake.succeed(AnyValue::unit());
                    }),
                );
                let clock = clock.clone();
                Some(op::sync(move || {
                    clock.cancel(id);
                    AnyValue::unit()
                }))
            })))
        }))
    }
}

impl Effect<FiberId> {
    /// Id of the running fiber.
    pub fn fiber_id() -> Effect<FiberId> {
        Effect::from_node(op::with_fiber(|fiber| op::succeed(AnyValue::new(fiber.id))))
    }
}

impl Effect<Instant> {
    /// Current instant on the runtime's clock.
    pub fn now() -> Effect<Instant> {
        Effect::from_node(op::with_fiber(|fiber| {
            op::succeed(AnyValue::new(fiber.runtime.clock.now()))
        }))
    }
}

impl<A: Value> Effect<A, Infallible> {
    /// View an effect that cannot fail at any failure type.
    pub fn widen<E: Value>(self) -> Effect<A, E> {
        Effect::from_node(self.node)
    }
}

// ============================================================================
// Sequencing
// ============================================================================

impl<A: Value, E: Value> Effect<A, E> {
    /// Transform the success value.
    pub fn map<B: Value>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<B, E> {
        Effect::from_node(op::flat_map(
            self.node,
            Arc::new(move |v: AnyValue| op::succeed(AnyValue::new(f(v.downcast::<A>())))),
        ))
    }

    /// Transform the typed failure.
    pub fn map_error<E2: Value>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<A, E2> {
        let f = Arc::new(f);
        self.fold_cause_effect(
            move |cause| {
                let f = f.clone();
                Effect::fail_cause(cause.map(move |e| f(e)))
            },
            Effect::succeed,
        )
    }

    /// Continue with an effect built from the success value.
    pub fn flat_map<B: Value>(
        self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        Effect::from_node(op::flat_map(
            self.node,
            Arc::new(move |v: AnyValue| f(v.downcast::<A>()).node),
        ))
    }

    /// Alias for [`flat_map`](Self::flat_map).
    pub fn and_then<B: Value>(
        self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        self.flat_map(f)
    }

    /// Run both, keeping both values.
    pub fn zip<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| {
            that.clone().map(move |b| (a.clone(), b))
        })
    }

    /// Run both, keeping the first value.
    pub fn zip_left<B: Value>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.clone().as_value(a))
    }

    /// Run both, keeping the second value.
    pub fn zip_right<B: Value>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_node(op::flat_map(self.node, Arc::new(move |_| that.node.clone())))
    }

    /// Replace the success value.
    pub fn as_value<B: Value>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.as_value(())
    }

    /// Repeat `n` more times after the first run, keeping the last value.
    pub fn repeat_n(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        let again = self.clone();
        self.flat_map(move |_| again.clone().repeat_n(n - 1))
    }

    /// Repeat until failure or interruption.
    pub fn forever(self) -> Effect<Infallible, E> {
        let again = self.clone();
        self.flat_map(move |_| again.clone().forever())
    }

    /// Retry up to `n` more times on typed failure.
    pub fn retry_n(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        let again = self.clone();
        self.catch_all(move |_| again.clone().retry_n(n - 1))
    }

    /// Wait for `duration` first.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::sleep(duration).widen::<E>().zip_right(self)
    }
}

// ============================================================================
// Error handling
// ============================================================================

impl<A: Value, E: Value> Effect<A, E> {
    /// Continue with one of two effects depending on the outcome. The failure
    /// handler sees the full cause.
    pub fn fold_cause_effect<B: Value, E2: Value>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        Effect::from_node(op::fold(
            self.node,
            Arc::new(move |cause: ErasedCause| on_failure(typed_cause(cause)).node),
            Arc::new(move |v: AnyValue| on_success(v.downcast::<A>()).node),
        ))
    }

    /// Map both outcomes to a value. Defects and interruptions pass through.
    pub fn fold<B: Value>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, Infallible> {
        self.fold_cause_effect(
            move |cause| match recoverable(&cause) {
                Some(e) => Effect::succeed(on_failure(e)),
                None => Effect::fail_cause(cause.strip_failures()),
            },
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Map both outcomes to a value, the failure side seeing the full cause.
    pub fn fold_cause<B: Value>(
        self,
        on_failure: impl Fn(Cause<E>) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, Infallible> {
        self.fold_cause_effect(
            move |cause| Effect::succeed(on_failure(cause)),
            move |a| Effect::succeed(on_success(a)),
        )
    }

    /// Recover from typed failures.
    pub fn catch_all<E2: Value>(
        self,
        f: impl Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause_effect(
            move |cause| match recoverable(&cause) {
                Some(e) => f(e),
                None => Effect::fail_cause(cause.strip_failures()),
            },
            Effect::succeed,
        )
    }

    /// Recover from any cause, including defects and interruptions that
    /// reach this handler.
    pub fn catch_all_cause<E2: Value>(
        self,
        f: impl Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Run `that` if this fails with a typed error.
    pub fn or_else<E2: Value>(self, that: Effect<A, E2>) -> Effect<A, E2> {
        self.catch_all(move |_| that.clone())
    }

    /// Move typed failures into the success channel.
    pub fn either(self) -> Effect<Result<A, E>, Infallible> {
        self.fold(Err, Ok)
    }

    /// Reify the outcome as an [`Exit`].
    pub fn exit(self) -> Effect<Exit<A, E>, Infallible> {
        self.fold_cause(Exit::Failure, Exit::Success)
    }

    /// Expose the full cause as the typed failure.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        self.fold_cause_effect(|cause| Effect::fail(cause), Effect::succeed)
    }
}

impl<A: Value, E: Value> Effect<A, Cause<E>> {
    /// Undo [`sandbox`](Effect::sandbox).
    pub fn unsandbox(self) -> Effect<A, E> {
        self.fold_cause_effect(
            |cause| Effect::fail_cause(flatten_cause(cause)),
            Effect::succeed,
        )
    }
}

// ============================================================================
// Interruption and finalization
// ============================================================================

impl<A: Value, E: Value> Effect<A, E> {
    /// Defer interruption until this effect completes.
    pub fn uninterruptible(self) -> Self {
        Effect::from_node(op::uninterruptible(self.node))
    }

    /// Make this effect interruptible, even inside an uninterruptible
    /// region.
    pub fn interruptible(self) -> Self {
        let body = self.node;
        Effect::from_node(Arc::new(Op::UpdateFlags {
            patch: FlagsPatch::enable(RuntimeFlags::INTERRUPTIBLE),
            body: Some(Arc::new(move |_| body.clone())),
        }))
    }

    /// Run `cleanup` after this effect however it ends. The cleanup runs
    /// uninterruptibly and its failures are added after the effect's own.
    pub fn on_exit(
        self,
        cleanup: impl Fn(&Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let cleanup = Arc::new(cleanup);
        Effect::uninterruptible_mask(move |restore| {
            let cleanup = cleanup.clone();
            restore
                .apply(self.clone())
                .exit()
                .widen::<E>()
                .flat_map(move |exit: Exit<A, E>| {
                    let outcome = exit.clone();
                    cleanup(&exit)
                        .exit()
                        .widen::<E>()
                        .flat_map(move |done| match (outcome.clone(), done) {
                            (outcome, Exit::Success(())) => Effect::from_exit(outcome),
                            (Exit::Success(_), Exit::Failure(c)) => {
                                Effect::fail_cause(absurd_cause(c))
                            }
                            (Exit::Failure(first), Exit::Failure(c)) => {
                                Effect::fail_cause(first.then(absurd_cause(c)))
                            }
                        })
                })
        })
    }

    /// Run `finalizer` after this effect however it ends.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` if this effect is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<(), Infallible>) -> Self {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup.clone()
            } else {
                Effect::unit()
            }
        })
    }
}

// ============================================================================
// Fibers
// ============================================================================

impl<A: Value, E: Value> Effect<A, E> {
    fn fork_with(self, scope: ForkScope) -> Effect<Fiber<A, E>> {
        Effect::from_node(op::flat_map(
            Arc::new(Op::Fork {
                body: self.node,
                scope,
            }),
            Arc::new(|v: AnyValue| {
                let shared = v.downcast::<Arc<FiberShared>>();
                op::succeed(AnyValue::new(Fiber::<A, E>::from_shared(shared)))
            }),
        ))
    }

    /// Start this effect on a child fiber. The child is interrupted when the
    /// forking fiber finishes.
    pub fn fork(self) -> Effect<Fiber<A, E>> {
        self.fork_with(ForkScope::Child)
    }

    /// Start this effect on a fiber supervised by the runtime instead of the
    /// forking fiber.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>> {
        self.fork_with(ForkScope::Daemon)
    }

    /// Start this effect on a fiber that lives until `scope` closes.
    pub fn fork_in(self, scope: &Scope) -> Effect<Fiber<A, E>> {
        self.fork_with(ForkScope::In(scope.clone()))
    }

    /// Fail with [`RuntimeError::TimedOut`] as a defect if this takes longer
    /// than `duration`.
    pub fn timeout_die(self, duration: Duration) -> Self {
        self.timeout(duration).flat_map(move |result| match result {
            Some(a) => Effect::succeed(a),
            None => Effect::die(Defect::from_error(&RuntimeError::TimedOut(duration))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked())
    }

    #[test]
    fn test_map_and_flat_map() {
        let rt = runtime();
        let effect = Effect::<i32, String>::succeed(2)
            .map(|n| n * 3)
            .flat_map(|n| Effect::succeed(n + 1));
        assert_eq!(rt.run_blocking(effect).value(), Some(&7));
    }

    #[test]
    fn test_effects_are_reusable() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let effect = Effect::<(), Infallible>::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rt.run_blocking(effect.clone());
        rt.run_blocking(effect);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_catch_all_recovers_typed_failure() {
        let rt = runtime();
        let effect = Effect::<i32, &str>::fail("bad").catch_all(|e| Effect::<i32, ()>::succeed(e.len() as i32));
        assert_eq!(rt.run_blocking(effect).value(), Some(&3));
    }

    #[test]
    fn test_catch_all_ignores_defects() {
        let rt = runtime();
        let effect = Effect::<i32, &str>::die_message("bug").catch_all(|_| Effect::<i32, ()>::succeed(0));
        let exit = rt.run_blocking(effect);
        assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let effect = Effect::<i32, Infallible>::sync(|| panic!("kaboom"));
        let exit = rt.run_blocking(effect);
        let cause = exit.cause().cloned().unwrap();
        assert_eq!(cause.defects()[0].message(), "kaboom");
    }

    #[test]
    fn test_sandbox_exposes_defects() {
        let rt = runtime();
        let effect = Effect::<i32, String>::die_message("oops")
            .sandbox()
            .catch_all(|cause| Effect::<i32, Cause<String>>::succeed(cause.defects().len() as i32));
        assert_eq!(rt.run_blocking(effect).value(), Some(&1));
    }

    #[test]
    fn test_unsandbox_round_trips() {
        let rt = runtime();
        let effect = Effect::<i32, String>::fail("x".into()).sandbox().unsandbox();
        let exit = rt.run_blocking(effect);
        assert_eq!(exit.cause().and_then(|c| c.first_failure()), Some(&"x".to_string()));
    }

    #[test]
    fn test_either_and_exit() {
        let rt = runtime();
        let either = rt.run_blocking(Effect::<i32, &str>::fail("no").either());
        assert_eq!(either.value(), Some(&Err("no")));
        let exit = rt.run_blocking(Effect::<i32, &str>::succeed(1).exit());
        assert_eq!(exit.value().and_then(|e| e.value()), Some(&1));
    }

    #[test]
    fn test_ensuring_runs_on_failure() {
        let rt = runtime();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let effect = Effect::<(), &str>::fail("x").ensuring(Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(rt.run_blocking(effect).is_failure());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_failure_is_sequential() {
        let rt = runtime();
        let effect = Effect::<(), &str>::fail("first").ensuring(Effect::die_message("second"));
        let cause = rt.run_blocking(effect).cause().cloned().unwrap();
        assert!(matches!(cause, Cause::Sequential(_, _)));
        assert_eq!(cause.first_failure(), Some(&"first"));
        assert!(cause.is_die());
    }

    #[test]
    fn test_repeat_and_retry() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let effect = Effect::<usize, Infallible>::sync(move || counter.fetch_add(1, Ordering::SeqCst) + 1).repeat_n(4);
        assert_eq!(rt.run_blocking(effect).value(), Some(&5));

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky = Effect::<usize, &str>::attempt(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("not yet")
            } else {
                Ok(n)
            }
        });
        assert_eq!(rt.run_blocking(flaky.clone().retry_n(5)).value(), Some(&2));
        assert!(rt.run_blocking(flaky.retry_n(0).zip_right(Effect::<(), &str>::fail("stop"))).is_failure());
    }

    #[test]
    fn test_foreach_preserves_order() {
        let rt = runtime();
        let effect = Effect::<i32, Infallible>::foreach(vec![1, 2, 3], |n| Effect::succeed(n * 10));
        assert_eq!(rt.run_blocking(effect).value(), Some(&vec![10, 20, 30]));
    }

    #[test]
    fn test_acquire_use_release_releases_on_failure() {
        let rt = runtime();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let effect = Effect::<(), &str>::acquire_use_release(
            Effect::succeed(5usize),
            |_| Effect::fail("use failed"),
            move |n| {
                let counter = counter.clone();
                Effect::sync(move || {
                    counter.fetch_add(n, Ordering::SeqCst);
                })
            },
        );
        assert!(rt.run_blocking(effect).is_failure());
        assert_eq!(released.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_fiber_id_differs_across_forks() {
        let rt = runtime();
        let effect = Effect::fiber_id()
            .zip(Effect::fiber_id().fork().flat_map(|f| f.join()));
        let (me, child) = rt.run_blocking(effect).value().cloned().unwrap();
        assert_ne!(me, child);
    }
}
