//! # One-Shot Resumption
//!
//! A fiber that reaches an asynchronous boundary parks itself and hands a
//! [`Resumer`] to whoever registered the boundary. The resumer is
//! **one-shot**: the first resumption wins and every later one is ignored.
//! Resumers are tied to the epoch of the boundary they were created for, so a
//! stale resumer can never wake the fiber at a later boundary.
//!
//! [`Callback`] is the typed view used by [`Effect::async_interrupt`] and the
//! concurrent primitives.
//!
//! [`Effect::async_interrupt`]: crate::Effect::async_interrupt

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cause::Cause;
use crate::effect::op::{ErasedCause, Node};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::{FiberId, FiberShared};
use crate::interpreter::Control;
use crate::value::{AnyValue, Value};

/// Erased resumption handle for one asynchronous boundary.
#[derive(Clone)]
pub(crate) struct Resumer {
    shared: Arc<FiberShared>,
    epoch: u64,
}

impl Resumer {
    pub(crate) fn new(shared: Arc<FiberShared>, epoch: u64) -> Self {
        Self { shared, epoch }
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.shared.id
    }

    /// Resume with a control. False if the fiber was not waiting anymore.
    pub(crate) fn resume(&self, control: Control) -> bool {
        self.shared
            .resume_with(self.epoch, control, |control| control)
            .is_ok()
    }

    /// Resume with a value built from `value`, handing `value` back if the
    /// fiber was not waiting anymore.
    pub(crate) fn try_resume_with<T>(
        &self,
        value: T,
        build: impl FnOnce(T) -> AnyValue,
    ) -> Result<(), T> {
        self.shared
            .resume_with(self.epoch, value, |v| Control::Return(build(v)))
    }

    pub(crate) fn succeed(&self, value: AnyValue) -> bool {
        self.resume(Control::Return(value))
    }

    pub(crate) fn fail_cause(&self, cause: ErasedCause) -> bool {
        self.resume(Control::Raise(cause))
    }

    pub(crate) fn resume_node(&self, node: Node) -> bool {
        self.resume(Control::Eval(node))
    }
}

/// Typed handle for completing an asynchronous effect.
///
/// The first call to any completion method wins; later calls return `false`
/// (or hand the value back) and have no effect.
pub struct Callback<A, E = Infallible> {
    resumer: Resumer,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resumer: self.resumer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Callback<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("fiber", &self.resumer.fiber_id())
            .finish()
    }
}

impl<A: Value, E: Value> Callback<A, E> {
    pub(crate) fn new(resumer: Resumer) -> Self {
        Self {
            resumer,
            _marker: PhantomData,
        }
    }

    /// Id of the suspended fiber.
    pub fn fiber_id(&self) -> FiberId {
        self.resumer.fiber_id()
    }

    /// Resume with a value.
    pub fn succeed(&self, value: A) -> bool {
        self.resumer.succeed(AnyValue::new(value))
    }

    /// Resume with a value, handing it back if the fiber stopped waiting
    /// (for example because it was interrupted).
    pub fn try_succeed(&self, value: A) -> Result<(), A> {
        self.resumer.try_resume_with(value, AnyValue::new)
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.resumer.fail_cause(Cause::fail(AnyValue::new(error)))
    }

    /// Resume with an arbitrary cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.resumer.fail_cause(cause.map(AnyValue::new))
    }

    /// Resume with an exit.
    pub fn complete(&self, exit: Exit<A, E>) -> bool {
        match exit {
            Exit::Success(a) => self.succeed(a),
            Exit::Failure(c) => self.fail_cause(c),
        }
    }

    /// Resume by running an effect on the suspended fiber.
    pub fn resume(&self, effect: Effect<A, E>) -> bool {
        self.resumer.resume_node(effect.into_node())
    }
}
