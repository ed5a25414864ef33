//! Erased effect nodes.
//!
//! Every typed [`Effect`](super::Effect) is a thin wrapper around a [`Node`]:
//! a shared, immutable tree of [`Op`]s. The interpreter pattern-matches on
//! this closed set and never sees the user's types.

use std::sync::{Arc, OnceLock};

use crate::cause::Cause;
use crate::continuation::Resumer;
use crate::flags::{FlagsPatch, RuntimeFlags};
use crate::interpreter::FiberRuntime;
use crate::scope::Scope;
use crate::value::AnyValue;

/// Shared pointer to an effect node.
pub(crate) type Node = Arc<Op>;

/// Erased failure cause.
pub(crate) type ErasedCause = Cause<AnyValue>;

pub(crate) type Thunk = Arc<dyn Fn() -> AnyValue + Send + Sync>;
pub(crate) type CauseThunk = Arc<dyn Fn() -> ErasedCause + Send + Sync>;
pub(crate) type NodeThunk = Arc<dyn Fn() -> Node + Send + Sync>;
pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Node + Send + Sync>;
pub(crate) type CauseCont = Arc<dyn Fn(ErasedCause) -> Node + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Resumer) -> Option<Node> + Send + Sync>;
pub(crate) type FlagsBody = Arc<dyn Fn(RuntimeFlags) -> Node + Send + Sync>;
pub(crate) type FiberAccess = Arc<dyn Fn(&mut FiberRuntime) -> Node + Send + Sync>;

/// Where a forked fiber is supervised.
#[derive(Clone)]
pub(crate) enum ForkScope {
    /// Child of the forking fiber; interrupted when the parent ends.
    Child,
    /// Attached to the runtime's global scope.
    Daemon,
    /// Attached to an explicit scope.
    In(Scope),
}

/// One step of an effect description.
pub(crate) enum Op {
    /// Produce a value.
    Succeed(AnyValue),
    /// Run a side-effecting closure and produce its value.
    Sync(Thunk),
    /// Fail with a lazily built cause.
    Fail(CauseThunk),
    /// Build the next node lazily.
    Suspend(NodeThunk),
    /// Run `body`, then feed its value to the continuation.
    FlatMap(Node, Cont),
    /// Run `body`, then pick a continuation by outcome.
    Fold {
        body: Node,
        on_failure: CauseCont,
        on_success: Cont,
    },
    /// Suspend until the registered callback resumes the fiber. The
    /// registration may hand back a canceler run on interruption.
    Async(Register),
    /// Start `body` on a new fiber.
    Fork { body: Node, scope: ForkScope },
    /// Patch runtime flags, optionally only for the duration of a body that
    /// receives the flags in force before the patch.
    UpdateFlags {
        patch: FlagsPatch,
        body: Option<FlagsBody>,
    },
    /// Read or modify the running fiber's own state.
    WithFiber(FiberAccess),
    /// Give the worker back to the scheduler.
    Yield,
}

// Long left-nested chains would otherwise be dropped recursively.
impl Drop for Op {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach_body(self, &mut pending);
        while let Some(node) = pending.pop() {
            if let Ok(mut op) = Arc::try_unwrap(node) {
                detach_body(&mut op, &mut pending);
            }
        }
    }
}

fn detach_body(op: &mut Op, out: &mut Vec<Node>) {
    static LEAF: OnceLock<Node> = OnceLock::new();
    match op {
        Op::FlatMap(body, _) | Op::Fold { body, .. } | Op::Fork { body, .. } => {
            let leaf = LEAF.get_or_init(|| Arc::new(Op::Yield)).clone();
            out.push(std::mem::replace(body, leaf));
        }
        _ => {}
    }
}

pub(crate) fn succeed(value: AnyValue) -> Node {
    Arc::new(Op::Succeed(value))
}

pub(crate) fn unit() -> Node {
    succeed(AnyValue::unit())
}

pub(crate) fn sync(f: impl Fn() -> AnyValue + Send + Sync + 'static) -> Node {
    Arc::new(Op::Sync(Arc::new(f)))
}

pub(crate) fn fail_cause(cause: ErasedCause) -> Node {
    Arc::new(Op::Fail(Arc::new(move || cause.clone())))
}

pub(crate) fn flat_map(body: Node, k: Cont) -> Node {
    Arc::new(Op::FlatMap(body, k))
}

pub(crate) fn fold(body: Node, on_failure: CauseCont, on_success: Cont) -> Node {
    Arc::new(Op::Fold {
        body,
        on_failure,
        on_success,
    })
}

pub(crate) fn with_fiber(f: impl Fn(&mut FiberRuntime) -> Node + Send + Sync + 'static) -> Node {
    Arc::new(Op::WithFiber(Arc::new(f)))
}

/// Run `body` with the given flags cleared.
pub(crate) fn without_flags(flags: RuntimeFlags, body: Node) -> Node {
    Arc::new(Op::UpdateFlags {
        patch: FlagsPatch::disable(flags),
        body: Some(Arc::new(move |_| body.clone())),
    })
}

/// Run `body` uninterruptibly.
pub(crate) fn uninterruptible(body: Node) -> Node {
    without_flags(RuntimeFlags::INTERRUPTIBLE, body)
}

/// Run `canceler` uninterruptibly, then fail with `cause`.
pub(crate) fn cancel_then_fail(canceler: Option<Node>, cause: ErasedCause) -> Node {
    match canceler {
        Some(canceler) => {
            let after = cause.clone();
            uninterruptible(fold(
                canceler,
                Arc::new(move |failed| fail_cause(cause.clone().then(failed))),
                Arc::new(move |_| fail_cause(after.clone())),
            ))
        }
        None => fail_cause(cause),
    }
}
