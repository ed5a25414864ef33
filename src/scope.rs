//! # Scopes
//!
//! A [`Scope`] is a resource-lifetime boundary. Finalizers are added while
//! the scope is open and run when it closes:
//!
//! - most-recently-added first,
//! - uninterruptibly, each with the exit the scope was closed with,
//! - every one of them, even when an earlier one fails; failures are folded
//!   into one cause with `Sequential`.
//!
//! Closing is idempotent. A later `close` waits for the first one to finish
//! and reports the same outcome. Adding a finalizer to a closed scope runs
//! it at once with the closing exit.
//!
//! Every fiber owns a scope for the children it forks, and the runtime owns a
//! global scope for daemon fibers.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::continuation::Resumer;
use crate::effect::op::{self, ErasedCause, Node, Op};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::ErasedExit;
use crate::value::{AnyValue, Value};

/// Erased exit handed to scope finalizers.
pub type ScopeExit = Exit<AnyValue, AnyValue>;

/// Erased finalizer: builds the cleanup effect for a closing exit.
pub(crate) type Finalizer = Arc<dyn Fn(&ErasedExit) -> Node + Send + Sync>;

enum State {
    Open {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Closing {
        exit: ErasedExit,
        waiters: Vec<Resumer>,
    },
    Closed {
        exit: ErasedExit,
        /// Aggregated finalizer failures, `Empty` if all succeeded.
        failures: ErasedCause,
    },
}

struct Inner {
    state: Mutex<State>,
}

/// A resource-lifetime boundary owning an ordered set of finalizers.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Scope {
    /// Create an open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Open {
                    next_key: 0,
                    finalizers: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Effect that creates an open scope.
    pub fn make() -> Effect<Scope> {
        Effect::sync(Scope::new)
    }

    /// True once closing has started.
    pub fn is_closed(&self) -> bool {
        !matches!(&*self.inner.state.lock(), State::Open { .. })
    }

    /// Number of finalizers waiting for close.
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Open { finalizers, .. } => finalizers.len(),
            _ => 0,
        }
    }

    /// Register a finalizer. Hands it back if the scope is no longer open.
    pub(crate) fn add_finalizer_raw(&self, finalizer: Finalizer) -> Result<u64, Finalizer> {
        match &mut *self.inner.state.lock() {
            State::Open {
                next_key,
                finalizers,
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Ok(key)
            }
            _ => Err(finalizer),
        }
    }

    /// Forget a finalizer without running it.
    pub(crate) fn remove_finalizer(&self, key: u64) {
        if let State::Open { finalizers, .. } = &mut *self.inner.state.lock() {
            finalizers.remove(&key);
        }
    }

    /// Add a finalizer effect.
    ///
    /// If the scope already closed, the finalizer runs now with the exit the
    /// scope was closed with.
    pub fn add_finalizer(
        &self,
        finalizer: impl Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<()> {
        let finalizer: Finalizer = Arc::new(move |exit: &ErasedExit| finalizer(exit).into_node());
        let scope = self.clone();
        Effect::from_node(Arc::new(Op::Suspend(Arc::new(move || {
            match scope.add_finalizer_raw(finalizer.clone()) {
                Ok(_) => op::unit(),
                Err(finalizer) => match scope.closing_exit() {
                    Some(exit) => op::uninterruptible(finalizer(&exit)),
                    None => op::unit(),
                },
            }
        }))))
    }

    /// Acquire a resource uninterruptibly and register its release here.
    pub fn acquire_release<A: Value, E: Value>(
        &self,
        acquire: Effect<A, E>,
        release: impl Fn(A, &ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        let scope = self.clone();
        let release = Arc::new(release);
        acquire
            .flat_map(move |a: A| {
                let release = release.clone();
                let resource = a.clone();
                scope
                    .add_finalizer(move |exit| release(resource.clone(), exit))
                    .widen::<E>()
                    .as_value(a)
            })
            .uninterruptible()
    }

    /// Close the scope with `exit`, running finalizers. Fails with the
    /// aggregated cause of any finalizer that failed.
    pub fn close<A: Value, E: Value>(&self, exit: Exit<A, E>) -> Effect<()> {
        Effect::from_node(self.close_node(crate::fiber::erase_exit(exit)))
    }

    fn closing_exit(&self) -> Option<ErasedExit> {
        match &*self.inner.state.lock() {
            State::Open { .. } => None,
            State::Closing { exit, .. } | State::Closed { exit, .. } => Some(exit.clone()),
        }
    }

    /// Erased close.
    pub(crate) fn close_node(&self, exit: ErasedExit) -> Node {
        let scope = self.clone();
        op::uninterruptible(Arc::new(Op::Suspend(Arc::new(move || {
            let taken = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    State::Open { finalizers, .. } => {
                        let finalizers = std::mem::take(finalizers);
                        *state = State::Closing {
                            exit: exit.clone(),
                            waiters: Vec::new(),
                        };
                        Ok(finalizers)
                    }
                    State::Closing { .. } => Err(None),
                    State::Closed { failures, .. } => Err(Some(failures.clone())),
                }
            };
            match taken {
                Ok(finalizers) => {
                    let finish = scope.clone();
                    op::flat_map(
                        run_finalizers(finalizers, exit.clone()),
                        Arc::new(move |failures| finish.finish_close(failures.downcast())),
                    )
                }
                Err(None) => scope.wait_closed(),
                Err(Some(failures)) => report(failures),
            }
        }))))
    }

    fn finish_close(&self, failures: ErasedCause) -> Node {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Closing { exit, waiters } => {
                    let exit = exit.clone();
                    let waiters = std::mem::take(waiters);
                    *state = State::Closed {
                        exit,
                        failures: failures.clone(),
                    };
                    waiters
                }
                _ => Vec::new(),
            }
        };
        if !failures.is_empty() {
            tracing::debug!("scope finalizers failed:\n{}", failures);
        }
        for waiter in waiters {
            waiter.resume_node(report(failures.clone()));
        }
        report(failures)
    }

    fn wait_closed(&self) -> Node {
        let scope = self.clone();
        Arc::new(Op::Async(Arc::new(move |resumer: Resumer| {
            let ready = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    State::Closing { waiters, .. } => {
                        waiters.push(resumer.clone());
                        None
                    }
                    State::Closed { failures, .. } => Some(report(failures.clone())),
                    State::Open { .. } => Some(op::unit()),
                }
            };
            if let Some(node) = ready {
                resumer.resume_node(node);
            }
            None
        })))
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Open { finalizers, .. } => format!("open({})", finalizers.len()),
            State::Closing { .. } => "closing".to_string(),
            State::Closed { .. } => "closed".to_string(),
        };
        f.debug_struct("Scope").field("state", &state).finish()
    }
}

/// Run finalizers newest first and succeed with their combined failures.
fn run_finalizers(finalizers: BTreeMap<u64, Finalizer>, exit: ErasedExit) -> Node {
    finalizers
        .into_values()
        .rev()
        .fold(op::succeed(AnyValue::new(ErasedCause::Empty)), |acc, finalizer| {
            let exit = exit.clone();
            op::flat_map(
                acc,
                Arc::new(move |so_far: AnyValue| {
                    let so_far: ErasedCause = so_far.downcast();
                    let finalizer = finalizer.clone();
                    let exit = exit.clone();
                    let body = Arc::new(Op::Suspend(Arc::new(move || finalizer(&exit))));
                    let on_ok = so_far.clone();
                    op::fold(
                        body,
                        Arc::new(move |failed| op::succeed(AnyValue::new(so_far.clone().then(failed)))),
                        Arc::new(move |_| op::succeed(AnyValue::new(on_ok.clone()))),
                    )
                }),
            )
        })
}

fn report(failures: ErasedCause) -> Node {
    if failures.is_empty() {
        op::unit()
    } else {
        op::fail_cause(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(
            crate::config::RuntimeConfig::builder()
                .num_workers(2)
                .build_unchecked(),
        )
    }

    #[test]
    fn test_finalizers_run_in_reverse_order() {
        let rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let mut program = Effect::unit();
        for i in 0..3 {
            let order = order.clone();
            program = program.zip_right(scope.add_finalizer(move |_| {
                let order = order.clone();
                Effect::sync(move || order.lock().push(i))
            }));
        }
        let program = program.zip_right(scope.close(Exit::<(), ()>::succeed(())));
        assert!(rt.run_blocking(program).is_success());
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(scope.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let counter = runs.clone();
        let program = scope
            .add_finalizer(move |_| {
                let counter = counter.clone();
                Effect::sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .zip_right(scope.close(Exit::<(), ()>::succeed(())))
            .zip_right(scope.close(Exit::<(), ()>::succeed(())));
        assert!(rt.run_blocking(program).is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_finalizer_does_not_stop_others() {
        let rt = runtime();
        let ran = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let counter = ran.clone();
        let program = scope
            .add_finalizer(move |_| {
                let counter = counter.clone();
                Effect::sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .zip_right(scope.add_finalizer(|_| Effect::die_message("boom")))
            .zip_right(scope.close(Exit::<(), ()>::succeed(())));
        let exit = rt.run_blocking(program);
        assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_after_close_runs_immediately() {
        let rt = runtime();
        let ran = Arc::new(AtomicUsize::new(0));
        let scope = Scope::new();
        let counter = ran.clone();
        let program = scope
            .close(Exit::<(), ()>::succeed(()))
            .zip_right(scope.add_finalizer(move |_| {
                let counter = counter.clone();
                Effect::sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }));
        assert!(rt.run_blocking(program).is_success());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_sees_closing_exit() {
        let rt = runtime();
        let seen = Arc::new(Mutex::new(None));
        let scope = Scope::new();
        let slot = seen.clone();
        let program = scope
            .add_finalizer(move |exit| {
                let slot = slot.clone();
                let failed = exit.is_failure();
                Effect::sync(move || *slot.lock() = Some(failed))
            })
            .zip_right(scope.close(Exit::<(), &'static str>::fail("bad")));
        assert!(rt.run_blocking(program).is_success());
        assert_eq!(*seen.lock(), Some(true));
    }
}
