//! # Software Transactional Memory
//!
//! An [`Stm<A, E>`] describes a transaction over transactional references
//! ([`TRef`], [`TArray`], [`TMap`], [`TQueue`]). Like an effect it is inert
//! until committed with [`Stm::commit`] (or [`atomically`]), which turns it
//! into an [`Effect`].
//!
//! ## Execution
//!
//! A commit runs the transaction against a fresh journal. Each cell is read
//! from its committed state the first time the attempt touches it, and
//! after that from the journal, which also holds the transaction's own
//! writes. Cells loaded at different moments may come from different
//! commits, so an attempt can see a torn view; such an attempt never
//! publishes and its result is never reported. At the end every touched cell is
//! locked in id order and its version compared with the one the transaction
//! observed. If none moved, the writes are published together; otherwise the
//! attempt is discarded and the transaction re-runs from scratch. No other
//! transaction ever sees a partial write.
//!
//! ## Retry
//!
//! [`Stm::retry`] abandons the attempt and suspends the fiber until one of
//! the cells it read is written by another commit, then re-runs it.
//! [`Stm::or_else`] offers an alternative instead: the first branch's writes
//! are rolled back and the second branch runs in the same transaction.
//!
//! ## Failures
//!
//! A typed failure aborts the transaction without publishing anything. So
//! does a panic inside a transaction closure, which becomes a defect. Both
//! are only reported if the attempt saw a consistent view; otherwise the
//! transaction is simply re-run.

mod journal;
mod tarray;
mod tmap;
mod tqueue;
mod tref;

pub use tarray::TArray;
pub use tmap::TMap;
pub use tqueue::TQueue;
pub use tref::TRef;

use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cause::Defect;
use crate::effect::op;
use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::fiber::FiberId;
use crate::value::Value;

use self::journal::{Journal, TCell};

/// Outcome of running a transaction body once.
pub(crate) enum TxResult<A, E> {
    Done(A),
    Fail(E),
    Die(Defect),
    Retry,
}

type Run<A, E> = Arc<dyn Fn(&mut Journal) -> TxResult<A, E> + Send + Sync>;

/// A transaction producing `A` or failing with `E`.
pub struct Stm<A, E = Infallible> {
    run: Run<A, E>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("success", &std::any::type_name::<A>())
            .field("error", &std::any::type_name::<E>())
            .finish()
    }
}

impl<A: Value, E: Value> Stm<A, E> {
    pub(crate) fn from_fn(f: impl Fn(&mut Journal) -> TxResult<A, E> + Send + Sync + 'static) -> Self {
        Self { run: Arc::new(f) }
    }

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_fn(move |_| TxResult::Done(value.clone()))
    }

    /// Abort with a typed failure.
    pub fn fail(error: E) -> Self {
        Self::from_fn(move |_| TxResult::Fail(error.clone()))
    }

    /// Abort with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::from_fn(move |_| TxResult::Die(defect.clone()))
    }

    /// Abort with a defect carrying `message`.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Abandon this attempt and run again once something it read changed.
    pub fn retry() -> Self {
        Self::from_fn(|_| TxResult::Retry)
    }

    /// Build the transaction when it runs.
    pub fn suspend(f: impl Fn() -> Stm<A, E> + Send + Sync + 'static) -> Self {
        Self::from_fn(move |journal| (f().run)(journal))
    }

    /// Run `f` for every item in order, collecting the values.
    pub fn foreach<T: Value>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Stm<A, E> + Send + Sync + 'static,
    ) -> Stm<Vec<A>, E> {
        let items: Vec<T> = items.into_iter().collect();
        Stm::from_fn(move |journal| {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter().cloned() {
                match (f(item).run)(journal) {
                    TxResult::Done(a) => out.push(a),
                    TxResult::Fail(e) => return TxResult::Fail(e),
                    TxResult::Die(d) => return TxResult::Die(d),
                    TxResult::Retry => return TxResult::Retry,
                }
            }
            TxResult::Done(out)
        })
    }

    /// Transform the value.
    pub fn map<B: Value>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Transform the typed failure.
    pub fn map_error<E2: Value>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Stm<A, E2> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            TxResult::Done(a) => TxResult::Done(a),
            TxResult::Fail(e) => TxResult::Fail(f(e)),
            TxResult::Die(d) => TxResult::Die(d),
            TxResult::Retry => TxResult::Retry,
        })
    }

    /// Continue with the transaction built from the value.
    pub fn flat_map<B: Value>(self, f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static) -> Stm<B, E> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            TxResult::Done(a) => (f(a).run)(journal),
            TxResult::Fail(e) => TxResult::Fail(e),
            TxResult::Die(d) => TxResult::Die(d),
            TxResult::Retry => TxResult::Retry,
        })
    }

    /// Run both, pairing the values.
    pub fn zip<B: Value>(self, that: Stm<B, E>) -> Stm<(A, B), E> {
        self.flat_map(move |a| that.clone().map(move |b| (a.clone(), b)))
    }

    /// Run both, keeping the second value.
    pub fn zip_right<B: Value>(self, that: Stm<B, E>) -> Stm<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Run both, keeping the first value.
    pub fn zip_left<B: Value>(self, that: Stm<B, E>) -> Stm<A, E> {
        self.flat_map(move |a| that.clone().map(move |_| a.clone()))
    }

    /// Recover from a typed failure. Writes made by the failed part are
    /// rolled back first.
    pub fn catch_all<E2: Value>(self, f: impl Fn(E) -> Stm<A, E2> + Send + Sync + 'static) -> Stm<A, E2> {
        let run = self.run;
        Stm::from_fn(move |journal| {
            let checkpoint = journal.checkpoint();
            match run(journal) {
                TxResult::Done(a) => TxResult::Done(a),
                TxResult::Fail(e) => {
                    journal.rollback(checkpoint);
                    (f(e).run)(journal)
                }
                TxResult::Die(d) => TxResult::Die(d),
                TxResult::Retry => TxResult::Retry,
            }
        })
    }

    /// If this retries, roll back its writes and run `that` instead.
    pub fn or_else(self, that: Stm<A, E>) -> Stm<A, E> {
        let run = self.run;
        Stm::from_fn(move |journal| {
            let checkpoint = journal.checkpoint();
            match run(journal) {
                TxResult::Retry => {
                    journal.rollback(checkpoint);
                    (that.run)(journal)
                }
                other => other,
            }
        })
    }

    /// If this retries or fails, roll back its writes and run `that`
    /// instead.
    pub fn or_try<E2: Value>(self, that: Stm<A, E2>) -> Stm<A, E2> {
        let run = self.run;
        Stm::from_fn(move |journal| {
            let checkpoint = journal.checkpoint();
            match run(journal) {
                TxResult::Done(a) => TxResult::Done(a),
                TxResult::Die(d) => TxResult::Die(d),
                TxResult::Fail(_) | TxResult::Retry => {
                    journal.rollback(checkpoint);
                    (that.run)(journal)
                }
            }
        })
    }

    /// Handle both outcomes. A failure's writes are rolled back.
    pub fn fold<B: Value>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Stm<B> {
        let run = self.run;
        Stm::from_fn(move |journal| {
            let checkpoint = journal.checkpoint();
            match run(journal) {
                TxResult::Done(a) => TxResult::Done(on_success(a)),
                TxResult::Fail(e) => {
                    journal.rollback(checkpoint);
                    TxResult::Done(on_failure(e))
                }
                TxResult::Die(d) => TxResult::Die(d),
                TxResult::Retry => TxResult::Retry,
            }
        })
    }

    /// Reify the typed failure.
    pub fn either(self) -> Stm<Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Run the transaction atomically.
    pub fn commit(&self) -> Effect<A, E> {
        let stm = self.clone();
        Effect::from_node(op::with_fiber(move |fiber| {
            let limit = fiber.runtime.config.stm.max_retries;
            attempt(&stm, limit, fiber.id).into_node()
        }))
    }
}

impl<E: Value> Stm<(), E> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Self::unit()
        } else {
            Self::retry()
        }
    }
}

impl<A: Value> Stm<A, Infallible> {
    /// View a transaction that cannot fail at any failure type.
    pub fn widen<E: Value>(self) -> Stm<A, E> {
        let run = self.run;
        Stm::from_fn(move |journal| match run(journal) {
            TxResult::Done(a) => TxResult::Done(a),
            TxResult::Fail(never) => match never {},
            TxResult::Die(d) => TxResult::Die(d),
            TxResult::Retry => TxResult::Retry,
        })
    }
}

/// Run `stm` atomically.
pub fn atomically<A: Value, E: Value>(stm: Stm<A, E>) -> Effect<A, E> {
    stm.commit()
}

pub(crate) fn out_of_bounds(index: usize, len: usize) -> Defect {
    Defect::from_error(&RuntimeError::IndexOutOfBounds { index, len })
}

/// Run attempts until one commits, fails consistently, or has to wait.
fn attempt<A: Value, E: Value>(stm: &Stm<A, E>, limit: usize, fiber: FiberId) -> Effect<A, E> {
    let mut conflicts = 0usize;
    loop {
        let mut journal = Journal::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (stm.run)(&mut journal)))
            .unwrap_or_else(|payload| TxResult::Die(Defect::from_panic(payload)));

        match outcome {
            TxResult::Done(a) => {
                if let Ok(wake) = journal.commit() {
                    for waiter in wake {
                        waiter.succeed(());
                    }
                    return Effect::succeed(a);
                }
            }
            TxResult::Fail(e) if journal.is_valid() => return Effect::fail(e),
            TxResult::Die(d) if journal.is_valid() => return Effect::die(d),
            TxResult::Retry if journal.is_valid() => {
                tracing::trace!(fiber = %fiber, reads = journal.len(), "transaction waiting for a change");
                let again = stm.commit();
                return wait_for_change(journal.read_set())
                    .widen::<E>()
                    .zip_right(again);
            }
            _ => {}
        }

        conflicts += 1;
        tracing::trace!(fiber = %fiber, conflicts, "transaction conflict, re-running");
        if limit > 0 && conflicts > limit {
            tracing::debug!(fiber = %fiber, conflicts, "transaction gave up");
            return Effect::die(Defect::from_error(&RuntimeError::ConflictLimit {
                retries: conflicts,
            }));
        }
    }
}

/// Suspend until one of `cells` is written past the given version.
fn wait_for_change(cells: Vec<(Arc<TCell>, u64)>) -> Effect<()> {
    static NEXT_WAIT_KEY: AtomicU64 = AtomicU64::new(0);
    let key = NEXT_WAIT_KEY.fetch_add(1, Ordering::Relaxed);
    let cells = Arc::new(cells);
    let watched = cells.clone();
    let unwatch = Effect::sync(move || {
        for (cell, _) in watched.iter() {
            cell.unwatch(key);
        }
    });
    Effect::async_callback(move |cb| {
        let changed = cells
            .iter()
            .any(|(cell, version)| !cell.watch(*version, key, cb.clone()));
        if changed {
            cb.succeed(());
        }
    })
    .ensuring(unwatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
    }

    #[test]
    fn test_commit_publishes_writes() {
        let rt = runtime();
        let a = TRef::new(1);
        let tx = a.update(|n| n + 41).zip_right(a.get());
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&42));
        assert_eq!(rt.run_blocking(a.get().commit()).value(), Some(&42));
    }

    #[test]
    fn test_failure_discards_writes() {
        let rt = runtime();
        let a = TRef::new(1);
        let tx = a
            .set(100)
            .widen()
            .zip_right(Stm::<(), &str>::fail("abort"));
        let exit = rt.run_blocking(tx.commit());
        assert_eq!(exit.cause().and_then(|c| c.first_failure()), Some(&"abort"));
        assert_eq!(rt.run_blocking(a.get().commit()).value(), Some(&1));
    }

    #[test]
    fn test_catch_all_rolls_back_failed_branch() {
        let rt = runtime();
        let a = TRef::new(0);
        let failing = a.set(5).widen().zip_right(Stm::<i32, &str>::fail("no"));
        let tx = failing.catch_all(|_| Stm::<i32, &str>::succeed(-1)).zip(a.get().widen());
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&(-1, 0)));
    }

    #[test]
    fn test_or_else_takes_alternative_on_retry() {
        let rt = runtime();
        let a = TRef::new(0);
        let left = a.set(9).zip_right(Stm::<i32>::retry());
        let tx = left.or_else(a.get().map(|n| n + 1));
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&1));
    }

    #[test]
    fn test_or_try_on_failure() {
        let rt = runtime();
        let tx = Stm::<i32, &str>::fail("x").or_try(Stm::<i32, String>::succeed(3));
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&3));
    }

    #[test]
    fn test_retry_waits_for_write() {
        let rt = runtime();
        let gate = TRef::new(false);
        let wait = gate
            .get()
            .flat_map(|open| Stm::check(open))
            .zip_right(Stm::succeed("through"));
        let program = wait.commit().fork().flat_map({
            let gate = gate.clone();
            move |waiter| {
                Effect::yield_now()
                    .zip_right(gate.set(true).commit())
                    .zip_right(waiter.join())
            }
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&"through"));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let tx = Stm::<i32>::suspend(|| panic!("inside transaction"));
        let exit = rt.run_blocking(tx.commit());
        let cause = exit.cause().cloned().unwrap_or_default();
        assert!(cause.is_die());
        assert_eq!(cause.defects()[0].message(), "inside transaction");
    }

    #[test]
    fn test_either_and_fold() {
        let rt = runtime();
        let tx = Stm::<i32, &str>::fail("bad").either();
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&Err("bad")));
    }

    #[test]
    fn test_conflict_limit_kills_transaction() {
        use std::sync::atomic::AtomicUsize;

        let config = RuntimeConfig::builder()
            .num_workers(1)
            .stm_max_retries(3)
            .build_unchecked();
        let rt = Runtime::new(config);
        let other = Arc::new(runtime());
        let cell = TRef::new(0);
        let attempts = Arc::new(AtomicUsize::new(0));

        let tx = cell.get().flat_map({
            let cell = cell.clone();
            let attempts = attempts.clone();
            move |n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let bumped = other.run_blocking(cell.set(n + 1).commit());
                assert!(bumped.is_success());
                cell.set(n)
            }
        });
        let exit = rt.run_blocking(tx.commit());
        let cause = exit.cause().cloned().unwrap_or_default();
        assert!(cause.is_die());
        assert!(cause.defects()[0].message().contains("4 conflicting attempts"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(rt.run_blocking(cell.get().commit()).value(), Some(&4));
    }

    #[test]
    fn test_conflict_limit_config_is_read() {
        let config = RuntimeConfig::builder()
            .num_workers(1)
            .stm_max_retries(3)
            .build_unchecked();
        let rt = Runtime::new(config);
        let a = TRef::new(1);
        assert_eq!(rt.run_blocking(a.get().commit()).value(), Some(&1));
    }
}
