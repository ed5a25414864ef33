//! Transactional reference.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::effect::Effect;
use crate::value::{AnyValue, Value};

use super::journal::{Journal, TCell};
use super::{Stm, TxResult};

/// A mutable cell that can only be accessed inside a transaction.
pub struct TRef<A> {
    cell: Arc<TCell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TRef").field(&self.cell.id()).finish()
    }
}

impl<A: Value> TRef<A> {
    /// A reference holding `initial`, created outside any transaction.
    pub fn new(initial: A) -> Self {
        Self {
            cell: TCell::new(AnyValue::new(initial)),
            _marker: PhantomData,
        }
    }

    /// Create a reference as part of a transaction.
    pub fn make(initial: A) -> Stm<TRef<A>> {
        Stm::from_fn(move |_| TxResult::Done(TRef::new(initial.clone())))
    }

    /// Create a reference in its own transaction.
    pub fn make_commit(initial: A) -> Effect<TRef<A>> {
        TRef::make(initial).commit()
    }

    pub(crate) fn read(&self, journal: &mut Journal) -> A {
        journal.read(&self.cell).downcast::<A>()
    }

    pub(crate) fn write(&self, journal: &mut Journal, value: A) {
        journal.write(&self.cell, AnyValue::new(value));
    }

    /// Read the value.
    pub fn get(&self) -> Stm<A> {
        let this = self.clone();
        Stm::from_fn(move |journal| TxResult::Done(this.read(journal)))
    }

    /// Replace the value.
    pub fn set(&self, value: A) -> Stm<()> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            this.write(journal, value.clone());
            TxResult::Done(())
        })
    }

    /// Apply `f` to the value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<()> {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` and return the new value.
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<A> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Apply `f` and return the old value.
    pub fn get_and_update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<A> {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Replace the value and return the old one.
    pub fn get_and_set(&self, value: A) -> Stm<A> {
        self.modify(move |a| (a, value.clone()))
    }

    /// Compute a result and a new value from the current one.
    pub fn modify<B: Value>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Stm<B> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            let (out, next) = f(this.read(journal));
            this.write(journal, next);
            TxResult::Done(out)
        })
    }
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
    fn test_tref_operations() {
        let rt = runtime();
        let r = TRef::new(3);
        let tx = r
            .get_and_update(|n| n * 2)
            .zip(r.update_and_get(|n| n + 1))
            .zip(r.get_and_set(0))
            .zip(r.get());
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&(((3, 7), 7), 0)));
    }

    #[test]
    fn test_make_commit() {
        let rt = runtime();
        let program = TRef::make_commit(String::from("a"))
            .flat_map(|r| r.update(|s| s + "b").commit().zip_right(r.get().commit()));
        assert_eq!(rt.run_blocking(program).value().map(String::as_str), Some("ab"));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let rt = runtime();
        let counter = TRef::new(0u64);
        let bump = counter.update(|n| n + 1).commit().repeat_n(49);
        let program = Effect::foreach_par(0..8, move |_| bump.clone()).zip_right(counter.get().commit());
        assert_eq!(rt.run_blocking(program).value(), Some(&400));
    }
}
