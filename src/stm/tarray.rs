//! Fixed-size array of transactional references.

use std::fmt;
use std::sync::Arc;

use crate::value::Value;

use super::tref::TRef;
use super::{out_of_bounds, Stm, TxResult};

/// A fixed-length array whose slots are independent [`TRef`]s, so
/// transactions touching different indices do not conflict.
pub struct TArray<A> {
    refs: Arc<[TRef<A>]>,
}

impl<A> Clone for TArray<A> {
    fn clone(&self) -> Self {
        Self {
            refs: self.refs.clone(),
        }
    }
}

impl<A> fmt::Debug for TArray<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TArray").field("len", &self.refs.len()).finish()
    }
}

impl<A: Value> TArray<A> {
    /// An array holding `items`.
    pub fn new(items: impl IntoIterator<Item = A>) -> Self {
        Self {
            refs: items.into_iter().map(TRef::new).collect(),
        }
    }

    /// Create an array as part of a transaction.
    pub fn make(items: Vec<A>) -> Stm<TArray<A>> {
        Stm::from_fn(move |_| TxResult::Done(TArray::new(items.clone())))
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether the array has no slots.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Read slot `index`. Dies if out of range.
    pub fn get(&self, index: usize) -> Stm<A> {
        match self.refs.get(index) {
            Some(r) => r.get(),
            None => Stm::die(out_of_bounds(index, self.refs.len())),
        }
    }

    /// Write slot `index`. Dies if out of range.
    pub fn set(&self, index: usize, value: A) -> Stm<()> {
        match self.refs.get(index) {
            Some(r) => r.set(value),
            None => Stm::die(out_of_bounds(index, self.refs.len())),
        }
    }

    /// Apply `f` to slot `index`. Dies if out of range.
    pub fn update(&self, index: usize, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<()> {
        match self.refs.get(index) {
            Some(r) => r.update(f),
            None => Stm::die(out_of_bounds(index, self.refs.len())),
        }
    }

    /// Snapshot of every slot.
    pub fn to_vec(&self) -> Stm<Vec<A>> {
        let refs = self.refs.clone();
        Stm::from_fn(move |journal| TxResult::Done(refs.iter().map(|r| r.read(journal)).collect()))
    }

    /// Fold over the slots in order.
    pub fn fold<B: Value>(&self, init: B, f: impl Fn(B, A) -> B + Send + Sync + 'static) -> Stm<B> {
        let refs = self.refs.clone();
        Stm::from_fn(move |journal| {
            let mut acc = init.clone();
            for r in refs.iter() {
                acc = f(acc, r.read(journal));
            }
            TxResult::Done(acc)
        })
    }

    /// First element matching `predicate`. Only the slots up to the match
    /// join the transaction's read set.
    pub fn find(&self, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Stm<Option<A>> {
        let refs = self.refs.clone();
        Stm::from_fn(move |journal| {
            for r in refs.iter() {
                let value = r.read(journal);
                if predicate(&value) {
                    return TxResult::Done(Some(value));
                }
            }
            TxResult::Done(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked())
    }

    #[test]
    fn test_tarray_operations() {
        let rt = runtime();
        let array = TArray::new(vec![1, 2, 3]);
        let tx = array
            .update(0, |n| n * 10)
            .zip_right(array.set(2, 7))
            .zip_right(array.fold(0, |acc, n| acc + n))
            .zip(array.find(|n| *n > 5))
            .zip(array.to_vec());
        assert_eq!(
            rt.run_blocking(tx.commit()).value(),
            Some(&((19, Some(10)), vec![10, 2, 7]))
        );
    }

    #[test]
    fn test_out_of_range_dies() {
        let rt = runtime();
        let array = TArray::new(vec![1]);
        let exit = rt.run_blocking(array.get(3).commit());
        let cause = exit.cause().cloned().unwrap_or_default();
        assert!(cause.is_die());
        assert!(cause.defects()[0].message().contains("index 3"));
        assert_eq!(array.len(), 1);
    }
}
