//! # Shared References
//!
//! [`Ref`] is an atomically updated cell shared between fibers. Every
//! operation is a single critical section, so updates never interleave.
//!
//! [`SynchronizedRef`] additionally supports effectful updates. Those may
//! suspend, so instead of holding a lock across them, writers queue on a
//! one-permit [`Semaphore`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::effect::Effect;
use crate::semaphore::Semaphore;
use crate::value::Value;

/// A mutable cell shared between fibers.
pub struct Ref<A> {
    value: Arc<RwLock<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<A: Value> Ref<A> {
    /// A ref holding `initial`.
    pub fn new(initial: A) -> Self {
        Self {
            value: Arc::new(RwLock::new(initial)),
        }
    }

    /// Effect creating a ref.
    pub fn make(initial: A) -> Effect<Ref<A>> {
        Effect::sync(move || Ref::new(initial.clone()))
    }

    /// Read the value.
    pub fn get(&self) -> Effect<A> {
        let value = self.value.clone();
        Effect::sync(move || value.read().clone())
    }

    /// Replace the value.
    pub fn set(&self, new: A) -> Effect<()> {
        let value = self.value.clone();
        Effect::sync(move || *value.write() = new.clone())
    }

    /// Apply `f` to the value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<()> {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` and return the new value.
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<A> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Apply `f` and return the old value.
    pub fn get_and_update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<A> {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Replace the value and return the old one.
    pub fn get_and_set(&self, new: A) -> Effect<A> {
        self.modify(move |a| (a, new.clone()))
    }

    /// Compute a result and a new value from the current one, atomically.
    pub fn modify<B: Value>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Effect<B> {
        let value = self.value.clone();
        Effect::sync(move || {
            let mut guard = value.write();
            let (out, next) = f(guard.clone());
            *guard = next;
            out
        })
    }

    fn snapshot(&self) -> A {
        self.value.read().clone()
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.value.read()).finish()
    }
}

/// A [`Ref`] whose updates may run effects.
pub struct SynchronizedRef<A> {
    cell: Ref<A>,
    writer: Semaphore,
}

impl<A> Clone for SynchronizedRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<A: Value> SynchronizedRef<A> {
    /// A ref holding `initial`.
    pub fn new(initial: A) -> Self {
        Self {
            cell: Ref::new(initial),
            writer: Semaphore::new(1),
        }
    }

    /// Effect creating a ref.
    pub fn make(initial: A) -> Effect<SynchronizedRef<A>> {
        Effect::sync(move || SynchronizedRef::new(initial.clone()))
    }

    /// Read the value. Does not wait for a running update.
    pub fn get(&self) -> Effect<A> {
        self.cell.get()
    }

    /// Replace the value once no update is running.
    pub fn set(&self, new: A) -> Effect<()> {
        self.writer.with_permit(self.cell.set(new))
    }

    /// Apply `f` once no update is running.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<()> {
        self.writer.with_permit(self.cell.update(f))
    }

    /// Compute a result and a new value once no update is running.
    pub fn modify<B: Value>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Effect<B> {
        self.writer.with_permit(self.cell.modify(f))
    }

    /// Replace the value with the result of an effect.
    ///
    /// If `f`'s effect fails the value is left unchanged.
    pub fn update_effect<E: Value>(
        &self,
        f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<(), E> {
        self.modify_effect(move |a| f(a).map(|next| ((), next)))
    }

    /// Like [`update_effect`](Self::update_effect), returning the new value.
    pub fn update_and_get_effect<E: Value>(
        &self,
        f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        self.modify_effect(move |a| f(a).map(|next| (next.clone(), next)))
    }

    /// Compute a result and a new value with an effect. Updates run one at a
    /// time, in the order they asked.
    pub fn modify_effect<B: Value, E: Value>(
        &self,
        f: impl Fn(A) -> Effect<(B, A), E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let cell = self.cell.clone();
        let step = Effect::suspend(move || {
            let cell = cell.clone();
            f(cell.snapshot()).flat_map(move |(out, next)| cell.set(next).widen().as_value(out))
        });
        self.writer.with_permit(step)
    }
}

impl<A: fmt::Debug> fmt::Debug for SynchronizedRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SynchronizedRef").field(&*self.cell.value.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::convert::Infallible;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
    }

    #[test]
    fn test_ref_operations() {
        let rt = runtime();
        let r = Ref::new(10);
        let program = r
            .get_and_set(20)
            .zip(r.update_and_get(|n| n + 1))
            .zip(r.modify(|n| (n * 2, n - 1)))
            .zip(r.get());
        assert_eq!(rt.run_blocking(program).value(), Some(&(((10, 21), 42), 20)));
    }

    #[test]
    fn test_ref_concurrent_updates() {
        let rt = runtime();
        let r = Ref::new(0u64);
        let bump = r.update(|n| n + 1).repeat_n(99);
        let program = Effect::foreach_par(0..10, move |_| bump.clone()).zip_right(r.get());
        assert_eq!(rt.run_blocking(program).value(), Some(&1000));
    }

    #[test]
    fn test_synchronized_ref_serialises_effectful_updates() {
        let rt = runtime();
        let r = SynchronizedRef::new(0u64);
        let bump = r.update_effect(|n| {
            Effect::<(), Infallible>::yield_now()
                .zip_right(Effect::sleep(Duration::from_millis(1)))
                .as_value(n + 1)
        });
        let program = Effect::foreach_par(0..20, move |_| bump.clone()).zip_right(r.get());
        assert_eq!(rt.run_blocking(program).value(), Some(&20));
    }

    #[test]
    fn test_failed_update_leaves_value() {
        let rt = runtime();
        let r = SynchronizedRef::new(5);
        let program = r
            .update_effect(|_| Effect::<i32, &str>::fail("no"))
            .either()
            .zip(r.get());
        let exit = rt.run_blocking(program);
        assert_eq!(exit.value(), Some(&(Err("no"), 5)));
    }
}
