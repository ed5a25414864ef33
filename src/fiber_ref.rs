//! Fiber-Local References
//!
//! A [`FiberRef`] is a variable whose value is local to each fiber, with
//! explicit rules for how values flow across `fork` and `join`.
//!
//! # Propagation
//!
//! - **fork**: the child starts with `fork(parent_value)` (identity by
//!   default).
//! - **join**: when a parent joins a child that *changed* the ref, the
//!   parent's value becomes `join(parent_value, child_value)` (the child's
//!   value by default). Refs the child never set are left alone, so joining a
//!   passive child cannot clobber updates the parent made meanwhile.
//!
//! Joins apply one child at a time. Siblings joined in either order give the
//! same result whenever the ref's join function is associative and
//! commutative (for example a sum); other join functions see the children in
//! join order.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein::{Effect, FiberRef};
//!
//! let counter = FiberRef::with_policies(0u64, |_| 0, |parent, child| parent + child);
//! let child = counter.update(|n| n + 1);
//! let both = child.clone().fork().zip(child.fork())
//!     .flat_map(|(a, b)| a.join().zip_right(b.join()))
//!     .zip_right(counter.get());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::op;
use crate::effect::Effect;
use crate::value::{AnyValue, Value};

type ForkFn = Arc<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFn = Arc<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

/// Identity and policies of one fiber ref.
pub(crate) struct FiberRefKey {
    id: u64,
    initial: AnyValue,
    fork: ForkFn,
    join: JoinFn,
}

impl FiberRefKey {
    fn next_id() -> u64 {
        static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
        NEXT_REF_ID.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct RefEntry {
    key: Arc<FiberRefKey>,
    value: AnyValue,
    /// Set since this fiber was forked.
    modified: bool,
}

/// A fiber's fiber-ref values.
///
/// Copy-on-write: a fork builds a fresh map for the child and never touches
/// the parent's.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    map: Arc<HashMap<u64, RefEntry>>,
}

/// Saved state of one ref, for `locally`.
#[derive(Clone)]
pub(crate) struct SavedRef(Option<RefEntry>);

impl FiberRefs {
    pub(crate) fn get(&self, key: &Arc<FiberRefKey>) -> AnyValue {
        match self.map.get(&key.id) {
            Some(entry) => entry.value.clone(),
            None => key.initial.clone(),
        }
    }

    pub(crate) fn set(&mut self, key: &Arc<FiberRefKey>, value: AnyValue) {
        Arc::make_mut(&mut self.map).insert(
            key.id,
            RefEntry {
                key: key.clone(),
                value,
                modified: true,
            },
        );
    }

    pub(crate) fn reset(&mut self, key: &Arc<FiberRefKey>) {
        if self.map.contains_key(&key.id) {
            Arc::make_mut(&mut self.map).remove(&key.id);
        }
    }

    pub(crate) fn save(&self, key: &Arc<FiberRefKey>) -> SavedRef {
        SavedRef(self.map.get(&key.id).cloned())
    }

    pub(crate) fn restore(&mut self, key: &Arc<FiberRefKey>, saved: SavedRef) {
        let map = Arc::make_mut(&mut self.map);
        match saved.0 {
            Some(entry) => {
                map.insert(key.id, entry);
            }
            None => {
                map.remove(&key.id);
            }
        }
    }

    /// Values for a child fiber.
    pub(crate) fn fork(&self) -> FiberRefs {
        let map = self
            .map
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    RefEntry {
                        key: entry.key.clone(),
                        value: (entry.key.fork)(&entry.value),
                        modified: false,
                    },
                )
            })
            .collect();
        FiberRefs { map: Arc::new(map) }
    }

    /// Merge a finished child's values into these.
    pub(crate) fn join(&mut self, child: &FiberRefs) {
        if Arc::ptr_eq(&self.map, &child.map) {
            return;
        }
        for entry in child.map.values().filter(|e| e.modified) {
            let parent = self.get(&entry.key);
            let joined = (entry.key.join)(&parent, &entry.value);
            self.set(&entry.key, joined);
        }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRefs")
            .field("len", &self.map.len())
            .finish()
    }
}

/// A fiber-local variable with fork and join policies.
pub struct FiberRef<A> {
    key: Arc<FiberRefKey>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef").field("id", &self.key.id).finish()
    }
}

impl<A: Value> FiberRef<A> {
    /// A ref that copies the parent's value into children and takes the
    /// child's value on join.
    pub fn new(initial: A) -> Self {
        Self::with_policies(initial, A::clone, |_, child: &A| child.clone())
    }

    /// A ref with explicit fork and join policies.
    pub fn with_policies(
        initial: A,
        fork: impl Fn(&A) -> A + Send + Sync + 'static,
        join: impl Fn(&A, &A) -> A + Send + Sync + 'static,
    ) -> Self {
        let fork: ForkFn = Arc::new(move |v: &AnyValue| AnyValue::new(fork(expect_ref::<A>(v))));
        let join: JoinFn = Arc::new(move |parent: &AnyValue, child: &AnyValue| {
            AnyValue::new(join(expect_ref::<A>(parent), expect_ref::<A>(child)))
        });
        Self {
            key: Arc::new(FiberRefKey {
                id: FiberRefKey::next_id(),
                initial: AnyValue::new(initial),
                fork,
                join,
            }),
            _marker: PhantomData,
        }
    }

    /// Effect that creates a ref with default policies.
    pub fn make(initial: A) -> Effect<FiberRef<A>> {
        Effect::sync(move || FiberRef::new(initial.clone()))
    }

    /// The value fibers see before anyone sets the ref.
    pub fn initial(&self) -> A {
        expect_ref::<A>(&self.key.initial).clone()
    }

    /// Value of this ref in a fiber's ref map.
    pub(crate) fn current(&self, refs: &FiberRefs) -> A {
        refs.get(&self.key).downcast()
    }

    /// Read the running fiber's value.
    pub fn get(&self) -> Effect<A> {
        let key = self.key.clone();
        Effect::from_node(op::with_fiber(move |fiber| op::succeed(fiber.refs.get(&key))))
    }

    /// Set the running fiber's value.
    pub fn set(&self, value: A) -> Effect<()> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Update the running fiber's value.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<()> {
        self.modify(move |a| ((), f(a)))
    }

    /// Update and return the new value.
    pub fn update_and_get(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<A> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Update and return the old value.
    pub fn get_and_update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Effect<A> {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Replace the value and return the old one.
    pub fn get_and_set(&self, value: A) -> Effect<A> {
        self.modify(move |a| (a, value.clone()))
    }

    /// Compute a result and a new value from the current one.
    pub fn modify<B: Value>(&self, f: impl Fn(A) -> (B, A) + Send + Sync + 'static) -> Effect<B> {
        let key = self.key.clone();
        Effect::from_node(op::with_fiber(move |fiber| {
            let current = fiber.refs.get(&key).downcast::<A>();
            let (out, next) = f(current);
            fiber.refs.set(&key, AnyValue::new(next));
            op::succeed(AnyValue::new(out))
        }))
    }

    /// Forget the running fiber's value, going back to the initial one.
    pub fn reset(&self) -> Effect<()> {
        let key = self.key.clone();
        Effect::from_node(op::with_fiber(move |fiber| {
            fiber.refs.reset(&key);
            op::unit()
        }))
    }

    /// Run `effect` with the ref set to `value`, restoring the previous
    /// state afterwards however `effect` ends.
    pub fn locally<B: Value, E: Value>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        let key = self.key.clone();
        let restore_key = self.key.clone();
        Effect::acquire_use_release(
            Effect::from_node(op::with_fiber(move |fiber| {
                let saved = fiber.refs.save(&key);
                fiber.refs.set(&key, AnyValue::new(value.clone()));
                op::succeed(AnyValue::new(saved))
            })),
            move |_| effect.clone(),
            move |saved: SavedRef| {
                let key = restore_key.clone();
                Effect::from_node(op::with_fiber(move |fiber| {
                    fiber.refs.restore(&key, saved.clone());
                    op::unit()
                }))
            },
        )
    }

    /// Run `effect` with the ref updated by `f`, restoring it afterwards.
    pub fn locally_with<B: Value, E: Value>(
        &self,
        f: impl Fn(A) -> A + Send + Sync + 'static,
        effect: Effect<B, E>,
    ) -> Effect<B, E> {
        let me = self.clone();
        let f = Arc::new(f);
        self.get()
            .widen::<E>()
            .flat_map(move |a| me.locally(f(a), effect.clone()))
    }
}

fn expect_ref<A: 'static>(value: &AnyValue) -> &A {
    match value.downcast_ref::<A>() {
        Some(a) => a,
        None => panic!(
            "fiber ref holds {}, expected {}",
            value.type_name(),
            std::any::type_name::<A>()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_ref() -> FiberRef<i64> {
        FiberRef::with_policies(0i64, |_| 0, |parent, child| parent + child)
    }

    #[test]
    fn test_fork_applies_policy_and_clears_modified() {
        let r = sum_ref();
        let mut parent = FiberRefs::default();
        parent.set(&r.key, AnyValue::new(10i64));

        let child = parent.fork();
        assert_eq!(child.get(&r.key).downcast::<i64>(), 0);
        assert_eq!(parent.get(&r.key).downcast::<i64>(), 10);
    }

    #[test]
    fn test_join_skips_untouched_refs() {
        let r = FiberRef::new(1i32);
        let mut parent = FiberRefs::default();
        parent.set(&r.key, AnyValue::new(1i32));
        let child = parent.fork();
        parent.set(&r.key, AnyValue::new(2i32));

        parent.join(&child);
        assert_eq!(parent.get(&r.key).downcast::<i32>(), 2);
    }

    #[test]
    fn test_sum_join_is_order_independent() {
        let r = sum_ref();
        let mut parent = FiberRefs::default();
        parent.set(&r.key, AnyValue::new(5i64));

        let mut a = parent.fork();
        let mut b = parent.fork();
        a.set(&r.key, AnyValue::new(3i64));
        b.set(&r.key, AnyValue::new(3i64));

        let mut ab = parent.clone();
        ab.join(&a);
        ab.join(&b);
        let mut ba = parent.clone();
        ba.join(&b);
        ba.join(&a);

        assert_eq!(ab.get(&r.key).downcast::<i64>(), 11);
        assert_eq!(ba.get(&r.key).downcast::<i64>(), 11);
    }

    #[test]
    fn test_nested_join_propagates_grandchild() {
        let r = sum_ref();
        let mut root = FiberRefs::default();
        let mut child = root.fork();
        let mut grandchild = child.fork();
        grandchild.set(&r.key, AnyValue::new(7i64));

        child.join(&grandchild);
        root.join(&child);
        assert_eq!(root.get(&r.key).downcast::<i64>(), 7);
    }

    #[test]
    fn test_save_and_restore() {
        let r = FiberRef::new("a".to_string());
        let mut refs = FiberRefs::default();
        let saved = refs.save(&r.key);
        refs.set(&r.key, AnyValue::new("b".to_string()));
        refs.restore(&r.key, saved);
        assert_eq!(refs.get(&r.key).downcast::<String>(), "a");
    }
}
