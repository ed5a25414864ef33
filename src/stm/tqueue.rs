//! Transactional queue.
//!
//! The elements live in one `TRef` holding a persistent two-stack queue.
//! Cloning it shares structure, so copying the queue into a journal is
//! constant time whatever its length.

use std::fmt;
use std::sync::Arc;

use crate::queue::Strategy;
use crate::value::Value;

use super::tref::TRef;
use super::{Stm, TxResult};

struct Link<A> {
    value: A,
    next: Stack<A>,
}

/// Immutable singly linked stack.
struct Stack<A>(Option<Arc<Link<A>>>);

impl<A> Clone for Stack<A> {
    fn clone(&self) -> Self {
        Stack(self.0.clone())
    }
}

impl<A> Drop for Stack<A> {
    fn drop(&mut self) {
        let mut next = self.0.take();
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(mut link) => next = link.next.0.take(),
                Err(_) => break,
            }
        }
    }
}

impl<A: Clone> Stack<A> {
    fn empty() -> Self {
        Stack(None)
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    fn push(&self, value: A) -> Self {
        Stack(Some(Arc::new(Link {
            value,
            next: self.clone(),
        })))
    }

    fn pop(&self) -> Option<(A, Stack<A>)> {
        self.0
            .as_ref()
            .map(|link| (link.value.clone(), link.next.clone()))
    }
}

/// FIFO built from a front stack and a reversed back stack.
struct Items<A> {
    front: Stack<A>,
    back: Stack<A>,
    len: usize,
}

impl<A> Clone for Items<A> {
    fn clone(&self) -> Self {
        Self {
            front: self.front.clone(),
            back: self.back.clone(),
            len: self.len,
        }
    }
}

impl<A: Clone> Items<A> {
    fn new() -> Self {
        Self {
            front: Stack::empty(),
            back: Stack::empty(),
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push_back(&mut self, value: A) {
        self.back = self.back.push(value);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<A> {
        if self.front.is_empty() {
            let mut reversed = Stack::empty();
            let mut rest = std::mem::replace(&mut self.back, Stack::empty());
            while let Some((value, next)) = rest.pop() {
                reversed = reversed.push(value);
                rest = next;
            }
            self.front = reversed;
        }
        let (value, next) = self.front.pop()?;
        self.front = next;
        self.len -= 1;
        Some(value)
    }
}

/// A FIFO queue usable inside transactions. A full back-pressured queue
/// and an empty queue block by retrying the transaction.
pub struct TQueue<A> {
    items: TRef<Items<A>>,
    capacity: Option<usize>,
    strategy: Strategy,
}

impl<A> Clone for TQueue<A> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            capacity: self.capacity,
            strategy: self.strategy,
        }
    }
}

impl<A> fmt::Debug for TQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TQueue")
            .field("capacity", &self.capacity)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<A: Value> TQueue<A> {
    fn make(capacity: Option<usize>, strategy: Strategy) -> Stm<TQueue<A>> {
        let capacity = capacity.map(|cap| cap.max(1));
        Stm::from_fn(move |_| {
            TxResult::Done(TQueue {
                items: TRef::new(Items::new()),
                capacity,
                strategy,
            })
        })
    }

    /// A queue whose offers retry while it is full.
    pub fn bounded(capacity: usize) -> Stm<TQueue<A>> {
        Self::make(Some(capacity), Strategy::BackPressure)
    }

    /// A queue that rejects offers while it is full.
    pub fn dropping(capacity: usize) -> Stm<TQueue<A>> {
        Self::make(Some(capacity), Strategy::Dropping)
    }

    /// A queue that evicts its oldest element to make room.
    pub fn sliding(capacity: usize) -> Stm<TQueue<A>> {
        Self::make(Some(capacity), Strategy::Sliding)
    }

    /// A queue without a size limit.
    pub fn unbounded() -> Stm<TQueue<A>> {
        Self::make(None, Strategy::BackPressure)
    }

    /// Maximum number of elements, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Add `value`. False if a dropping queue rejected it.
    pub fn offer(&self, value: A) -> Stm<bool> {
        let this = self.clone();
        Stm::from_fn(move |journal| {
            let mut items = this.items.read(journal);
            if this.capacity.is_some_and(|cap| items.len() >= cap) {
                match this.strategy {
                    Strategy::BackPressure => return TxResult::Retry,
                    Strategy::Dropping => return TxResult::Done(false),
                    Strategy::Sliding => {
                        items.pop_front();
                    }
                }
            }
            items.push_back(value.clone());
            this.items.write(journal, items);
            TxResult::Done(true)
        })
    }

    /// Offer every element in order. True if all of them were accepted.
    pub fn offer_all(&self, values: impl IntoIterator<Item = A>) -> Stm<bool> {
        let this = self.clone();
        Stm::foreach(values, move |value| this.offer(value))
            .map(|accepted| accepted.into_iter().all(|ok| ok))
    }

    /// Take the oldest element, retrying while the queue is empty.
    pub fn take(&self) -> Stm<A> {
        let items = self.items.clone();
        Stm::from_fn(move |journal| {
            let mut queue = items.read(journal);
            match queue.pop_front() {
                Some(value) => {
                    items.write(journal, queue);
                    TxResult::Done(value)
                }
                None => TxResult::Retry,
            }
        })
    }

    /// Take the oldest element if there is one.
    pub fn poll(&self) -> Stm<Option<A>> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    /// Take every element.
    pub fn take_all(&self) -> Stm<Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `max` elements without waiting.
    pub fn take_up_to(&self, max: usize) -> Stm<Vec<A>> {
        let items = self.items.clone();
        Stm::from_fn(move |journal| {
            let mut queue = items.read(journal);
            let count = max.min(queue.len());
            let taken: Vec<A> = (0..count).filter_map(|_| queue.pop_front()).collect();
            if !taken.is_empty() {
                items.write(journal, queue);
            }
            TxResult::Done(taken)
        })
    }

    /// Number of elements.
    pub fn size(&self) -> Stm<usize> {
        self.items.get().map(|items| items.len())
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> Stm<bool> {
        self.items.get().map(|items| items.is_empty())
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> Stm<bool> {
        let capacity = self.capacity;
        self.items
            .get()
            .map(move |items| capacity.is_some_and(|cap| items.len() >= cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::effect::Effect;
    use crate::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked())
    }

    #[test]
    fn test_items_keep_fifo_order_across_clones() {
        let mut items = Items::new();
        for n in 0..3 {
            items.push_back(n);
        }
        let snapshot = items.clone();
        assert_eq!(items.pop_front(), Some(0));
        items.push_back(3);
        let drained: Vec<i32> = std::iter::from_fn(|| items.pop_front()).collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(items.len(), 0);

        let mut snapshot = snapshot;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.pop_front(), Some(0));
    }

    #[test]
    fn test_long_queue_drops_without_recursion() {
        let mut items = Items::new();
        for n in 0..200_000u32 {
            items.push_back(n);
        }
        assert_eq!(items.pop_front(), Some(0));
        drop(items);
    }

    #[test]
    fn test_sliding_and_dropping() {
        let rt = runtime();
        let tx = TQueue::sliding(2).flat_map(|q| q.offer_all(vec![1, 2, 3]).zip(q.take_all()));
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&(true, vec![2, 3])));

        let tx = TQueue::dropping(2).flat_map(|q| q.offer_all(vec![1, 2, 3]).zip(q.take_all()));
        assert_eq!(rt.run_blocking(tx.commit()).value(), Some(&(false, vec![1, 2])));
    }

    #[test]
    fn test_take_waits_for_offer() {
        let rt = runtime();
        let program = TQueue::<u32>::unbounded().commit().flat_map(|q| {
            let taker = q.take().commit();
            let offer = q.offer(7).commit();
            taker
                .fork()
                .flat_map(move |fiber| Effect::yield_now().zip_right(offer.clone()).zip_right(fiber.join()))
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&7));
    }

    #[test]
    fn test_bounded_offer_waits_for_room() {
        let rt = runtime();
        let program = TQueue::<u32>::bounded(1).commit().flat_map(|q| {
            let blocked = q.offer(2).commit();
            let take = q.take().commit();
            q.offer(1).commit().zip_right(blocked.fork()).flat_map(move |fiber| {
                Effect::yield_now()
                    .zip_right(take.clone())
                    .zip_left(fiber.join())
                    .zip(take.clone())
            })
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&(1, 2)));
    }

    #[test]
    fn test_poll_and_size() {
        let rt = runtime();
        let tx = TQueue::bounded(3).flat_map(|q| {
            q.poll()
                .zip(q.offer(5))
                .zip(q.is_full())
                .zip(q.size())
                .zip(q.poll())
                .zip(q.is_empty())
        });
        assert_eq!(
            rt.run_blocking(tx.commit()).value(),
            Some(&(((((None, true), false), 1), Some(5)), true))
        );
    }
}
