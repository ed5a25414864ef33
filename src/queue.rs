//! # Queue
//!
//! An asynchronous FIFO queue for fibers.
//!
//! What happens when an offer finds the queue full depends on its
//! [`Strategy`]:
//!
//! - `BackPressure`: the offering fiber suspends until space frees up.
//!   Suspended offerers are admitted in arrival order.
//! - `Dropping`: the offer returns `false` and the queue is unchanged.
//! - `Sliding`: the oldest element is evicted and the offer returns `true`.
//!
//! `take` suspends while the queue is empty; waiting takers are served in
//! arrival order. `take_all`, `take_up_to` and `poll` never suspend.
//!
//! After [`Queue::shutdown`] every waiting fiber is interrupted, and so is
//! any fiber that offers or takes afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::continuation::Callback;
use crate::effect::Effect;
use crate::fiber::FiberId;
use crate::value::Value;

/// What an offer does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Suspend the offerer until there is room.
    BackPressure,
    /// Reject the new element.
    Dropping,
    /// Evict the oldest element.
    Sliding,
}

struct State<A> {
    buffer: VecDeque<A>,
    capacity: Option<usize>,
    strategy: Strategy,
    next_key: u64,
    takers: VecDeque<(u64, Callback<A>)>,
    offerers: VecDeque<(u64, A, Callback<bool>)>,
    shutdown: bool,
}

impl<A: Value> State<A> {
    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.buffer.len() >= cap)
    }

    fn key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Hand `value` to the first taker still waiting for it.
    fn hand_off(&mut self, mut value: A) -> Result<(), A> {
        while let Some((_, taker)) = self.takers.pop_front() {
            match taker.try_succeed(value) {
                Ok(()) => return Ok(()),
                Err(back) => value = back,
            }
        }
        Err(value)
    }

    /// Move suspended offerers into freed buffer space.
    fn admit_offerers(&mut self) {
        while !self.is_full() {
            let Some((_, value, offerer)) = self.offerers.pop_front() else {
                break;
            };
            if offerer.try_succeed(true).is_ok() {
                self.buffer.push_back(value);
            }
        }
    }

    fn take_up_to(&mut self, max: usize) -> Vec<A> {
        let n = max.min(self.buffer.len());
        let taken = self.buffer.drain(..n).collect();
        self.admit_offerers();
        taken
    }
}

/// An asynchronous queue shared between fibers.
pub struct Queue<A> {
    state: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Value> Queue<A> {
    fn with_strategy(capacity: Option<usize>, strategy: Strategy) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buffer: VecDeque::new(),
                capacity: capacity.map(|cap| cap.max(1)),
                strategy,
                next_key: 0,
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
                shutdown: false,
            })),
        }
    }

    /// A queue whose offers suspend while it holds `capacity` elements.
    pub fn bounded(capacity: usize) -> Effect<Queue<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::BackPressure))
    }

    /// A queue that rejects offers while full.
    pub fn dropping(capacity: usize) -> Effect<Queue<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::Dropping))
    }

    /// A queue that evicts its oldest element to make room.
    pub fn sliding(capacity: usize) -> Effect<Queue<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::Sliding))
    }

    /// A queue without a capacity.
    pub fn unbounded() -> Effect<Queue<A>> {
        Effect::sync(|| Self::with_strategy(None, Strategy::BackPressure))
    }

    /// Capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.state.lock().capacity
    }

    /// The overflow strategy.
    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy
    }

    /// Offer one element. `false` only if a dropping queue was full.
    pub fn offer(&self, value: A) -> Effect<bool> {
        let state = self.state.clone();
        Effect::async_interrupt(move |cb| {
            let mut guard = state.lock();
            if guard.shutdown {
                drop(guard);
                cb.fail_cause(Cause::interrupt(cb.fiber_id()));
                return None;
            }
            let value = match guard.hand_off(value.clone()) {
                Ok(()) => {
                    drop(guard);
                    cb.succeed(true);
                    return None;
                }
                Err(value) => value,
            };
            let strategy = guard.strategy;
            let accepted = if !guard.is_full() {
                guard.buffer.push_back(value);
                true
            } else {
                match strategy {
                    Strategy::Dropping => false,
                    Strategy::Sliding => {
                        guard.buffer.pop_front();
                        guard.buffer.push_back(value);
                        true
                    }
                    Strategy::BackPressure => {
                        let key = guard.key();
                        guard.offerers.push_back((key, value, cb.clone()));
                        drop(guard);
                        let state = state.clone();
                        return Some(Effect::sync(move || {
                            state.lock().offerers.retain(|(k, _, _)| *k != key);
                        }));
                    }
                }
            };
            drop(guard);
            cb.succeed(accepted);
            None
        })
    }

    /// Offer every element in order. True if all of them were accepted.
    pub fn offer_all(&self, values: impl IntoIterator<Item = A>) -> Effect<bool> {
        let me = self.clone();
        Effect::foreach(values, move |value| me.offer(value))
            .map(|accepted| accepted.into_iter().all(|ok| ok))
    }

    /// Take the oldest element, suspending while the queue is empty.
    pub fn take(&self) -> Effect<A> {
        let state = self.state.clone();
        Effect::async_interrupt(move |cb| {
            let mut guard = state.lock();
            if let Some(value) = guard.buffer.pop_front() {
                guard.admit_offerers();
                drop(guard);
                cb.succeed(value);
                return None;
            }
            if guard.shutdown {
                drop(guard);
                cb.fail_cause(Cause::interrupt(cb.fiber_id()));
                return None;
            }
            let key = guard.key();
            guard.takers.push_back((key, cb.clone()));
            drop(guard);
            let state = state.clone();
            Some(Effect::sync(move || {
                state.lock().takers.retain(|(k, _)| *k != key);
            }))
        })
    }

    /// Take the oldest element if there is one.
    pub fn poll(&self) -> Effect<Option<A>> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    /// Take everything currently buffered.
    pub fn take_all(&self) -> Effect<Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `max` buffered elements.
    pub fn take_up_to(&self, max: usize) -> Effect<Vec<A>> {
        let state = self.state.clone();
        Effect::suspend(move || {
            let mut guard = state.lock();
            if guard.shutdown {
                return Effect::interrupt();
            }
            Effect::succeed(guard.take_up_to(max))
        })
    }

    /// Take at least `min` and at most `max` elements, suspending until
    /// `min` are available.
    pub fn take_between(&self, min: usize, max: usize) -> Effect<Vec<A>> {
        take_between(self.clone(), Vec::new(), min, max.max(min))
    }

    /// Number of buffered elements.
    pub fn size(&self) -> Effect<usize> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().buffer.len())
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> Effect<bool> {
        self.size().map(|n| n == 0)
    }

    /// Whether the buffer is at capacity.
    pub fn is_full(&self) -> Effect<bool> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().is_full())
    }

    /// Shut the queue down, interrupting every waiting fiber.
    pub fn shutdown(&self) -> Effect<()> {
        let state = self.state.clone();
        Effect::fiber_id().flat_map(move |by: FiberId| {
            let (takers, offerers) = {
                let mut guard = state.lock();
                if guard.shutdown {
                    return Effect::unit();
                }
                guard.shutdown = true;
                guard.buffer.clear();
                (
                    std::mem::take(&mut guard.takers),
                    std::mem::take(&mut guard.offerers),
                )
            };
            tracing::debug!(
                takers = takers.len(),
                offerers = offerers.len(),
                "queue shut down"
            );
            for (_, taker) in takers {
                taker.fail_cause(Cause::interrupt(by));
            }
            for (_, _, offerer) in offerers {
                offerer.fail_cause(Cause::interrupt(by));
            }
            Effect::unit()
        })
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> Effect<bool> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().shutdown)
    }
}

fn take_between<A: Value>(queue: Queue<A>, acc: Vec<A>, min: usize, max: usize) -> Effect<Vec<A>> {
    let next = queue.clone();
    queue.take_up_to(max - acc.len()).flat_map(move |batch| {
        let mut acc = acc.clone();
        acc.extend(batch);
        if acc.len() >= min {
            return Effect::succeed(acc);
        }
        let rest = next.clone();
        next.take().flat_map(move |value| {
            let mut acc = acc.clone();
            acc.push(value);
            take_between(rest.clone(), acc, min, max)
        })
    })
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("size", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("strategy", &state.strategy)
            .field("takers", &state.takers.len())
            .field("offerers", &state.offerers.len())
            .field("shutdown", &state.shutdown)
            .finish()
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
    fn test_sliding_keeps_newest() {
        let rt = runtime();
        let program = Queue::<i32>::sliding(2).flat_map(|q| {
            q.offer_all([1, 2, 3]).zip(q.take_all())
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&(true, vec![2, 3])));
    }

    #[test]
    fn test_dropping_rejects_when_full() {
        let rt = runtime();
        let program = Queue::<i32>::dropping(2).flat_map(|q| {
            q.offer(1)
                .zip(q.offer(2))
                .zip(q.offer(3))
                .zip(q.take_all())
        });
        assert_eq!(
            rt.run_blocking(program).value(),
            Some(&(((true, true), false), vec![1, 2]))
        );
    }

    #[test]
    fn test_back_pressure_resumes_offerer() {
        let rt = runtime();
        let program = Queue::<i32>::bounded(1).flat_map(|q| {
            let producer = q.offer_all([1, 2, 3]);
            let consumer = q.take().zip(q.take()).zip(q.take());
            producer.fork().zip_right(consumer)
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&((1, 2), 3)));
    }

    #[test]
    fn test_take_suspends_until_offer() {
        let rt = runtime();
        let program = Queue::<&str>::unbounded().flat_map(|q| {
            q.take()
                .fork()
                .flat_map({
                    let q = q.clone();
                    move |taker| {
                        Effect::yield_now()
                            .zip_right(q.offer("hello"))
                            .zip_right(taker.join())
                    }
                })
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&"hello"));
    }

    #[test]
    fn test_take_between() {
        let rt = runtime();
        let program = Queue::<u8>::unbounded().flat_map(|q| {
            let later = Effect::yield_now().zip_right(q.offer_all([3, 4, 5]));
            q.offer_all([1, 2])
                .zip_right(later.fork())
                .zip_right(q.take_between(4, 10))
        });
        let taken = rt.run_blocking(program).value().cloned().unwrap_or_default();
        assert!(taken.len() >= 4);
        assert_eq!(&taken[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_take_up_to_never_blocks() {
        let rt = runtime();
        let program = Queue::<u8>::bounded(4)
            .flat_map(|q| q.take_up_to(3).zip(q.poll()));
        assert_eq!(rt.run_blocking(program).value(), Some(&(vec![], None)));
    }

    #[test]
    fn test_shutdown_interrupts_waiters() {
        let rt = runtime();
        let program = Queue::<u8>::bounded(1).flat_map(|q| {
            q.take().fork().flat_map({
                let q = q.clone();
                move |taker| {
                    Effect::yield_now()
                        .zip_right(q.shutdown())
                        .zip_right(taker.await_exit())
                        .zip(q.is_shutdown())
                }
            })
        });
        let exit = rt.run_blocking(program);
        let (taker_exit, closed) = exit.value().cloned().expect("program succeeds");
        assert!(taker_exit.is_interrupted());
        assert!(closed);
    }
}
