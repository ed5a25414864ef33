//! # Hub
//!
//! A broadcast queue. Every published message is appended once to a shared
//! chain of nodes and read independently by each subscriber, which advances
//! its own cursor. A node records how many subscribers still have to pass
//! it; once the count reaches zero it is released and its slot counts as
//! free space again.
//!
//! A subscriber only sees messages published after it subscribed. Publishing
//! with no subscribers succeeds and the message is dropped.
//!
//! When the hub is at capacity, `publish` follows the hub's [`Strategy`]:
//! suspend the publisher, drop the message, or release the oldest node (any
//! subscriber that had not read it skips it).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::continuation::Callback;
use crate::effect::Effect;
use crate::queue::Strategy;
use crate::value::Value;

struct Node<A> {
    value: A,
    /// Subscribers that have not read this node yet.
    remaining: usize,
}

struct Subscriber<A> {
    /// Sequence number of the next node to read.
    cursor: u64,
    takers: VecDeque<(u64, Callback<A>)>,
}

struct State<A> {
    nodes: VecDeque<Node<A>>,
    /// Sequence number of `nodes[0]`.
    head: u64,
    capacity: Option<usize>,
    strategy: Strategy,
    subscribers: HashMap<u64, Subscriber<A>>,
    publishers: VecDeque<(u64, A, Callback<bool>)>,
    next_key: u64,
}

impl<A: Value> State<A> {
    fn tail(&self) -> u64 {
        self.head + self.nodes.len() as u64
    }

    fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.nodes.len() >= cap)
    }

    fn key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Release fully read nodes from the front.
    fn collect(&mut self) {
        while self.nodes.front().is_some_and(|node| node.remaining == 0) {
            self.nodes.pop_front();
            self.head += 1;
        }
    }

    /// Drop the oldest node whether read or not.
    fn evict(&mut self) {
        if self.nodes.pop_front().is_some() {
            self.head += 1;
            let head = self.head;
            for sub in self.subscribers.values_mut() {
                sub.cursor = sub.cursor.max(head);
            }
        }
    }

    /// Read the next node for `id`, advancing its cursor.
    fn read(&mut self, id: u64) -> Option<A> {
        let sub = self.subscribers.get_mut(&id)?;
        let index = sub.cursor.checked_sub(self.head)? as usize;
        let node = self.nodes.get_mut(index)?;
        sub.cursor += 1;
        node.remaining -= 1;
        Some(node.value.clone())
    }

    /// Serve waiting takers of `id` from unread nodes.
    fn serve(&mut self, id: u64) {
        loop {
            let Some(sub) = self.subscribers.get_mut(&id) else {
                return;
            };
            if sub.cursor >= self.head + self.nodes.len() as u64 {
                return;
            }
            let Some((_, taker)) = sub.takers.pop_front() else {
                return;
            };
            let index = (sub.cursor - self.head) as usize;
            let value = self.nodes[index].value.clone();
            if taker.try_succeed(value).is_ok() {
                sub.cursor += 1;
                self.nodes[index].remaining -= 1;
            }
        }
    }

    /// Append a node for the current subscribers and serve their takers.
    fn append(&mut self, value: A) {
        let remaining = self.subscribers.len();
        if remaining == 0 {
            return;
        }
        self.nodes.push_back(Node { value, remaining });
        let ids: Vec<u64> = self.subscribers.keys().copied().collect();
        for id in ids {
            self.serve(id);
        }
        self.collect();
    }

    /// Let suspended publishers into freed space.
    fn admit_publishers(&mut self) {
        while !self.is_full() {
            let Some((_, value, publisher)) = self.publishers.pop_front() else {
                break;
            };
            if publisher.try_succeed(true).is_ok() {
                self.append(value);
            }
        }
    }

    fn unsubscribe(&mut self, id: u64) {
        let Some(sub) = self.subscribers.remove(&id) else {
            return;
        };
        let from = sub.cursor.saturating_sub(self.head) as usize;
        for node in self.nodes.iter_mut().skip(from) {
            node.remaining -= 1;
        }
        self.collect();
        self.admit_publishers();
    }

    fn take_up_to(&mut self, id: u64, max: usize) -> Vec<A> {
        let mut taken = Vec::new();
        while taken.len() < max {
            match self.read(id) {
                Some(value) => taken.push(value),
                None => break,
            }
        }
        if !taken.is_empty() {
            self.collect();
            self.admit_publishers();
        }
        taken
    }

    fn unread(&self, id: u64) -> usize {
        self.subscribers
            .get(&id)
            .map_or(0, |sub| self.tail().saturating_sub(sub.cursor) as usize)
    }
}

/// A multi-subscriber broadcast queue.
pub struct Hub<A> {
    state: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Value> Hub<A> {
    fn with_strategy(capacity: Option<usize>, strategy: Strategy) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                nodes: VecDeque::new(),
                head: 0,
                capacity: capacity.map(|cap| cap.max(1)),
                strategy,
                subscribers: HashMap::new(),
                publishers: VecDeque::new(),
                next_key: 0,
            })),
        }
    }

    /// A hub whose publishers suspend while `capacity` messages are unread.
    pub fn bounded(capacity: usize) -> Effect<Hub<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::BackPressure))
    }

    /// A hub that drops new messages while full.
    pub fn dropping(capacity: usize) -> Effect<Hub<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::Dropping))
    }

    /// A hub that releases its oldest message to make room.
    pub fn sliding(capacity: usize) -> Effect<Hub<A>> {
        Effect::sync(move || Self::with_strategy(Some(capacity), Strategy::Sliding))
    }

    /// A hub without a capacity.
    pub fn unbounded() -> Effect<Hub<A>> {
        Effect::sync(|| Self::with_strategy(None, Strategy::BackPressure))
    }

    /// Capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.state.lock().capacity
    }

    /// Publish to every current subscriber. `false` only if a dropping hub
    /// was full.
    pub fn publish(&self, value: A) -> Effect<bool> {
        let state = self.state.clone();
        Effect::async_interrupt(move |cb| {
            let mut guard = state.lock();
            let strategy = guard.strategy;
            let accepted = if guard.subscribers.is_empty() {
                true
            } else if !guard.is_full() {
                guard.append(value.clone());
                true
            } else {
                match strategy {
                    Strategy::Dropping => false,
                    Strategy::Sliding => {
                        guard.evict();
                        guard.append(value.clone());
                        true
                    }
                    Strategy::BackPressure => {
                        let key = guard.key();
                        guard.publishers.push_back((key, value.clone(), cb.clone()));
                        drop(guard);
                        let state = state.clone();
                        return Some(Effect::sync(move || {
                            state.lock().publishers.retain(|(k, _, _)| *k != key);
                        }));
                    }
                }
            };
            drop(guard);
            cb.succeed(accepted);
            None
        })
    }

    /// Publish every message in order. True if all of them were accepted.
    pub fn publish_all(&self, values: impl IntoIterator<Item = A>) -> Effect<bool> {
        let me = self.clone();
        Effect::foreach(values, move |value| me.publish(value))
            .map(|accepted| accepted.into_iter().all(|ok| ok))
    }

    /// Subscribe to messages published from now on.
    pub fn subscribe(&self) -> Effect<Subscription<A>> {
        let state = self.state.clone();
        Effect::sync(move || {
            let id = {
                let mut guard = state.lock();
                let id = guard.key();
                let cursor = guard.tail();
                guard.subscribers.insert(
                    id,
                    Subscriber {
                        cursor,
                        takers: VecDeque::new(),
                    },
                );
                id
            };
            tracing::trace!(subscriber = id, "hub subscription opened");
            Subscription {
                inner: Arc::new(SubscriptionInner {
                    id,
                    state: state.clone(),
                }),
            }
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> Effect<usize> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().subscribers.len())
    }

    /// Messages not yet read by every subscriber.
    pub fn size(&self) -> Effect<usize> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().nodes.len())
    }
}

impl<A> fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Hub")
            .field("size", &state.nodes.len())
            .field("capacity", &state.capacity)
            .field("strategy", &state.strategy)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

struct SubscriptionInner<A: Value> {
    id: u64,
    state: Arc<Mutex<State<A>>>,
}

impl<A: Value> Drop for SubscriptionInner<A> {
    fn drop(&mut self) {
        self.state.lock().unsubscribe(self.id);
        tracing::trace!(subscriber = self.id, "hub subscription closed");
    }
}

/// A subscriber's view of a [`Hub`]. Dropping the last clone unsubscribes.
pub struct Subscription<A: Value> {
    inner: Arc<SubscriptionInner<A>>,
}

impl<A: Value> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Value> Subscription<A> {
    /// Take the next message, suspending until one is published.
    pub fn take(&self) -> Effect<A> {
        let inner = self.inner.clone();
        Effect::async_interrupt(move |cb| {
            let id = inner.id;
            let mut guard = inner.state.lock();
            if let Some(value) = guard.read(id) {
                guard.collect();
                guard.admit_publishers();
                drop(guard);
                cb.succeed(value);
                return None;
            }
            let key = guard.key();
            match guard.subscribers.get_mut(&id) {
                Some(sub) => sub.takers.push_back((key, cb.clone())),
                None => return None,
            }
            drop(guard);
            let inner = inner.clone();
            Some(Effect::sync(move || {
                if let Some(sub) = inner.state.lock().subscribers.get_mut(&inner.id) {
                    sub.takers.retain(|(k, _)| *k != key);
                }
            }))
        })
    }

    /// Take the next message if one is waiting.
    pub fn poll(&self) -> Effect<Option<A>> {
        self.take_up_to(1).map(|mut taken| taken.pop())
    }

    /// Take every waiting message.
    pub fn take_all(&self) -> Effect<Vec<A>> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `max` waiting messages.
    pub fn take_up_to(&self, max: usize) -> Effect<Vec<A>> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().take_up_to(inner.id, max))
    }

    /// Messages waiting for this subscriber.
    pub fn size(&self) -> Effect<usize> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().unread(inner.id))
    }
}

impl<A: Value> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
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
    fn test_fan_out_in_order() {
        let rt = runtime();
        let program = Hub::<u32>::bounded(10).flat_map(|hub| {
            let publish = hub.publish_all(0..10);
            hub.subscribe().zip(hub.subscribe()).flat_map(move |(a, b)| {
                let take_ten = |s: Subscription<u32>| {
                    Effect::foreach(0..10, move |_| s.take())
                };
                let readers = take_ten(a).zip_par(take_ten(b));
                publish.clone().fork().zip_right(readers)
            })
        });
        let expected: Vec<u32> = (0..10).collect();
        assert_eq!(
            rt.run_blocking(program).value(),
            Some(&(expected.clone(), expected))
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let rt = runtime();
        let program = Hub::<u8>::bounded(1).flat_map(|hub| {
            hub.publish(1)
                .zip(hub.publish(2))
                .zip(hub.size())
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&((true, true), 0)));
    }

    #[test]
    fn test_nodes_released_after_all_read() {
        let rt = runtime();
        let program = Hub::<u8>::unbounded().flat_map(|hub| {
            let hub2 = hub.clone();
            hub.subscribe().zip(hub.subscribe()).flat_map(move |(a, b)| {
                let hub = hub2.clone();
                hub.publish_all([1, 2, 3])
                    .zip_right(a.take_all())
                    .zip(hub.size())
                    .zip(b.take_up_to(2))
                    .zip(hub.size())
                    .zip_left(b.size())
            })
        });
        assert_eq!(
            rt.run_blocking(program).value(),
            Some(&(((vec![1, 2, 3], 3), vec![1, 2]), 1))
        );
    }

    #[test]
    fn test_dropping_and_sliding() {
        let rt = runtime();
        let dropping = Hub::<u8>::dropping(2).flat_map(|hub| {
            hub.subscribe().flat_map(move |sub| {
                hub.publish_all([1, 2, 3]).zip(sub.take_all())
            })
        });
        assert_eq!(rt.run_blocking(dropping).value(), Some(&(false, vec![1, 2])));

        let sliding = Hub::<u8>::sliding(2).flat_map(|hub| {
            hub.subscribe().flat_map(move |sub| {
                hub.publish_all([1, 2, 3]).zip(sub.take_all())
            })
        });
        assert_eq!(rt.run_blocking(sliding).value(), Some(&(true, vec![2, 3])));
    }

    #[test]
    fn test_unsubscribe_releases_unread_nodes() {
        let hub = Hub::<u8>::with_strategy(Some(1), Strategy::BackPressure);
        let mut state = hub.state.lock();
        state.subscribers.insert(
            7,
            Subscriber {
                cursor: 0,
                takers: VecDeque::new(),
            },
        );
        state.append(1);
        assert!(state.is_full());
        state.unsubscribe(7);
        assert!(state.nodes.is_empty());
        assert_eq!(state.head, 1);
        assert!(!state.is_full());
    }

    #[test]
    fn test_dropping_last_handle_unsubscribes() {
        let hub = Hub::<u8>::with_strategy(None, Strategy::BackPressure);
        hub.state.lock().subscribers.insert(
            3,
            Subscriber {
                cursor: 0,
                takers: VecDeque::new(),
            },
        );
        let sub = Subscription {
            inner: Arc::new(SubscriptionInner {
                id: 3,
                state: hub.state.clone(),
            }),
        };
        let other = sub.clone();
        drop(sub);
        assert_eq!(hub.state.lock().subscribers.len(), 1);
        drop(other);
        assert!(hub.state.lock().subscribers.is_empty());
    }
}
