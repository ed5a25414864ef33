//! # Semaphore
//!
//! A counting semaphore for fibers. Waiting fibers are suspended, never
//! blocked, and served strictly in arrival order: a large request at the
//! head of the queue holds back smaller ones behind it.
//!
//! Acquisition goes through a ticket. Reserving a ticket is instantaneous
//! and happens uninterruptibly; waiting on it is interruptible; releasing a
//! ticket either hands its permits back or withdraws it from the queue, so
//! an interrupted waiter can never leak permits.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::continuation::Callback;
use crate::effect::Effect;
use crate::value::Value;

struct Waiter {
    ticket: u64,
    permits: usize,
    wake: Option<Callback<(), Infallible>>,
}

struct State {
    available: usize,
    next_ticket: u64,
    waiting: VecDeque<Waiter>,
    /// Tickets granted but not yet handed to their holder or released.
    granted: HashMap<u64, usize>,
}

impl State {
    /// Grant permits to the head of the queue while they last.
    fn grant(&mut self) -> Vec<Callback<(), Infallible>> {
        let mut wake = Vec::new();
        while let Some(head) = self.waiting.front() {
            if head.permits > self.available {
                break;
            }
            if let Some(waiter) = self.waiting.pop_front() {
                self.available -= waiter.permits;
                self.granted.insert(waiter.ticket, waiter.permits);
                wake.extend(waiter.wake);
            }
        }
        wake
    }
}

fn wake_all(callbacks: Vec<Callback<(), Infallible>>) {
    for cb in callbacks {
        cb.succeed(());
    }
}

/// A fiber-aware counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<Mutex<State>>,
}

impl Semaphore {
    /// A semaphore with `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: permits,
                next_ticket: 0,
                waiting: VecDeque::new(),
                granted: HashMap::new(),
            })),
        }
    }

    /// Effect creating a semaphore.
    pub fn make(permits: usize) -> Effect<Semaphore> {
        Effect::sync(move || Semaphore::new(permits))
    }

    /// Permits currently available.
    pub fn available(&self) -> Effect<usize> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().available)
    }

    /// Take one permit, waiting if none is available.
    pub fn acquire(&self) -> Effect<()> {
        self.acquire_n(1)
    }

    /// Take `n` permits, waiting until all of them are available at once.
    ///
    /// Interrupting the wait gives back anything that was granted.
    pub fn acquire_n(&self, n: usize) -> Effect<()> {
        let me = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            let me = me.clone();
            me.reserve(n).flat_map(move |ticket| {
                let holder = me.clone();
                restore
                    .apply(me.wait(ticket))
                    .on_interrupt(me.release_ticket(ticket))
                    .map(move |_| holder.keep(ticket))
            })
        })
    }

    /// Give back one permit.
    pub fn release(&self) -> Effect<()> {
        self.release_n(1)
    }

    /// Give back `n` permits.
    pub fn release_n(&self, n: usize) -> Effect<()> {
        let state = self.state.clone();
        Effect::sync(move || {
            let wake = {
                let mut state = state.lock();
                state.available += n;
                state.grant()
            };
            wake_all(wake);
        })
    }

    /// Run `effect` holding one permit.
    pub fn with_permit<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        self.with_permits(1, effect)
    }

    /// Run `effect` holding `n` permits. The permits are returned however
    /// `effect` ends.
    pub fn with_permits<A: Value, E: Value>(&self, n: usize, effect: Effect<A, E>) -> Effect<A, E> {
        let waiter = self.clone();
        let releaser = self.clone();
        Effect::acquire_use_release(
            self.reserve(n).widen(),
            move |ticket| waiter.wait(ticket).widen().zip_right(effect.clone()),
            move |ticket| releaser.release_ticket(ticket),
        )
    }

    /// Queue a request for `n` permits, granting it at once if possible.
    fn reserve(&self, n: usize) -> Effect<u64> {
        let state = self.state.clone();
        Effect::sync(move || {
            let mut state = state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            if state.waiting.is_empty() && state.available >= n {
                state.available -= n;
                state.granted.insert(ticket, n);
            } else {
                state.waiting.push_back(Waiter {
                    ticket,
                    permits: n,
                    wake: None,
                });
            }
            ticket
        })
    }

    /// Suspend until `ticket` is granted.
    fn wait(&self, ticket: u64) -> Effect<()> {
        let state = self.state.clone();
        Effect::async_callback(move |cb| {
            let ready = {
                let mut state = state.lock();
                if state.granted.contains_key(&ticket) {
                    true
                } else {
                    match state.waiting.iter_mut().find(|w| w.ticket == ticket) {
                        Some(waiter) => {
                            waiter.wake = Some(cb.clone());
                            false
                        }
                        None => true,
                    }
                }
            };
            if ready {
                cb.succeed(());
            }
        })
    }

    /// Hand back the permits of a granted ticket, or withdraw a waiting one.
    fn release_ticket(&self, ticket: u64) -> Effect<()> {
        let state = self.state.clone();
        Effect::sync(move || {
            let wake = {
                let mut state = state.lock();
                match state.granted.remove(&ticket) {
                    Some(permits) => state.available += permits,
                    None => state.waiting.retain(|w| w.ticket != ticket),
                }
                state.grant()
            };
            wake_all(wake);
        })
    }

    /// The holder keeps the permits of `ticket` until an explicit release.
    fn keep(&self, ticket: u64) {
        self.state.lock().granted.remove(&ticket);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("available", &state.available)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
    }

    #[test]
    fn test_acquire_release() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let program = sem
            .acquire_n(2)
            .zip_right(sem.available())
            .zip(sem.release_n(2).zip_right(sem.available()));
        assert_eq!(rt.run_blocking(program).value(), Some(&(0, 2)));
    }

    #[test]
    fn test_with_permit_limits_concurrency() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task = {
            let entering = running.clone();
            let peak = peak.clone();
            let enter = Effect::sync(move || {
                let now = entering.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            });
            let leaving = running.clone();
            let leave = Effect::sync(move || {
                leaving.fetch_sub(1, Ordering::SeqCst);
            });
            sem.with_permit(
                enter
                    .zip_right(Effect::sleep(Duration::from_millis(5)))
                    .zip_right(leave),
            )
        };
        let exit = rt.run_blocking(Effect::foreach_par(0..8, move |_| task.clone()));
        assert!(exit.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupted_waiter_leaks_nothing() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let blocked = sem.with_permit(Effect::<(), Infallible>::unit());
        let program = sem.acquire().zip_right(blocked.fork()).flat_map({
            let sem = sem.clone();
            move |fiber| {
                Effect::yield_now()
                    .zip_right(fiber.interrupt())
                    .zip_right(sem.release())
                    .zip_right(sem.available())
            }
        });
        assert_eq!(rt.run_blocking(program).value(), Some(&1));
        assert!(sem.state.lock().granted.is_empty());
    }

    #[test]
    fn test_fifo_head_blocks_smaller_requests() {
        let mut state = State {
            available: 1,
            next_ticket: 0,
            waiting: VecDeque::new(),
            granted: HashMap::new(),
        };
        for (ticket, permits) in [(0, 2), (1, 1)] {
            state.waiting.push_back(Waiter {
                ticket,
                permits,
                wake: None,
            });
        }
        state.grant();
        assert!(state.granted.is_empty());
        state.available += 1;
        state.grant();
        assert_eq!(state.granted.get(&0), Some(&2));
        assert_eq!(state.waiting.len(), 1);
    }
}
