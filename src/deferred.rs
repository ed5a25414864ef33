//! # Deferred
//!
//! A [`Deferred`] is a one-shot cell fibers can wait on. The first
//! completion wins; every waiter, present or future, sees the same exit.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::continuation::Callback;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::value::Value;

enum State<A, E> {
    Pending {
        next_key: u64,
        waiters: BTreeMap<u64, Callback<A, E>>,
    },
    Done(Exit<A, E>),
}

/// A value that will be set at most once.
pub struct Deferred<A, E = Infallible> {
    state: Arc<Mutex<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Value, E: Value> Deferred<A, E> {
    /// An empty deferred.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending {
                next_key: 0,
                waiters: BTreeMap::new(),
            })),
        }
    }

    /// Effect creating an empty deferred.
    pub fn make() -> Effect<Deferred<A, E>> {
        Effect::sync(Self::new)
    }

    /// Complete with a value. True if this call set the deferred.
    pub fn succeed(&self, value: A) -> Effect<bool> {
        self.complete(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> Effect<bool> {
        self.complete(Exit::fail(error))
    }

    /// Complete with a defect.
    pub fn die(&self, defect: Defect) -> Effect<bool> {
        self.complete(Exit::die(defect))
    }

    /// Complete with an interruption by `by`.
    pub fn interrupt(&self, by: FiberId) -> Effect<bool> {
        self.complete(Exit::interrupt(by))
    }

    /// Complete with a cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> Effect<bool> {
        self.complete(Exit::Failure(cause))
    }

    /// Complete with an exit.
    pub fn complete(&self, exit: Exit<A, E>) -> Effect<bool> {
        let me = self.clone();
        Effect::sync(move || me.settle(exit.clone()))
    }

    /// Complete with the exit of `effect`, which runs first.
    pub fn complete_with(&self, effect: Effect<A, E>) -> Effect<bool> {
        let me = self.clone();
        effect.exit().flat_map(move |exit| me.complete(exit))
    }

    /// Wait for the deferred to be completed and take on its exit.
    pub fn await_value(&self) -> Effect<A, E> {
        let state = self.state.clone();
        Effect::async_interrupt(move |cb| {
            let registered = {
                let mut guard = state.lock();
                match &mut *guard {
                    State::Done(exit) => Err(exit.clone()),
                    State::Pending { next_key, waiters } => {
                        let key = *next_key;
                        *next_key += 1;
                        waiters.insert(key, cb.clone());
                        Ok(key)
                    }
                }
            };
            match registered {
                Ok(key) => {
                    let state = state.clone();
                    Some(Effect::sync(move || {
                        if let State::Pending { waiters, .. } = &mut *state.lock() {
                            waiters.remove(&key);
                        }
                    }))
                }
                Err(exit) => {
                    cb.complete(exit);
                    None
                }
            }
        })
    }

    /// The exit, if completed.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>> {
        let me = self.clone();
        Effect::sync(move || me.peek())
    }

    /// Whether the deferred was completed.
    pub fn is_done(&self) -> Effect<bool> {
        let me = self.clone();
        Effect::sync(move || me.peek().is_some())
    }

    fn peek(&self) -> Option<Exit<A, E>> {
        match &*self.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        }
    }

    fn settle(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut guard = self.state.lock();
            match std::mem::replace(&mut *guard, State::Done(exit.clone())) {
                State::Pending { waiters, .. } => waiters,
                State::Done(first) => {
                    *guard = State::Done(first);
                    return false;
                }
            }
        };
        for cb in waiters.into_values() {
            cb.complete(exit.clone());
        }
        true
    }
}

impl<A: Value, E: Value> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (done, waiting) = match &*self.state.lock() {
            State::Done(_) => (true, 0),
            State::Pending { waiters, .. } => (false, waiters.len()),
        };
        f.debug_struct("Deferred")
            .field("done", &done)
            .field("waiting", &waiting)
            .finish()
    }
}
