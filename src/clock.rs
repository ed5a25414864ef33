//! Clock and Timers
//!
//! The runtime consumes time through the [`Clock`] trait: a monotonic `now`
//! and one-shot timer callbacks. `Effect::sleep` registers a timer and
//! suspends the fiber; interrupting the sleep cancels the timer.
//!
//! # Components
//!
//! - `LiveClock`: the default clock, one timer thread per runtime
//! - `TestClock`: a manually advanced clock for deterministic tests
//! - `Deadline`: an absolute point in time with remaining-time helpers

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::RuntimeError;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Work to run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Monotonic time and timer scheduling.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Run `callback` once `deadline` has passed.
    fn schedule(&self, deadline: Instant, callback: TimerCallback) -> TimerId;

    /// Cancel a timer. Cancelling a fired or unknown timer does nothing.
    fn cancel(&self, id: TimerId);

    /// Stop firing timers.
    fn shutdown(&self) {}
}

// ============================================================================
// Deadline
// ============================================================================

/// A deadline for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    deadline: Instant,
}

impl Deadline {
    /// Create a deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self { deadline: instant }
    }

    /// Create a deadline `duration` after `now`.
    pub fn after(now: Instant, duration: Duration) -> Self {
        Self {
            deadline: now + duration,
        }
    }

    /// Get the deadline instant.
    pub fn instant(&self) -> Instant {
        self.deadline
    }

    /// Check if the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Remaining time at `now`, or `None` if expired.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if now >= self.deadline {
            None
        } else {
            Some(self.deadline - now)
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

// ============================================================================
// Live clock
// ============================================================================

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        callback: TimerCallback,
    },
    Cancel(u64),
    Stop,
}

/// Wall clock backed by a single timer thread.
pub struct LiveClock {
    commands: Sender<Command>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LiveClock {
    /// Start the timer thread.
    pub fn new() -> Result<Self, RuntimeError> {
        let (commands, inbox) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("skein-timer".to_string())
            .spawn(move || timer_loop(inbox))
            .map_err(|err| RuntimeError::ThreadSpawn {
                thread: "skein-timer".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl Clock for LiveClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .commands
            .send(Command::Schedule {
                id,
                deadline,
                callback,
            })
            .is_err()
        {
            tracing::trace!(timer = id, "timer scheduled on a stopped clock");
        }
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let _ = self.commands.send(Command::Cancel(id.0));
    }

    fn shutdown(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for LiveClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LiveClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClock").finish_non_exhaustive()
    }
}

fn timer_loop(inbox: Receiver<Command>) {
    let mut timers: BTreeMap<(Instant, u64), TimerCallback> = BTreeMap::new();
    let mut deadlines: HashMap<u64, Instant> = HashMap::new();

    loop {
        let now = Instant::now();
        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), callback) = entry.remove_entry();
            deadlines.remove(&id);
            callback();
        }

        let command = match timers.keys().next() {
            Some((deadline, _)) => match inbox.recv_timeout(deadline.saturating_duration_since(now)) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Schedule {
                id,
                deadline,
                callback,
            } => {
                timers.insert((deadline, id), callback);
                deadlines.insert(id, deadline);
            }
            Command::Cancel(id) => {
                if let Some(deadline) = deadlines.remove(&id) {
                    timers.remove(&(deadline, id));
                }
            }
            Command::Stop => break,
        }
    }
    tracing::trace!(pending = timers.len(), "timer thread stopped");
}

// ============================================================================
// Test clock
// ============================================================================

struct TestClockState {
    now: Instant,
    next_id: u64,
    timers: BTreeMap<(Instant, u64), TimerCallback>,
    deadlines: HashMap<u64, Instant>,
}

/// A clock that only moves when told to.
///
/// Timers fire on the thread that calls [`TestClock::adjust`].
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestClockState>>,
}

impl TestClock {
    /// A clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TestClockState {
                now: Instant::now(),
                next_id: 1,
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
            })),
        }
    }

    /// Move time forward by `by`, firing every timer that came due.
    pub fn adjust(&self, by: Duration) {
        let target = {
            let mut state = self.state.lock();
            state.now += by;
            state.now
        };
        loop {
            let due = {
                let mut state = self.state.lock();
                match state.timers.first_entry() {
                    Some(entry) if entry.key().0 <= target => {
                        let ((_, id), callback) = entry.remove_entry();
                        state.deadlines.remove(&id);
                        Some(callback)
                    }
                    _ => None,
                }
            };
            match due {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    /// Number of timers not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.state.lock().now
    }

    fn schedule(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert((deadline, id), callback);
        state.deadlines.insert(id, deadline);
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(deadline) = state.deadlines.remove(&id.0) {
            state.timers.remove(&(deadline, id.0));
        }
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestClock")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_deadline_basic() {
        let now = Instant::now();
        let deadline = Deadline::after(now, Duration::from_secs(10));
        assert!(!deadline.is_expired(now));
        assert_eq!(deadline.remaining(now), Some(Duration::from_secs(10)));
        assert_eq!(deadline.remaining(now + Duration::from_secs(11)), None);
    }

    #[test]
    fn test_live_clock_fires() {
        let clock = LiveClock::new().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        clock.schedule(
            clock.now() + Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_live_clock_cancel() {
        let clock = LiveClock::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = clock.schedule(
            clock.now() + Duration::from_millis(30),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        clock.cancel(id);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_live_clock_orders_timers() {
        let clock = LiveClock::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::bounded(2);
        let now = clock.now();
        for (i, delay) in [(1, 20u64), (0, 5u64)] {
            let order = order.clone();
            let tx = tx.clone();
            clock.schedule(
                now + Duration::from_millis(delay),
                Box::new(move || {
                    order.lock().push(i);
                    let _ = tx.send(());
                }),
            );
        }
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[test]
    fn test_test_clock_adjust() {
        let clock = TestClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for delay in [5u64, 10, 20] {
            let counter = fired.clone();
            clock.schedule(
                clock.now() + Duration::from_millis(delay),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        clock.adjust(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(clock.pending(), 1);
        clock.adjust(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
