//! Structured concurrency combinators.
//!
//! Every combinator here forks its operands as children of the calling fiber
//! and never returns while one of them is still running: losers are
//! interrupted and awaited before the result is produced, and interrupting
//! the caller interrupts and awaits all of them.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::{ErasedExit, Fiber, FiberShared};
use crate::value::Value;

use super::Effect;

/// Completion observers registered on a set of fibers.
///
/// Releasing removes every observer registered so far; observers added
/// after a release are removed by the next one.
struct Watch {
    keys: Mutex<Vec<(Arc<FiberShared>, u64)>>,
    released: AtomicBool,
}

impl Watch {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(Vec::with_capacity(capacity)),
            released: AtomicBool::new(false),
        })
    }

    fn push(&self, fiber: Arc<FiberShared>, key: u64) {
        self.keys.lock().push((fiber, key));
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
        let keys = std::mem::take(&mut *self.keys.lock());
        for (fiber, key) in keys {
            fiber.remove_observer(key);
        }
    }

    /// Called once registration is over.
    fn settle(&self) {
        if self.released.load(Ordering::Acquire) {
            self.release();
        }
    }

    fn canceler(self: &Arc<Self>) -> Option<Effect<(), Infallible>> {
        let watch = self.clone();
        Some(Effect::sync(move || watch.release()))
    }
}

/// Suspend until one of `fibers` is done. Yields the index of the first
/// one observed.
fn await_first(fibers: Vec<Arc<FiberShared>>) -> Effect<usize> {
    Effect::async_interrupt(move |cb| {
        let watch = Watch::new(fibers.len());
        for (index, fiber) in fibers.iter().enumerate() {
            let first = cb.clone();
            let observed = watch.clone();
            match fiber.add_observer(Box::new(move |_: &ErasedExit| {
                observed.release();
                first.succeed(index);
            })) {
                Ok(key) => watch.push(fiber.clone(), key),
                Err(_) => {
                    watch.release();
                    cb.succeed(index);
                    break;
                }
            }
        }
        watch.settle();
        watch.canceler()
    })
}

/// Suspend until every fiber succeeded, or one failed. Yields `None` when
/// all succeeded, or the index of the first failure.
fn await_all_or_failure(fibers: Vec<Arc<FiberShared>>) -> Effect<Option<usize>> {
    Effect::async_interrupt(move |cb| {
        let remaining = Arc::new(AtomicUsize::new(fibers.len()));
        let watch = Watch::new(fibers.len());
        for (index, fiber) in fibers.iter().enumerate() {
            let on_exit = {
                let cb = cb.clone();
                let remaining = remaining.clone();
                let watch = watch.clone();
                move |exit: &ErasedExit| {
                    if exit.is_failure() {
                        watch.release();
                        cb.succeed(Some(index));
                    } else if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        cb.succeed(None);
                    }
                }
            };
            match fiber.add_observer(Box::new(on_exit.clone())) {
                Ok(key) => watch.push(fiber.clone(), key),
                Err(exit) => on_exit(&exit),
            }
        }
        watch.settle();
        watch.canceler()
    })
}

/// Combine the cause of the first failure with the cause a sibling ended
/// with, leaving out siblings that only report our own interruption.
fn merge_loser<A, E>(first: Cause<E>, loser: Exit<A, E>) -> Cause<E> {
    match loser {
        Exit::Failure(cause) if !cause.is_interrupted_only() => first.both(cause),
        _ => first,
    }
}

impl<A: Value, E: Value> Effect<A, E> {
    /// Run both effects concurrently. The handler of whichever finishes first
    /// gets its exit and the other, still running, fiber.
    ///
    /// The winner's fiber refs are merged into the caller before the handler
    /// runs. Interrupting the caller interrupts both sides.
    pub fn race_with<B: Value, C: Value, E2: Value>(
        self,
        that: Effect<B, E>,
        left_done: impl Fn(Exit<A, E>, Fiber<B, E>) -> Effect<C, E2> + Send + Sync + 'static,
        right_done: impl Fn(Exit<B, E>, Fiber<A, E>) -> Effect<C, E2> + Send + Sync + 'static,
    ) -> Effect<C, E2> {
        let left = self.interruptible();
        let right = that.interruptible();
        let left_done = Arc::new(left_done);
        let right_done = Arc::new(right_done);
        Effect::uninterruptible_mask(move |restore| {
            let left_done = left_done.clone();
            let right_done = right_done.clone();
            left.clone()
                .fork()
                .zip(right.clone().fork())
                .widen::<E2>()
                .flat_map(move |(lf, rf): (Fiber<A, E>, Fiber<B, E>)| {
                    let left_done = left_done.clone();
                    let right_done = right_done.clone();
                    let both = vec![lf.shared().clone(), rf.shared().clone()];
                    let stop_both = lf.interrupt().zip_right(rf.interrupt()).as_unit();
                    restore
                        .apply(await_first(both).widen::<E2>())
                        .on_interrupt(stop_both)
                        .flat_map(move |first| {
                            let left_done = left_done.clone();
                            let right_done = right_done.clone();
                            let (lf, rf) = (lf.clone(), rf.clone());
                            if first == 0 {
                                lf.inherit_refs()
                                    .zip_right(lf.await_exit())
                                    .widen::<E2>()
                                    .flat_map(move |exit| restore.apply(left_done(exit, rf.clone())))
                            } else {
                                rf.inherit_refs()
                                    .zip_right(rf.await_exit())
                                    .widen::<E2>()
                                    .flat_map(move |exit| restore.apply(right_done(exit, lf.clone())))
                            }
                        })
                })
        })
    }

    /// First success wins and the loser is interrupted. If the first to
    /// finish fails, the result is the other's; if both fail, their causes
    /// are combined in parallel.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        fn settle<A: Value, E: Value>(exit: Exit<A, E>, loser: Fiber<A, E>) -> Effect<A, E> {
            match exit {
                Exit::Success(a) => loser.interrupt().widen::<E>().as_value(a),
                Exit::Failure(first) => loser
                    .join()
                    .catch_all_cause(move |other| Effect::fail_cause(first.clone().both(other))),
            }
        }
        self.race_with(that, settle::<A, E>, settle::<A, E>)
    }

    /// Run both concurrently and pair their values. The first failure
    /// interrupts the other side; causes are combined in parallel.
    pub fn zip_par<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.race_with(
            that,
            |exit: Exit<A, E>, right: Fiber<B, E>| match exit {
                Exit::Success(a) => right.join().map(move |b| (a.clone(), b)),
                Exit::Failure(first) => right.interrupt().widen::<E>().flat_map(move |loser| {
                    Effect::fail_cause(merge_loser(first.clone(), loser))
                }),
            },
            |exit: Exit<B, E>, left: Fiber<A, E>| match exit {
                Exit::Success(b) => left.join().map(move |a| (a, b.clone())),
                Exit::Failure(first) => left.interrupt().widen::<E>().flat_map(move |loser| {
                    Effect::fail_cause(merge_loser(first.clone(), loser))
                }),
            },
        )
    }

    /// `None` if this does not finish within `duration`; the effect is then
    /// interrupted and awaited.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.race_with(
            Effect::sleep(duration).widen::<E>(),
            |exit: Exit<A, E>, timer: Fiber<(), E>| {
                timer
                    .interrupt()
                    .widen::<E>()
                    .zip_right(Effect::from_exit(exit.map(Some)))
            },
            |_, work: Fiber<A, E>| work.interrupt().widen::<E>().as_value(None),
        )
    }

    /// Fail with `error` if this does not finish within `duration`.
    pub fn timeout_fail(self, duration: Duration, error: E) -> Effect<A, E> {
        self.timeout(duration).flat_map(move |result| match result {
            Some(a) => Effect::succeed(a),
            None => Effect::fail(error.clone()),
        })
    }

    /// Run `f` for every item concurrently, collecting values in input
    /// order. The first failure interrupts the rest; causes of siblings that
    /// failed on their own are combined in parallel.
    pub fn foreach_par<T: Value>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<Vec<A>, E> {
        let effects: Vec<Effect<A, E>> = items.into_iter().map(f).collect();
        Effect::collect_all_par(effects)
    }

    /// Run all effects concurrently, collecting values in input order.
    pub fn collect_all_par(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        if effects.is_empty() {
            return Effect::succeed(Vec::new());
        }
        let effects: Vec<Effect<A, E>> = effects.into_iter().map(Effect::interruptible).collect();
        Effect::uninterruptible_mask(move |restore| {
            let fork_all = Effect::<Fiber<A, E>, Infallible>::foreach(effects.clone(), |e| e.fork());
            fork_all.widen::<E>().flat_map(move |fibers: Vec<Fiber<A, E>>| {
                let shared = fibers.iter().map(|f| f.shared().clone()).collect();
                let stop_all = Effect::<Exit<A, E>, Infallible>::foreach(fibers.clone(), |f| {
                    f.interrupt()
                })
                .as_unit();
                let fibers = fibers.clone();
                restore
                    .apply(await_all_or_failure(shared).widen::<E>())
                    .on_interrupt(stop_all)
                    .flat_map(move |failed| match failed {
                        None => Effect::foreach(fibers.clone(), |f: Fiber<A, E>| f.join()),
                        Some(index) => {
                            let fibers = fibers.clone();
                            Effect::<Exit<A, E>, Infallible>::foreach(fibers.clone(), |f| {
                                f.interrupt()
                            })
                            .widen::<E>()
                            .flat_map(move |exits| {
                                let mut exits = exits;
                                let first = match exits.remove(index) {
                                    Exit::Failure(cause) => cause,
                                    Exit::Success(_) => Cause::Empty,
                                };
                                let cause = exits.into_iter().fold(first, merge_loser);
                                Effect::fail_cause(cause)
                            })
                        }
                    })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicBool;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(4).build_unchecked())
    }

    #[test]
    fn test_await_first_releases_losing_observers() {
        let rt = runtime();
        let slow = rt.run(Effect::<()>::never());
        let fast = rt.run(Effect::<()>::succeed(()));
        let first = await_first(vec![slow.shared().clone(), fast.shared().clone()]);
        assert_eq!(rt.run_blocking(first).value(), Some(&1));
        assert_eq!(slow.shared().observer_count(), 0);
        assert!(rt.run_blocking(slow.interrupt()).is_success());
    }

    #[test]
    fn test_zip_par_pairs_values() {
        let rt = runtime();
        let effect = Effect::<i32, String>::succeed(1)
            .delay(Duration::from_millis(5))
            .zip_par(Effect::succeed("b"));
        assert_eq!(rt.run_blocking(effect).value(), Some(&(1, "b")));
    }

    #[test]
    fn test_zip_par_failure_interrupts_other() {
        let rt = runtime();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow = Effect::sleep(Duration::from_secs(5))
            .widen::<&str>()
            .zip_right(Effect::sync(move || flag.store(true, Ordering::SeqCst)));
        let effect = Effect::<(), &str>::fail("fast").zip_par(slow);
        let exit = rt.run_blocking(effect);
        let cause = exit.cause().cloned().unwrap();
        assert_eq!(cause.failures(), vec![&"fast"]);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_race_first_success_wins() {
        let rt = runtime();
        let slow = Effect::<&str, ()>::succeed("slow").delay(Duration::from_millis(500));
        let fast = Effect::<&str, ()>::succeed("fast").delay(Duration::from_millis(5));
        assert_eq!(rt.run_blocking(slow.race(fast)).value(), Some(&"fast"));
    }

    #[test]
    fn test_race_falls_back_when_first_fails() {
        let rt = runtime();
        let failing = Effect::<i32, &str>::fail("no");
        let slow = Effect::<i32, &str>::succeed(3).delay(Duration::from_millis(10));
        assert_eq!(rt.run_blocking(failing.race(slow)).value(), Some(&3));
    }

    #[test]
    fn test_timeout_interrupts_work() {
        let rt = runtime();
        let effect = Effect::<i32, ()>::never().timeout(Duration::from_millis(10));
        assert_eq!(rt.run_blocking(effect).value(), Some(&None));

        let quick = Effect::<i32, ()>::succeed(4).timeout(Duration::from_secs(5));
        assert_eq!(rt.run_blocking(quick).value(), Some(&Some(4)));
    }

    #[test]
    fn test_timeout_fail() {
        let rt = runtime();
        let effect = Effect::<i32, &str>::never().timeout_fail(Duration::from_millis(5), "late");
        let exit = rt.run_blocking(effect);
        assert_eq!(exit.cause().and_then(|c| c.first_failure()), Some(&"late"));
    }

    #[test]
    fn test_foreach_par_collects_in_order() {
        let rt = runtime();
        let effect = Effect::<u64, Infallible>::foreach_par(vec![30u64, 10, 20], |ms| {
            Effect::succeed(ms).delay(Duration::from_millis(ms))
        });
        assert_eq!(rt.run_blocking(effect).value(), Some(&vec![30, 10, 20]));
    }

    #[test]
    fn test_foreach_par_fails_fast() {
        let rt = runtime();
        let effect = Effect::<u64, String>::foreach_par(vec![1u64, 2, 3], |n| {
            if n == 2 {
                Effect::fail(format!("item {}", n))
            } else {
                Effect::<u64, String>::never()
            }
        });
        let exit = rt.run_blocking(effect);
        let cause = exit.cause().cloned().unwrap();
        assert_eq!(cause.failures(), vec![&"item 2".to_string()]);
    }

    #[test]
    fn test_collect_all_par_empty() {
        let rt = runtime();
        let effect = Effect::<i32, Infallible>::collect_all_par(Vec::new());
        assert_eq!(rt.run_blocking(effect).value(), Some(&Vec::new()));
    }
}
