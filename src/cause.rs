//! # Structured Failure
//!
//! A [`Cause`] describes *why* a fiber did not produce a value. It composes
//! three kinds of leaves:
//!
//! - **Fail**: an expected, typed error of the effect's error type
//! - **Die**: a defect (an unexpected panic), kept with its original payload
//! - **Interrupt**: a cancellation signal carrying the interrupting fiber id
//!
//! Leaves are combined with `Sequential` (one happened after the other, for
//! example a finalizer failing after the main effect failed) and `Parallel`
//! (both happened concurrently, for example both sides of a race).
//!
//! ## Algebra
//!
//! `Empty` is the identity of both combinators and both combinators are
//! associative; `Parallel` is also commutative. Equality is defined on the
//! normal form (a sequence of parallel steps), so two causes that differ only
//! in grouping compare equal. The smart constructors [`Cause::then`] and
//! [`Cause::both`] drop `Empty` operands eagerly.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fiber::FiberId;

// ============================================================================
// Defect
// ============================================================================

struct DefectInner {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

/// An unexpected failure, usually a panic caught inside a user closure.
///
/// The original panic payload is preserved so that it can be re-raised with
/// [`std::panic::resume_unwind`] by whoever finally handles the defect.
#[derive(Clone)]
pub struct Defect {
    inner: Arc<DefectInner>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DefectInner {
                message: message.into(),
                payload: Mutex::new(None),
            }),
        }
    }

    /// Create a defect from any error value.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::new(error.to_string())
    }

    /// Create a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self {
            inner: Arc::new(DefectInner {
                message,
                payload: Mutex::new(Some(payload)),
            }),
        }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Take the original panic payload, if this defect came from a panic and
    /// nobody took it yet.
    pub fn take_payload(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.payload.lock().take()
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.message == other.inner.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.inner.message).finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.message)
    }
}

// ============================================================================
// Cause
// ============================================================================

/// A structured description of why an effect failed.
#[derive(Clone)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// A defect from a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition, dropping `Empty` operands.
    pub fn then(self, next: Cause<E>) -> Cause<E> {
        match (self, next) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Sequential(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition, dropping `Empty` operands.
    pub fn both(self, other: Cause<E>) -> Cause<E> {
        match (self, other) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Parallel(Box::new(left), Box::new(right)),
        }
    }

    /// True if the cause contains no leaves at all.
    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }

    /// True if some leaf is a typed failure.
    pub fn is_failure(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Cause::Fail(_)))
    }

    /// True if some leaf is a defect.
    pub fn is_die(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Cause::Die(_)))
    }

    /// True if some leaf is an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Cause::Interrupt(_)))
    }

    /// True if the cause is non-empty and every leaf is an interruption.
    pub fn is_interrupted_only(&self) -> bool {
        let leaves = self.leaves();
        !leaves.is_empty() && leaves.iter().all(|l| matches!(l, Cause::Interrupt(_)))
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Cause::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Cause::Die(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Ids of every fiber that interrupted.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Cause::Interrupt(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// The first typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// Transform every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2>(self, f: &mut dyn FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(l, r) => {
                let l = l.map_inner(f);
                Cause::Sequential(Box::new(l), Box::new(r.map_inner(f)))
            }
            Cause::Parallel(l, r) => {
                let l = l.map_inner(f);
                Cause::Parallel(Box::new(l), Box::new(r.map_inner(f)))
            }
        }
    }

    /// Drop typed failures, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        self.filter_map_leaves(&mut |leaf| match leaf {
            Cause::Fail(_) => Cause::Empty,
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            _ => Cause::Empty,
        })
    }

    /// Drop interruption leaves.
    pub fn strip_interrupts(self) -> Cause<E> {
        self.filter_map_leaves(&mut |leaf| match leaf {
            Cause::Interrupt(_) => Cause::Empty,
            other => other,
        })
    }

    fn filter_map_leaves<E2>(self, f: &mut dyn FnMut(Cause<E>) -> Cause<E2>) -> Cause<E2> {
        match self {
            Cause::Sequential(l, r) => {
                let l = l.filter_map_leaves(f);
                l.then(r.filter_map_leaves(f))
            }
            Cause::Parallel(l, r) => {
                let l = l.filter_map_leaves(f);
                l.both(r.filter_map_leaves(f))
            }
            leaf => f(leaf),
        }
    }

    /// Leaves in left-to-right order, skipping `Empty`.
    pub fn leaves(&self) -> Vec<&Cause<E>> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(c) = stack.pop() {
            match c {
                Cause::Empty => {}
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    stack.push(r);
                    stack.push(l);
                }
                leaf => out.push(leaf),
            }
        }
        out
    }

    /// Normal form: a list of sequential steps, each a set of parallel leaves.
    fn steps(&self) -> Vec<Vec<&Cause<E>>> {
        match self {
            Cause::Empty => Vec::new(),
            Cause::Sequential(l, r) => {
                let mut steps = l.steps();
                steps.extend(r.steps());
                steps
            }
            Cause::Parallel(l, r) => {
                let mut left = l.steps();
                let right = r.steps();
                for (i, step) in right.into_iter().enumerate() {
                    if i < left.len() {
                        left[i].extend(step);
                    } else {
                        left.push(step);
                    }
                }
                left
            }
            leaf => vec![vec![leaf]],
        }
    }

    fn leaf_eq(a: &Cause<E>, b: &Cause<E>) -> bool
    where
        E: PartialEq,
    {
        match (a, b) {
            (Cause::Fail(x), Cause::Fail(y)) => x == y,
            (Cause::Die(x), Cause::Die(y)) => x == y,
            (Cause::Interrupt(x), Cause::Interrupt(y)) => x == y,
            _ => false,
        }
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let left = self.steps();
        let right = other.steps();
        if left.len() != right.len() {
            return false;
        }
        left.iter().zip(right.iter()).all(|(a, b)| {
            if a.len() != b.len() {
                return false;
            }
            // Multiset comparison of the parallel leaves in one step.
            let mut used = vec![false; b.len()];
            a.iter().all(|x| {
                match b
                    .iter()
                    .enumerate()
                    .position(|(j, y)| !used[j] && Cause::leaf_eq(x, y))
                {
                    Some(j) => {
                        used[j] = true;
                        true
                    }
                    None => false,
                }
            })
        })
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E: fmt::Debug> fmt::Debug for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => write!(f, "Empty"),
            Cause::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            Cause::Die(d) => f.debug_tuple("Die").field(d).finish(),
            Cause::Interrupt(id) => f.debug_tuple("Interrupt").field(id).finish(),
            Cause::Sequential(l, r) => f.debug_tuple("Sequential").field(l).field(r).finish(),
            Cause::Parallel(l, r) => f.debug_tuple("Parallel").field(l).field(r).finish(),
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Render the whole tree, one node per line.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            Cause::Empty => out.push_str(&format!("{pad}Empty\n")),
            Cause::Fail(e) => out.push_str(&format!("{pad}Fail: {e:?}\n")),
            Cause::Die(d) => out.push_str(&format!("{pad}Die: {d}\n")),
            Cause::Interrupt(id) => out.push_str(&format!("{pad}Interrupted by {id}\n")),
            Cause::Sequential(l, r) => {
                out.push_str(&format!("{pad}Sequential\n"));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
            Cause::Parallel(l, r) => {
                out.push_str(&format!("{pad}Parallel\n"));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty().trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::new(n)
    }

    #[test]
    fn test_empty_is_identity() {
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(Cause::Empty.then(c.clone()), c);
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.both(c.clone()), c);
        assert_eq!(c.clone().both(Cause::Empty), c);
    }

    #[test]
    fn test_raw_empty_nodes_compare_equal_to_leaf() {
        let c: Cause<i32> = Cause::Sequential(Box::new(Cause::Empty), Box::new(Cause::Fail(1)));
        assert_eq!(c, Cause::Fail(1));
        let p: Cause<i32> = Cause::Parallel(Box::new(Cause::Fail(1)), Box::new(Cause::Empty));
        assert_eq!(p, Cause::Fail(1));
    }

    #[test]
    fn test_sequential_associative() {
        let a: Cause<i32> = Cause::fail(1);
        let b = Cause::fail(2);
        let c = Cause::die_message("x");
        assert_eq!(
            a.clone().then(b.clone()).then(c.clone()),
            a.then(b.then(c))
        );
    }

    #[test]
    fn test_parallel_associative_and_commutative() {
        let a: Cause<i32> = Cause::fail(1);
        let b = Cause::interrupt(fid(3));
        let c = Cause::fail(2);
        assert_eq!(
            a.clone().both(b.clone()).both(c.clone()),
            a.clone().both(b.clone().both(c.clone()))
        );
        assert_eq!(a.clone().both(b.clone()), b.both(a));
    }

    #[test]
    fn test_sequential_is_not_commutative() {
        let a: Cause<i32> = Cause::fail(1);
        let b = Cause::fail(2);
        assert_ne!(a.clone().then(b.clone()), b.then(a));
    }

    #[test]
    fn test_is_interrupted() {
        let c: Cause<i32> = Cause::fail(1).then(Cause::interrupt(fid(9)).both(Cause::fail(2)));
        assert!(c.is_interrupted());
        assert!(!c.is_interrupted_only());
        assert_eq!(c.interruptors().into_iter().collect::<Vec<_>>(), vec![fid(9)]);

        let only: Cause<i32> = Cause::interrupt(fid(1)).both(Cause::interrupt(fid(2)));
        assert!(only.is_interrupted_only());
        assert!(!Cause::<i32>::Empty.is_interrupted());
    }

    #[test]
    fn test_failures_order() {
        let c: Cause<i32> = Cause::fail(1).then(Cause::fail(2).both(Cause::fail(3)));
        assert_eq!(c.failures(), vec![&1, &2, &3]);
        assert_eq!(c.first_failure(), Some(&1));
    }

    #[test]
    fn test_map_and_strip() {
        let c: Cause<i32> = Cause::fail(1).then(Cause::die_message("bug"));
        let mapped = c.clone().map(|e| e.to_string());
        assert_eq!(mapped.failures(), vec![&"1".to_string()]);

        let stripped: Cause<()> = c.strip_failures();
        assert!(!stripped.is_failure());
        assert!(stripped.is_die());

        let ci: Cause<i32> = Cause::fail(1).both(Cause::interrupt(fid(4)));
        assert_eq!(ci.strip_interrupts(), Cause::fail(1));
    }

    #[test]
    fn test_defect_from_panic_keeps_payload() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        let d = Defect::from_panic(payload);
        assert_eq!(d.message(), "kaboom");
        assert!(d.take_payload().is_some());
        assert!(d.take_payload().is_none());
    }

    #[test]
    fn test_pretty_keeps_structure() {
        let c: Cause<&str> = Cause::fail("a").then(Cause::fail("b").both(Cause::interrupt(fid(2))));
        let rendered = c.pretty();
        assert!(rendered.contains("Sequential"));
        assert!(rendered.contains("Parallel"));
        assert!(rendered.contains("Fail: \"a\""));
        assert!(rendered.contains("Interrupted by Fiber(2)"));
    }
}
