//! Terminal outcome of a fiber or effect.

use std::fmt;

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// How an effect finished: a value, or a [`Cause`] explaining why not.
#[derive(Clone, PartialEq)]
pub enum Exit<A, E> {
    /// Completed with a value.
    Success(A),
    /// Did not complete.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A failure with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(by))
    }

    /// True on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True on failure of any kind.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// True if the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Transform typed failures.
    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Combine two exits of concurrent computations. Failures merge in
    /// parallel; if only one side failed its cause wins.
    pub fn zip_par<B>(self, other: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, other) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Exit::Failure(l), Exit::Failure(r)) => Exit::Failure(l.both(r)),
            (Exit::Failure(l), _) => Exit::Failure(l),
            (_, Exit::Failure(r)) => Exit::Failure(r),
        }
    }

    /// Combine two exits of sequential computations.
    pub fn zip_seq<B>(self, other: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, other) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Exit::Failure(l), Exit::Failure(r)) => Exit::Failure(l.then(r)),
            (Exit::Failure(l), _) => Exit::Failure(l),
            (_, Exit::Failure(r)) => Exit::Failure(r),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

impl<A: fmt::Debug, E: fmt::Debug> fmt::Debug for Exit<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Success(a) => f.debug_tuple("Success").field(a).finish(),
            Exit::Failure(c) => f.debug_tuple("Failure").field(c).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries() {
        let ok: Exit<i32, &str> = Exit::succeed(1);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&1));
        assert!(ok.cause().is_none());

        let interrupted: Exit<i32, &str> = Exit::interrupt(FiberId::new(3));
        assert!(interrupted.is_failure());
        assert!(interrupted.is_interrupted());
    }

    #[test]
    fn test_zip_par_merges_failures() {
        let l: Exit<i32, &str> = Exit::fail("a");
        let r: Exit<i32, &str> = Exit::fail("b");
        match l.zip_par(r) {
            Exit::Failure(c) => assert_eq!(c, Cause::fail("b").both(Cause::fail("a"))),
            Exit::Success(_) => panic!("expected failure"),
        }

        let l: Exit<i32, &str> = Exit::succeed(1);
        let r: Exit<&str, &str> = Exit::succeed("x");
        assert_eq!(l.zip_par(r).into_result().unwrap(), (1, "x"));
    }

    #[test]
    fn test_from_result() {
        let e: Exit<i32, String> = Err("nope".to_string()).into();
        assert_eq!(e.cause().unwrap().failures(), vec![&"nope".to_string()]);
    }
}
