//! Type-erased values.
//!
//! The interpreter moves success values and typed errors around without
//! knowing their types. Everything it carries is wrapped in an [`AnyValue`],
//! which can be cloned (so an `Exit` can be handed to several observers) and
//! downcast back to the concrete type at the typed API boundary.
//!
//! Effect descriptions are shared between worker threads and may be run more
//! than once, so every value they carry is [`Value`]: cloneable, `Send`,
//! `Sync` and `'static`.

use std::any::Any;
use std::fmt;

/// Anything an effect can produce or fail with.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Object-safe view of a [`Value`].
trait Payload: Send + Sync + 'static {
    fn clone_boxed(&self) -> Box<dyn Payload>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn type_name(&self) -> &'static str;
}

impl<T: Value> Payload for T {
    fn clone_boxed(&self) -> Box<dyn Payload> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A cloneable, type-erased value.
pub struct AnyValue(Box<dyn Payload>);

impl AnyValue {
    /// Wrap a value.
    pub fn new<T: Value>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// The unit value.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Check whether the wrapped value has type `T`.
    pub fn is<T: 'static>(&self) -> bool {
        (*self.0).as_any().is::<T>()
    }

    /// Borrow the wrapped value as `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    /// Take the wrapped value as `T`, handing the value back on mismatch.
    pub fn try_downcast<T: 'static>(self) -> Result<T, Self> {
        if self.is::<T>() {
            match self.0.into_any().downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => unreachable!("type id checked above"),
            }
        } else {
            Err(self)
        }
    }

    /// Take the wrapped value as `T`.
    ///
    /// # Panics
    /// Panics if the value has a different type. The typed effect API only
    /// ever downcasts to the type it erased, so a mismatch is a runtime bug.
    pub fn downcast<T: 'static>(self) -> T {
        match self.try_downcast::<T>() {
            Ok(value) => value,
            Err(other) => panic!(
                "erased value type mismatch: expected {}, found {}",
                std::any::type_name::<T>(),
                other.type_name()
            ),
        }
    }

    /// Name of the wrapped type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        (*self.0).type_name()
    }
}

impl Clone for AnyValue {
    fn clone(&self) -> Self {
        Self((*self.0).clone_boxed())
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyValue<{}>", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_roundtrip() {
        let v = AnyValue::new(vec![1, 2, 3]);
        assert!(v.is::<Vec<i32>>());
        assert_eq!(v.downcast_ref::<Vec<i32>>(), Some(&vec![1, 2, 3]));
        assert_eq!(v.downcast::<Vec<i32>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_clone_is_deep() {
        let v = AnyValue::new(String::from("hello"));
        let w = v.clone();
        assert_eq!(v.downcast::<String>(), "hello");
        assert_eq!(w.downcast::<String>(), "hello");
    }

    #[test]
    fn test_try_downcast_mismatch_returns_value() {
        let v = AnyValue::new(7u8);
        let back = v.try_downcast::<u16>().unwrap_err();
        assert_eq!(back.downcast::<u8>(), 7);
    }

    #[test]
    #[should_panic(expected = "erased value type mismatch")]
    fn test_downcast_mismatch_panics() {
        AnyValue::new(1i32).downcast::<String>();
    }
}
