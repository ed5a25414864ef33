//! Per-fiber runtime flags.

use std::fmt;

/// A small bit set of behaviours the interpreter consults on every step.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFlags(u32);

impl RuntimeFlags {
    /// No flags set.
    pub const NONE: RuntimeFlags = RuntimeFlags(0);
    /// The fiber may be interrupted.
    pub const INTERRUPTIBLE: RuntimeFlags = RuntimeFlags(1 << 0);
    /// The fiber yields its worker after the step budget is spent.
    pub const COOPERATIVE_YIELDING: RuntimeFlags = RuntimeFlags(1 << 1);

    /// Flags every new fiber starts with.
    pub const DEFAULT: RuntimeFlags =
        RuntimeFlags(Self::INTERRUPTIBLE.0 | Self::COOPERATIVE_YIELDING.0);

    /// True if every flag in `other` is set.
    pub fn contains(self, other: RuntimeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Shorthand for `contains(INTERRUPTIBLE)`.
    pub fn interruptible(self) -> bool {
        self.contains(Self::INTERRUPTIBLE)
    }

    /// Shorthand for `contains(COOPERATIVE_YIELDING)`.
    pub fn cooperative_yielding(self) -> bool {
        self.contains(Self::COOPERATIVE_YIELDING)
    }

    /// Apply a patch.
    pub fn patch(self, patch: FlagsPatch) -> RuntimeFlags {
        RuntimeFlags((self.0 | patch.enable.0) & !patch.disable.0)
    }

    /// The patch that turns `self` back into `previous`.
    pub fn diff(self, previous: RuntimeFlags) -> FlagsPatch {
        FlagsPatch {
            enable: RuntimeFlags(previous.0 & !self.0),
            disable: RuntimeFlags(self.0 & !previous.0),
        }
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for RuntimeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFlags")
            .field("interruptible", &self.interruptible())
            .field("cooperative_yielding", &self.cooperative_yielding())
            .finish()
    }
}

/// A change to runtime flags: bits to set and bits to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsPatch {
    enable: RuntimeFlags,
    disable: RuntimeFlags,
}

impl FlagsPatch {
    /// Set the given flags.
    pub fn enable(flags: RuntimeFlags) -> Self {
        Self {
            enable: flags,
            disable: RuntimeFlags::NONE,
        }
    }

    /// Clear the given flags.
    pub fn disable(flags: RuntimeFlags) -> Self {
        Self {
            enable: RuntimeFlags::NONE,
            disable: flags,
        }
    }

    /// True if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.enable.0 == 0 && self.disable.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_and_diff() {
        let start = RuntimeFlags::DEFAULT;
        let masked = start.patch(FlagsPatch::disable(RuntimeFlags::INTERRUPTIBLE));
        assert!(!masked.interruptible());
        assert!(masked.cooperative_yielding());

        let back = masked.patch(masked.diff(start));
        assert_eq!(back, start);
        assert!(start.diff(start).is_empty());
    }
}
