/// Typed state bitmasks.
///
/// Current-state and target-state of assignments, volume states, and the
/// per-entity status words are bitmasks. `FlagSet` wraps the raw integer so
/// that every transition goes through set/clear mask operations instead of
/// ad-hoc integer arithmetic at call sites. The named bit values live in
/// [`crate::constants`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of state flags backed by a 64-bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet(u64);

impl FlagSet {
    /// Empty flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flag set from a raw mask (deserialization and explicit state masks).
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw mask value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True if every flag in `mask` is set.
    pub const fn is_set(self, mask: u64) -> bool {
        self.0 & mask == mask
    }

    /// True if none of the flags in `mask` are set.
    pub const fn is_clear(self, mask: u64) -> bool {
        self.0 & mask == 0
    }

    /// Set every flag in `mask`.
    pub fn set(&mut self, mask: u64) {
        self.0 |= mask;
    }

    /// Clear every flag in `mask`.
    pub fn clear(&mut self, mask: u64) {
        self.0 &= !mask;
    }

    /// Apply a clear mask, then a set mask, in one transition.
    pub fn apply(&mut self, clear_mask: u64, set_mask: u64) {
        self.0 = (self.0 & !clear_mask) | set_mask;
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut flags = FlagSet::empty();
        flags.set(0x5);
        assert!(flags.is_set(0x1));
        assert!(flags.is_set(0x4));
        assert!(!flags.is_set(0x2));
        flags.clear(0x1);
        assert!(flags.is_clear(0x1));
        assert_eq!(flags.bits(), 0x4);
    }

    #[test]
    fn test_apply_clear_then_set() {
        let mut flags = FlagSet::from_bits(0x3);
        flags.apply(0x1, 0x8);
        assert_eq!(flags.bits(), 0xa);
        // a flag in both masks ends up set
        let mut flags = FlagSet::empty();
        flags.apply(0x4, 0x4);
        assert!(flags.is_set(0x4));
    }

    #[test]
    fn test_is_set_requires_all() {
        let flags = FlagSet::from_bits(0x1);
        assert!(!flags.is_set(0x3));
        assert!(!flags.is_clear(0x3));
    }
}
