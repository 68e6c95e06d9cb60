//! Widget identity tokens carried through the pick pass.
//!
//! The pick pass writes a 64-bit token into a two-channel 32-bit integer
//! target. Instead of round-tripping a raw widget address through the GPU, the
//! widget layer registers whatever it wants back (a key into its own tree, an
//! `Rc`, an index) in an [`IdentityRegistry`] and draws the returned
//! [`WidgetId`]. Decoding a read-back token is then a checked table lookup: a
//! token from a removed widget resolves to `None` instead of a dangling value.

use std::num::NonZeroU64;

use crate::arena::{Arena, Key};

/// Non-null 64-bit widget token.
///
/// The low half is the registry slot plus one, the high half the slot's
/// generation, so the all-zero value the pick target is cleared to never
/// names a widget.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WidgetId(NonZeroU64);

impl WidgetId {
    /// Build a token from its raw value; zero is the null identity.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw 64-bit value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Split into `[low, high]` 32-bit halves.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub const fn to_halves(self) -> [u32; 2] {
        let raw = self.0.get();
        [raw as u32, (raw >> 32) as u32]
    }

    /// Reassemble halves read back from a pick target.
    #[must_use]
    pub fn from_halves([low, high]: [u32; 2]) -> Option<Self> {
        Self::from_raw(u64::from(low) | (u64::from(high) << 32))
    }

    fn from_key(key: Key) -> Self {
        // Arena slots stop below u32::MAX, so the low half is never zero.
        let low = u64::from(key.index()) + 1;
        let raw = (u64::from(key.generation()) << 32) | low;
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn key(self) -> Option<Key> {
        let [low, high] = self.to_halves();
        Some(Key::from_parts(low.checked_sub(1)?, high))
    }
}

/// Maps [`WidgetId`] tokens to caller-owned values.
pub struct IdentityRegistry<T> {
    entries: Arena<T>,
}

impl<T> Default for IdentityRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdentityRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Arena::new(),
        }
    }

    /// Register `value` and return its token.
    ///
    /// # Errors
    ///
    /// Hands `value` back when the registry has no free token left.
    pub fn register(&mut self, value: T) -> Result<WidgetId, T> {
        self.entries.insert(value).map(WidgetId::from_key)
    }

    /// Resolve a token.
    #[must_use]
    pub fn get(&self, id: WidgetId) -> Option<&T> {
        self.entries.get(id.key()?)
    }

    /// Unregister a token, returning its value.
    pub fn remove(&mut self, id: WidgetId) -> Option<T> {
        self.entries.remove(id.key()?)
    }

    /// Resolve halves read back from a pick pass.
    #[must_use]
    pub fn resolve(&self, halves: [u32; 2]) -> Option<&T> {
        self.get(WidgetId::from_halves(halves)?)
    }

    /// Number of registered values.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn halves_round_trip() {
        for raw in [
            1,
            0xFFFF_FFFF,
            0x1_0000_0000,
            0xDEAD_BEEF_0000_0001,
            u64::MAX,
        ] {
            let id = WidgetId::from_raw(raw).unwrap();
            assert_eq!(WidgetId::from_halves(id.to_halves()), Some(id));
        }
    }

    #[test]
    fn zero_halves_are_null() {
        assert_eq!(WidgetId::from_halves([0, 0]), None);
    }

    #[test]
    fn registry_resolves_registered_values() {
        let mut registry = IdentityRegistry::new();
        let a = registry.register("button").unwrap();
        let b = registry.register("slider").unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get(a), Some(&"button"));
        assert_eq!(registry.resolve(b.to_halves()), Some(&"slider"));
        assert_eq!(registry.resolve([0, 0]), None);
    }

    #[test]
    fn removed_token_goes_stale() {
        let mut registry = IdentityRegistry::new();
        let old = registry.register(1).unwrap();
        assert_eq!(registry.remove(old), Some(1));
        let new = registry.register(2).unwrap();
        assert_ne!(old, new);
        assert_eq!(registry.get(old), None);
        assert_eq!(registry.get(new), Some(&2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn foreign_token_is_rejected() {
        let registry: IdentityRegistry<u8> = IdentityRegistry::new();
        let foreign = WidgetId::from_raw(0x7_0000_0003).unwrap();
        assert!(registry.get(foreign).is_none());
        // High half only: slot 0 minus one underflows.
        assert!(registry.get(WidgetId::from_raw(1 << 32).unwrap()).is_none());
    }
}
