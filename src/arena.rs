//! Generational slot storage for backend-owned resources.
//!
//! Backends keep their GPU textures in an [`Arena`] and hand out the [`Key`]
//! inside a [`Texture`](crate::Texture). A freed slot bumps its generation,
//! so a stale key can never reach a recycled resource.

/// Stable reference to an arena slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at insertion time.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Index of a new slot appended after `len` others.
///
/// Stops short of `u32::MAX` so a slot index plus one always fits the low
/// half of a [`WidgetId`](crate::WidgetId).
fn slot_index(len: usize) -> Option<u32> {
    u32::try_from(len).ok().filter(|&index| index < u32::MAX)
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A vector of reusable slots addressed by [`Key`].
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of live values.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no value is live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` and return its key.
    ///
    /// # Errors
    ///
    /// Hands `value` back when every one of the `u32::MAX` slots is live.
    pub fn insert(&mut self, value: T) -> Result<Key, T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.len += 1;
            return Ok(Key::from_parts(index, slot.generation));
        }
        let Some(index) = slot_index(self.slots.len()) else {
            return Err(value);
        };
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Ok(Key::from_parts(index, 0))
    }

    /// Borrow the value behind `key`, if it is still live.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Mutably borrow the value behind `key`, if it is still live.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Take the value out of its slot, retiring `key`.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Iterate over live values.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    /// Remove every live value, retiring all keys.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (slot, index) in self.slots.iter_mut().zip(0u32..) {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_key_does_not_reach_recycled_slot() {
        let mut arena = Arena::new();
        let old = arena.insert(1).unwrap();
        arena.remove(old);
        let new = arena.insert(2).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn drain_empties_and_retires() {
        let mut arena = Arena::new();
        let keys: Vec<_> = (0..4).map(|v| arena.insert(v).unwrap()).collect();
        arena.remove(keys[1]);
        let mut drained = arena.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 2, 3]);
        assert!(arena.is_empty());
        assert!(keys.iter().all(|&k| arena.get(k).is_none()));
        assert_eq!(arena.values().count(), 0);

        let reused = arena.insert(9).unwrap();
        assert!(reused.index() < 4);
    }

    #[test]
    fn last_slot_index_is_reserved() {
        assert_eq!(slot_index(0), Some(0));
        assert_eq!(slot_index(u32::MAX as usize - 1), Some(u32::MAX - 1));
        assert_eq!(slot_index(u32::MAX as usize), None);
        assert_eq!(slot_index(usize::MAX), None);
    }
}
