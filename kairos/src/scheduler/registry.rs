//! Generation-checked arena.
//!
//! The scheduler remembers which processor every live thread belongs to.
//! Instead of keying the map by thread address, each registered thread gets
//! a [`Handle`]: a slot index plus the generation of the slot. A slot is
//! reused once its thread is removed, and the bumped generation makes every
//! stale handle miss instead of aliasing the new occupant.
use alloc::vec::Vec;

/// Index of a registered thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A slab of values addressed by [`Handle`].
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value` and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(value);
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Handle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// The value of `handle`, if it is still registered.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Removes the value of `handle`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    /// Number of registered values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the registered values.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_misses() {
        let mut registry = Registry::new();
        let a = registry.insert(0usize);
        assert_eq!(registry.remove(a), Some(0));
        let b = registry.insert(3);
        assert_eq!(registry.get(a), None);
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.get(b), Some(&3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn slots_are_reused() {
        let mut registry = Registry::new();
        let handles = (0..4).map(|i| registry.insert(i)).collect::<Vec<_>>();
        registry.remove(handles[1]);
        registry.remove(handles[2]);
        registry.insert(9);
        registry.insert(8);
        assert_eq!(registry.slots.len(), 4);
        assert_eq!(registry.values().copied().collect::<Vec<_>>(), [0, 8, 9, 3]);
    }
}
