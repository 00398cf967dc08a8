//! Generational slab of connection slots.
//!
//! A [`Handle`] names a slot together with the generation it was allocated
//! in. Once a slot is freed its generation moves on, so a stale handle (for
//! example a token from a readiness event queued before teardown) no longer
//! resolves even when the slot has been reused.

use mio::Token;

const INDEX_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: usize,
}

impl Handle {
    pub fn index(self) -> usize {
        self.index
    }

    pub fn token(self) -> Token {
        Token((self.generation << INDEX_BITS) | self.index)
    }

    pub fn from_token(token: Token) -> Handle {
        Handle {
            index: token.0 & INDEX_MASK,
            generation: token.0 >> INDEX_BITS,
        }
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied(T),
    Vacant(Option<usize>),
}

#[derive(Debug)]
struct Slot<T> {
    generation: usize,
    entry: Entry<T>,
}

#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Option<usize>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: None,
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        match self.free {
            Some(index) => {
                let slot = &mut self.slots[index];
                if let Entry::Vacant(next) = slot.entry {
                    self.free = next;
                }
                slot.entry = Entry::Occupied(value);
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Slot {
                    generation: 0,
                    entry: Entry::Occupied(value),
                });
                Handle { index, generation: 0 }
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation || matches!(slot.entry, Entry::Vacant(_)) {
            return None;
        }
        let entry = std::mem::replace(&mut slot.entry, Entry::Vacant(self.free));
        // The top generation is never used, keeping tokens clear of the reserved ones.
        slot.generation = (slot.generation + 1) % INDEX_MASK;
        self.free = Some(handle.index);
        self.len -= 1;
        match entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    /// Handles of every occupied slot.
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.entry, Entry::Occupied(_)))
            .map(|(index, slot)| Handle {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match &mut slot.entry {
                Entry::Occupied(value) => Some((
                    Handle {
                        index,
                        generation: slot.generation,
                    },
                    value,
                )),
                Entry::Vacant(_) => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_does_not_resolve_after_reuse() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        assert_eq!(slab.remove(a), Some("a"));

        let b = slab.insert("b");
        assert_eq!(a.index(), b.index());
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn token_round_trip() {
        let mut slab = Slab::new();
        let first = slab.insert(1);
        slab.remove(first);
        let h = slab.insert(2);
        assert_eq!(Handle::from_token(h.token()), h);
        assert_ne!(h.token(), first.token());
    }
}
