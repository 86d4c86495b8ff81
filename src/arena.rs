//! Generational slot storage shared by every node and batch pool in the crate.
//!
//! The arena uses a sparse-set layout:
//!
//! - **Generational Indices**: a [`Handle`] holds a slot index and a
//!   generation. Reusing a slot bumps the generation, so stale handles from
//!   earlier frames resolve to `None` instead of aliasing the new value.
//!
//! - **Dense Storage**: values are stored contiguously for cache-friendly
//!   iteration.
//!
//! - **Sparse Map**: O(1) lookup from a stable handle to a dense position.
//!
//! - **Swap-Remove**: O(1) removal without holes in the dense storage.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Stable reference into an [`Arena<T>`].
///
/// - `index`: position in the sparse array (reused after removal)
/// - `generation`: version counter incremented whenever the slot is reused
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index, stable for the lifetime of the value.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Convert to a u64 for external use (debug output, hashing by hosts).
    /// Combines generation (high bits) with index (low bits).
    pub fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Entry in the sparse map, pointing to a dense array slot.
struct SparseEntry {
    dense_index: usize,
    generation: u32,
}

struct Slot<T> {
    value: T,
    /// Back-pointer to sparse array index (for swap-remove fixup)
    sparse_index: u32,
}

/// Arena-based storage with generational handles.
pub struct Arena<T> {
    dense: Vec<Slot<T>>,
    sparse: Vec<Option<SparseEntry>>,
    /// Generation last handed out for each sparse slot
    generations: Vec<u32>,
    free_indices: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            dense: Vec::new(),
            sparse: Vec::new(),
            generations: Vec::new(),
            free_indices: Vec::new(),
        }
    }

    /// Store a value and return its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let (sparse_index, generation) = if let Some(idx) = self.free_indices.pop() {
            // Reuse a freed slot - increment generation
            let generation = self.generations[idx as usize].wrapping_add(1);
            self.generations[idx as usize] = generation;
            (idx, generation)
        } else {
            let idx = self.sparse.len() as u32;
            self.sparse.push(None);
            self.generations.push(0);
            (idx, 0)
        };

        let dense_index = self.dense.len();
        self.dense.push(Slot {
            value,
            sparse_index,
        });
        self.sparse[sparse_index as usize] = Some(SparseEntry {
            dense_index,
            generation,
        });

        Handle::new(sparse_index, generation)
    }

    /// Remove a value, returning it if the handle was live.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let dense_index = self.dense_index(handle)?;
        let last_dense_index = self.dense.len() - 1;

        let removed = self.dense.swap_remove(dense_index);

        // Fix up the moved slot's sparse entry (if we didn't remove the last element)
        if dense_index != last_dense_index {
            let moved_sparse_idx = self.dense[dense_index].sparse_index;
            if let Some(entry) = self.sparse[moved_sparse_idx as usize].as_mut() {
                entry.dense_index = dense_index;
            }
        }

        self.sparse[handle.index as usize] = None;
        self.free_indices.push(handle.index);
        Some(removed.value)
    }

    fn dense_index(&self, handle: Handle<T>) -> Option<usize> {
        self.sparse
            .get(handle.index as usize)
            .and_then(|e| e.as_ref())
            .filter(|e| e.generation == handle.generation)
            .map(|e| e.dense_index)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.dense_index(handle).is_some()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.dense_index(handle).map(|i| &self.dense[i].value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.dense_index(handle)
            .map(move |i| &mut self.dense[i].value)
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Iterate live values in dense (not insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.dense.iter().map(move |slot| {
            let generation = self.generations[slot.sparse_index as usize];
            (Handle::new(slot.sparse_index, generation), &slot.value)
        })
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.dense.iter_mut().map(|slot| &mut slot.value)
    }

    /// Drop every value. Handles issued before the call stay stale forever.
    pub fn clear(&mut self) {
        for slot in self.dense.drain(..) {
            self.sparse[slot.sparse_index as usize] = None;
            self.free_indices.push(slot.sparse_index);
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::ops::Index<Handle<T>> for Arena<T> {
    type Output = T;

    /// Panics on a stale handle; use [`Arena::get`] where staleness is expected.
    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

impl<T> std::ops::IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_insert_remove() {
        let mut arena = Arena::new();
        let h = arena.insert(7);
        assert!(arena.contains(h));
        assert_eq!(arena.get(h), Some(&7));

        assert_eq!(arena.remove(h), Some(7));
        assert!(!arena.contains(h));
        assert_eq!(arena.remove(h), None);
    }

    #[test]
    fn test_arena_generational_index() {
        let mut arena = Arena::new();
        let h1 = arena.insert("a");
        arena.remove(h1);

        let h2 = arena.insert("b");

        // Stale handle must not alias the reused slot
        assert!(!arena.contains(h1));
        assert!(arena.contains(h2));
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
    }

    #[test]
    fn test_arena_swap_remove_fixup() {
        let mut arena = Arena::new();
        let h1 = arena.insert(1);
        let h2 = arena.insert(2);
        let h3 = arena.insert(3);

        // Removing the first moves the last into its dense position
        arena.remove(h1);

        assert_eq!(arena.get(h2), Some(&2));
        assert_eq!(arena.get(h3), Some(&3));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_arena_iter_yields_live_handles() {
        let mut arena = Arena::new();
        let h1 = arena.insert(10);
        let h2 = arena.insert(20);
        arena.remove(h1);
        let h3 = arena.insert(30);

        let mut seen: Vec<_> = arena.iter().map(|(h, v)| (h, *v)).collect();
        seen.sort_by_key(|(_, v)| *v);
        assert_eq!(seen, vec![(h2, 20), (h3, 30)]);
    }

    #[test]
    fn test_arena_clear_invalidates_handles() {
        let mut arena = Arena::new();
        let h = arena.insert(1);
        arena.clear();
        assert!(arena.is_empty());
        assert!(!arena.contains(h));
        let h2 = arena.insert(2);
        assert!(!arena.contains(h));
        assert!(arena.contains(h2));
    }
}
