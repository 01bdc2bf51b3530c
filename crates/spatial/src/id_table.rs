use serde::{Deserialize, Serialize};

/// Generational handle to one piece of spatial data.
///
/// Generation 0 is never handed out, so the default handle is always invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpatialDataHandle {
    index: u32,
    generation: u32,
}

impl SpatialDataHandle {
    pub const INVALID: Self = Self {
        index: 0,
        generation: 0,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_invalid(&self) -> bool {
        self.generation == 0
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot-recycling table keyed by [`SpatialDataHandle`].
///
/// Freed slots go on a free list and are reused with a bumped generation, so
/// stale handles are detected by generation mismatch.
#[derive(Debug)]
pub struct IdTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> IdTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> SpatialDataHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SpatialDataHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        SpatialDataHandle {
            index,
            generation: 1,
        }
    }

    /// Remove the value behind `handle`. Stale handles are ignored.
    pub fn remove(&mut self, handle: SpatialDataHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    pub fn get(&self, handle: SpatialDataHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: SpatialDataHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Access by raw slot index, ignoring generations. Used when walking grids,
    /// which only know data indices.
    pub fn get_by_index_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: SpatialDataHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated (live + free); upper bound of data indices.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handle_is_invalid() {
        let table: IdTable<u32> = IdTable::new();
        assert!(SpatialDataHandle::default().is_invalid());
        assert!(table.get(SpatialDataHandle::INVALID).is_none());
    }

    #[test]
    fn insert_get_remove() {
        let mut table = IdTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));

        assert_eq!(table.remove(a), Some("a"));
        assert!(table.get(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let mut table = IdTable::new();
        let a = table.insert(1);
        table.remove(a);
        let b = table.insert(2);

        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b), Some(&2));
        assert_eq!(table.slot_count(), 1);
    }

    #[test]
    fn double_free_is_noop() {
        let mut table = IdTable::new();
        let a = table.insert(1);
        let _b = table.insert(2);
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);

        // The stale handle must not free the slot a second time.
        let c = table.insert(3);
        let d = table.insert(4);
        assert_ne!(c.index(), d.index());
    }

    #[test]
    fn get_by_index_ignores_generation() {
        let mut table = IdTable::new();
        let a = table.insert(10);
        *table.get_by_index_mut(a.index()).unwrap() += 1;
        assert_eq!(table.get(a), Some(&11));
        table.remove(a);
        assert!(table.get_by_index_mut(a.index()).is_none());
    }
}
