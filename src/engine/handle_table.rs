//! Fixed-capacity handle table
//!
//! Slots are individually locked so that operations on different handles never
//! contend. Each slot carries a generation counter that is bumped when its
//! entry is removed; a [`HandleId`] minted for an earlier occupant therefore
//! never resolves to a later one.

use crate::error::MqttError;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque reference to a client handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId {
    index: u16,
    generation: u32,
}

impl HandleId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<T>>,
}

pub struct HandleTable<T> {
    slots: Box<[Mutex<Slot<T>>]>,
}

fn lock<T>(slot: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> HandleTable<T> {
    /// Capacity is clamped to the `u16` index space
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    generation: 0,
                    entry: None,
                })
            })
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| lock(slot).entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a new entry in the first free slot.
    ///
    /// `make` receives the id the entry will be reachable under. Fails with
    /// `NoMem` when every slot is occupied.
    pub fn insert_with<F>(&self, make: F) -> Result<HandleId, MqttError>
    where
        F: FnOnce(HandleId) -> Result<T, MqttError>,
    {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = lock(slot);
            if slot.entry.is_some() {
                continue;
            }
            let id = HandleId {
                index: index as u16,
                generation: slot.generation,
            };
            slot.entry = Some(Arc::new(make(id)?));
            return Ok(id);
        }
        Err(MqttError::NoMem { resource: "handles" })
    }

    /// Resolve `id`, failing with `HandleNotFound` for free or stale slots
    pub fn get(&self, id: HandleId) -> Result<Arc<T>, MqttError> {
        let slot = self.slots.get(id.index()).ok_or(MqttError::HandleNotFound)?;
        let slot = lock(slot);
        match &slot.entry {
            Some(entry) if slot.generation == id.generation => Ok(Arc::clone(entry)),
            _ => Err(MqttError::HandleNotFound),
        }
    }

    /// Remove `id` if `check` approves, bumping the slot generation.
    ///
    /// Fails with `InvalidHandle` when `id` does not name a live entry.
    /// `check` runs under the slot lock.
    pub fn remove_if<F>(&self, id: HandleId, check: F) -> Result<Arc<T>, MqttError>
    where
        F: FnOnce(&T) -> Result<(), MqttError>,
    {
        let slot = self.slots.get(id.index()).ok_or(MqttError::InvalidHandle)?;
        let mut slot = lock(slot);
        match &slot.entry {
            Some(entry) if slot.generation == id.generation => check(&**entry)?,
            _ => return Err(MqttError::InvalidHandle),
        }
        let entry = slot.entry.take().ok_or(MqttError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(entry)
    }

    /// Snapshot of every live entry, taking one slot lock at a time
    pub fn entries(&self) -> Vec<(HandleId, Arc<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let slot = lock(slot);
                slot.entry.as_ref().map(|entry| {
                    (
                        HandleId {
                            index: index as u16,
                            generation: slot.generation,
                        },
                        Arc::clone(entry),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let table: HandleTable<&str> = HandleTable::with_capacity(2);
        let a = table.insert_with(|_| Ok("a")).unwrap();
        let b = table.insert_with(|_| Ok("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        let result = table.insert_with(|_| Ok("c"));
        assert!(matches!(result, Err(MqttError::NoMem { .. })));
    }

    #[test]
    fn test_get_resolves_live_entries() {
        let table = HandleTable::with_capacity(1);
        let id = table.insert_with(|id| Ok(id.index())).unwrap();
        assert_eq!(*table.get(id).unwrap(), 0);
    }

    #[test]
    fn test_stale_id_never_resolves_to_new_occupant() {
        let table = HandleTable::with_capacity(1);
        let old = table.insert_with(|_| Ok("old")).unwrap();
        table.remove_if(old, |_| Ok(())).unwrap();

        let new = table.insert_with(|_| Ok("new")).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(matches!(table.get(old), Err(MqttError::HandleNotFound)));
        assert!(matches!(table.remove_if(old, |_| Ok(())), Err(MqttError::InvalidHandle)));
        assert_eq!(*table.get(new).unwrap(), "new");
    }

    #[test]
    fn test_remove_respects_check() {
        let table = HandleTable::with_capacity(1);
        let id = table.insert_with(|_| Ok(5)).unwrap();

        let refused = table.remove_if(id, |_| Err(MqttError::bad_arg("busy")));
        assert!(refused.is_err());
        assert!(table.get(id).is_ok());

        table.remove_if(id, |_| Ok(())).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_failed_construction_leaves_slot_free() {
        let table: HandleTable<u8> = HandleTable::with_capacity(1);
        assert!(table.insert_with(|_| Err(MqttError::bad_arg("no"))).is_err());
        assert!(table.insert_with(|_| Ok(1)).is_ok());
    }

    #[test]
    fn test_entries_snapshot() {
        let table = HandleTable::with_capacity(3);
        let a = table.insert_with(|_| Ok('a')).unwrap();
        let _b = table.insert_with(|_| Ok('b')).unwrap();
        table.remove_if(a, |_| Ok(())).unwrap();

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(*entries[0].1, 'b');
    }
}
