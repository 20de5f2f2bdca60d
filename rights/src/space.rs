//! Capability tables (spaces)
//!
//! A space is a per-task table of entries: a slot arena with a free
//! list, a generation tag per slot, and a reverse index from port to
//! slot so send and receive rights to the same port coalesce into one
//! entry. The whole table sits behind a reader/writer lock; read-mostly
//! name resolution takes the read side only, mutation goes through
//! [`EntryGuard`] under the write side.
//!
//! Slot generations are bumped on every transition to or from the
//! unused state, so a name captured before a slot was recycled can
//! never resolve to the recycled occupant.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{RwLock, RwLockWriteGuard};

use crate::{
    entry::{Entry, RightKind},
    error::{Result, RightError},
    name::Name,
    object::PortRef,
};

/// Hard cap on table growth
const TABLE_MAX: usize = 1 << 20;

/// Space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u64);

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Key for the reverse index: the port's stable address
pub(crate) fn port_key(port: &PortRef) -> usize {
    Arc::as_ptr(port) as usize
}

/// One slot of the arena
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) entry: Option<Entry>,
    pub(crate) next_free: Option<u32>,
}

impl Slot {
    pub(crate) fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.generation = 1;
        }
    }
}

/// The lock-protected table body
pub(crate) struct Table {
    pub(crate) active: bool,
    pub(crate) slots: Vec<Slot>,
    pub(crate) free_head: Option<u32>,
    /// Port address -> slot index of the coalesced send/receive entry
    pub(crate) reverse: BTreeMap<usize, u32>,
}

impl Table {
    /// Resolve a name to its slot index, checking the generation
    pub(crate) fn resolve(&self, name: Name) -> Result<u32> {
        let index = name.index() as usize;
        match self.slots.get(index) {
            Some(slot) if slot.generation == name.generation() && slot.entry.is_some() => {
                Ok(index as u32)
            }
            _ => Err(RightError::InvalidName),
        }
    }

    /// Install an entry in a free slot, growing the arena on demand.
    /// Returns the slot index and the freshly generated name.
    pub(crate) fn alloc(&mut self, entry: Entry) -> Result<(u32, Name)> {
        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = slot.next_free.take();
                index
            }
            None => {
                if self.slots.len() >= TABLE_MAX {
                    return Err(RightError::ResourceShortage);
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                    next_free: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.bump_generation();
        slot.entry = Some(entry);
        Ok((index, Name::new(index, slot.generation)))
    }

    /// Vacate a slot: drop its entry, bump the generation, and chain it
    /// onto the free list. The caller has already removed any reverse
    /// mapping.
    pub(crate) fn free(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.entry = None;
        slot.bump_generation();
        slot.next_free = self.free_head;
        self.free_head = Some(index);
    }
}

/// Per-space statistics
#[derive(Default)]
pub struct SpaceStats {
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub entries_allocated: AtomicU64,
    pub entries_freed: AtomicU64,
}

/// A per-task capability table
pub struct Space {
    id: SpaceId,
    pub(crate) table: RwLock<Table>,
    stats: SpaceStats,
}

impl Space {
    /// Create an empty, active space
    pub fn new() -> Self {
        Self {
            id: SpaceId(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed)),
            table: RwLock::new(Table {
                active: true,
                slots: Vec::new(),
                free_head: None,
                reverse: BTreeMap::new(),
            }),
            stats: SpaceStats::default(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Whether the space has not been terminated
    pub fn is_active(&self) -> bool {
        self.table.read().active
    }

    /// Read-mostly name resolution: no write lock, no port lock.
    ///
    /// Returns the right kind and a shared reference to the port. Fails
    /// `InvalidRight` for entries without an object (dead names and
    /// port sets).
    pub fn lookup_read(&self, name: Name) -> Result<(RightKind, PortRef)> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let table = self.table.read();
        if !table.active {
            return Err(RightError::InvalidTask);
        }
        let index = match table.resolve(name) {
            Ok(index) => index,
            Err(e) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let entry = table.slots[index as usize]
            .entry
            .as_ref()
            .expect("entry present after resolve");
        match &entry.object {
            Some(port) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok((entry.kind, port.clone()))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(RightError::InvalidRight)
            }
        }
    }

    /// Resolve a name under the write lock, returning a mutation guard
    pub fn lookup_write(&self, name: Name) -> Result<EntryGuard<'_>> {
        let table = self.table.write();
        if !table.active {
            return Err(RightError::InvalidTask);
        }
        let index = table.resolve(name)?;
        Ok(EntryGuard { table, index, name })
    }

    /// Take the write lock for operations that may allocate entries
    pub(crate) fn write_table(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write()
    }

    pub(crate) fn note_alloc(&self) {
        self.stats.entries_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_free(&self) {
        self.stats.entries_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Enumerate live entries as (name, kind) pairs
    pub fn names(&self) -> Vec<(Name, RightKind)> {
        let table = self.table.read();
        table
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry
                    .as_ref()
                    .map(|e| (Name::new(index as u32, slot.generation), e.kind))
            })
            .collect()
    }

    /// Get statistics
    pub fn stats(&self) -> &SpaceStats {
        &self.stats
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        crate::rights::terminate(self);
    }
}

/// A validated, write-locked view of one entry.
///
/// Holding the guard pins the slot: the entry cannot be vacated or
/// recycled by anyone else, which is what makes it safe to take the
/// port lock afterwards.
pub struct EntryGuard<'a> {
    table: RwLockWriteGuard<'a, Table>,
    index: u32,
    name: Name,
}

impl EntryGuard<'_> {
    /// The name this guard resolved
    pub fn name(&self) -> Name {
        self.name
    }

    /// The guarded entry
    pub fn entry(&self) -> &Entry {
        self.table.slots[self.index as usize]
            .entry
            .as_ref()
            .expect("entry present while guard held")
    }

    /// The guarded entry, mutably
    pub fn entry_mut(&mut self) -> &mut Entry {
        self.table.slots[self.index as usize]
            .entry
            .as_mut()
            .expect("entry present while guard held")
    }

    /// Drop the reverse mapping for the entry's port, if present
    pub(crate) fn remove_reverse(&mut self) {
        let key = self.table.slots[self.index as usize]
            .entry
            .as_ref()
            .and_then(|e| e.object.as_ref().map(port_key));
        if let Some(key) = key {
            self.table.reverse.remove(&key);
        }
    }

    /// Vacate the slot, consuming the guard. Removes the reverse
    /// mapping first so a fresh entry for the same port can coalesce.
    pub(crate) fn free(mut self) {
        self.remove_reverse();
        let index = self.index;
        self.table.free(index);
    }
}
