use super::{RegEntry, RegHandle};
use std::collections::BTreeMap;

enum Slot {
    Vacant { generation: u32 },
    Occupied { generation: u32, entry: RegEntry },
}

/// Address-ordered registry of disjoint buffer ranges.
///
/// Entries live in an arena addressed by generation-checked [`RegHandle`]s;
/// a `BTreeMap` keyed by start address gives O(log n) containment search.
/// Because live ranges never overlap, the only candidate that can contain
/// `[addr, addr + len)` is the entry with the greatest start `<= addr`.
#[derive(Default)]
pub struct RegIndex {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_addr: BTreeMap<u64, u32>,
}

impl RegIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn get(&self, handle: RegHandle) -> Option<&RegEntry> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == handle.generation => {
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: RegHandle) -> Option<&mut RegEntry> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, entry } if *generation == handle.generation => {
                Some(entry)
            }
            _ => None,
        }
    }

    /// Handle of the live entry whose range fully contains `[addr, addr + len)`.
    pub fn search(&self, addr: u64, len: usize) -> Option<RegHandle> {
        let end = addr.checked_add(len as u64)?;
        let (_, &index) = self.by_addr.range(..=addr).next_back()?;
        match &self.slots[index as usize] {
            // An empty query at the entry's end lies outside it.
            Slot::Occupied { generation, entry } if addr < entry.end() && end <= entry.end() => {
                Some(RegHandle {
                    index,
                    generation: *generation,
                })
            }
            _ => None,
        }
    }

    /// Any live entry intersecting `[addr, addr + len)`.
    pub fn find_overlap(&self, addr: u64, len: usize) -> Option<RegHandle> {
        let end = addr.saturating_add(len as u64);
        // Predecessor may extend into the range; otherwise the first entry
        // starting inside it is the overlap.
        let pred = self.by_addr.range(..=addr).next_back();
        let inner = self.by_addr.range(addr..end).next();
        for (_, &index) in pred.into_iter().chain(inner) {
            if let Slot::Occupied { generation, entry } = &self.slots[index as usize]
                && entry.addr < end
                && entry.end() > addr
            {
                return Some(RegHandle {
                    index,
                    generation: *generation,
                });
            }
        }
        None
    }

    /// Insert an entry. The caller guarantees it does not overlap a live one.
    pub fn insert(&mut self, entry: RegEntry) -> RegHandle {
        debug_assert!(self.find_overlap(entry.addr, entry.len).is_none());
        let addr = entry.addr;
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let generation = match slot {
                    Slot::Vacant { generation } => generation.wrapping_add(1),
                    Slot::Occupied { .. } => unreachable!("free list holds an occupied slot"),
                };
                *slot = Slot::Occupied { generation, entry };
                RegHandle { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    entry,
                });
                RegHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_addr.insert(addr, handle.index);
        handle
    }

    pub fn remove(&mut self, handle: RegHandle) -> Option<RegEntry> {
        self.get(handle)?;
        let slot = std::mem::replace(
            &mut self.slots[handle.index as usize],
            Slot::Vacant {
                generation: handle.generation,
            },
        );
        let Slot::Occupied { entry, .. } = slot else {
            return None;
        };
        self.by_addr.remove(&entry.addr);
        self.free.push(handle.index);
        Some(entry)
    }

    /// Handles of every live entry, in address order.
    pub fn handles(&self) -> Vec<RegHandle> {
        self.by_addr
            .values()
            .filter_map(|&index| match &self.slots[index as usize] {
                Slot::Occupied { generation, .. } => Some(RegHandle {
                    index,
                    generation: *generation,
                }),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}
