//! Registration cache: which user buffers are known, and which of them are
//! already registered with the backends.
//!
//! Registering memory with a NIC pins pages and programs translation tables,
//! which costs far more than a transfer setup. Collectives reuse the same user
//! buffers every iteration, so the mapper keeps every buffer it has seen here
//! and answers sub-range queries against larger registrations.

mod index;

pub use index::RegIndex;

use crate::backend::BackendRegId;
use crate::error::{CoreError, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opaque token for a cache entry.
///
/// Tokens are generation-checked: once an entry is removed, its token never
/// resolves again, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegHandle {
    index: u32,
    generation: u32,
}

/// Registration state of a cached buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegState {
    /// Known to the mapper but not yet registered with any backend.
    Cached,
    /// Registered; one backend handle per enabled backend, in backend order.
    Registered(Vec<BackendRegId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegEntry {
    pub addr: u64,
    pub len: usize,
    pub state: RegState,
}

impl RegEntry {
    pub fn cached(addr: u64, len: usize) -> Self {
        Self {
            addr,
            len,
            state: RegState::Cached,
        }
    }

    pub fn end(&self) -> u64 {
        self.addr + self.len as u64
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, RegState::Registered(_))
    }

    /// Backend handle for the backend at position `backend_idx`.
    pub fn backend_handle(&self, backend_idx: usize) -> Option<BackendRegId> {
        match &self.state {
            RegState::Registered(ids) => ids.get(backend_idx).copied(),
            RegState::Cached => None,
        }
    }
}

/// Thread-safe registration cache.
///
/// A single mutex guards the index. Single operations lock internally;
/// compound operations (search, then insert and register on a miss) take the
/// guard once via [`lock`](Self::lock) so concurrent callers cannot race the
/// same range into two entries.
#[derive(Default)]
pub struct RegCache {
    inner: Mutex<RegIndex>,
}

impl RegCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, RegIndex>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::LockPoisoned("registration cache"))
    }

    /// Copy of the entry behind `handle`, if it is still live.
    pub fn lookup(&self, handle: RegHandle) -> Result<Option<RegEntry>> {
        Ok(self.lock()?.get(handle).cloned())
    }

    pub fn search(&self, addr: u64, len: usize) -> Result<Option<RegHandle>> {
        Ok(self.lock()?.search(addr, len))
    }

    /// Insert a new entry, rejecting empty or overlapping ranges.
    pub fn insert(&self, entry: RegEntry) -> Result<RegHandle> {
        let mut index = self.lock()?;
        insert_checked(&mut index, entry)
    }

    pub fn remove(&self, handle: RegHandle) -> Result<Option<RegEntry>> {
        Ok(self.lock()?.remove(handle))
    }

    /// Every live handle; used by the teardown sweep.
    pub fn all_handles(&self) -> Result<Vec<RegHandle>> {
        Ok(self.lock()?.handles())
    }

    /// Remove and return every entry, recovering the index from a poisoned
    /// lock.
    pub fn drain(&self) -> Vec<RegEntry> {
        let mut index = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        index
            .handles()
            .into_iter()
            .filter_map(|h| index.remove(h))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

/// Validate and insert under an already-held guard.
pub(crate) fn insert_checked(index: &mut RegIndex, entry: RegEntry) -> Result<RegHandle> {
    if entry.len == 0 {
        return Err(CoreError::invalid_buffer(entry.addr, 0, "zero-length range"));
    }
    if entry.addr.checked_add(entry.len as u64).is_none() {
        return Err(CoreError::invalid_buffer(
            entry.addr,
            entry.len,
            "range wraps the address space",
        ));
    }
    if let Some(existing) = index.find_overlap(entry.addr, entry.len) {
        let (addr, len) = index
            .get(existing)
            .map(|e| (e.addr, e.len))
            .unwrap_or_default();
        return Err(CoreError::invalid_buffer(
            entry.addr,
            entry.len,
            format!("partially overlaps cached range 0x{addr:x} ({len} bytes)"),
        ));
    }
    Ok(index.insert(entry))
}
