//! Registered memory regions and the table that hands out their ids.

use coltran::backend::BackendRegId;
use coltran::error::{CoreError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A buffer registered with the protection domain.
pub struct MemoryRegion {
    mr: *mut ibverbs_sys::ibv_mr,
    addr: u64,
    len: usize,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    pub(super) fn new(mr: *mut ibverbs_sys::ibv_mr, addr: u64, len: usize) -> Self {
        Self { mr, addr, len }
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> RegionKeys {
        RegionKeys {
            addr: self.addr,
            len: self.len,
            lkey: self.lkey(),
            rkey: self.rkey(),
        }
    }

    /// Deregister now and report the verbs status.
    pub fn deregister(mut self) -> Result<()> {
        let mr = std::mem::replace(&mut self.mr, std::ptr::null_mut());
        let rc = unsafe { ibverbs_sys::ibv_dereg_mr(mr) };
        if rc != 0 {
            return Err(CoreError::RegistrationFailure {
                backend: "ib",
                op: "deregister",
                addr: self.addr,
                len: self.len,
                reason: format!("ibv_dereg_mr returned {rc}"),
            });
        }
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            unsafe {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
        }
    }
}

/// Everything needed to post work against a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionKeys {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

impl RegionKeys {
    /// Whether `[addr, addr + len)` lies inside the region.
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        match (
            self.addr.checked_add(self.len as u64),
            addr.checked_add(len as u64),
        ) {
            (Some(end), Some(req_end)) => addr >= self.addr && req_end <= end,
            _ => false,
        }
    }
}

/// Live user-buffer registrations keyed by the id handed to the mapper.
#[derive(Default)]
pub struct MrTable {
    next_id: AtomicU64,
    regions: Mutex<HashMap<u64, MemoryRegion>>,
}

impl MrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mr: MemoryRegion) -> Result<BackendRegId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib mr table"))?
            .insert(id, mr);
        Ok(BackendRegId(id))
    }

    pub fn remove(&self, id: BackendRegId) -> Result<MemoryRegion> {
        self.regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib mr table"))?
            .remove(&id.0)
            .ok_or_else(|| CoreError::RegistrationFailure {
                backend: "ib",
                op: "deregister",
                addr: 0,
                len: 0,
                reason: format!("unknown registration {}", id.0),
            })
    }

    pub fn keys(&self, id: BackendRegId) -> Result<RegionKeys> {
        self.regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib mr table"))?
            .get(&id.0)
            .map(MemoryRegion::keys)
            .ok_or_else(|| CoreError::backend(format!("ib: unknown registration {}", id.0)))
    }

    pub fn len(&self) -> usize {
        self.regions.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
