use super::adapter::{CopyFence, DeviceAdapter, ReadyFence};
use crate::error::{CoreError, Result};
use crate::types::{MemoryKind, StreamHandle};
use std::sync::atomic::{AtomicU64, Ordering};

/// Device adapter for plain host memory.
///
/// Copies run synchronously, so every fence is ready on return. By default
/// every pointer reports [`MemoryKind::Host`] and is refused for
/// registration; [`HostAdapter::device_emulating`] reports host allocations
/// as device memory so the registration and transfer paths can run on
/// machines without a GPU.
#[derive(Debug)]
pub struct HostAdapter {
    reported: MemoryKind,
    next_stream: AtomicU64,
}

impl HostAdapter {
    pub fn new() -> Self {
        Self {
            reported: MemoryKind::Host,
            next_stream: AtomicU64::new(1),
        }
    }

    pub fn device_emulating() -> Self {
        Self {
            reported: MemoryKind::Device,
            next_stream: AtomicU64::new(1),
        }
    }
}

impl Default for HostAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAdapter for HostAdapter {
    fn memory_kind(&self, addr: u64) -> Result<MemoryKind> {
        if addr == 0 {
            return Ok(MemoryKind::Unregistered);
        }
        Ok(self.reported)
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        Ok(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    fn destroy_stream(&self, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    unsafe fn copy_async(
        &self,
        dst: u64,
        src: u64,
        len: usize,
        _stream: StreamHandle,
    ) -> Result<Box<dyn CopyFence>> {
        if len == 0 {
            return Ok(Box::new(ReadyFence));
        }
        if dst == 0 || src == 0 {
            return Err(CoreError::device("host copy with null pointer"));
        }
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, len);
        }
        Ok(Box::new(ReadyFence))
    }
}
