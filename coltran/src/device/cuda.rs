//! CUDA device adapter.
//!
//! Uses cudarc 0.19 driver bindings: pointer attributes to decide whether a
//! buffer is a device allocation, and `cuMemcpyAsync` plus an event per copy
//! for the local copy path. Unified addressing lets one call cover every
//! copy direction.

use super::adapter::{CopyFence, DeviceAdapter};
use crate::error::{CoreError, Result};
use crate::types::{MemoryKind, StreamHandle};
use cudarc::driver::result;
use cudarc::driver::sys;
use std::sync::Arc;

/// Device adapter for NVIDIA GPUs using cudarc.
pub struct CudaAdapter {
    ctx: Arc<cudarc::driver::CudaContext>,
}

impl CudaAdapter {
    /// Create a new CUDA adapter for the given GPU ordinal.
    pub fn new(device_ordinal: u32) -> Result<Self> {
        let ctx = cudarc::driver::CudaContext::new(device_ordinal as usize).map_err(|e| {
            CoreError::device_with_source(
                format!("failed to create CUDA context for GPU {device_ordinal}"),
                e,
            )
        })?;
        Ok(Self { ctx })
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| CoreError::device_with_source("CUDA bind_to_thread failed", e))
    }
}

impl DeviceAdapter for CudaAdapter {
    fn memory_kind(&self, addr: u64) -> Result<MemoryKind> {
        self.bind()?;

        let mut is_managed: u32 = 0;
        let rc = unsafe {
            sys::cuPointerGetAttribute(
                &mut is_managed as *mut u32 as *mut std::ffi::c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_IS_MANAGED,
                addr as sys::CUdeviceptr,
            )
        };
        if rc == sys::cudaError_enum::CUDA_ERROR_INVALID_VALUE {
            // Pointer unknown to the driver: plain pageable host memory.
            return Ok(MemoryKind::Unregistered);
        }
        rc.result()
            .map_err(|e| CoreError::device_with_source("cuPointerGetAttribute(IS_MANAGED)", e))?;
        if is_managed != 0 {
            return Ok(MemoryKind::Managed);
        }

        let mut mem_type = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        unsafe {
            sys::cuPointerGetAttribute(
                &mut mem_type as *mut sys::CUmemorytype as *mut std::ffi::c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                addr as sys::CUdeviceptr,
            )
        }
        .result()
        .map_err(|e| CoreError::device_with_source("cuPointerGetAttribute(MEMORY_TYPE)", e))?;

        Ok(match mem_type {
            sys::CUmemorytype::CU_MEMORYTYPE_DEVICE => MemoryKind::Device,
            sys::CUmemorytype::CU_MEMORYTYPE_UNIFIED => MemoryKind::Managed,
            _ => MemoryKind::Host,
        })
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        self.bind()?;
        let stream = result::stream::create(result::stream::StreamKind::NonBlocking)
            .map_err(|e| CoreError::device_with_source("cuStreamCreate failed", e))?;
        Ok(stream as usize as StreamHandle)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if stream == 0 {
            return Ok(());
        }
        self.bind()?;
        unsafe { result::stream::destroy(stream as usize as sys::CUstream) }
            .map_err(|e| CoreError::device_with_source("cuStreamDestroy failed", e))
    }

    unsafe fn copy_async(
        &self,
        dst: u64,
        src: u64,
        len: usize,
        stream: StreamHandle,
    ) -> Result<Box<dyn CopyFence>> {
        self.bind()?;
        let stream = stream as usize as sys::CUstream;
        unsafe {
            sys::cuMemcpyAsync(dst as sys::CUdeviceptr, src as sys::CUdeviceptr, len, stream)
        }
        .result()
        .map_err(|e| CoreError::device_with_source("cuMemcpyAsync failed", e))?;

        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| CoreError::device_with_source("cuEventCreate failed", e))?;
        if let Err(e) = unsafe { result::event::record(event, stream) } {
            let _ = unsafe { result::event::destroy(event) };
            return Err(CoreError::device_with_source("cuEventRecord failed", e));
        }
        Ok(Box::new(CudaFence {
            event,
            ctx: Arc::clone(&self.ctx),
        }))
    }
}

/// Event recorded behind an async copy.
struct CudaFence {
    event: sys::CUevent,
    ctx: Arc<cudarc::driver::CudaContext>,
}

// The event handle is only touched through driver calls, which are thread-safe.
unsafe impl Send for CudaFence {}

impl CopyFence for CudaFence {
    fn is_complete(&self) -> Result<bool> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| CoreError::device_with_source("CUDA bind_to_thread failed", e))?;
        let rc = unsafe { sys::cuEventQuery(self.event) };
        if rc == sys::cudaError_enum::CUDA_ERROR_NOT_READY {
            return Ok(false);
        }
        rc.result()
            .map_err(|e| CoreError::device_with_source("cuEventQuery failed", e))?;
        Ok(true)
    }
}

impl Drop for CudaFence {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_ok() {
            let _ = unsafe { result::event::destroy(self.event) };
        }
    }
}
