//! Per-device verbs resources: device context, protection domain, completion queue.

use super::mr::MemoryRegion;
use super::qp::PreparedQp;
use coltran::error::{CoreError, Result};
use ibverbs_sys::ibv_access_flags;
use std::io;
use std::os::raw::c_int;
use std::ptr;

/// Shared per-device verbs resources.
///
/// One completion queue serves every queue pair created from this context,
/// for both send and receive completions, so a single poll loop drives the
/// whole backend.
pub struct IbContext {
    pub(super) ctx: *mut ibverbs_sys::ibv_context,
    pub(super) pd: *mut ibverbs_sys::ibv_pd,
    pub(super) cq: *mut ibverbs_sys::ibv_cq,
    port: u8,
    gid_index: u8,
}

unsafe impl Send for IbContext {}
unsafe impl Sync for IbContext {}

impl IbContext {
    /// Open a verbs device and allocate the PD and CQ.
    ///
    /// `device_index` selects which device to use (default: first).
    pub fn open(device_index: Option<usize>, port: u8, gid_index: u8, cq_depth: usize) -> Result<Self> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                if !dev_list.is_null() {
                    ibverbs_sys::ibv_free_device_list(dev_list);
                }
                return Err(CoreError::backend("ib: no verbs devices found"));
            }

            let idx = device_index.unwrap_or(0);
            if idx >= num_devices as usize {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(CoreError::backend(format!(
                    "ib: device index {idx} out of range (have {num_devices})"
                )));
            }

            let dev = *dev_list.add(idx);
            let ctx = ibverbs_sys::ibv_open_device(dev);
            let open_err = io::Error::last_os_error();
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(CoreError::backend_with_source(
                    "ib: ibv_open_device failed",
                    open_err,
                ));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                let err = io::Error::last_os_error();
                ibverbs_sys::ibv_close_device(ctx);
                return Err(CoreError::backend_with_source("ib: ibv_alloc_pd failed", err));
            }

            let cq = ibverbs_sys::ibv_create_cq(
                ctx,
                c_int::try_from(cq_depth).unwrap_or(c_int::MAX),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if cq.is_null() {
                let err = io::Error::last_os_error();
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(CoreError::backend_with_source(
                    format!("ib: ibv_create_cq(depth={cq_depth}) failed"),
                    err,
                ));
            }

            Ok(Self {
                ctx,
                pd,
                cq,
                port,
                gid_index,
            })
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    /// GID used to address this port (IB and RoCE alike).
    pub fn gid(&self) -> Result<[u8; 16]> {
        unsafe {
            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc =
                ibverbs_sys::ibv_query_gid(self.ctx, self.port, self.gid_index as c_int, &mut gid);
            if rc != 0 {
                return Err(CoreError::backend(format!(
                    "ib: ibv_query_gid(port={}, index={}) failed (rc={rc})",
                    self.port, self.gid_index
                )));
            }
            Ok(gid.raw)
        }
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    /// Register `[addr, addr + len)` for local writes and remote reads/writes.
    ///
    /// # Safety
    /// The range must stay allocated until the returned region is released.
    pub unsafe fn register(&self, addr: u64, len: usize) -> Result<MemoryRegion> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        let mr = unsafe { ibverbs_sys::ibv_reg_mr(self.pd, addr as *mut _, len, access.0 as c_int) };
        if mr.is_null() {
            return Err(CoreError::RegistrationFailure {
                backend: "ib",
                op: "register",
                addr,
                len,
                reason: format!("ibv_reg_mr: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(MemoryRegion::new(mr, addr, len))
    }

    /// Create an RC queue pair in INIT state bound to the shared CQ.
    pub fn prepare_qp(&self, max_send_wr: u32, max_recv_wr: u32) -> Result<PreparedQp> {
        PreparedQp::create(self, max_send_wr, max_recv_wr)
    }

    /// Drain up to `wcs.len()` completions without blocking.
    pub fn poll(&self, wcs: &mut [ibverbs_sys::ibv_wc]) -> Result<usize> {
        unsafe {
            let poll_cq = (*self.ctx)
                .ops
                .poll_cq
                .ok_or_else(|| CoreError::backend("ib: provider has no poll_cq"))?;
            let n = poll_cq(self.cq, wcs.len() as c_int, wcs.as_mut_ptr());
            if n < 0 {
                return Err(CoreError::backend(format!("ib: poll_cq failed (rc={n})")));
            }
            Ok(n as usize)
        }
    }
}

impl Drop for IbContext {
    fn drop(&mut self) {
        unsafe {
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}
