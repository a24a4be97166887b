//! Reliable-connected queue pairs.
//!
//! Two-phase construction:
//! 1. `IbContext::prepare_qp()` creates a QP in INIT state.
//! 2. Exchange `qp_num` and GID with the peer over the bootstrap.
//! 3. `PreparedQp::complete()` walks INIT → RTR → RTS.

use super::context::IbContext;
use coltran::error::{CoreError, Result};
use ibverbs_sys::{
    ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_wr_opcode,
};
use std::os::raw::c_int;
use std::ptr;

/// What the peer needs to connect to one of our queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpEndpoint {
    pub qp_num: u32,
    pub gid: [u8; 16],
}

/// A QP in INIT state, ready for endpoint exchange and handshake.
pub struct PreparedQp {
    qp: *mut ibverbs_sys::ibv_qp,
    qp_num: u32,
    port: u8,
    gid_index: u8,
}

unsafe impl Send for PreparedQp {}
unsafe impl Sync for PreparedQp {}

impl PreparedQp {
    pub(super) fn create(ctx: &IbContext, max_send_wr: u32, max_recv_wr: u32) -> Result<Self> {
        unsafe {
            let mut init: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init.qp_type = ibv_qp_type::IBV_QPT_RC;
            init.send_cq = ctx.cq;
            init.recv_cq = ctx.cq;
            init.cap.max_send_wr = max_send_wr;
            init.cap.max_recv_wr = max_recv_wr;
            init.cap.max_send_sge = 1;
            init.cap.max_recv_sge = 1;

            let qp = ibverbs_sys::ibv_create_qp(ctx.pd, &mut init);
            if qp.is_null() {
                return Err(CoreError::backend_with_source(
                    "ib: ibv_create_qp failed",
                    std::io::Error::last_os_error(),
                ));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = ctx.port();
            attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                .0;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

            let rc = ibverbs_sys::ibv_modify_qp(qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                ibverbs_sys::ibv_destroy_qp(qp);
                return Err(CoreError::backend(format!(
                    "ib: ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }

            Ok(Self {
                qp,
                qp_num: (*qp).qp_num,
                port: ctx.port(),
                gid_index: ctx.gid_index(),
            })
        }
    }

    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Complete the handshake with the remote peer's endpoint.
    pub fn complete(mut self, remote: QpEndpoint) -> Result<QueuePair> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 4;
            attr.min_rnr_timer = 12;
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = self.gid_index;
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.port_num = self.port;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CoreError::backend(format!(
                    "ib: ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 4;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CoreError::backend(format!(
                    "ib: ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }
        }

        // Ownership moves to the connected QP.
        let qp = std::mem::replace(&mut self.qp, ptr::null_mut());
        Ok(QueuePair { qp })
    }
}

impl Drop for PreparedQp {
    fn drop(&mut self) {
        if !self.qp.is_null() {
            unsafe {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
        }
    }
}

/// Local side of one posted transfer.
#[derive(Debug, Clone, Copy)]
pub struct LocalSge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// A connected QP. Completions land on the context's shared CQ.
pub struct QueuePair {
    qp: *mut ibverbs_sys::ibv_qp,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// Post a signalled two-sided send.
    pub fn post_send(&self, wr_id: u64, sge: LocalSge) -> Result<()> {
        unsafe {
            let mut list = to_sge(sge);
            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut list;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            self.post(&mut wr)
        }
    }

    /// Post a signalled RDMA write, carrying `imm` to the peer's receive
    /// queue when set.
    pub fn post_write(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote_addr: u64,
        rkey: u32,
        imm: Option<u32>,
    ) -> Result<()> {
        unsafe {
            let mut list = to_sge(sge);
            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut list;
            wr.num_sge = 1;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            match imm {
                Some(imm) => {
                    wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                    wr.__bindgen_anon_1.imm_data = imm.to_be();
                }
                None => wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            }
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;
            self.post(&mut wr)
        }
    }

    /// Post a receive into `sge`.
    pub fn post_recv(&self, wr_id: u64, sge: LocalSge) -> Result<()> {
        unsafe {
            let mut list = to_sge(sge);
            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut list;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let post_recv = (*ctx)
                .ops
                .post_recv
                .ok_or_else(|| CoreError::backend("ib: provider has no post_recv"))?;
            let rc = post_recv(self.qp, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(CoreError::backend(format!(
                    "ib: post_recv failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    unsafe fn post(&self, wr: &mut ibverbs_sys::ibv_send_wr) -> Result<()> {
        unsafe {
            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let post_send = (*ctx)
                .ops
                .post_send
                .ok_or_else(|| CoreError::backend("ib: provider has no post_send"))?;
            let rc = post_send(self.qp, wr, &mut bad_wr);
            if rc != 0 {
                return Err(CoreError::backend(format!(
                    "ib: post_send failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }
}

fn to_sge(sge: LocalSge) -> ibverbs_sys::ibv_sge {
    ibverbs_sys::ibv_sge {
        addr: sge.addr,
        length: sge.len,
        lkey: sge.lkey,
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if !self.qp.is_null() {
            unsafe {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
        }
    }
}
