//! Control-message plumbing: wire record, work-request ids, host slots.
//!
//! A control message tells the peer where a registered buffer lives and which
//! rkey grants access to it. Messages travel as two-sided sends out of small
//! pre-registered host slots; free send slots are recycled through a
//! lock-free queue, receive slots are reposted as soon as they are consumed.

use crate::verbs::{IbContext, LocalSge, MemoryRegion};
use coltran::error::{CoreError, Result};
use coltran::types::Rank;
use crossbeam_queue::ArrayQueue;
use rkyv::util::AlignedVec;

/// Bytes reserved per control slot.
pub const SLOT_SIZE: usize = 64;

/// Buffer announcement sent ahead of a put.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMsg {
    pub addr: u64,
    pub rkey: u32,
}

impl ControlMsg {
    pub fn encode(&self) -> Result<AlignedVec> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| CoreError::backend(format!("ib: control encode failed: {e}")))?;
        if bytes.len() > SLOT_SIZE {
            return Err(CoreError::backend(format!(
                "ib: control message of {} bytes exceeds slot size {SLOT_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| CoreError::backend(format!("ib: malformed control message: {e}")))
    }
}

/// What a work request was posted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    CtrlSend,
    Recv,
    Put,
}

impl WorkKind {
    const fn tag(self) -> u64 {
        match self {
            WorkKind::CtrlSend => 1,
            WorkKind::Recv => 2,
            WorkKind::Put => 3,
        }
    }

    const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(WorkKind::CtrlSend),
            2 => Some(WorkKind::Recv),
            3 => Some(WorkKind::Put),
            _ => None,
        }
    }
}

const PEER_MASK: u64 = 0xff_ffff;

/// Pack kind, peer and index into a work-request id:
/// `[kind:8][peer:24][index:32]`.
pub fn pack_wr_id(kind: WorkKind, peer: Rank, index: u32) -> u64 {
    (kind.tag() << 56) | ((peer as u64 & PEER_MASK) << 32) | index as u64
}

pub fn unpack_wr_id(wr_id: u64) -> Option<(WorkKind, Rank, u32)> {
    let kind = WorkKind::from_tag(wr_id >> 56)?;
    Some((kind, ((wr_id >> 32) & PEER_MASK) as Rank, wr_id as u32))
}

/// Heap memory handed to the NIC. Freed only after its region is released.
struct RawBuf {
    ptr: *mut u8,
    len: usize,
}

impl Drop for RawBuf {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// A run of `SLOT_SIZE` host slots registered as one region.
pub struct HostSlab {
    // Declared first: deregistered before `buf` is freed.
    region: MemoryRegion,
    buf: RawBuf,
    slots: usize,
}

unsafe impl Send for HostSlab {}
unsafe impl Sync for HostSlab {}

impl HostSlab {
    pub fn new(ctx: &IbContext, slots: usize) -> Result<Self> {
        let len = slots * SLOT_SIZE;
        let boxed = vec![0u8; len].into_boxed_slice();
        let buf = RawBuf {
            ptr: Box::into_raw(boxed) as *mut u8,
            len,
        };
        let region = unsafe { ctx.register(buf.ptr as u64, len)? };
        Ok(Self { region, buf, slots })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot_addr(&self, index: u32) -> Result<u64> {
        if index as usize >= self.slots {
            return Err(CoreError::backend(format!(
                "ib: control slot {index} out of range ({} slots)",
                self.slots
            )));
        }
        Ok(self.buf.ptr as u64 + index as u64 * SLOT_SIZE as u64)
    }

    /// Scatter entry covering `len` bytes of slot `index`.
    pub fn sge(&self, index: u32, len: usize) -> Result<LocalSge> {
        Ok(LocalSge {
            addr: self.slot_addr(index)?,
            len: len.min(SLOT_SIZE) as u32,
            lkey: self.region.lkey(),
        })
    }

    /// Copy `bytes` into slot `index`.
    ///
    /// # Safety
    /// The slot must not be owned by a posted work request.
    pub unsafe fn write(&self, index: u32, bytes: &[u8]) -> Result<()> {
        let addr = self.slot_addr(index)?;
        let n = bytes.len().min(SLOT_SIZE);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, n) };
        Ok(())
    }

    /// Copy `len` bytes out of slot `index`.
    ///
    /// # Safety
    /// The receive that filled the slot must have completed and not yet been
    /// reposted.
    pub unsafe fn read(&self, index: u32, len: usize) -> Result<Vec<u8>> {
        let addr = self.slot_addr(index)?;
        let n = len.min(SLOT_SIZE);
        Ok(unsafe { std::slice::from_raw_parts(addr as *const u8, n) }.to_vec())
    }
}

/// Send slots shared by all peers plus a fixed receive ring per peer.
pub struct CtrlSlots {
    pub send: HostSlab,
    pub free: ArrayQueue<u32>,
    pub recv: HostSlab,
    recv_depth: u32,
}

impl CtrlSlots {
    pub fn new(ctx: &IbContext, send_slots: usize, world_size: u32, recv_depth: u32) -> Result<Self> {
        let send = HostSlab::new(ctx, send_slots)?;
        let recv = HostSlab::new(ctx, world_size as usize * recv_depth as usize)?;
        let free = ArrayQueue::new(send_slots.max(1));
        for i in 0..send_slots as u32 {
            let _ = free.push(i);
        }
        Ok(Self {
            send,
            free,
            recv,
            recv_depth,
        })
    }

    pub fn recv_depth(&self) -> u32 {
        self.recv_depth
    }

    /// Receive slot `k` of `peer`'s ring.
    pub fn recv_slot(&self, peer: Rank, k: u32) -> u32 {
        peer * self.recv_depth + k
    }
}
