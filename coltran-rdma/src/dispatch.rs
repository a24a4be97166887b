//! Completion bookkeeping for the verbs backend.
//!
//! Tracks the tokens of posted sends and writes, pairs control announcements
//! with waiting receives and counts notifications per peer. None of it touches
//! the device: the backend feeds it [`WorkCompletion`]s reaped from the CQ and
//! carries out the returned [`Followup`].

use crate::ctrl::{ControlMsg, WorkKind, unpack_wr_id};
use coltran::backend::{CompletionToken, RemoteAccessKey, RemoteBuffer};
use coltran::error::{CoreError, Result};
use coltran::types::Rank;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A work completion reduced to what dispatch needs.
#[derive(Debug)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub failure: Option<CoreError>,
    /// The peer wrote with immediate data.
    pub with_imm: bool,
    pub len: usize,
}

impl WorkCompletion {
    pub fn from_wc(wc: &ibverbs_sys::ibv_wc) -> Self {
        let wr_id = wc.wr_id();
        Self {
            wr_id,
            failure: wc.error().map(|(status, vendor_err)| {
                CoreError::backend(format!(
                    "ib: work request {wr_id:#x} failed (status={status:?}, vendor_err={vendor_err})"
                ))
            }),
            with_imm: wc.opcode() == ibverbs_sys::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM,
            len: wc.len(),
        }
    }
}

/// Device work left to the caller once a completion is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    /// Return a control send slot to the free list.
    FreeSendSlot(u32),
    /// Post the receive slot again.
    Repost { peer: Rank, slot: u32 },
}

#[derive(Default)]
struct PeerControl {
    waiting: VecDeque<Arc<CompletionToken>>,
    arrived: VecDeque<std::result::Result<RemoteBuffer, CoreError>>,
    /// Set once the peer's receive queue failed; it never recovers.
    broken: Option<CoreError>,
}

pub struct Dispatch {
    rank: Rank,
    inflight: Mutex<HashMap<u64, Arc<CompletionToken>>>,
    control: Mutex<Vec<PeerControl>>,
    notify: Vec<AtomicU64>,
}

impl Dispatch {
    pub fn new(rank: Rank, world_size: u32) -> Self {
        let world = world_size as usize;
        Self {
            rank,
            inflight: Mutex::new(HashMap::new()),
            control: Mutex::new((0..world).map(|_| PeerControl::default()).collect()),
            notify: (0..world).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Token for a work request about to be posted.
    pub fn track(&self, wr_id: u64) -> Result<Arc<CompletionToken>> {
        let token = Arc::new(CompletionToken::new());
        self.inflight
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib inflight"))?
            .insert(wr_id, Arc::clone(&token));
        Ok(token)
    }

    /// Forget a work request whose post failed.
    pub fn untrack(&self, wr_id: u64) -> Option<Arc<CompletionToken>> {
        self.inflight.lock().ok().and_then(|mut m| m.remove(&wr_id))
    }

    pub fn inflight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn finish(&self, wr_id: u64, failure: Option<CoreError>) {
        let Some(token) = self.untrack(wr_id) else {
            tracing::warn!(wr_id, "ib: completion for untracked work request");
            return;
        };
        match failure {
            Some(e) => token.fail(e),
            None => token.complete(),
        }
    }

    /// Queue a receive for the next announcement from `peer`.
    pub fn expect_control(&self, peer: Rank) -> Result<Arc<CompletionToken>> {
        let token = Arc::new(CompletionToken::new());
        {
            let mut control = self
                .control
                .lock()
                .map_err(|_| CoreError::LockPoisoned("ib control"))?;
            let state = control
                .get_mut(peer as usize)
                .ok_or_else(|| CoreError::unavailable(peer, "ib: rank outside communicator"))?;
            if let Some(err) = &state.broken {
                return Err(err.duplicate());
            }
            state.waiting.push_back(Arc::clone(&token));
        }
        self.match_control()?;
        Ok(token)
    }

    /// Consume one notification from `peer`. A broken peer with nothing
    /// pending reports its failure so waiters do not spin forever.
    pub fn take_notify(&self, peer: Rank) -> Result<bool> {
        let counter = self
            .notify
            .get(peer as usize)
            .ok_or_else(|| CoreError::unavailable(peer, "ib: rank outside communicator"))?;
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(true);
        }
        let control = self
            .control
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib control"))?;
        match control.get(peer as usize).and_then(|s| s.broken.as_ref()) {
            Some(err) => Err(err.duplicate()),
            None => Ok(false),
        }
    }

    /// Mark `peer`'s receive path dead and fail every receive waiting on it.
    pub fn break_peer(&self, peer: Rank, err: CoreError) {
        tracing::warn!(rank = self.rank, peer, "ib: control path failed: {err}");
        let Ok(mut control) = self.control.lock() else {
            return;
        };
        let Some(state) = control.get_mut(peer as usize) else {
            return;
        };
        for token in state.waiting.drain(..) {
            token.fail(err.duplicate());
        }
        state.broken.get_or_insert(err);
    }

    /// Pair arrived announcements with waiting receives, oldest first.
    pub fn match_control(&self) -> Result<()> {
        let mut control = self
            .control
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib control"))?;
        for state in control.iter_mut() {
            while !state.waiting.is_empty() && !state.arrived.is_empty() {
                if let (Some(token), Some(arrival)) =
                    (state.waiting.pop_front(), state.arrived.pop_front())
                {
                    match arrival {
                        Ok(remote) => token.complete_with_remote(remote),
                        Err(e) => token.fail(e),
                    }
                }
            }
        }
        Ok(())
    }

    fn push_arrival(&self, peer: Rank, arrival: std::result::Result<RemoteBuffer, CoreError>) -> Result<()> {
        self.control
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib control"))?
            .get_mut(peer as usize)
            .ok_or_else(|| CoreError::backend(format!("ib: receive from unknown peer {peer}")))?
            .arrived
            .push_back(arrival);
        Ok(())
    }

    /// Apply one completion. `read_slot` copies a filled receive slot out.
    ///
    /// A malformed announcement is queued as a failed arrival, so the receive
    /// it was meant for fails instead of shifting later announcements.
    pub fn handle(
        &self,
        wc: WorkCompletion,
        read_slot: impl FnOnce(u32, usize) -> Result<Vec<u8>>,
    ) -> Result<Followup> {
        let Some((kind, peer, index)) = unpack_wr_id(wc.wr_id) else {
            tracing::warn!(wr_id = wc.wr_id, "ib: completion with unknown work request id");
            return Ok(Followup::Nothing);
        };
        match kind {
            WorkKind::CtrlSend => {
                self.finish(wc.wr_id, wc.failure);
                Ok(Followup::FreeSendSlot(index))
            }
            WorkKind::Put => {
                self.finish(wc.wr_id, wc.failure);
                Ok(Followup::Nothing)
            }
            WorkKind::Recv => {
                if let Some(err) = wc.failure {
                    // The queue pair is in error state; reposting would fail too.
                    self.break_peer(peer, err);
                    return Ok(Followup::Nothing);
                }
                if wc.with_imm {
                    if let Some(n) = self.notify.get(peer as usize) {
                        n.fetch_add(1, Ordering::AcqRel);
                    }
                } else {
                    let arrival = read_slot(index, wc.len)
                        .and_then(|bytes| ControlMsg::decode(&bytes))
                        .map(|msg| RemoteBuffer {
                            addr: msg.addr,
                            key: RemoteAccessKey::Ib { rkey: msg.rkey },
                        });
                    if let Err(e) = &arrival {
                        tracing::warn!(rank = self.rank, peer, "ib: dropping control message: {e}");
                    }
                    self.push_arrival(peer, arrival)?;
                }
                Ok(Followup::Repost { peer, slot: index })
            }
        }
    }
}
