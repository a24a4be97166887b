//! Verbs implementation of the mapper's [`Backend`] trait.
//!
//! One device context, one shared completion queue and one RC queue pair per
//! peer. Control messages are two-sided sends out of registered host slots;
//! puts are RDMA writes, with immediate data when the peer must be notified.
//! Nothing blocks: every completion is reaped from [`Backend::progress`].

use crate::bootstrap::{self, EndpointTable};
use crate::config::IbConfig;
use crate::ctrl::{ControlMsg, CtrlSlots, SLOT_SIZE, WorkKind, pack_wr_id};
use crate::dispatch::{Dispatch, Followup, WorkCompletion};
use crate::verbs::{IbContext, LocalSge, MrTable, PreparedQp, QpEndpoint, QueuePair};
use coltran::backend::{
    Backend, BackendFactory, BackendKind, BackendRegId, CompletionToken, PutOp, RemoteAccessKey,
};
use coltran::error::{CoreError, Result};
use coltran::types::{CommInfo, Rank};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

const POLL_BATCH: usize = 16;

/// Verbs transport for one communicator.
pub struct IbBackend {
    rank: Rank,
    peers: Vec<Option<QueuePair>>,
    mrs: MrTable,
    ctrl: CtrlSlots,
    dispatch: Dispatch,
    next_put: AtomicU32,
    poll_buf: Mutex<Vec<ibverbs_sys::ibv_wc>>,
    // Last: queue pairs and regions above must be destroyed before the
    // protection domain and CQ they belong to.
    ctx: IbContext,
}

struct Prepared {
    ctx: IbContext,
    qps: Vec<Option<PreparedQp>>,
    ctrl: CtrlSlots,
    table: EndpointTable,
}

impl IbBackend {
    /// Open the device, exchange endpoints with every rank and connect.
    ///
    /// Collective: every rank of `comm` must call this, including ranks whose
    /// device fails to open.
    pub fn connect(comm: &CommInfo, config: &IbConfig) -> Result<Self> {
        let prepared = match Self::prepare(comm, config) {
            Ok(p) => p,
            Err(e) => {
                // Still take part so the peers' exchange completes.
                if let Err(xe) = bootstrap::exchange(comm, None) {
                    tracing::warn!(rank = comm.rank, "ib: endpoint exchange failed: {xe}");
                }
                return Err(e);
            }
        };
        let tables = bootstrap::exchange(comm, Some(&prepared.table))?;

        let Prepared {
            ctx,
            qps,
            ctrl,
            table: _,
        } = prepared;

        let mut peers = Vec::with_capacity(qps.len());
        for (peer, prep) in qps.into_iter().enumerate() {
            let peer = peer as Rank;
            let remote = tables
                .get(peer as usize)
                .and_then(Option::as_ref)
                .and_then(|t| t.qp_for(comm.rank).map(|qp_num| QpEndpoint { qp_num, gid: t.gid }));
            let qp = match (prep, remote) {
                (Some(prep), Some(remote)) => match prep.complete(remote) {
                    Ok(qp) => Some(qp),
                    Err(e) => {
                        tracing::warn!(rank = comm.rank, peer, "ib: connect failed: {e}");
                        None
                    }
                },
                _ => None,
            };
            if let Some(qp) = &qp {
                for k in 0..ctrl.recv_depth() {
                    let slot = ctrl.recv_slot(peer, k);
                    qp.post_recv(
                        pack_wr_id(WorkKind::Recv, peer, slot),
                        ctrl.recv.sge(slot, SLOT_SIZE)?,
                    )?;
                }
            }
            peers.push(qp);
        }

        let connected = peers.iter().filter(|p| p.is_some()).count();
        tracing::info!(
            rank = comm.rank,
            world_size = comm.world_size,
            connected,
            "ib: backend ready"
        );

        Ok(Self {
            rank: comm.rank,
            peers,
            mrs: MrTable::new(),
            ctrl,
            dispatch: Dispatch::new(comm.rank, comm.world_size),
            next_put: AtomicU32::new(0),
            poll_buf: Mutex::new((0..POLL_BATCH).map(|_| ibverbs_sys::ibv_wc::default()).collect()),
            ctx,
        })
    }

    fn prepare(comm: &CommInfo, config: &IbConfig) -> Result<Prepared> {
        let ctx = IbContext::open(
            config.device_index,
            config.port,
            config.gid_index,
            config.cq_entries(comm.world_size),
        )?;
        let gid = ctx.gid()?;

        let mut qps = Vec::with_capacity(comm.world_size as usize);
        let mut qp_nums = Vec::with_capacity(comm.world_size as usize);
        for peer in 0..comm.world_size {
            if peer == comm.rank {
                qps.push(None);
                qp_nums.push(0);
                continue;
            }
            let qp = ctx.prepare_qp(config.send_depth, config.recv_depth)?;
            qp_nums.push(qp.qp_num());
            qps.push(Some(qp));
        }

        let ctrl = CtrlSlots::new(&ctx, config.ctrl_send_slots, comm.world_size, config.recv_depth)?;
        Ok(Prepared {
            ctx,
            qps,
            ctrl,
            table: EndpointTable { gid, qp_nums },
        })
    }

    fn qp(&self, peer: Rank) -> Result<&QueuePair> {
        self.peers
            .get(peer as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::unavailable(peer, "ib: no connected queue pair"))
    }

    fn on_completion(&self, wc: &ibverbs_sys::ibv_wc) -> Result<()> {
        let event = WorkCompletion::from_wc(wc);
        let followup = self
            .dispatch
            .handle(event, |slot, len| unsafe { self.ctrl.recv.read(slot, len) })?;
        match followup {
            Followup::Nothing => Ok(()),
            Followup::FreeSendSlot(slot) => {
                let _ = self.ctrl.free.push(slot);
                Ok(())
            }
            Followup::Repost { peer, slot } => {
                let reposted = self.qp(peer).and_then(|qp| {
                    qp.post_recv(
                        pack_wr_id(WorkKind::Recv, peer, slot),
                        self.ctrl.recv.sge(slot, SLOT_SIZE)?,
                    )
                });
                if let Err(e) = &reposted {
                    self.dispatch.break_peer(peer, e.duplicate());
                }
                reposted
            }
        }
    }
}

impl Backend for IbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ib
    }

    fn reaches(&self, peer: Rank) -> bool {
        self.peers.get(peer as usize).is_some_and(Option::is_some)
    }

    fn register_buffer(&self, addr: u64, len: usize) -> Result<BackendRegId> {
        let mr = unsafe { self.ctx.register(addr, len)? };
        self.mrs.insert(mr)
    }

    fn deregister_buffer(&self, id: BackendRegId) -> Result<()> {
        self.mrs.remove(id)?.deregister()
    }

    fn send_control(
        &self,
        addr: u64,
        id: BackendRegId,
        peer: Rank,
    ) -> Result<Arc<CompletionToken>> {
        let qp = self.qp(peer)?;
        let keys = self.mrs.keys(id)?;
        if !keys.covers(addr, 0) {
            return Err(CoreError::invalid_buffer(
                addr,
                0,
                format!("outside registration {}", id.0),
            ));
        }
        let bytes = ControlMsg {
            addr,
            rkey: keys.rkey,
        }
        .encode()?;

        let slot = self
            .ctrl
            .free
            .pop()
            .ok_or_else(|| CoreError::backend("ib: all control send slots in flight"))?;
        let wr_id = pack_wr_id(WorkKind::CtrlSend, peer, slot);
        let posted = unsafe { self.ctrl.send.write(slot, &bytes) }
            .and_then(|()| self.ctrl.send.sge(slot, bytes.len()))
            .and_then(|sge| {
                let token = self.dispatch.track(wr_id)?;
                qp.post_send(wr_id, sge).map(|()| token)
            });
        if posted.is_err() {
            self.dispatch.untrack(wr_id);
            let _ = self.ctrl.free.push(slot);
        }
        posted
    }

    fn receive_control(&self, peer: Rank) -> Result<Arc<CompletionToken>> {
        self.qp(peer)?;
        self.dispatch.expect_control(peer)
    }

    unsafe fn put(&self, op: PutOp) -> Result<Arc<CompletionToken>> {
        let qp = self.qp(op.peer)?;
        let keys = self.mrs.keys(op.local)?;
        if !keys.covers(op.src, op.len) {
            return Err(CoreError::invalid_buffer(
                op.src,
                op.len,
                format!("not covered by registration {}", op.local.0),
            ));
        }
        let len = u32::try_from(op.len)
            .map_err(|_| CoreError::invalid_buffer(op.src, op.len, "exceeds a single write"))?;
        let RemoteAccessKey::Ib { rkey } = op.remote;

        let wr_id = pack_wr_id(
            WorkKind::Put,
            op.peer,
            self.next_put.fetch_add(1, Ordering::Relaxed),
        );
        let token = self.dispatch.track(wr_id)?;
        let sge = LocalSge {
            addr: op.src,
            len,
            lkey: keys.lkey,
        };
        let imm = op.notify.then_some(self.rank);
        if let Err(e) = qp.post_write(wr_id, sge, op.dst, rkey, imm) {
            self.dispatch.untrack(wr_id);
            return Err(e);
        }
        Ok(token)
    }

    fn check_notify(&self, peer: Rank) -> Result<bool> {
        self.qp(peer)?;
        self.dispatch.take_notify(peer)
    }

    fn progress(&self) -> Result<()> {
        let mut wcs = self
            .poll_buf
            .lock()
            .map_err(|_| CoreError::LockPoisoned("ib poll buffer"))?;
        // Reap the whole batch even if one completion fails.
        let mut first_err = None;
        loop {
            let n = self.ctx.poll(&mut wcs)?;
            for wc in &wcs[..n] {
                if let Err(e) = self.on_completion(wc) {
                    tracing::warn!(rank = self.rank, "ib: completion handling failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
            if n < wcs.len() {
                break;
            }
        }
        drop(wcs);
        self.dispatch.match_control()?;
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for IbBackend {
    fn drop(&mut self) {
        let live = self.mrs.len();
        if live > 0 {
            tracing::warn!(rank = self.rank, live, "ib: backend dropped with live registrations");
        }
    }
}

/// Brings up an [`IbBackend`] for each communicator.
#[derive(Debug, Clone, Default)]
pub struct IbBackendFactory {
    config: IbConfig,
}

impl IbBackendFactory {
    pub fn new(config: IbConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(IbConfig::from_env())
    }

    pub fn config(&self) -> &IbConfig {
        &self.config
    }
}

impl BackendFactory for IbBackendFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Ib
    }

    fn create(&self, comm: &CommInfo) -> Result<Arc<dyn Backend>> {
        match IbBackend::connect(comm, &self.config) {
            Ok(backend) => Ok(Arc::new(backend)),
            Err(e @ CoreError::AllocationFailure { .. }) => Err(e),
            Err(e) => Err(CoreError::AllocationFailure {
                backend: BackendKind::Ib.name(),
                reason: e.to_string(),
            }),
        }
    }
}
