//! In-process fabric for ranks that share one address space.
//!
//! Every rank gets a [`Backend`] onto the same shared endpoints: control
//! messages travel through per-pair lock-free queues, puts are memcpys run
//! from the issuer's `progress()`, and notifications are per-pair counters.
//! The fabric issues `Ib` style keys so it can stand in for the verbs backend
//! and counts every registration call for leak checks. Failures can be
//! injected for the degrade paths.

use crate::backend::{
    Backend, BackendFactory, BackendKind, BackendRegId, CompletionToken, PutOp, RemoteAccessKey,
    RemoteBuffer,
};
use crate::error::{CoreError, Result};
use crate::types::{CommInfo, Rank};
use crossbeam_queue::SegQueue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Registration counters across the whole fabric.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FabricStats {
    /// Successful `register_buffer` calls.
    pub registrations: u64,
    /// `deregister_buffer` calls, successful or not.
    pub deregistrations: u64,
    /// Regions currently registered on any rank.
    pub live: u64,
}

struct Endpoint {
    /// rkey -> (addr, len) of regions registered by this rank.
    regions: Mutex<HashMap<u32, (u64, usize)>>,
    /// Control messages addressed to this rank, indexed by sender.
    ctrl: Vec<SegQueue<RemoteBuffer>>,
    /// Notifications addressed to this rank, indexed by sender.
    notify: Vec<AtomicU64>,
}

impl Endpoint {
    fn new(world_size: usize) -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            ctrl: (0..world_size).map(|_| SegQueue::new()).collect(),
            notify: (0..world_size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn region(&self, key: u32) -> Result<Option<(u64, usize)>> {
        let regions = self
            .regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("loopback regions"))?;
        Ok(regions.get(&key).copied())
    }
}

struct FabricShared {
    kind: BackendKind,
    endpoints: Vec<Endpoint>,
    next_key: AtomicU32,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    fail_register: AtomicBool,
    fail_bring_up: AtomicBool,
}

/// Shared in-process fabric. Clones refer to the same fabric.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl LoopbackFabric {
    /// Fabric for `world_size` ranks serving the `Ib` backend slot.
    pub fn new(world_size: u32) -> Self {
        Self::with_kind(world_size, BackendKind::Ib)
    }

    pub fn with_kind(world_size: u32, kind: BackendKind) -> Self {
        let n = world_size as usize;
        Self {
            shared: Arc::new(FabricShared {
                kind,
                endpoints: (0..n).map(|_| Endpoint::new(n)).collect(),
                next_key: AtomicU32::new(1),
                registrations: AtomicU64::new(0),
                deregistrations: AtomicU64::new(0),
                fail_register: AtomicBool::new(false),
                fail_bring_up: AtomicBool::new(false),
            }),
        }
    }

    pub fn world_size(&self) -> u32 {
        self.shared.endpoints.len() as u32
    }

    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        Arc::new(LoopbackFactory {
            fabric: self.clone(),
        })
    }

    pub fn stats(&self) -> FabricStats {
        let live = self
            .shared
            .endpoints
            .iter()
            .map(|ep| ep.regions.lock().map(|r| r.len() as u64).unwrap_or(0))
            .sum();
        FabricStats {
            registrations: self.shared.registrations.load(Ordering::SeqCst),
            deregistrations: self.shared.deregistrations.load(Ordering::SeqCst),
            live,
        }
    }

    /// Make every subsequent `register_buffer` fail.
    pub fn fail_registrations(&self, on: bool) {
        self.shared.fail_register.store(on, Ordering::SeqCst);
    }

    /// Make every subsequent backend construction fail.
    pub fn fail_bring_up(&self, on: bool) {
        self.shared.fail_bring_up.store(on, Ordering::SeqCst);
    }
}

struct LoopbackFactory {
    fabric: LoopbackFabric,
}

impl BackendFactory for LoopbackFactory {
    fn kind(&self) -> BackendKind {
        self.fabric.shared.kind
    }

    fn create(&self, comm: &CommInfo) -> Result<Arc<dyn Backend>> {
        let shared = &self.fabric.shared;
        if shared.fail_bring_up.load(Ordering::SeqCst) {
            return Err(CoreError::AllocationFailure {
                backend: shared.kind.name(),
                reason: "loopback bring-up disabled".into(),
            });
        }
        let world = self.fabric.world_size();
        if comm.world_size != world || comm.rank >= world {
            return Err(CoreError::AllocationFailure {
                backend: shared.kind.name(),
                reason: format!(
                    "rank {} of {} does not fit a loopback fabric of {world}",
                    comm.rank, comm.world_size
                ),
            });
        }
        Ok(Arc::new(LoopbackBackend {
            rank: comm.rank,
            shared: Arc::clone(shared),
            pending_recv: Mutex::new((0..world).map(|_| VecDeque::new()).collect()),
            sends: SegQueue::new(),
            puts: SegQueue::new(),
        }))
    }
}

struct LoopbackBackend {
    rank: Rank,
    shared: Arc<FabricShared>,
    /// Posted control receives, per sending peer, in post order.
    pending_recv: Mutex<Vec<VecDeque<Arc<CompletionToken>>>>,
    sends: SegQueue<Arc<CompletionToken>>,
    puts: SegQueue<(PutOp, Arc<CompletionToken>)>,
}

fn covers((start, len): (u64, usize), addr: u64, n: usize) -> bool {
    match (start.checked_add(len as u64), addr.checked_add(n as u64)) {
        (Some(end), Some(req_end)) => addr >= start && req_end <= end,
        _ => false,
    }
}

fn key_of(id: BackendRegId) -> u32 {
    id.0 as u32
}

impl LoopbackBackend {
    fn endpoint(&self, rank: Rank) -> Result<&Endpoint> {
        self.shared
            .endpoints
            .get(rank as usize)
            .ok_or_else(|| CoreError::unavailable(rank, "rank outside the loopback fabric"))
    }

    fn local(&self) -> &Endpoint {
        &self.shared.endpoints[self.rank as usize]
    }
}

impl Backend for LoopbackBackend {
    fn kind(&self) -> BackendKind {
        self.shared.kind
    }

    fn reaches(&self, peer: Rank) -> bool {
        (peer as usize) < self.shared.endpoints.len()
    }

    fn register_buffer(&self, addr: u64, len: usize) -> Result<BackendRegId> {
        if self.shared.fail_register.load(Ordering::SeqCst) {
            return Err(CoreError::RegistrationFailure {
                backend: self.shared.kind.name(),
                op: "register",
                addr,
                len,
                reason: "registration failure injected".into(),
            });
        }
        let key = self.shared.next_key.fetch_add(1, Ordering::SeqCst);
        self.local()
            .regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("loopback regions"))?
            .insert(key, (addr, len));
        self.shared.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(BackendRegId(key as u64))
    }

    fn deregister_buffer(&self, id: BackendRegId) -> Result<()> {
        self.shared.deregistrations.fetch_add(1, Ordering::SeqCst);
        let removed = self
            .local()
            .regions
            .lock()
            .map_err(|_| CoreError::LockPoisoned("loopback regions"))?
            .remove(&key_of(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(CoreError::RegistrationFailure {
                backend: self.shared.kind.name(),
                op: "deregister",
                addr: 0,
                len: 0,
                reason: format!("unknown registration {}", id.0),
            }),
        }
    }

    fn send_control(
        &self,
        addr: u64,
        id: BackendRegId,
        peer: Rank,
    ) -> Result<Arc<CompletionToken>> {
        let target = self.endpoint(peer)?;
        if self.local().region(key_of(id))?.is_none() {
            return Err(CoreError::backend(format!(
                "control for unregistered buffer 0x{addr:x} (registration {})",
                id.0
            )));
        }
        target.ctrl[self.rank as usize].push(RemoteBuffer {
            addr,
            key: RemoteAccessKey::Ib { rkey: key_of(id) },
        });
        let token = Arc::new(CompletionToken::new());
        self.sends.push(Arc::clone(&token));
        Ok(token)
    }

    fn receive_control(&self, peer: Rank) -> Result<Arc<CompletionToken>> {
        self.endpoint(peer)?;
        let token = Arc::new(CompletionToken::new());
        let mut pending = self
            .pending_recv
            .lock()
            .map_err(|_| CoreError::LockPoisoned("loopback receives"))?;
        pending[peer as usize].push_back(Arc::clone(&token));
        Ok(token)
    }

    unsafe fn put(&self, op: PutOp) -> Result<Arc<CompletionToken>> {
        let target = self.endpoint(op.peer)?;
        match self.local().region(key_of(op.local))? {
            Some(region) if covers(region, op.src, op.len) => {}
            _ => {
                return Err(CoreError::backend(format!(
                    "put source 0x{:x} ({} bytes) outside registration {}",
                    op.src, op.len, op.local.0
                )));
            }
        }
        let RemoteAccessKey::Ib { rkey } = op.remote;
        match target.region(rkey)? {
            Some(region) if covers(region, op.dst, op.len) => {}
            _ => {
                return Err(CoreError::backend(format!(
                    "put target 0x{:x} ({} bytes) not covered by rkey {rkey} on rank {}",
                    op.dst, op.len, op.peer
                )));
            }
        }
        let token = Arc::new(CompletionToken::new());
        self.puts.push((op, Arc::clone(&token)));
        Ok(token)
    }

    fn check_notify(&self, peer: Rank) -> Result<bool> {
        let counter = self
            .local()
            .notify
            .get(peer as usize)
            .ok_or_else(|| CoreError::unavailable(peer, "rank outside the loopback fabric"))?;
        Ok(counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok())
    }

    fn progress(&self) -> Result<()> {
        while let Some(token) = self.sends.pop() {
            token.complete();
        }

        {
            let mut pending = self
                .pending_recv
                .lock()
                .map_err(|_| CoreError::LockPoisoned("loopback receives"))?;
            let inbox = &self.local().ctrl;
            for (peer, waiting) in pending.iter_mut().enumerate() {
                while !waiting.is_empty() {
                    let Some(remote) = inbox[peer].pop() else {
                        break;
                    };
                    if let Some(token) = waiting.pop_front() {
                        token.complete_with_remote(remote);
                    }
                }
            }
        }

        while let Some((op, token)) = self.puts.pop() {
            // SAFETY: `put` callers keep both ranges valid until the token
            // completes, which happens after the copy.
            unsafe {
                std::ptr::copy(op.src as *const u8, op.dst as *mut u8, op.len);
            }
            if op.notify {
                self.shared.endpoints[op.peer as usize].notify[self.rank as usize]
                    .fetch_add(1, Ordering::AcqRel);
            }
            token.complete();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::LocalBootstrap;

    fn backends(fabric: &LoopbackFabric) -> Vec<Arc<dyn Backend>> {
        let n = fabric.world_size();
        let factory = fabric.factory();
        LocalBootstrap::group(n)
            .into_iter()
            .enumerate()
            .map(|(rank, boot)| {
                let comm = CommInfo::new(rank as Rank, n, 0x77, Arc::new(boot));
                factory.create(&comm).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_register_counts() {
        let fabric = LoopbackFabric::new(1);
        let b = &backends(&fabric)[0];
        let id = b.register_buffer(0x1000, 64).unwrap();
        assert_eq!(fabric.stats().live, 1);
        b.deregister_buffer(id).unwrap();
        assert!(b.deregister_buffer(id).is_err());
        assert_eq!(
            fabric.stats(),
            FabricStats {
                registrations: 1,
                deregistrations: 2,
                live: 0
            }
        );
    }

    #[test]
    fn test_control_put_notify() {
        let fabric = LoopbackFabric::new(2);
        let b = backends(&fabric);
        let src: Vec<u8> = (0..128).map(|i| i as u8).collect();
        let mut dst = vec![0u8; 128];
        let src_id = b[0].register_buffer(src.as_ptr() as u64, src.len()).unwrap();
        let dst_id = b[1]
            .register_buffer(dst.as_mut_ptr() as u64, dst.len())
            .unwrap();

        let recv = b[0].receive_control(1).unwrap();
        b[0].progress().unwrap();
        assert!(!recv.is_complete());

        let sent = b[1]
            .send_control(dst.as_mut_ptr() as u64, dst_id, 0)
            .unwrap();
        b[1].progress().unwrap();
        assert!(sent.is_complete());
        b[0].progress().unwrap();
        let remote = recv.remote().unwrap();
        assert_eq!(remote.addr, dst.as_ptr() as u64);

        assert!(!b[1].check_notify(0).unwrap());
        let put = unsafe {
            b[0].put(PutOp {
                src: src.as_ptr() as u64,
                dst: remote.addr,
                len: 128,
                peer: 1,
                local: src_id,
                remote: remote.key,
                notify: true,
            })
        }
        .unwrap();
        assert!(!put.is_complete());
        b[0].progress().unwrap();
        assert!(put.is_complete());
        assert!(b[1].check_notify(0).unwrap());
        assert!(!b[1].check_notify(0).unwrap());
        assert_eq!(dst, src);
    }

    #[test]
    fn test_put_rejects_unregistered_target() {
        let fabric = LoopbackFabric::new(2);
        let b = backends(&fabric);
        let src = [1u8; 16];
        let id = b[0].register_buffer(src.as_ptr() as u64, 16).unwrap();
        let err = unsafe {
            b[0].put(PutOp {
                src: src.as_ptr() as u64,
                dst: 0x9000,
                len: 16,
                peer: 1,
                local: id,
                remote: RemoteAccessKey::Ib { rkey: 999 },
                notify: false,
            })
        }
        .unwrap_err();
        assert!(matches!(err, CoreError::Backend { .. }));
    }

    #[test]
    fn test_injected_failures() {
        let fabric = LoopbackFabric::new(1);
        let b = &backends(&fabric)[0];
        fabric.fail_registrations(true);
        let err = b.register_buffer(0x1000, 8).unwrap_err();
        assert!(matches!(err, CoreError::RegistrationFailure { op: "register", .. }));

        fabric.fail_bring_up(true);
        let boot = LocalBootstrap::group(1).remove(0);
        let comm = CommInfo::new(0, 1, 0, Arc::new(boot));
        let err = fabric.factory().create(&comm).err().unwrap();
        assert!(matches!(err, CoreError::AllocationFailure { .. }));
    }

    #[test]
    fn test_peer_out_of_range() {
        let fabric = LoopbackFabric::new(1);
        let b = &backends(&fabric)[0];
        assert!(!b.reaches(3));
        assert!(b.receive_control(3).unwrap_err().is_transport_unavailable());
    }
}
