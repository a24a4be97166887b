//! Per-communicator transport façade.
//!
//! The [`Mapper`] composes the registration cache, the enabled backends and
//! the device adapter. Collective algorithms resolve their buffers through it,
//! exchange control messages, post puts and poll for notifications; every
//! transport call is routed to the backend assigned to the target rank.

use crate::backend::{
    Backend, BackendFactory, BackendRegId, BackendSlot, PutOp, RemoteAccessKey, RemoteBuffer,
};
use crate::config::{MapperConfig, RegisterMode};
use crate::device::DeviceAdapter;
use crate::error::{CoreError, Result};
use crate::profiling::{CollTimestamp, ProfileWriter, Profiler};
use crate::regcache::{RegCache, RegEntry, RegHandle, RegIndex, RegState, insert_checked};
use crate::request::Request;
use crate::telemetry::{
    DurationKind, MapperId, MapperStats, RegSnapshot, TelemetrySink, log_snapshot,
};
use crate::types::{CommInfo, Rank, StreamHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of [`Mapper::resolve_for_transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub handle: RegHandle,
    /// The buffer was unknown and got registered by this call. The caller
    /// owns its deregistration.
    pub dynamic: bool,
}

/// Arguments of a one-sided write.
#[derive(Debug, Clone, Copy)]
pub struct PutArgs {
    pub src: u64,
    pub dst: u64,
    pub len: usize,
    pub peer: Rank,
    /// Local registration covering the source range.
    pub local: RegHandle,
    /// Key received from `peer` for the buffer containing `dst`.
    pub remote: RemoteAccessKey,
    /// Raise `peer`'s notify signal once the data lands.
    pub notify: bool,
}

impl PutArgs {
    /// Target the buffer announced by a completed control receive.
    pub fn to_remote(
        src: u64,
        local: RegHandle,
        remote: RemoteBuffer,
        offset: u64,
        len: usize,
        peer: Rank,
    ) -> Self {
        Self {
            src,
            dst: remote.addr + offset,
            len,
            peer,
            local,
            remote: remote.key,
            notify: false,
        }
    }

    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }
}

/// Builder for [`Mapper`].
pub struct MapperBuilder {
    comm: CommInfo,
    device: Arc<dyn DeviceAdapter>,
    config: MapperConfig,
    factories: Vec<Arc<dyn BackendFactory>>,
    telemetry: Option<Arc<TelemetrySink>>,
    profile_writer: Option<Arc<dyn ProfileWriter>>,
}

impl MapperBuilder {
    pub fn new(comm: CommInfo, device: Arc<dyn DeviceAdapter>) -> Self {
        Self {
            comm,
            device,
            config: MapperConfig::default(),
            factories: Vec::new(),
            telemetry: None,
            profile_writer: None,
        }
    }

    pub fn config(mut self, config: MapperConfig) -> Self {
        self.config = config;
        self
    }

    /// Make a backend kind constructible. Only kinds listed in
    /// `MapperConfig::backends` are brought up.
    pub fn backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Process-wide sink for registration telemetry.
    pub fn telemetry(mut self, sink: Arc<TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn profile_writer(mut self, writer: Arc<dyn ProfileWriter>) -> Self {
        self.profile_writer = Some(writer);
        self
    }

    /// Bring up the enabled backends and assign one to every rank.
    ///
    /// A backend that fails to come up is logged and skipped; ranks no other
    /// backend reaches are left [`BackendSlot::Unset`]. Only a failure to
    /// create the internal copy stream aborts construction.
    pub fn build(self) -> Result<Mapper> {
        let comm = self.comm;
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        for &kind in &self.config.backends {
            let created = match self.factories.iter().find(|f| f.kind() == kind) {
                Some(factory) => factory.create(&comm),
                None => Err(CoreError::AllocationFailure {
                    backend: kind.name(),
                    reason: "no factory installed".into(),
                }),
            };
            match created {
                Ok(backend) => {
                    tracing::info!(rank = comm.rank, backend = kind.name(), "backend initialized");
                    backends.push(backend);
                }
                Err(e) => {
                    let e = match e {
                        e @ CoreError::AllocationFailure { .. } => e,
                        other => CoreError::AllocationFailure {
                            backend: kind.name(),
                            reason: other.to_string(),
                        },
                    };
                    tracing::warn!(
                        rank = comm.rank,
                        comm_hash = comm.comm_hash,
                        "{e}; ranks it would serve fall back to unset"
                    );
                }
            }
        }

        let rank_slots = (0..comm.world_size)
            .map(|peer| {
                backends
                    .iter()
                    .find(|b| b.reaches(peer))
                    .map(|b| BackendSlot::Assigned(b.kind()))
                    .unwrap_or(BackendSlot::Unset)
            })
            .collect();

        let internal_stream = self.device.create_stream()?;

        let stats = Arc::new(MapperStats::new());
        let telemetry = match self.telemetry {
            Some(sink) if self.config.snapshot_cadence.is_enabled() => {
                let id = sink.attach(comm.comm_hash, Arc::clone(&stats));
                Some((sink, id))
            }
            _ => None,
        };

        let profiler = Profiler::new(
            self.config.profiling,
            self.config.profiling_report_count,
            self.config.profile_dir.clone(),
            self.profile_writer,
        );

        tracing::debug!(
            rank = comm.rank,
            comm_hash = comm.comm_hash,
            backends = backends.len(),
            mode = ?self.config.register_mode,
            "mapper created"
        );

        Ok(Mapper {
            comm,
            config: self.config,
            cache: RegCache::new(),
            backends,
            rank_slots,
            device: self.device,
            internal_stream,
            stats,
            telemetry,
            profiler,
        })
    }
}

/// One communicator's view of the transport layer.
///
/// Registration, deregistration and lookups may be called from several
/// threads at once. `progress`, request polling and notify checks should be
/// driven by one thread. Dropping the mapper deregisters every buffer still
/// in its cache.
pub struct Mapper {
    comm: CommInfo,
    config: MapperConfig,
    cache: RegCache,
    backends: Vec<Arc<dyn Backend>>,
    rank_slots: Vec<BackendSlot>,
    device: Arc<dyn DeviceAdapter>,
    internal_stream: StreamHandle,
    stats: Arc<MapperStats>,
    telemetry: Option<(Arc<TelemetrySink>, MapperId)>,
    profiler: Profiler,
}

impl Mapper {
    pub fn builder(comm: CommInfo, device: Arc<dyn DeviceAdapter>) -> MapperBuilder {
        MapperBuilder::new(comm, device)
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank
    }

    pub fn comm_hash(&self) -> u64 {
        self.comm.comm_hash
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Backend assignment of `rank`.
    pub fn backend_slot(&self, rank: Rank) -> BackendSlot {
        self.rank_slots
            .get(rank as usize)
            .copied()
            .unwrap_or(BackendSlot::Unset)
    }

    /// Registration counters of this mapper.
    pub fn snapshot(&self) -> RegSnapshot {
        self.stats.snapshot()
    }

    /// Make `[addr, addr + len)` known to the mapper.
    ///
    /// A range already covered by a cached entry returns that entry's handle.
    /// The buffer is registered with the backends right away in eager mode or
    /// when `force_eager` is set; otherwise registration waits for the first
    /// [`resolve_for_transfer`](Self::resolve_for_transfer).
    pub fn register_buffer(&self, addr: u64, len: usize, force_eager: bool) -> Result<RegHandle> {
        let eager = force_eager || self.config.register_mode == RegisterMode::Eager;
        let mut index = self.cache.lock()?;
        if let Some(handle) = index.search(addr, len) {
            if eager && self.register_entry(&mut index, handle)? {
                self.stats.on_uncached();
            }
            return Ok(handle);
        }
        self.insert_entry(&mut index, addr, len, eager)
    }

    /// Forget a buffer, deregistering it if needed.
    ///
    /// `None` and handles that no longer resolve succeed without effect. The
    /// entry is dropped from the cache even if a backend refuses the
    /// deregistration; that error is returned.
    pub fn deregister_buffer(&self, handle: Option<RegHandle>) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let Some(entry) = self.cache.remove(handle)? else {
            return Ok(());
        };
        self.release_entry(entry)
    }

    /// Handle of the cached entry containing `[addr, addr + len)`, without
    /// registering anything.
    pub fn search(&self, addr: u64, len: usize) -> Result<Option<RegHandle>> {
        self.cache.search(addr, len)
    }

    /// Copy of the cache entry behind `handle`.
    pub fn entry(&self, handle: RegHandle) -> Result<Option<RegEntry>> {
        self.cache.lookup(handle)
    }

    /// Make `[addr, addr + len)` ready for a transfer.
    ///
    /// A registered entry is a fast-path hit. A cached-only entry is
    /// registered now. An unknown buffer is inserted and registered on the
    /// spot, and the result is marked dynamic: the caller must deregister it.
    pub fn resolve_for_transfer(&self, addr: u64, len: usize) -> Result<Resolved> {
        let start = Instant::now();
        let mut index = self.cache.lock()?;

        if let Some(handle) = index.search(addr, len) {
            let registered = index.get(handle).is_some_and(RegEntry::is_registered);
            if registered {
                drop(index);
                self.stats.on_lookup_hit();
                self.sample(DurationKind::LookupHit, start.elapsed());
                return Ok(Resolved {
                    handle,
                    dynamic: false,
                });
            }
            if self.register_entry(&mut index, handle)? {
                self.stats.on_uncached();
            }
            drop(index);
            self.stats.on_lookup_miss(false);
            self.sample(DurationKind::LookupMiss, start.elapsed());
            return Ok(Resolved {
                handle,
                dynamic: false,
            });
        }

        let handle = self.insert_entry(&mut index, addr, len, true)?;
        drop(index);
        self.stats.on_lookup_miss(true);
        self.sample(DurationKind::LookupMiss, start.elapsed());
        tracing::debug!(
            rank = self.comm.rank,
            addr,
            len,
            "dynamically registered buffer"
        );
        Ok(Resolved {
            handle,
            dynamic: true,
        })
    }

    /// Local device copy of `len` bytes from `src` to `dst`.
    ///
    /// Runs on `stream`, or on the mapper's internal stream when `None`.
    ///
    /// # Safety
    /// Both ranges must stay valid for `len` bytes until the request
    /// completes.
    pub unsafe fn copy_async(
        &self,
        dst: u64,
        src: u64,
        len: usize,
        stream: Option<StreamHandle>,
    ) -> Result<Request<'_>> {
        let stream = stream.unwrap_or(self.internal_stream);
        let fence = unsafe { self.device.copy_async(dst, src, len, stream)? };
        Ok(Request::copy(self, fence))
    }

    /// Advance every enabled backend once. Never blocks.
    pub fn progress(&self) -> Result<()> {
        for backend in &self.backends {
            backend.progress()?;
        }
        Ok(())
    }

    /// Announce the registered buffer at `addr` to `peer`.
    pub fn send_control(&self, addr: u64, handle: RegHandle, peer: Rank) -> Result<Request<'_>> {
        let (idx, backend) = self.backend_for(peer)?;
        let id = self.backend_reg(handle, idx, addr, 0)?;
        let token = backend.send_control(addr, id, peer)?;
        Ok(Request::backend(self, token))
    }

    /// Receive the next buffer announcement from `peer`. The request's
    /// [`remote_buffer`](Request::remote_buffer) is set once it completes.
    pub fn receive_control(&self, peer: Rank) -> Result<Request<'_>> {
        let (_, backend) = self.backend_for(peer)?;
        let token = backend.receive_control(peer)?;
        Ok(Request::backend(self, token))
    }

    /// Post a one-sided write to `args.peer`.
    ///
    /// The matching control exchange must have completed first. With `track`
    /// the returned request reports local completion only.
    ///
    /// # Safety
    /// The source range must stay valid and unmodified until the write
    /// completes locally, and the destination must lie inside the buffer
    /// the peer announced with `args.remote`.
    pub unsafe fn put(&self, args: PutArgs, track: bool) -> Result<Option<Request<'_>>> {
        let (idx, backend) = self.backend_for(args.peer)?;
        let local = self.backend_reg(args.local, idx, args.src, args.len)?;
        let op = PutOp {
            src: args.src,
            dst: args.dst,
            len: args.len,
            peer: args.peer,
            local,
            remote: args.remote,
            notify: args.notify,
        };
        let token = unsafe { backend.put(op)? };
        Ok(track.then(|| Request::backend(self, token)))
    }

    /// Whether a notifying put from `peer` has landed since the last check.
    ///
    /// Drives the peer's backend once before looking, and consumes one
    /// pending notification when it returns `true`.
    pub fn check_notify(&self, peer: Rank) -> Result<bool> {
        let (_, backend) = self.backend_for(peer)?;
        backend.progress()?;
        backend.check_notify(peer)
    }

    /// Spin on [`check_notify`](Self::check_notify) until it returns `true`.
    ///
    /// There is no timeout and no way to cancel the wait. Callers that need a
    /// deadline should loop on `check_notify` themselves.
    pub fn wait_notify(&self, peer: Rank) -> Result<()> {
        while !self.check_notify(peer)? {
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Buffer a per-collective timestamp record.
    pub fn record_timestamp(&self, record: CollTimestamp) {
        self.profiler.push(record);
    }

    /// Emit buffered timestamp records once enough have accumulated, or
    /// unconditionally with `flush`. Returns the number emitted.
    pub fn report_profiling(&self, flush: bool) -> usize {
        self.profiler
            .report(flush, self.comm.rank, self.comm.comm_hash)
    }

    fn backend_for(&self, peer: Rank) -> Result<(usize, &Arc<dyn Backend>)> {
        match self.backend_slot(peer) {
            BackendSlot::Assigned(kind) => self
                .backends
                .iter()
                .enumerate()
                .find(|(_, b)| b.kind() == kind)
                .ok_or_else(|| CoreError::unavailable(peer, format!("{kind} backend missing"))),
            BackendSlot::Unset => Err(CoreError::unavailable(peer, "no backend assigned")),
        }
    }

    /// Backend registration for `handle`, checking that it covers the range.
    fn backend_reg(
        &self,
        handle: RegHandle,
        backend_idx: usize,
        addr: u64,
        len: usize,
    ) -> Result<BackendRegId> {
        let entry = self
            .cache
            .lookup(handle)?
            .ok_or_else(|| CoreError::invalid_buffer(addr, len, "stale registration handle"))?;
        let end = addr.checked_add(len as u64);
        if addr < entry.addr || end.is_none_or(|end| end > entry.end()) {
            return Err(CoreError::invalid_buffer(
                addr,
                len,
                format!(
                    "outside registration 0x{:x} ({} bytes)",
                    entry.addr, entry.len
                ),
            ));
        }
        entry
            .backend_handle(backend_idx)
            .ok_or_else(|| CoreError::invalid_buffer(addr, len, "buffer is not registered"))
    }

    /// Insert a new cache entry under the held guard, registering it when
    /// `register_now` is set. A failed registration leaves the cache as it
    /// was.
    fn insert_entry(
        &self,
        index: &mut RegIndex,
        addr: u64,
        len: usize,
        register_now: bool,
    ) -> Result<RegHandle> {
        let kind = self.device.memory_kind(addr)?;
        if !kind.is_registrable() {
            return Err(CoreError::invalid_buffer(
                addr,
                len,
                format!("{kind:?} memory is not a registrable device allocation"),
            ));
        }
        let handle = insert_checked(index, RegEntry::cached(addr, len))?;
        if !register_now {
            self.stats.on_cached();
        } else if let Err(e) = self.register_entry(index, handle) {
            index.remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Register a cached entry with every backend. Returns `false` when it
    /// was already registered. On failure, backends that already accepted it
    /// are rolled back and the entry stays cached.
    fn register_entry(&self, index: &mut RegIndex, handle: RegHandle) -> Result<bool> {
        let entry = index
            .get_mut(handle)
            .ok_or_else(|| CoreError::invalid_buffer(0, 0, "stale registration handle"))?;
        if entry.is_registered() {
            return Ok(false);
        }
        if self.backends.is_empty() {
            return Err(CoreError::unavailable(
                self.comm.rank,
                "no backend initialized to register with",
            ));
        }

        let start = Instant::now();
        let mut ids = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            match backend.register_buffer(entry.addr, entry.len) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for (b, id) in self.backends.iter().zip(ids) {
                        if let Err(undo) = b.deregister_buffer(id) {
                            tracing::warn!(rank = self.comm.rank, "rollback failed: {undo}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        entry.state = RegState::Registered(ids);
        tracing::debug!(
            rank = self.comm.rank,
            addr = entry.addr,
            len = entry.len,
            "registered buffer"
        );
        self.stats.on_registered();
        self.sample(DurationKind::Registration, start.elapsed());
        Ok(true)
    }

    /// Release an entry already removed from the cache.
    fn release_entry(&self, entry: RegEntry) -> Result<()> {
        let RegState::Registered(ids) = entry.state else {
            self.stats.on_uncached();
            return Ok(());
        };
        let start = Instant::now();
        let mut first_err = None;
        for (backend, id) in self.backends.iter().zip(ids) {
            if let Err(e) = backend.deregister_buffer(id)
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        self.stats.on_deregistered();
        self.sample(DurationKind::Deregistration, start.elapsed());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sample(&self, kind: DurationKind, elapsed: Duration) {
        if let Some((sink, _)) = &self.telemetry {
            sink.record(kind, elapsed);
        }
    }
}

impl Drop for Mapper {
    fn drop(&mut self) {
        self.profiler
            .report(true, self.comm.rank, self.comm.comm_hash);

        let entries = self.cache.drain();
        let swept = entries.len();
        let mut failed = 0usize;
        for entry in entries {
            if let Err(e) = self.release_entry(entry) {
                failed += 1;
                tracing::warn!(rank = self.comm.rank, "teardown deregistration failed: {e}");
            }
        }
        if swept > 0 {
            tracing::debug!(
                rank = self.comm.rank,
                swept,
                failed,
                "released outstanding registrations"
            );
        }

        if self.config.snapshot_cadence.is_enabled() {
            log_snapshot(self.comm.comm_hash, &self.stats.snapshot());
        }
        if let Some((sink, id)) = self.telemetry.take()
            && sink.detach(id)
        {
            sink.report();
        }

        if let Err(e) = self.device.destroy_stream(self.internal_stream) {
            tracing::warn!(rank = self.comm.rank, "failed to destroy internal stream: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::bootstrap::LocalBootstrap;
    use crate::config::SnapshotCadence;
    use crate::device::HostAdapter;
    use crate::loopback::LoopbackFabric;

    fn comm(rank: Rank, boot: LocalBootstrap, world: u32) -> CommInfo {
        CommInfo::new(rank, world, 0xc0ffee, Arc::new(boot))
    }

    fn config(mode: RegisterMode) -> MapperConfig {
        MapperConfig {
            register_mode: mode,
            ..MapperConfig::default()
        }
    }

    fn single(fabric: &LoopbackFabric, mode: RegisterMode) -> Mapper {
        let boot = LocalBootstrap::group(1).remove(0);
        Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
            .config(config(mode))
            .backend_factory(fabric.factory())
            .build()
            .unwrap()
    }

    #[test]
    fn test_eager_scenario() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);

        let h1 = mapper.register_buffer(0x1000, 4096, false).unwrap();
        assert!(mapper.entry(h1).unwrap().unwrap().is_registered());
        assert_eq!(fabric.stats().registrations, 1);

        assert_eq!(mapper.search(0x1000, 4096).unwrap(), Some(h1));
        assert_eq!(fabric.stats().registrations, 1);

        mapper.deregister_buffer(Some(h1)).unwrap();
        assert_eq!(mapper.search(0x1000, 4096).unwrap(), None);
        assert_eq!(fabric.stats().live, 0);
    }

    #[test]
    fn test_sub_range_reuses_registration() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);
        let h = mapper.register_buffer(0x10000, 0x4000, false).unwrap();
        for (addr, len) in [(0x10000, 1), (0x10800, 0x800), (0x13fff, 1), (0x10000, 0x4000)] {
            let r = mapper.resolve_for_transfer(addr, len).unwrap();
            assert_eq!(r, Resolved { handle: h, dynamic: false });
        }
        assert_eq!(fabric.stats().registrations, 1);
        assert_eq!(mapper.snapshot().lookup_hit_count, 4);
    }

    #[test]
    fn test_register_twice_returns_same_handle() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let a = mapper.register_buffer(0x1000, 4096, false).unwrap();
        let b = mapper.register_buffer(0x1000, 4096, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(mapper.snapshot().cached_count, 1);
    }

    #[test]
    fn test_lazy_registers_on_first_transfer() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let h = mapper.register_buffer(0x1000, 4096, false).unwrap();
        assert_eq!(mapper.entry(h).unwrap().unwrap().state, RegState::Cached);
        assert_eq!(fabric.stats().registrations, 0);

        let r = mapper.resolve_for_transfer(0x1000, 4096).unwrap();
        assert_eq!(r, Resolved { handle: h, dynamic: false });
        assert!(mapper.entry(h).unwrap().unwrap().is_registered());
        assert_eq!(fabric.stats().registrations, 1);

        let snap = mapper.snapshot();
        assert_eq!(snap.lookup_miss_count, 1);
        assert_eq!(snap.dynamic_count, 0);
        assert_eq!(snap.live_cached, 0);
        assert_eq!(snap.live_registered, 1);
    }

    #[test]
    fn test_force_eager_in_lazy_mode() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let h = mapper.register_buffer(0x1000, 64, true).unwrap();
        assert!(mapper.entry(h).unwrap().unwrap().is_registered());
    }

    #[test]
    fn test_dynamic_registration() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);

        let first = mapper.resolve_for_transfer(0x8000, 256).unwrap();
        assert!(first.dynamic);
        assert!(mapper.entry(first.handle).unwrap().unwrap().is_registered());

        let second = mapper.resolve_for_transfer(0x8000, 256).unwrap();
        assert_eq!(second, Resolved { handle: first.handle, dynamic: false });
        assert_eq!(fabric.stats().registrations, 1);
        assert_eq!(mapper.snapshot().dynamic_count, 1);

        mapper.deregister_buffer(Some(first.handle)).unwrap();
        assert!(mapper.resolve_for_transfer(0x8000, 256).unwrap().dynamic);
    }

    #[test]
    fn test_deregister_none_and_unknown() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);
        let h = mapper.register_buffer(0x1000, 64, false).unwrap();
        mapper.deregister_buffer(Some(h)).unwrap();
        let before = fabric.stats();

        mapper.deregister_buffer(None).unwrap();
        mapper.deregister_buffer(Some(h)).unwrap();
        assert_eq!(fabric.stats(), before);
        assert_eq!(mapper.snapshot().live_registered, 0);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);
        let old = mapper.register_buffer(0x1000, 64, false).unwrap();
        mapper.deregister_buffer(Some(old)).unwrap();
        let new = mapper.register_buffer(0x1000, 64, false).unwrap();
        assert_ne!(old, new);
        mapper.deregister_buffer(Some(old)).unwrap();
        assert_eq!(mapper.search(0x1000, 64).unwrap(), Some(new));
    }

    #[test]
    fn test_host_memory_is_rejected() {
        let fabric = LoopbackFabric::new(1);
        let boot = LocalBootstrap::group(1).remove(0);
        let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::new()))
            .config(config(RegisterMode::Eager))
            .backend_factory(fabric.factory())
            .build()
            .unwrap();

        let err = mapper.register_buffer(0x1000, 4096, false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuffer { addr: 0x1000, .. }));
        let err = mapper.resolve_for_transfer(0x1000, 4096).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuffer { .. }));
        assert_eq!(mapper.search(0x1000, 1).unwrap(), None);
        assert_eq!(fabric.stats().registrations, 0);
    }

    #[test]
    fn test_partial_overlap_is_rejected() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        mapper.register_buffer(0x1000, 0x1000, false).unwrap();
        let err = mapper.register_buffer(0x1800, 0x1000, false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuffer { .. }));
        let err = mapper.resolve_for_transfer(0x1800, 0x1000).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuffer { .. }));
        assert_eq!(mapper.snapshot().cached_count, 1);
    }

    #[test]
    fn test_registration_failure_leaves_cache_unchanged() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        fabric.fail_registrations(true);
        let err = mapper.register_buffer(0x1000, 64, true).unwrap_err();
        assert!(matches!(err, CoreError::RegistrationFailure { .. }));
        assert_eq!(mapper.search(0x1000, 64).unwrap(), None);

        let h = mapper.register_buffer(0x1000, 64, false).unwrap();
        assert!(mapper.resolve_for_transfer(0x1000, 64).is_err());
        assert_eq!(mapper.entry(h).unwrap().unwrap().state, RegState::Cached);

        fabric.fail_registrations(false);
        assert!(!mapper.resolve_for_transfer(0x1000, 64).unwrap().dynamic);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let fabric = LoopbackFabric::new(1);
        {
            let mapper = single(&fabric, RegisterMode::Lazy);
            for i in 0..5u64 {
                mapper.register_buffer(0x10000 * (i + 1), 4096, true).unwrap();
            }
            mapper.resolve_for_transfer(0x900000, 128).unwrap();
            // Cached-only entries need no backend call.
            mapper.register_buffer(0xa00000, 128, false).unwrap();
            assert_eq!(fabric.stats().live, 6);
        }
        let stats = fabric.stats();
        assert_eq!(stats.deregistrations, 6);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_teardown_sweeps_poisoned_cache() {
        let fabric = LoopbackFabric::new(1);
        {
            let mapper = single(&fabric, RegisterMode::Eager);
            mapper.register_buffer(0x1000, 4096, false).unwrap();
            mapper.resolve_for_transfer(0x9000, 64).unwrap();
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _guard = mapper.cache.lock().unwrap();
                panic!("poison the cache");
            }));
            assert!(mapper.search(0x1000, 1).is_err());
        }
        assert_eq!(fabric.stats().live, 0);
        assert_eq!(fabric.stats().deregistrations, 2);
    }

    #[test]
    fn test_cached_count_tracks_lazy_inserts_only() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);
        mapper.register_buffer(0x1000, 4096, false).unwrap();
        mapper.resolve_for_transfer(0x9000, 64).unwrap();
        let snap = mapper.snapshot();
        assert_eq!(snap.cached_count, 0);
        assert_eq!(snap.live_cached, 0);
        assert_eq!(snap.registered_count, 2);
        assert_eq!(snap.dynamic_count, 1);

        let lazy = single(&LoopbackFabric::new(1), RegisterMode::Lazy);
        let h = lazy.register_buffer(0x20000, 128, false).unwrap();
        assert_eq!(lazy.snapshot().live_cached, 1);
        lazy.register_buffer(0x20000, 128, true).unwrap();
        let snap = lazy.snapshot();
        assert_eq!(snap.cached_count, 1);
        assert_eq!(snap.live_cached, 0);
        assert_eq!(snap.live_registered, 1);
        lazy.deregister_buffer(Some(h)).unwrap();
        assert_eq!(lazy.snapshot().live_registered, 0);
    }

    #[test]
    fn test_empty_range_past_entry_end_is_not_a_hit() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Eager);
        mapper.register_buffer(0x1000, 0x1000, false).unwrap();
        assert_eq!(mapper.search(0x2000, 0).unwrap(), None);
        let err = mapper.resolve_for_transfer(0x2000, 0).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBuffer { len: 0, .. }));
    }

    #[test]
    fn test_unset_backend_degrades() {
        let fabric = LoopbackFabric::new(2);
        fabric.fail_bring_up(true);
        let boot = LocalBootstrap::group(2).remove(0);
        let mapper = Mapper::builder(comm(0, boot, 2), Arc::new(HostAdapter::device_emulating()))
            .config(config(RegisterMode::Lazy))
            .backend_factory(fabric.factory())
            .build()
            .unwrap();

        assert_eq!(mapper.backend_slot(1), BackendSlot::Unset);
        assert!(mapper.receive_control(1).err().unwrap().is_transport_unavailable());
        assert!(mapper.check_notify(1).unwrap_err().is_transport_unavailable());

        let h = mapper.register_buffer(0x1000, 64, false).unwrap();
        assert!(mapper.send_control(0x1000, h, 1).err().unwrap().is_transport_unavailable());
        assert!(
            mapper
                .resolve_for_transfer(0x1000, 64)
                .unwrap_err()
                .is_transport_unavailable()
        );
        mapper.progress().unwrap();
    }

    #[test]
    fn test_missing_factory_degrades() {
        let boot = LocalBootstrap::group(1).remove(0);
        let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
            .build()
            .unwrap();
        assert_eq!(mapper.backend_slot(0), BackendSlot::Unset);
        assert_eq!(mapper.backend_slot(9), BackendSlot::Unset);
    }

    #[test]
    fn test_slots_follow_fabric() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        assert_eq!(mapper.backend_slot(0), BackendSlot::Assigned(BackendKind::Ib));
    }

    #[test]
    fn test_copy_async_on_internal_and_caller_stream() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let src: Vec<u8> = (0..32).collect();
        let mut dst = vec![0u8; 32];
        let mut req = unsafe {
            mapper
                .copy_async(dst.as_mut_ptr() as u64, src.as_ptr() as u64, 32, None)
                .unwrap()
        };
        req.wait().unwrap();
        assert!(req.is_complete());
        assert_eq!(dst, src);

        let mut other = vec![0u8; 32];
        let mut req = unsafe {
            mapper
                .copy_async(other.as_mut_ptr() as u64, src.as_ptr() as u64, 32, Some(7))
                .unwrap()
        };
        assert!(req.test().unwrap());
        assert_eq!(other, src);
    }

    #[test]
    fn test_telemetry_attach_and_samples() {
        let fabric = LoopbackFabric::new(1);
        let sink = TelemetrySink::new(SnapshotCadence::AtTeardown);
        let boot = LocalBootstrap::group(1).remove(0);
        let cfg = MapperConfig {
            register_mode: RegisterMode::Lazy,
            snapshot_cadence: SnapshotCadence::AtTeardown,
            ..MapperConfig::default()
        };
        {
            let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
                .config(cfg)
                .backend_factory(fabric.factory())
                .telemetry(Arc::clone(&sink))
                .build()
                .unwrap();
            assert_eq!(sink.attached(), 1);
            let r = mapper.resolve_for_transfer(0x1000, 64).unwrap();
            mapper.resolve_for_transfer(0x1000, 64).unwrap();
            mapper.deregister_buffer(Some(r.handle)).unwrap();

            assert_eq!(sink.durations(DurationKind::Registration).count, 1);
            assert_eq!(sink.durations(DurationKind::Deregistration).count, 1);
            assert_eq!(sink.durations(DurationKind::LookupHit).count, 1);
            assert_eq!(sink.durations(DurationKind::LookupMiss).count, 1);
            assert_eq!(sink.aggregate().dynamic_count, 1);
        }
        assert_eq!(sink.attached(), 0);
    }

    #[test]
    fn test_periodic_snapshot_reports() {
        let fabric = LoopbackFabric::new(1);
        let sink = TelemetrySink::new(SnapshotCadence::Every(2));
        let boot = LocalBootstrap::group(1).remove(0);
        let cfg = MapperConfig {
            register_mode: RegisterMode::Eager,
            snapshot_cadence: SnapshotCadence::Every(2),
            ..MapperConfig::default()
        };
        {
            let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
                .config(cfg)
                .backend_factory(fabric.factory())
                .telemetry(Arc::clone(&sink))
                .build()
                .unwrap();
            mapper.register_buffer(0x1000, 64, false).unwrap();
            assert_eq!(sink.reports(), 0);
            mapper.register_buffer(0x2000, 64, false).unwrap();
            assert_eq!(sink.reports(), 1);
            mapper.register_buffer(0x3000, 64, false).unwrap();
            mapper.register_buffer(0x4000, 64, false).unwrap();
            mapper.register_buffer(0x5000, 64, false).unwrap();
            assert_eq!(sink.reports(), 2);
        }
        // The last mapper to detach reports once more.
        assert_eq!(sink.reports(), 3);
    }

    #[test]
    fn test_telemetry_disabled_by_cadence() {
        let fabric = LoopbackFabric::new(1);
        let sink = TelemetrySink::new(SnapshotCadence::AtTeardown);
        let boot = LocalBootstrap::group(1).remove(0);
        let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
            .backend_factory(fabric.factory())
            .telemetry(Arc::clone(&sink))
            .build()
            .unwrap();
        mapper.resolve_for_transfer(0x1000, 64).unwrap();
        assert_eq!(sink.attached(), 0);
        assert_eq!(sink.durations(DurationKind::LookupMiss).count, 0);
        assert_eq!(mapper.snapshot().lookup_miss_count, 1);
    }

    #[test]
    fn test_concurrent_resolve_registers_once() {
        let fabric = LoopbackFabric::new(1);
        let mapper = Arc::new(single(&fabric, RegisterMode::Lazy));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let mapper = Arc::clone(&mapper);
                std::thread::spawn(move || mapper.resolve_for_transfer(0x4000, 4096).unwrap())
            })
            .collect();
        let results: Vec<Resolved> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.dynamic).count(), 1);
        assert!(results.iter().all(|r| r.handle == results[0].handle));
        assert_eq!(fabric.stats().registrations, 1);
    }

    #[test]
    fn test_control_put_notify_across_ranks() {
        const LEN: usize = 4096;
        let fabric = LoopbackFabric::new(2);
        let boots = LocalBootstrap::group(2);

        let threads: Vec<_> = boots
            .into_iter()
            .enumerate()
            .map(|(rank, boot)| {
                let fabric = fabric.clone();
                std::thread::spawn(move || {
                    let rank = rank as Rank;
                    let mapper =
                        Mapper::builder(comm(rank, boot, 2), Arc::new(HostAdapter::device_emulating()))
                            .config(config(RegisterMode::Lazy))
                            .backend_factory(fabric.factory())
                            .build()
                            .unwrap();

                    if rank == 0 {
                        let src: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
                        let local = mapper
                            .resolve_for_transfer(src.as_ptr() as u64, LEN)
                            .unwrap();
                        let mut recv = mapper.receive_control(1).unwrap();
                        recv.wait().unwrap();
                        let remote = recv.remote_buffer().unwrap();

                        let args =
                            PutArgs::to_remote(src.as_ptr() as u64, local.handle, remote, 0, LEN, 1)
                                .with_notify();
                        let mut put = unsafe { mapper.put(args, true).unwrap().unwrap() };
                        put.wait().unwrap();
                        mapper.deregister_buffer(Some(local.handle)).unwrap();
                        None
                    } else {
                        let mut dst = vec![0u8; LEN];
                        let addr = dst.as_mut_ptr() as u64;
                        let local = mapper.resolve_for_transfer(addr, LEN).unwrap();
                        assert!(local.dynamic);
                        assert!(!mapper.check_notify(0).unwrap());

                        let mut sent = mapper.send_control(addr, local.handle, 0).unwrap();
                        sent.wait().unwrap();
                        mapper.wait_notify(0).unwrap();
                        assert!(!mapper.check_notify(0).unwrap());
                        Some(dst)
                    }
                })
            })
            .collect();

        let received: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        let dst = received[1].as_ref().unwrap();
        let expected: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
        assert_eq!(*dst, expected);
        assert_eq!(fabric.stats().live, 0);
    }

    #[test]
    fn test_put_requires_registered_source() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let h = mapper.register_buffer(0x1000, 64, false).unwrap();
        let args = PutArgs {
            src: 0x1000,
            dst: 0x2000,
            len: 64,
            peer: 0,
            local: h,
            remote: RemoteAccessKey::Ib { rkey: 1 },
            notify: false,
        };
        let err = unsafe { mapper.put(args, false) }.err().unwrap();
        assert!(matches!(err, CoreError::InvalidBuffer { .. }));

        let r = mapper.resolve_for_transfer(0x1000, 64).unwrap();
        let args = PutArgs { len: 128, local: r.handle, ..args };
        let err = unsafe { mapper.put(args, false) }.err().unwrap();
        assert!(matches!(err, CoreError::InvalidBuffer { .. }));
    }

    #[test]
    fn test_put_to_unknown_key_fails() {
        let fabric = LoopbackFabric::new(1);
        let mapper = single(&fabric, RegisterMode::Lazy);
        let src = [3u8; 64];
        let r = mapper.resolve_for_transfer(src.as_ptr() as u64, 64).unwrap();
        let args = PutArgs {
            src: src.as_ptr() as u64,
            dst: 0x2000,
            len: 64,
            peer: 0,
            local: r.handle,
            remote: RemoteAccessKey::Ib { rkey: 4242 },
            notify: false,
        };
        let err = unsafe { mapper.put(args, true) }.err().unwrap();
        assert!(matches!(err, CoreError::Backend { .. }));
    }

    #[test]
    fn test_profiling_flushes_at_teardown() {
        use crate::config::ProfilingMode;
        use crate::profiling::ProfileTarget;
        use std::sync::Mutex;

        #[derive(Default)]
        struct Capture(Mutex<Vec<usize>>);
        impl ProfileWriter for Capture {
            fn write(&self, _: &ProfileTarget, records: &[CollTimestamp]) -> Result<()> {
                self.0.lock().unwrap().push(records.len());
                Ok(())
            }
        }

        let writer = Arc::new(Capture::default());
        let boot = LocalBootstrap::group(1).remove(0);
        let cfg = MapperConfig {
            profiling: ProfilingMode::TraceFile,
            profiling_report_count: 2,
            ..MapperConfig::default()
        };
        {
            let mapper = Mapper::builder(comm(0, boot, 1), Arc::new(HostAdapter::device_emulating()))
                .config(cfg)
                .profile_writer(Arc::clone(&writer) as Arc<dyn ProfileWriter>)
                .build()
                .unwrap();
            for algo in ["allgather", "allgather", "alltoall"] {
                let mut ts = CollTimestamp::new(algo);
                ts.mark_put_issued(0);
                mapper.record_timestamp(ts);
            }
            assert_eq!(mapper.report_profiling(false), 3);
            mapper.record_timestamp(CollTimestamp::new("sendrecv"));
            assert_eq!(mapper.report_profiling(false), 0);
        }
        assert_eq!(*writer.0.lock().unwrap(), vec![3, 1]);
    }
}
