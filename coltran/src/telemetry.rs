//! Registration telemetry: per-mapper counters and a process-wide sink.
//!
//! Each mapper owns a [`MapperStats`] and, when snapshot reporting is enabled,
//! attaches it to an injected [`TelemetrySink`] at construction and detaches
//! it at teardown. The sink aggregates duration samples across all attached
//! mappers and can report the whole process on demand. Nothing here feeds
//! back into mapper control flow.

use crate::config::SnapshotCadence;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a duration sample measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationKind {
    Registration,
    Deregistration,
    LookupHit,
    LookupMiss,
}

impl DurationKind {
    pub const ALL: [DurationKind; 4] = [
        DurationKind::Registration,
        DurationKind::Deregistration,
        DurationKind::LookupHit,
        DurationKind::LookupMiss,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            DurationKind::Registration => "registration",
            DurationKind::Deregistration => "deregistration",
            DurationKind::LookupHit => "lookup-hit",
            DurationKind::LookupMiss => "lookup-miss",
        }
    }
}

/// Point-in-time registration counters.
///
/// The `*_count` fields are lifetime totals; `live_*` are current values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegSnapshot {
    pub cached_count: u64,
    pub registered_count: u64,
    pub dynamic_count: u64,
    pub lookup_hit_count: u64,
    pub lookup_miss_count: u64,
    pub live_cached: i64,
    pub live_registered: i64,
}

impl RegSnapshot {
    pub fn merge(&mut self, other: &RegSnapshot) {
        self.cached_count += other.cached_count;
        self.registered_count += other.registered_count;
        self.dynamic_count += other.dynamic_count;
        self.lookup_hit_count += other.lookup_hit_count;
        self.lookup_miss_count += other.lookup_miss_count;
        self.live_cached += other.live_cached;
        self.live_registered += other.live_registered;
    }
}

/// Lock-free counters owned by one mapper.
#[derive(Debug, Default)]
pub struct MapperStats {
    total_cached: AtomicU64,
    total_registered: AtomicU64,
    total_dynamic: AtomicU64,
    lookup_hit: AtomicU64,
    lookup_miss: AtomicU64,
    live_cached: AtomicI64,
    live_registered: AtomicI64,
}

impl MapperStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer entered the cache without being registered.
    pub(crate) fn on_cached(&self) {
        self.total_cached.fetch_add(1, Ordering::Relaxed);
        self.live_cached.fetch_add(1, Ordering::Relaxed);
    }

    /// A cached-only entry was dropped or promoted.
    pub(crate) fn on_uncached(&self) {
        self.live_cached.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn on_registered(&self) {
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        self.live_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_deregistered(&self) {
        self.live_registered.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn on_lookup_hit(&self) {
        self.lookup_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_lookup_miss(&self, dynamic: bool) {
        self.lookup_miss.fetch_add(1, Ordering::Relaxed);
        if dynamic {
            self.total_dynamic.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RegSnapshot {
        RegSnapshot {
            cached_count: self.total_cached.load(Ordering::Relaxed),
            registered_count: self.total_registered.load(Ordering::Relaxed),
            dynamic_count: self.total_dynamic.load(Ordering::Relaxed),
            lookup_hit_count: self.lookup_hit.load(Ordering::Relaxed),
            lookup_miss_count: self.lookup_miss.load(Ordering::Relaxed),
            live_cached: self.live_cached.load(Ordering::Relaxed),
            live_registered: self.live_registered.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate of the samples recorded for one [`DurationKind`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DurationSummary {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationSummary {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    fn add(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.max = self.max.max(d);
    }
}

/// Identifies one attached mapper inside a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapperId(u64);

struct Attached {
    comm_hash: u64,
    stats: Arc<MapperStats>,
}

#[derive(Default)]
struct SinkState {
    next_id: u64,
    mappers: HashMap<MapperId, Attached>,
    durations: HashMap<DurationKind, DurationSummary>,
}

/// Process-wide collector shared by every mapper that reports telemetry.
pub struct TelemetrySink {
    cadence: SnapshotCadence,
    state: Mutex<SinkState>,
    reports: AtomicU64,
}

impl TelemetrySink {
    /// `Every(0)` is treated as [`SnapshotCadence::AtTeardown`].
    pub fn new(cadence: SnapshotCadence) -> Arc<Self> {
        let cadence = match cadence {
            SnapshotCadence::Every(0) => SnapshotCadence::AtTeardown,
            other => other,
        };
        Arc::new(Self {
            cadence,
            state: Mutex::new(SinkState::default()),
            reports: AtomicU64::new(0),
        })
    }

    pub fn cadence(&self) -> SnapshotCadence {
        self.cadence
    }

    pub fn attach(&self, comm_hash: u64, stats: Arc<MapperStats>) -> MapperId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = MapperId(state.next_id);
        state.next_id += 1;
        state.mappers.insert(id, Attached { comm_hash, stats });
        id
    }

    /// Detach a mapper. Returns `true` when it was the last one attached.
    pub fn detach(&self, id: MapperId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.mappers.remove(&id);
        state.mappers.is_empty()
    }

    /// Record one duration sample.
    ///
    /// With [`SnapshotCadence::Every`], every N-th registration sample triggers
    /// a full [`report`](Self::report).
    pub fn record(&self, kind: DurationKind, duration: Duration) {
        let should_report = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let summary = state.durations.entry(kind).or_default();
            summary.add(duration);
            match self.cadence {
                SnapshotCadence::Every(n) => {
                    kind == DurationKind::Registration
                        && summary.count.checked_rem(n) == Some(0)
                }
                _ => false,
            }
        };
        // Report re-locks the state.
        if should_report {
            self.report();
        }
    }

    pub fn durations(&self, kind: DurationKind) -> DurationSummary {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.durations.get(&kind).copied().unwrap_or_default()
    }

    /// Snapshot of one attached mapper.
    pub fn snapshot(&self, id: MapperId) -> Option<RegSnapshot> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.mappers.get(&id).map(|m| m.stats.snapshot())
    }

    /// Sum of the snapshots of every attached mapper.
    pub fn aggregate(&self) -> RegSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut total = RegSnapshot::default();
        for m in state.mappers.values() {
            total.merge(&m.stats.snapshot());
        }
        total
    }

    pub fn attached(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.mappers.len()
    }

    /// Number of reports emitted so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    /// Log every attached mapper's counters and the process-wide latencies.
    pub fn report(&self) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for m in state.mappers.values() {
            log_snapshot(m.comm_hash, &m.stats.snapshot());
        }
        for kind in DurationKind::ALL {
            let Some(summary) = state.durations.get(&kind) else {
                continue;
            };
            if summary.count == 0 {
                continue;
            }
            tracing::info!(
                kind = kind.name(),
                count = summary.count,
                total_ms = summary.total.as_secs_f64() * 1e3,
                avg_ms = summary.average().as_secs_f64() * 1e3,
                max_ms = summary.max.as_secs_f64() * 1e3,
                "register snapshot: {} latency across all comms",
                kind.name()
            );
        }
    }
}

pub(crate) fn log_snapshot(comm_hash: u64, snap: &RegSnapshot) {
    tracing::info!(
        comm_hash,
        cached = snap.cached_count,
        registered = snap.registered_count,
        dynamic = snap.dynamic_count,
        lookup_hit = snap.lookup_hit_count,
        lookup_miss = snap.lookup_miss_count,
        "register snapshot"
    );
}
