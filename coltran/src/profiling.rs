//! Per-collective timestamp records.
//!
//! Collective algorithms open a [`CollTimestamp`] per operation and mark when
//! control messages arrive and when puts are issued and complete. The mapper
//! buffers the records and flushes them once `profiling_report_count` have
//! accumulated, or at teardown. Text modes render a plain report; trace-file
//! mode passes the records to an installed [`ProfileWriter`].

use crate::config::ProfilingMode;
use crate::error::Result;
use crate::types::Rank;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPoint {
    pub peer: Rank,
    pub at: SystemTime,
}

impl TimestampPoint {
    pub fn now(peer: Rank) -> Self {
        Self {
            peer,
            at: SystemTime::now(),
        }
    }

    pub fn nanos_since_epoch(&self) -> u128 {
        nanos(self.at)
    }
}

/// Timeline of one collective operation.
#[derive(Debug, Clone)]
pub struct CollTimestamp {
    pub algo: String,
    pub start: SystemTime,
    pub recv_ctrl: Vec<TimestampPoint>,
    pub put_issued: Vec<TimestampPoint>,
    pub put_complete: Vec<TimestampPoint>,
}

impl CollTimestamp {
    pub fn new(algo: impl Into<String>) -> Self {
        Self {
            algo: algo.into(),
            start: SystemTime::now(),
            recv_ctrl: Vec::new(),
            put_issued: Vec::new(),
            put_complete: Vec::new(),
        }
    }

    pub fn mark_recv_ctrl(&mut self, peer: Rank) {
        self.recv_ctrl.push(TimestampPoint::now(peer));
    }

    pub fn mark_put_issued(&mut self, peer: Rank) {
        self.put_issued.push(TimestampPoint::now(peer));
    }

    pub fn mark_put_complete(&mut self, peer: Rank) {
        self.put_complete.push(TimestampPoint::now(peer));
    }
}

/// Identifies one flush for a [`ProfileWriter`].
#[derive(Debug, Clone)]
pub struct ProfileTarget {
    pub dir: PathBuf,
    pub pid: u32,
    pub rank: Rank,
    pub comm_hash: u64,
    /// Increments per flush of this mapper.
    pub seq: u64,
}

/// Destination for trace-file profiling. Formatting and file layout are the
/// writer's business.
pub trait ProfileWriter: Send + Sync {
    fn write(&self, target: &ProfileTarget, records: &[CollTimestamp]) -> Result<()>;
}

pub(crate) struct Profiler {
    mode: ProfilingMode,
    report_count: usize,
    dir: PathBuf,
    writer: Option<Arc<dyn ProfileWriter>>,
    records: Mutex<Vec<CollTimestamp>>,
    seq: AtomicU64,
}

impl Profiler {
    pub(crate) fn new(
        mode: ProfilingMode,
        report_count: usize,
        dir: PathBuf,
        writer: Option<Arc<dyn ProfileWriter>>,
    ) -> Self {
        Self {
            mode,
            report_count,
            dir,
            writer,
            records: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, record: CollTimestamp) {
        if self.mode == ProfilingMode::None {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record);
    }

    pub(crate) fn pending(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Flush buffered records once more than `report_count` are pending, or
    /// unconditionally when `flush` is set. Returns how many were flushed.
    pub(crate) fn report(&self, flush: bool, rank: Rank, comm_hash: u64) -> usize {
        let records = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if records.is_empty() || (!flush && records.len() <= self.report_count) {
                return 0;
            }
            std::mem::take(&mut *records)
        };

        match self.mode {
            ProfilingMode::None => {}
            ProfilingMode::Stdout => print!("{}", render_text(&records)),
            ProfilingMode::Info => {
                for record in &records {
                    tracing::info!("{}", render_text(std::slice::from_ref(record)));
                }
            }
            ProfilingMode::TraceFile => {
                let target = ProfileTarget {
                    dir: self.dir.clone(),
                    pid: std::process::id(),
                    rank,
                    comm_hash,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                };
                match &self.writer {
                    Some(writer) => {
                        if let Err(e) = writer.write(&target, &records) {
                            tracing::warn!(rank, "profile dump to {:?} failed: {e}", target.dir);
                        }
                    }
                    None => tracing::warn!(
                        rank,
                        "trace-file profiling enabled without a profile writer; dropping {} records",
                        records.len()
                    ),
                }
            }
        }
        records.len()
    }
}

fn nanos(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

/// Plain-text rendering used by the stdout and info modes.
pub fn render_text(records: &[CollTimestamp]) -> String {
    let mut out = String::from("[coltran] communication profiling:\n");
    for ts in records {
        let _ = writeln!(out, "    collective={}", ts.algo);
        let _ = writeln!(out, "    startTime={}", nanos(ts.start));
        for (label, points) in [
            ("recvCtrl", &ts.recv_ctrl),
            ("putIssued", &ts.put_issued),
            ("putComplete", &ts.put_complete),
        ] {
            for p in points {
                let _ = writeln!(out, "        {label}[{}]={}", p.peer, p.nanos_since_epoch());
            }
        }
    }
    out
}
