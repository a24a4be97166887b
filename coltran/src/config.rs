//! Process-wide mapper settings.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `COLTRAN_`) or by constructing a custom `MapperConfig`. The config is read
//! once before the first mapper is built and treated as read-only afterwards.

use crate::backend::BackendKind;
use std::path::PathBuf;
use std::str::FromStr;

/// When user-provided buffers are registered with the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterMode {
    /// No eager registration of user buffers; transfers still register on demand.
    None,
    /// Track user buffers, register at first use in a transfer.
    #[default]
    Lazy,
    /// Register as soon as the user provides the buffer.
    Eager,
}

impl FromStr for RegisterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lazy" => Ok(Self::Lazy),
            "eager" => Ok(Self::Eager),
            other => Err(format!("unknown register mode '{other}'")),
        }
    }
}

/// Where per-collective profiling records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfilingMode {
    #[default]
    None,
    /// Print the text report to stdout.
    Stdout,
    /// Emit the text report through `tracing` at info level.
    Info,
    /// Hand records to the installed [`ProfileWriter`](crate::profiling::ProfileWriter).
    TraceFile,
}

impl FromStr for ProfilingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "stdout" => Ok(Self::Stdout),
            "info" => Ok(Self::Info),
            "trace-file" | "trace_file" | "kineto" => Ok(Self::TraceFile),
            other => Err(format!("unknown profiling mode '{other}'")),
        }
    }
}

/// Snapshot reporting cadence for registration telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotCadence {
    /// No telemetry samples are recorded.
    #[default]
    Disabled,
    /// Report once, when the mapper is torn down.
    AtTeardown,
    /// Report at teardown and after every N registrations process-wide.
    Every(u64),
}

impl SnapshotCadence {
    /// Map the integer knob: negative disables, 0 is teardown-only, N is periodic.
    pub fn from_count(count: i64) -> Self {
        match count {
            n if n < 0 => Self::Disabled,
            0 => Self::AtTeardown,
            n => Self::Every(n as u64),
        }
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Settings consumed by every [`Mapper`](crate::Mapper).
#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub register_mode: RegisterMode,

    /// Backends to bring up, in preference order.
    pub backends: Vec<BackendKind>,

    pub profiling: ProfilingMode,

    /// Directory handed to the profile writer in trace-file mode.
    pub profile_dir: PathBuf,

    pub snapshot_cadence: SnapshotCadence,

    /// Number of buffered profiling records that triggers a report.
    pub profiling_report_count: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            register_mode: RegisterMode::Lazy,
            backends: vec![BackendKind::Ib],
            profiling: ProfilingMode::None,
            profile_dir: PathBuf::from("/tmp"),
            snapshot_cadence: SnapshotCadence::Disabled,
            profiling_report_count: 100,
        }
    }
}

impl MapperConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COLTRAN_REGISTER` (`none`, `lazy`, `eager`)
    /// - `COLTRAN_BACKENDS` (comma separated, `ib`)
    /// - `COLTRAN_PROFILING` (`none`, `stdout`, `info`, `trace-file`)
    /// - `COLTRAN_PROFILE_DIR`
    /// - `COLTRAN_REGISTER_REPORT_SNAPSHOT_COUNT`
    /// - `COLTRAN_PROFILING_REPORT_COUNT`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("COLTRAN_REGISTER") {
            match v.parse() {
                Ok(mode) => cfg.register_mode = mode,
                Err(e) => tracing::warn!("ignoring COLTRAN_REGISTER: {e}"),
            }
        }
        if let Some(v) = lookup("COLTRAN_BACKENDS") {
            let mut kinds = Vec::new();
            for name in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match name.parse::<BackendKind>() {
                    Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("ignoring COLTRAN_BACKENDS entry: {e}"),
                }
            }
            cfg.backends = kinds;
        }
        if let Some(v) = lookup("COLTRAN_PROFILING") {
            match v.parse() {
                Ok(mode) => cfg.profiling = mode,
                Err(e) => tracing::warn!("ignoring COLTRAN_PROFILING: {e}"),
            }
        }
        if let Some(v) = lookup("COLTRAN_PROFILE_DIR") {
            cfg.profile_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("COLTRAN_REGISTER_REPORT_SNAPSHOT_COUNT") {
            if let Ok(n) = v.trim().parse::<i64>() {
                cfg.snapshot_cadence = SnapshotCadence::from_count(n);
            }
        }
        if let Some(v) = lookup("COLTRAN_PROFILING_REPORT_COUNT") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.profiling_report_count = n;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = MapperConfig::from_lookup(|_| None);
        assert_eq!(cfg.register_mode, RegisterMode::Lazy);
        assert_eq!(cfg.backends, vec![BackendKind::Ib]);
        assert_eq!(cfg.profiling, ProfilingMode::None);
        assert_eq!(cfg.snapshot_cadence, SnapshotCadence::Disabled);
        assert_eq!(cfg.profiling_report_count, 100);
        assert_eq!(cfg.profile_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_overrides() {
        let cfg = MapperConfig::from_lookup(lookup(&[
            ("COLTRAN_REGISTER", "EAGER"),
            ("COLTRAN_BACKENDS", "ib, ib"),
            ("COLTRAN_PROFILING", "trace-file"),
            ("COLTRAN_PROFILE_DIR", "/var/log/coltran"),
            ("COLTRAN_REGISTER_REPORT_SNAPSHOT_COUNT", "50"),
            ("COLTRAN_PROFILING_REPORT_COUNT", "7"),
        ]));
        assert_eq!(cfg.register_mode, RegisterMode::Eager);
        assert_eq!(cfg.backends, vec![BackendKind::Ib]);
        assert_eq!(cfg.profiling, ProfilingMode::TraceFile);
        assert_eq!(cfg.profile_dir, PathBuf::from("/var/log/coltran"));
        assert_eq!(cfg.snapshot_cadence, SnapshotCadence::Every(50));
        assert_eq!(cfg.profiling_report_count, 7);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let cfg = MapperConfig::from_lookup(lookup(&[
            ("COLTRAN_REGISTER", "sometimes"),
            ("COLTRAN_BACKENDS", "carrier-pigeon"),
            ("COLTRAN_REGISTER_REPORT_SNAPSHOT_COUNT", "lots"),
        ]));
        assert_eq!(cfg.register_mode, RegisterMode::Lazy);
        assert!(cfg.backends.is_empty());
        assert_eq!(cfg.snapshot_cadence, SnapshotCadence::Disabled);
    }

    #[test]
    fn test_snapshot_cadence_from_count() {
        assert_eq!(SnapshotCadence::from_count(-1), SnapshotCadence::Disabled);
        assert_eq!(SnapshotCadence::from_count(0), SnapshotCadence::AtTeardown);
        assert_eq!(SnapshotCadence::from_count(3), SnapshotCadence::Every(3));
        assert!(!SnapshotCadence::Disabled.is_enabled());
        assert!(SnapshotCadence::AtTeardown.is_enabled());
    }
}
