//! Verbs backend settings.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `COLTRAN_IB_`) or by constructing a custom `IbConfig`.

/// Settings for [`IbBackendFactory`](crate::IbBackendFactory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbConfig {
    /// Verbs device to open. `None` picks the first one.
    pub device_index: Option<usize>,

    pub port: u8,

    pub gid_index: u8,

    /// Entries in the shared completion queue.
    pub cq_depth: usize,

    /// Outstanding send work requests per queue pair.
    pub send_depth: u32,

    /// Receives kept posted per peer. Every control message and every
    /// notifying put consumes one until `progress` reposts it.
    pub recv_depth: u32,

    /// Control messages that may be in flight at once, across all peers.
    pub ctrl_send_slots: usize,
}

impl Default for IbConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            port: 1,
            gid_index: 0,
            cq_depth: 4096,
            send_depth: 256,
            recv_depth: 64,
            ctrl_send_slots: 256,
        }
    }
}

impl IbConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COLTRAN_IB_DEVICE`
    /// - `COLTRAN_IB_PORT`
    /// - `COLTRAN_IB_GID_INDEX`
    /// - `COLTRAN_IB_RECV_DEPTH`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("COLTRAN_IB_DEVICE")
            && let Ok(n) = v.trim().parse()
        {
            cfg.device_index = Some(n);
        }
        if let Some(v) = lookup("COLTRAN_IB_PORT")
            && let Ok(n) = v.trim().parse()
        {
            cfg.port = n;
        }
        if let Some(v) = lookup("COLTRAN_IB_GID_INDEX")
            && let Ok(n) = v.trim().parse()
        {
            cfg.gid_index = n;
        }
        if let Some(v) = lookup("COLTRAN_IB_RECV_DEPTH")
            && let Ok(n) = v.trim().parse::<u32>()
            && n > 0
        {
            cfg.recv_depth = n;
        }
        cfg
    }

    /// Completion queue entries needed for `world_size` ranks: every posted
    /// receive plus every send slot on every queue pair, never below
    /// `cq_depth`.
    pub fn cq_entries(&self, world_size: u32) -> usize {
        let peers = world_size.saturating_sub(1) as usize;
        let per_peer = (self.recv_depth as usize).saturating_add(self.send_depth as usize);
        peers
            .saturating_mul(per_peer)
            .saturating_add(self.ctrl_send_slots)
            .max(self.cq_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = IbConfig::from_lookup(|_| None);
        assert_eq!(cfg, IbConfig::default());
        assert_eq!(cfg.port, 1);
        assert_eq!(cfg.device_index, None);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cfg = IbConfig::from_lookup(|key| match key {
            "COLTRAN_IB_DEVICE" => Some("2".into()),
            "COLTRAN_IB_GID_INDEX" => Some("3".into()),
            "COLTRAN_IB_PORT" => Some("not-a-port".into()),
            "COLTRAN_IB_RECV_DEPTH" => Some("0".into()),
            _ => None,
        });
        assert_eq!(cfg.device_index, Some(2));
        assert_eq!(cfg.gid_index, 3);
        assert_eq!(cfg.port, 1);
        assert_eq!(cfg.recv_depth, 64);
    }

    #[test]
    fn test_cq_entries_scale_with_world() {
        let cfg = IbConfig::default();
        assert_eq!(cfg.cq_entries(1), cfg.cq_depth);
        assert_eq!(cfg.cq_entries(2), cfg.cq_depth);
        // 63 peers * (64 + 256) + 256 slots
        assert_eq!(cfg.cq_entries(64), 20_416);

        let small = IbConfig {
            cq_depth: 16,
            send_depth: 4,
            recv_depth: 2,
            ctrl_send_slots: 8,
            ..IbConfig::default()
        };
        assert_eq!(small.cq_entries(3), 20);
    }
}
