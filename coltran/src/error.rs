use crate::types::Rank;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid buffer 0x{addr:x} ({len} bytes): {reason}")]
    InvalidBuffer {
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("no transport available for rank {rank}: {reason}")]
    TransportUnavailable { rank: Rank, reason: String },

    #[error("{backend} backend failed to {op} buffer 0x{addr:x} ({len} bytes): {reason}")]
    RegistrationFailure {
        backend: &'static str,
        op: &'static str,
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("failed to bring up {backend} backend: {reason}")]
    AllocationFailure {
        backend: &'static str,
        reason: String,
    },

    #[error("backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device adapter error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("bootstrap exchange failed: {0}")]
    Bootstrap(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl CoreError {
    /// Create a `Backend` error with just a message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Backend` error with a message and a source error.
    pub fn backend_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_buffer(addr: u64, len: usize, reason: impl Into<String>) -> Self {
        Self::InvalidBuffer {
            addr,
            len,
            reason: reason.into(),
        }
    }

    pub fn unavailable(rank: Rank, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            rank,
            reason: reason.into(),
        }
    }

    /// Whether this error means the target rank has no usable transport.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, Self::TransportUnavailable { .. })
    }

    /// Duplicate the error for fan-out to several waiters.
    ///
    /// Source chains are flattened into the message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidBuffer { addr, len, reason } => Self::InvalidBuffer {
                addr: *addr,
                len: *len,
                reason: reason.clone(),
            },
            Self::TransportUnavailable { rank, reason } => Self::TransportUnavailable {
                rank: *rank,
                reason: reason.clone(),
            },
            Self::RegistrationFailure {
                backend,
                op,
                addr,
                len,
                reason,
            } => Self::RegistrationFailure {
                backend,
                op,
                addr: *addr,
                len: *len,
                reason: reason.clone(),
            },
            Self::AllocationFailure { backend, reason } => Self::AllocationFailure {
                backend,
                reason: reason.clone(),
            },
            Self::Backend { .. } => Self::backend(self.to_string()),
            Self::Device { .. } => Self::device(self.to_string()),
            Self::Bootstrap(msg) => Self::Bootstrap(msg.clone()),
            Self::LockPoisoned(what) => Self::LockPoisoned(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_buffer_display() {
        let e = CoreError::invalid_buffer(0x1000, 4096, "not a device buffer");
        assert_eq!(
            e.to_string(),
            "invalid buffer 0x1000 (4096 bytes): not a device buffer"
        );
    }

    #[test]
    fn test_registration_failure_display() {
        let e = CoreError::RegistrationFailure {
            backend: "ib",
            op: "register",
            addr: 0xff,
            len: 8,
            reason: "ibv_reg_mr returned null".into(),
        };
        assert_eq!(
            e.to_string(),
            "ib backend failed to register buffer 0xff (8 bytes): ibv_reg_mr returned null"
        );
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let e = CoreError::unavailable(3, "backend unset");
        let d = e.duplicate();
        assert!(d.is_transport_unavailable());
        assert_eq!(e.to_string(), d.to_string());

        let io = std::io::Error::other("boom");
        let e = CoreError::backend_with_source("post failed", io);
        assert!(e.duplicate().to_string().contains("post failed"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<CoreError> = vec![
            CoreError::invalid_buffer(0, 0, "zero length"),
            CoreError::unavailable(1, "unset"),
            CoreError::RegistrationFailure {
                backend: "ib",
                op: "deregister",
                addr: 1,
                len: 1,
                reason: "x".into(),
            },
            CoreError::AllocationFailure {
                backend: "ib",
                reason: "no devices".into(),
            },
            CoreError::backend("poll_cq failed"),
            CoreError::device("oom"),
            CoreError::Bootstrap("peer vanished".into()),
            CoreError::LockPoisoned("regcache"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
