//! Transport capability interface.
//!
//! A backend owns everything transport-specific: how buffers are registered,
//! how control messages travel, how one-sided writes are posted and how their
//! completions surface. The mapper only sees the [`Backend`] trait, brings
//! backends up through [`BackendFactory`], and assigns one per remote rank.
//! A rank with no working backend holds [`BackendSlot::Unset`] and every
//! operation targeting it fails with `TransportUnavailable`.

mod completion;

pub use completion::CompletionToken;

use crate::error::Result;
use crate::types::{CommInfo, Rank};
use std::str::FromStr;
use std::sync::Arc;

/// Transports the mapper knows how to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// InfiniBand / RoCE verbs.
    Ib,
}

impl BackendKind {
    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Ib => "ib",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ib" => Ok(BackendKind::Ib),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Backend-side registration token, issued by [`Backend::register_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendRegId(pub u64);

/// What a peer needs to write into a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteAccessKey {
    Ib { rkey: u32 },
}

/// A peer's buffer as announced over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteBuffer {
    pub addr: u64,
    pub key: RemoteAccessKey,
}

/// A one-sided write request handed to [`Backend::put`].
#[derive(Debug, Clone, Copy)]
pub struct PutOp {
    pub src: u64,
    pub dst: u64,
    pub len: usize,
    pub peer: Rank,
    /// Registration covering `[src, src + len)`.
    pub local: BackendRegId,
    /// Key covering `[dst, dst + len)` on the peer.
    pub remote: RemoteAccessKey,
    /// Raise the peer's notify signal once the data has landed.
    pub notify: bool,
}

/// Per-rank backend assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSlot {
    Assigned(BackendKind),
    Unset,
}

/// A transport usable by the mapper.
///
/// All methods are non-blocking. Asynchronous operations return a
/// [`CompletionToken`] that the backend resolves from inside
/// [`progress`](Backend::progress). `progress` and completion polling need not
/// tolerate concurrent callers; one thread per communicator drives them.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend can carry traffic to `peer`. The mapper assigns
    /// each rank the first enabled backend that reaches it.
    fn reaches(&self, peer: Rank) -> bool {
        let _ = peer;
        true
    }

    /// Register `[addr, addr + len)` with the transport.
    fn register_buffer(&self, addr: u64, len: usize) -> Result<BackendRegId>;

    fn deregister_buffer(&self, id: BackendRegId) -> Result<()>;

    /// Send the location and access key of a local registered buffer to `peer`.
    fn send_control(&self, addr: u64, id: BackendRegId, peer: Rank)
    -> Result<Arc<CompletionToken>>;

    /// Receive the next buffer announcement from `peer`.
    ///
    /// The token's [`remote`](CompletionToken::remote) is set on completion.
    fn receive_control(&self, peer: Rank) -> Result<Arc<CompletionToken>>;

    /// Post a one-sided write. The token completes on local send completion.
    ///
    /// # Safety
    /// `[op.src, op.src + op.len)` must stay valid and unmodified until the
    /// token completes, and `[op.dst, op.dst + op.len)` must lie inside the
    /// peer buffer that `op.remote` was issued for.
    unsafe fn put(&self, op: PutOp) -> Result<Arc<CompletionToken>>;

    /// Consume one pending notification from `peer`, if any.
    fn check_notify(&self, peer: Rank) -> Result<bool>;

    /// Advance outstanding operations. Never blocks.
    fn progress(&self) -> Result<()>;
}

/// Builds a backend for a communicator.
pub trait BackendFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create(&self, comm: &CommInfo) -> Result<Arc<dyn Backend>>;
}
