//! Thin wrappers over raw `ibverbs-sys` FFI.

mod context;
mod mr;
mod qp;

pub use context::IbContext;
pub use mr::{MemoryRegion, MrTable, RegionKeys};
pub use qp::{LocalSge, PreparedQp, QpEndpoint, QueuePair};
