use crate::error::Result;
use crate::types::{MemoryKind, StreamHandle};

/// Completion marker for an asynchronous device copy.
pub trait CopyFence: Send {
    /// Non-blocking query.
    fn is_complete(&self) -> Result<bool>;
}

/// A fence that is already signalled (synchronous copies).
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadyFence;

impl CopyFence for ReadyFence {
    fn is_complete(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Bridges the mapper with the device runtime.
///
/// The mapper needs two things from the device side: whether a pointer is a
/// device allocation the NIC may register, and a local copy engine for the
/// non-RDMA path.
///
/// - `HostAdapter` (built-in): host memory, synchronous copies.
/// - `CudaAdapter` (`cuda` feature): driver pointer attributes, stream copies.
pub trait DeviceAdapter: Send + Sync {
    /// Classify the allocation that `addr` points into.
    fn memory_kind(&self, addr: u64) -> Result<MemoryKind>;

    /// Create a non-blocking stream for the mapper's internal copies.
    fn create_stream(&self) -> Result<StreamHandle>;

    /// Destroy a stream created by [`create_stream`](Self::create_stream).
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;

    /// Enqueue a `len`-byte copy from `src` to `dst` on `stream`.
    ///
    /// # Safety
    /// Both ranges must be valid for `len` bytes until the fence signals.
    unsafe fn copy_async(
        &self,
        dst: u64,
        src: u64,
        len: usize,
        stream: StreamHandle,
    ) -> Result<Box<dyn CopyFence>>;
}
