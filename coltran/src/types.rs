use std::sync::Arc;

use crate::bootstrap::Bootstrap;

/// Rank of a participant in a communicator (0-indexed).
pub type Rank = u32;

/// Raw stream handle (a `CUstream` for CUDA adapters, 0 for the default stream).
pub type StreamHandle = u64;

/// Where a pointer lives, as reported by a [`DeviceAdapter`](crate::device::DeviceAdapter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Device,
    Managed,
    Unregistered,
}

impl MemoryKind {
    /// Only plain device allocations qualify for registration with the NIC.
    pub const fn is_registrable(self) -> bool {
        matches!(self, MemoryKind::Device)
    }
}

/// Communicator identity handed to the mapper and its backends.
#[derive(Clone)]
pub struct CommInfo {
    pub rank: Rank,
    pub world_size: u32,
    pub comm_hash: u64,
    pub bootstrap: Arc<dyn Bootstrap>,
}

impl CommInfo {
    pub fn new(rank: Rank, world_size: u32, comm_hash: u64, bootstrap: Arc<dyn Bootstrap>) -> Self {
        Self {
            rank,
            world_size,
            comm_hash,
            bootstrap,
        }
    }

    /// Ranks other than this one, in ascending order.
    pub fn peers(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.world_size).filter(move |&r| r != self.rank)
    }
}

impl std::fmt::Debug for CommInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommInfo")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("comm_hash", &format_args!("{:#x}", self.comm_hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::LocalBootstrap;

    #[test]
    fn test_peers_skip_self() {
        let boots = LocalBootstrap::group(4);
        let comm = CommInfo::new(2, 4, 0xabc, Arc::new(boots[2].clone()));
        let peers: Vec<Rank> = comm.peers().collect();
        assert_eq!(peers, vec![0, 1, 3]);
    }

    #[test]
    fn test_memory_kind_registrable() {
        assert!(MemoryKind::Device.is_registrable());
        assert!(!MemoryKind::Host.is_registrable());
        assert!(!MemoryKind::Managed.is_registrable());
        assert!(!MemoryKind::Unregistered.is_registrable());
    }
}
