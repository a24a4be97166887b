//! Queue-pair endpoint exchange.
//!
//! Every rank prepares one RC queue pair per peer, then publishes its GID and
//! the `qp_num` it allocated for each peer in a single all-gather. A rank that
//! failed to bring up its device still joins the all-gather with an empty blob
//! so the rest of the group does not hang waiting for it.

use coltran::error::{CoreError, Result};
use coltran::types::{CommInfo, Rank};
use rkyv::util::AlignedVec;

/// One rank's contribution to the endpoint exchange.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EndpointTable {
    pub gid: [u8; 16],
    /// `qp_nums[j]` is the queue pair this rank created for rank `j`.
    /// Zero for itself and for peers it could not prepare a queue pair for.
    pub qp_nums: Vec<u32>,
}

impl EndpointTable {
    pub fn encode(&self) -> Result<AlignedVec> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| CoreError::Bootstrap(format!("endpoint table encode failed: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| CoreError::Bootstrap(format!("malformed endpoint table: {e}")))
    }

    /// The queue pair `owner` created for `peer`, if any.
    pub fn qp_for(&self, peer: Rank) -> Option<u32> {
        self.qp_nums.get(peer as usize).copied().filter(|&n| n != 0)
    }
}

/// Publish `local` (or nothing, if this rank failed to prepare) and collect
/// every rank's table. Ranks that contributed nothing come back as `None`.
pub fn exchange(comm: &CommInfo, local: Option<&EndpointTable>) -> Result<Vec<Option<EndpointTable>>> {
    let bytes = match local {
        Some(table) => table.encode()?.to_vec(),
        None => Vec::new(),
    };
    let gathered = comm.bootstrap.all_gather(&bytes)?;
    if gathered.len() != comm.world_size as usize {
        return Err(CoreError::Bootstrap(format!(
            "endpoint exchange returned {} entries for world size {}",
            gathered.len(),
            comm.world_size
        )));
    }

    Ok(gathered
        .iter()
        .enumerate()
        .map(|(rank, blob)| {
            if blob.is_empty() {
                return None;
            }
            match EndpointTable::decode(blob) {
                Ok(table) => Some(table),
                Err(e) => {
                    tracing::warn!(rank, "ib: ignoring peer endpoints: {e}");
                    None
                }
            }
        })
        .collect())
}
