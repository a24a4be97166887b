//! Out-of-band exchange used by backends to wire up their connections.
//!
//! Backends only need one primitive: a blocking all-gather of a small byte
//! blob per rank (queue-pair endpoints, device identifiers). The communicator
//! that owns the mapper supplies the real implementation; [`LocalBootstrap`]
//! covers ranks that share one process.

use crate::error::{CoreError, Result};
use crate::types::Rank;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Blocking collective exchange over the communicator's side channel.
pub trait Bootstrap: Send + Sync {
    /// Contribute `local` and return every rank's contribution, indexed by rank.
    ///
    /// Must be called by all ranks of the communicator.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Option<Arc<Vec<Vec<u8>>>>,
}

struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    cv: Condvar,
}

/// In-process bootstrap: every rank is a handle onto the same shared round.
#[derive(Clone)]
pub struct LocalBootstrap {
    rank: Rank,
    shared: Arc<Shared>,
}

impl LocalBootstrap {
    /// Create one handle per rank for a group of `world_size` ranks.
    pub fn group(world_size: u32) -> Vec<LocalBootstrap> {
        Self::group_with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    pub fn group_with_timeout(world_size: u32, timeout: Duration) -> Vec<LocalBootstrap> {
        let n = world_size as usize;
        let shared = Arc::new(Shared {
            world_size: n,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: vec![None; n],
                published: None,
            }),
            cv: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| LocalBootstrap {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }
}

impl Bootstrap for LocalBootstrap {
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shared = &self.shared;
        let mut round = shared
            .round
            .lock()
            .map_err(|_| CoreError::LockPoisoned("local bootstrap"))?;

        let idx = self.rank as usize;
        if round.slots[idx].is_some() {
            return Err(CoreError::Bootstrap(format!(
                "rank {} entered all_gather twice in one round",
                self.rank
            )));
        }
        let generation = round.generation;
        round.slots[idx] = Some(local.to_vec());
        round.arrived += 1;

        if round.arrived == shared.world_size {
            let gathered: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            let gathered = Arc::new(gathered);
            round.published = Some(Arc::clone(&gathered));
            round.arrived = 0;
            round.generation += 1;
            shared.cv.notify_all();
            return Ok(gathered.as_ref().clone());
        }

        let deadline = Instant::now() + shared.timeout;
        while round.generation == generation {
            let now = Instant::now();
            if now >= deadline {
                round.slots[idx] = None;
                round.arrived -= 1;
                return Err(CoreError::Bootstrap(format!(
                    "rank {} timed out after {}ms waiting for {} of {} ranks",
                    self.rank,
                    shared.timeout.as_millis(),
                    shared.world_size - round.arrived,
                    shared.world_size
                )));
            }
            let (guard, _) = shared
                .cv
                .wait_timeout(round, deadline - now)
                .map_err(|_| CoreError::LockPoisoned("local bootstrap"))?;
            round = guard;
        }

        round
            .published
            .as_ref()
            .map(|g| g.as_ref().clone())
            .ok_or_else(|| CoreError::Bootstrap("round completed without a result".into()))
    }
}
