//! Distributed bookkeeping: rank discovery, coordinator role and collectives.
//!
//! Gradient synchronisation is left to the tensor framework; this module only
//! carries what the driver itself needs: who writes files, which shard of the
//! training set a rank sees, and summing running statistics across ranks.

use std::env;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Whether a rank owns shared side effects (files, logs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator)
    }
}

/// Rank and world size of the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single_process()
    }
}

impl DistributedContext {
    pub fn single_process() -> Self {
        Self { rank: 0, world_size: 1, local_rank: 0 }
    }

    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Distributed("world size must be positive".into()));
        }
        if rank >= world_size {
            return Err(Error::Distributed(format!(
                "rank {rank} is out of bounds for world size {world_size}"
            )));
        }
        Ok(Self { rank, world_size, local_rank: rank })
    }

    /// Read `RANK`, `WORLD_SIZE` and `LOCAL_RANK` (defaults 0, 1, 0).
    pub fn from_env() -> Result<Self> {
        let rank = read_env_usize("RANK")?.unwrap_or(0);
        let world_size = read_env_usize("WORLD_SIZE")?.unwrap_or(1);
        let local_rank = read_env_usize("LOCAL_RANK")?.unwrap_or(rank);
        let mut ctx = Self::new(rank, world_size)?;
        ctx.local_rank = local_rank;
        Ok(ctx)
    }

    pub fn role(&self) -> Role {
        if self.rank == 0 {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.role().is_coordinator()
    }
}

fn read_env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| Error::Distributed(format!("{name}={raw} is not a valid integer: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Distributed(format!("{name}: {e}"))),
    }
}

/// Collective operations over all ranks of a run.
///
/// Every rank must call each operation the same number of times; a missing
/// participant blocks the others indefinitely.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum of `values` across ranks, written back in place.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&mut [])
    }
}

/// Single-process collective; every operation is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GroupInner {
    arrived: usize,
    generation: u64,
    buffer: Vec<f64>,
    result: Vec<f64>,
}

#[derive(Debug)]
struct GroupState {
    world_size: usize,
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

/// In-process rendezvous where each rank runs on its own thread.
#[derive(Debug, Clone)]
pub struct RendezvousCollective {
    group: Arc<GroupState>,
    rank: usize,
}

impl RendezvousCollective {
    /// One handle per rank, all joined to the same group.
    pub fn group(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::Distributed("world size must be positive".into()));
        }
        let group = Arc::new(GroupState {
            world_size,
            inner: Mutex::new(GroupInner::default()),
            condvar: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| Self { group: Arc::clone(&group), rank })
            .collect())
    }
}

impl Collective for RendezvousCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let poisoned = |_| Error::Distributed("rendezvous lock poisoned".into());
        let mut state = self.group.inner.lock().map_err(poisoned)?;

        if state.arrived == 0 {
            state.buffer.clear();
            state.buffer.resize(values.len(), 0.0);
        } else if state.buffer.len() != values.len() {
            return Err(Error::Distributed(format!(
                "all_reduce buffer length mismatch: expected {}, got {}",
                state.buffer.len(),
                values.len()
            )));
        }

        for (acc, value) in state.buffer.iter_mut().zip(values.iter()) {
            *acc += value;
        }
        state.arrived += 1;

        let generation = state.generation;
        if state.arrived == self.group.world_size {
            state.result = std::mem::take(&mut state.buffer);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.group.condvar.notify_all();
        } else {
            while state.generation == generation {
                state = self.group.condvar.wait(state).map_err(poisoned)?;
            }
        }

        values.copy_from_slice(&state.result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_is_coordinator() {
        let ctx = DistributedContext::single_process();
        assert_eq!(ctx.role(), Role::Coordinator);
        assert!(ctx.is_coordinator());
    }

    #[test]
    fn test_rank_out_of_bounds() {
        assert!(DistributedContext::new(2, 2).is_err());
        assert!(DistributedContext::new(0, 0).is_err());
        let worker = DistributedContext::new(1, 2).unwrap();
        assert_eq!(worker.role(), Role::Worker);
    }

    #[test]
    fn test_local_collective_is_identity() {
        let mut values = [1.0, 2.5];
        LocalCollective.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, [1.0, 2.5]);
        assert!(LocalCollective.barrier().is_ok());
    }

    #[test]
    fn test_rendezvous_all_reduce_sums_across_ranks() {
        let handles: Vec<_> = RendezvousCollective::group(3)
            .unwrap()
            .into_iter()
            .map(|collective| {
                thread::spawn(move || {
                    let rank = collective.rank() as f64;
                    let mut first = [rank, 1.0];
                    collective.all_reduce_sum(&mut first).unwrap();
                    collective.barrier().unwrap();
                    let mut second = [10.0 * rank];
                    collective.all_reduce_sum(&mut second).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, [3.0, 3.0]);
            assert_eq!(second, [30.0]);
        }
    }
}
