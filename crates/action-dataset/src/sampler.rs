//! Rank-sharded sampling of the training set.

use std::marker::PhantomData;

use burn::data::dataset::Dataset;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use action_core::DistributedContext;

/// Splits a dataset of `len` items into `world_size` equally sized shards.
///
/// Each epoch draws a permutation seeded with `seed + epoch`, pads it by
/// wrapping around to a multiple of `world_size`, and hands rank `r` every
/// `world_size`-th index starting at `r`.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, ctx: &DistributedContext, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            rank: ctx.rank,
            world_size: ctx.world_size.max(1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    /// Items this rank sees per epoch
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    pub fn total_size(&self) -> usize {
        self.num_samples() * self.world_size
    }

    /// This rank's share of the epoch, padded so every rank has
    /// [`num_samples`](Self::num_samples) items.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let total = self.total_size();
        let mut padded = Vec::with_capacity(total);
        while padded.len() < total {
            let take = (total - padded.len()).min(order.len());
            padded.extend_from_slice(&order[..take]);
        }

        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Like [`indices`](Self::indices) without the wrap-around padding, so
    /// every item lands on exactly one rank. Shard lengths differ by at most one.
    pub fn unpadded_indices(&self) -> Vec<usize> {
        let mut indices = self.indices();
        let kept = (self.len + self.world_size - 1 - self.rank) / self.world_size;
        indices.truncate(kept);
        indices
    }
}

/// View of `inner` restricted to, and reordered by, `indices`.
#[derive(Debug, Clone)]
pub struct SampledDataset<D, I> {
    inner: D,
    indices: Vec<usize>,
    _item: PhantomData<fn() -> I>,
}

impl<D, I> SampledDataset<D, I>
where
    D: Dataset<I>,
{
    pub fn new(inner: D, indices: Vec<usize>) -> Self {
        Self {
            inner,
            indices,
            _item: PhantomData,
        }
    }
}

impl<D, I> Dataset<I> for SampledDataset<D, I>
where
    D: Dataset<I>,
    I: Send + Sync,
{
    fn get(&self, index: usize) -> Option<I> {
        self.indices.get(index).and_then(|&i| self.inner.get(i))
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}
