/// Deterministic, lossless dataset sharding across ranks
///
/// Shard `s` of `w` owns dataset positions `[⌊T·s/w⌋, ⌊T·(s+1)/w⌋)`, so shard
/// lengths differ by at most one. Every shard is padded with ignore-flagged
/// placeholders up to the same whole number of batches, which keeps batch
/// counts identical on all ranks without counting any sample twice.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::{EvalError, Result};

/// Position of this rank among all participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    shard_id: usize,
    num_shards: usize,
}

impl ShardSpec {
    pub fn new(shard_id: usize, num_shards: usize) -> Result<Self> {
        if num_shards < 1 {
            return Err(EvalError::Configuration(
                "num_shards (world size) must be >= 1".to_string(),
            ));
        }
        if shard_id >= num_shards {
            return Err(EvalError::Configuration(format!(
                "shard_id {} out of range for {} shards",
                shard_id, num_shards
            )));
        }
        Ok(Self {
            shard_id,
            num_shards,
        })
    }

    /// Single-process layout
    pub fn single() -> Self {
        Self {
            shard_id: 0,
            num_shards: 1,
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }
}

/// Order in which dataset positions are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrder {
    /// Identity order, identical every epoch
    Sequential,
    /// Global permutation drawn from `seed + epoch`
    Shuffled { seed: u64 },
}

/// One slot of a shard batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEntry {
    /// Index into the dataset
    pub dataset_index: usize,
    /// Padding placeholder; carries zero metric weight
    pub ignore: bool,
}

/// Indices for one batch of this rank's shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBatch {
    /// Batch position within the epoch
    pub index: usize,
    pub entries: Vec<ShardEntry>,
}

impl ShardBatch {
    /// Number of real (non-placeholder) entries
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.ignore).count()
    }
}

/// Produces the batches owned by one shard
#[derive(Debug, Clone)]
pub struct ShardedDatasetReader {
    total: usize,
    spec: ShardSpec,
    batch_size: usize,
    order: SampleOrder,
}

impl ShardedDatasetReader {
    /// Create a reader over `total` samples
    ///
    /// # Arguments
    /// * `total` - Dataset size T
    /// * `spec` - Shard id and count
    /// * `batch_size` - Samples per emitted batch
    /// * `order` - Sequential for evaluation, shuffled for training
    pub fn new(total: usize, spec: ShardSpec, batch_size: usize, order: SampleOrder) -> Result<Self> {
        if total == 0 {
            return Err(EvalError::Configuration(
                "cannot shard an empty dataset".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(EvalError::Configuration(
                "batch_size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            total,
            spec,
            batch_size,
            order,
        })
    }

    pub fn spec(&self) -> ShardSpec {
        self.spec
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Range of permutation positions owned by this shard
    pub fn shard_range(&self) -> std::ops::Range<usize> {
        let start = self.total * self.spec.shard_id / self.spec.num_shards;
        let end = self.total * (self.spec.shard_id + 1) / self.spec.num_shards;
        start..end
    }

    /// Real samples in this shard
    pub fn shard_len(&self) -> usize {
        self.shard_range().len()
    }

    /// Largest shard length across all ranks, ceil(T/W)
    pub fn max_shard_len(&self) -> usize {
        self.total.div_ceil(self.spec.num_shards)
    }

    /// Batches every rank emits per epoch
    pub fn batches_per_epoch(&self) -> usize {
        self.max_shard_len().div_ceil(self.batch_size)
    }

    /// Placeholders appended to this shard
    pub fn padding_len(&self) -> usize {
        self.batches_per_epoch() * self.batch_size - self.shard_len()
    }

    fn permutation(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.total).collect();
        if let SampleOrder::Shuffled { seed } = self.order {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// All slots of this shard for `epoch`, real samples first
    pub fn epoch_entries(&self, epoch: usize) -> Vec<ShardEntry> {
        let permutation = self.permutation(epoch);
        let range = self.shard_range();
        let mut entries: Vec<ShardEntry> = permutation[range.clone()]
            .iter()
            .map(|&dataset_index| ShardEntry {
                dataset_index,
                ignore: false,
            })
            .collect();

        // An empty shard (T < W) still needs something decodable to pad with
        let filler = entries
            .last()
            .map(|e| e.dataset_index)
            .unwrap_or(permutation[0]);
        entries.extend((0..self.padding_len()).map(|_| ShardEntry {
            dataset_index: filler,
            ignore: true,
        }));
        entries
    }

    /// Batches of this shard for `epoch`
    pub fn epoch_batches(&self, epoch: usize) -> Vec<ShardBatch> {
        self.epoch_entries(epoch)
            .chunks(self.batch_size)
            .enumerate()
            .map(|(index, chunk)| ShardBatch {
                index,
                entries: chunk.to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn union_counts(total: usize, world: usize, batch: usize, order: SampleOrder, epoch: usize) -> HashMap<usize, usize> {
        let mut seen = HashMap::new();
        for rank in 0..world {
            let reader = ShardedDatasetReader::new(total, ShardSpec::new(rank, world).unwrap(), batch, order).unwrap();
            for entry in reader.epoch_entries(epoch) {
                if !entry.ignore {
                    *seen.entry(entry.dataset_index).or_insert(0) += 1;
                }
            }
        }
        seen
    }

    #[test]
    fn test_union_is_exact_for_all_small_layouts() {
        for total in 1..=23 {
            for world in 1..=total.min(7) {
                for batch in [1, 2, 3, 8] {
                    let seen = union_counts(total, world, batch, SampleOrder::Sequential, 0);
                    assert_eq!(seen.len(), total, "T={} W={} B={}", total, world, batch);
                    assert!(seen.values().all(|&c| c == 1), "T={} W={} B={}", total, world, batch);
                }
            }
        }
    }

    #[test]
    fn test_union_is_exact_when_shuffled() {
        for epoch in 0..3 {
            let seen = union_counts(37, 4, 5, SampleOrder::Shuffled { seed: 99 }, epoch);
            assert_eq!(seen.len(), 37);
            assert!(seen.values().all(|&c| c == 1));
        }
    }

    #[test]
    fn test_ten_over_three_pads_to_uniform_batch_count() {
        let mut real = 0;
        let mut batch_counts = Vec::new();
        for rank in 0..3 {
            let reader = ShardedDatasetReader::new(10, ShardSpec::new(rank, 3).unwrap(), 2, SampleOrder::Sequential).unwrap();
            let batches = reader.epoch_batches(0);
            batch_counts.push(batches.len());
            real += batches.iter().map(|b| b.valid_count()).sum::<usize>();
            assert!(batches.iter().all(|b| b.entries.len() == 2));
        }
        assert_eq!(batch_counts, vec![2, 2, 2]);
        assert_eq!(real, 10);
    }

    #[test]
    fn test_padding_is_trailing_and_repeats_last_sample() {
        let reader = ShardedDatasetReader::new(10, ShardSpec::new(0, 3).unwrap(), 4, SampleOrder::Sequential).unwrap();
        let entries = reader.epoch_entries(0);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[..3].iter().map(|e| e.dataset_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(entries[3].ignore);
        assert_eq!(entries[3].dataset_index, 2);
    }

    #[test]
    fn test_more_ranks_than_samples_still_aligned() {
        let seen = union_counts(2, 5, 4, SampleOrder::Sequential, 0);
        assert_eq!(seen.len(), 2);

        let empty = ShardedDatasetReader::new(2, ShardSpec::new(0, 5).unwrap(), 4, SampleOrder::Sequential).unwrap();
        assert_eq!(empty.shard_len(), 0);
        assert_eq!(empty.epoch_batches(0).len(), 1);
        assert!(empty.epoch_entries(0).iter().all(|e| e.ignore));
    }

    #[test]
    fn test_sequential_order_is_reproducible() {
        let reader = ShardedDatasetReader::new(50, ShardSpec::new(1, 4).unwrap(), 8, SampleOrder::Sequential).unwrap();
        assert_eq!(reader.epoch_entries(0), reader.epoch_entries(5));
    }

    #[test]
    fn test_shuffled_order_changes_per_epoch() {
        let reader = ShardedDatasetReader::new(64, ShardSpec::single(), 8, SampleOrder::Shuffled { seed: 3 }).unwrap();
        assert_ne!(reader.epoch_entries(0), reader.epoch_entries(1));
        assert_eq!(reader.epoch_entries(1), reader.epoch_entries(1));
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(ShardSpec::new(0, 0), Err(EvalError::Configuration(_))));
        assert!(matches!(ShardSpec::new(3, 3), Err(EvalError::Configuration(_))));
        assert!(ShardedDatasetReader::new(0, ShardSpec::single(), 4, SampleOrder::Sequential).is_err());
        assert!(ShardedDatasetReader::new(4, ShardSpec::single(), 0, SampleOrder::Sequential).is_err());
    }
}
