/// Data loading: dataset sources, sharding, preprocessing and prefetch
pub mod folder;
pub mod loader;
pub mod pipeline;
pub mod sharding;

pub use folder::{ImageFolder, InMemoryDataset, Sample, SampleSource};
pub use loader::{Batch, PrefetchLoader};
pub use pipeline::{DataQualityEvent, Mode, PipelineConfig, PreparedImage, PreprocessingPipeline};
pub use sharding::{SampleOrder, ShardBatch, ShardEntry, ShardSpec, ShardedDatasetReader};

use candle_core::Device;

/// Generic batch loader trait
pub trait BatchDataLoader {
    /// Get next batch on `device`, or `None` once the epoch is exhausted
    fn next_batch(&mut self, device: &Device) -> crate::Result<Option<Batch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches per epoch
    fn num_batches(&self) -> usize;
}
