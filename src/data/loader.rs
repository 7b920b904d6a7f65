/// Prefetching batch loader
///
/// Three stages overlap, linked by bounded channels of `prefetch_depth`:
/// an I/O thread reads encoded bytes, a decode thread fans each batch out
/// over a fixed-size rayon pool, and the caller's thread assembles the
/// tensor on the compute device.
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use super::folder::{Sample, SampleSource};
use super::pipeline::{DataQualityEvent, PreparedImage, PreprocessingPipeline};
use super::sharding::{ShardBatch, ShardEntry, ShardedDatasetReader};
use super::BatchDataLoader;
use crate::{EvalError, Result};

/// One model-ready batch
#[derive(Debug)]
pub struct Batch {
    /// Batch position within the epoch
    pub index: usize,
    /// Normalized images in the pipeline's layout
    pub images: Tensor,
    pub labels: Vec<u32>,
    /// Per-row padding mask; ignored rows carry zero metric weight
    pub ignore: Vec<bool>,
    /// Corrupt samples substituted while preparing this batch
    pub events: Vec<DataQualityEvent>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows that count towards metrics
    pub fn valid_count(&self) -> usize {
        self.ignore.iter().filter(|&&i| !i).count()
    }

    pub fn substitutions(&self) -> usize {
        self.events.len()
    }
}

struct RawBatch {
    shard: ShardBatch,
    samples: Vec<std::io::Result<Sample>>,
}

struct PreparedBatch {
    index: usize,
    images: Vec<PreparedImage>,
    labels: Vec<u32>,
    ignore: Vec<bool>,
    events: Vec<DataQualityEvent>,
}

struct Slot {
    image: PreparedImage,
    label: u32,
    ignore: bool,
    event: Option<DataQualityEvent>,
}

struct EpochStream {
    rx: Receiver<Result<PreparedBatch>>,
    handles: Vec<JoinHandle<()>>,
}

/// Streams this rank's shard through the preprocessing pipeline
pub struct PrefetchLoader {
    source: Arc<dyn SampleSource>,
    reader: ShardedDatasetReader,
    pipeline: Arc<PreprocessingPipeline>,
    pool: Arc<rayon::ThreadPool>,
    depth: usize,
    epoch: usize,
    max_batches: Option<usize>,
    stream: Option<EpochStream>,
    exhausted: bool,
}

impl PrefetchLoader {
    /// Create a loader
    ///
    /// # Arguments
    /// * `source` - Dataset the reader's indices refer to
    /// * `reader` - This rank's shard layout
    /// * `pipeline` - Decode/transform/normalize steps
    /// * `workers` - Size of the decode thread pool
    /// * `depth` - Batches buffered between stages
    pub fn new(
        source: Arc<dyn SampleSource>,
        reader: ShardedDatasetReader,
        pipeline: PreprocessingPipeline,
        workers: usize,
        depth: usize,
    ) -> Result<Self> {
        if source.len() != reader.total() {
            return Err(EvalError::Configuration(format!(
                "reader expects {} samples but the dataset has {}",
                reader.total(),
                source.len()
            )));
        }
        if workers == 0 || depth == 0 {
            return Err(EvalError::Configuration(
                "workers and prefetch depth must be > 0".to_string(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("decode-{}", i))
            .build()
            .map_err(|e| EvalError::Configuration(format!("failed to build decode pool: {}", e)))?;

        Ok(Self {
            source,
            reader,
            pipeline: Arc::new(pipeline),
            pool: Arc::new(pool),
            depth,
            epoch: 0,
            max_batches: None,
            stream: None,
            exhausted: false,
        })
    }

    /// Stop every epoch after `limit` batches
    pub fn with_max_batches(mut self, limit: Option<usize>) -> Self {
        self.max_batches = limit;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Jump to `epoch`, discarding any in-flight batches
    pub fn set_epoch(&mut self, epoch: usize) {
        self.shutdown();
        self.epoch = epoch;
        self.exhausted = false;
    }

    pub fn reader(&self) -> &ShardedDatasetReader {
        &self.reader
    }

    fn start(&mut self) -> Result<EpochStream> {
        let batches: Vec<ShardBatch> = self
            .reader
            .epoch_batches(self.epoch)
            .into_iter()
            .take(self.num_batches())
            .collect();

        let (raw_tx, raw_rx) = sync_channel::<RawBatch>(self.depth);
        let (out_tx, out_rx) = sync_channel::<Result<PreparedBatch>>(self.depth);

        let source = Arc::clone(&self.source);
        let io = thread::Builder::new()
            .name("prefetch-io".to_string())
            .spawn(move || read_batches(source.as_ref(), batches, raw_tx))?;

        let source = Arc::clone(&self.source);
        let pipeline = Arc::clone(&self.pipeline);
        let pool = Arc::clone(&self.pool);
        let epoch = self.epoch;
        let decode = thread::Builder::new()
            .name("prefetch-decode".to_string())
            .spawn(move || {
                decode_batches(source.as_ref(), &pipeline, &pool, epoch, raw_rx, out_tx)
            })?;

        log::debug!(
            "Prefetch started for epoch {} ({} batches, depth {})",
            self.epoch,
            self.num_batches(),
            self.depth
        );

        Ok(EpochStream {
            rx: out_rx,
            handles: vec![decode, io],
        })
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Dropping the receiver unblocks the decode thread, which in turn
            // drops the raw receiver and unblocks the I/O thread.
            drop(stream.rx);
            for handle in stream.handles {
                if handle.join().is_err() {
                    log::error!("prefetch worker panicked during shutdown");
                }
            }
        }
    }
}

impl BatchDataLoader for PrefetchLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.stream.is_none() {
            let stream = self.start()?;
            self.stream = Some(stream);
        }

        let received = match &self.stream {
            Some(stream) => stream.rx.recv(),
            None => return Ok(None),
        };

        match received {
            Ok(Ok(prepared)) => {
                let images = self.pipeline.to_tensor(&prepared.images, device)?;
                Ok(Some(Batch {
                    index: prepared.index,
                    images,
                    labels: prepared.labels,
                    ignore: prepared.ignore,
                    events: prepared.events,
                }))
            }
            Ok(Err(e)) => {
                self.shutdown();
                Err(e)
            }
            Err(_) => {
                // Channel closed: both workers are done with this epoch
                self.exhausted = true;
                let Some(stream) = self.stream.take() else {
                    return Ok(None);
                };
                for handle in stream.handles {
                    if handle.join().is_err() {
                        return Err(EvalError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "prefetch worker panicked",
                        )));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Tear down the current stream and advance to the next epoch
    fn reset(&mut self) {
        self.shutdown();
        self.epoch += 1;
        self.exhausted = false;
    }

    fn num_batches(&self) -> usize {
        let full = self.reader.batches_per_epoch();
        match self.max_batches {
            Some(limit) => full.min(limit),
            None => full,
        }
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_batches(source: &dyn SampleSource, batches: Vec<ShardBatch>, tx: SyncSender<RawBatch>) {
    for shard in batches {
        let samples = shard
            .entries
            .iter()
            .map(|entry| source.read(entry.dataset_index))
            .collect();
        if tx.send(RawBatch { shard, samples }).is_err() {
            return;
        }
    }
}

fn decode_batches(
    source: &dyn SampleSource,
    pipeline: &PreprocessingPipeline,
    pool: &rayon::ThreadPool,
    epoch: usize,
    rx: Receiver<RawBatch>,
    tx: SyncSender<Result<PreparedBatch>>,
) {
    for raw in rx {
        let index = raw.shard.index;
        let slots: Result<Vec<Slot>> = pool.install(|| {
            raw.shard
                .entries
                .into_par_iter()
                .zip(raw.samples.into_par_iter())
                .map(|(entry, sample)| prepare_slot(source, pipeline, epoch, entry, sample))
                .collect()
        });

        let message = slots.map(|slots| {
            let mut prepared = PreparedBatch {
                index,
                images: Vec::with_capacity(slots.len()),
                labels: Vec::with_capacity(slots.len()),
                ignore: Vec::with_capacity(slots.len()),
                events: Vec::new(),
            };
            for slot in slots {
                prepared.images.push(slot.image);
                prepared.labels.push(slot.label);
                prepared.ignore.push(slot.ignore);
                prepared.events.extend(slot.event);
            }
            prepared
        });

        let failed = message.is_err();
        if tx.send(message).is_err() || failed {
            return;
        }
    }
}

/// Prepare one entry, substituting the nearest decodable sample on failure
///
/// Candidates are searched outward from the failing position (+1, -1, +2,
/// -2, ...). The substitute's label is used so the row stays consistent.
fn prepare_slot(
    source: &dyn SampleSource,
    pipeline: &PreprocessingPipeline,
    epoch: usize,
    entry: ShardEntry,
    sample: std::io::Result<Sample>,
) -> Result<Slot> {
    let first = sample.map_err(EvalError::from).and_then(|s| {
        pipeline
            .prepare(&s.bytes, epoch, entry.dataset_index)
            .map(|image| (image, s.label))
    });
    let reason = match first {
        Ok((image, label)) => {
            return Ok(Slot {
                image,
                label,
                ignore: entry.ignore,
                event: None,
            })
        }
        Err(e) => e.to_string(),
    };

    let total = source.len();
    let origin = entry.dataset_index;
    for distance in 1..total {
        let candidates = [origin.checked_add(distance), origin.checked_sub(distance)];
        for candidate in candidates.into_iter().flatten().filter(|&c| c < total) {
            let Ok(sample) = source.read(candidate) else {
                continue;
            };
            let Ok(image) = pipeline.prepare(&sample.bytes, epoch, candidate) else {
                continue;
            };

            // Padding rows carry no weight, so their substitutions are not reported
            let event = if entry.ignore {
                None
            } else {
                log::warn!(
                    "Corrupt sample {} replaced by {}: {}",
                    source.describe(origin),
                    source.describe(candidate),
                    reason
                );
                Some(DataQualityEvent {
                    epoch,
                    dataset_index: origin,
                    substitute_index: candidate,
                    reason,
                })
            };
            return Ok(Slot {
                image,
                label: sample.label,
                ignore: entry.ignore,
                event,
            });
        }
    }

    Err(EvalError::DatasetUnreadable { total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::folder::InMemoryDataset;
    use crate::data::pipeline::tests::encode_png;
    use crate::data::pipeline::{Mode, PipelineConfig};
    use crate::data::sharding::{SampleOrder, ShardSpec};

    fn dataset(corrupt: &[usize], total: usize) -> Arc<dyn SampleSource> {
        let samples = (0..total)
            .map(|i| Sample {
                bytes: if corrupt.contains(&i) {
                    b"garbage".to_vec()
                } else {
                    encode_png(12, 10, i as u8)
                },
                label: (i % 3) as u32,
            })
            .collect();
        Arc::new(InMemoryDataset::new(samples))
    }

    fn loader(source: Arc<dyn SampleSource>, rank: usize, world: usize, batch: usize) -> PrefetchLoader {
        let reader = ShardedDatasetReader::new(
            source.len(),
            ShardSpec::new(rank, world).unwrap(),
            batch,
            SampleOrder::Sequential,
        )
        .unwrap();
        let pipeline = PreprocessingPipeline::new(PipelineConfig {
            mode: Mode::Eval,
            crop_size: 8,
            val_size: 8,
            ..PipelineConfig::default()
        })
        .unwrap();
        PrefetchLoader::new(source, reader, pipeline, 2, 2).unwrap()
    }

    fn drain(loader: &mut PrefetchLoader) -> Result<Vec<Batch>> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch(&Device::Cpu)? {
            out.push(batch);
        }
        Ok(out)
    }

    #[test]
    fn test_streams_whole_shard_in_order() -> Result<()> {
        let mut loader = loader(dataset(&[], 7), 0, 1, 3);
        let batches = drain(&mut loader)?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(batches.iter().map(|b| b.valid_count()).sum::<usize>(), 7);
        assert_eq!(batches[0].images.dims(), &[3, 3, 8, 8]);
        assert_eq!(batches[2].ignore, vec![false, true, true]);
        assert_eq!(batches[0].labels, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_corrupt_sample_is_substituted_with_neighbour() -> Result<()> {
        let mut loader = loader(dataset(&[2], 6), 0, 1, 6);
        let batches = drain(&mut loader)?;
        let batch = &batches[0];
        assert_eq!(batch.substitutions(), 1);
        let event = &batch.events[0];
        assert_eq!(event.dataset_index, 2);
        assert_eq!(event.substitute_index, 3);
        assert_eq!(batch.labels[2], 0);
        assert_eq!(batch.valid_count(), 6);
        Ok(())
    }

    #[test]
    fn test_search_goes_backwards_at_dataset_end() -> Result<()> {
        let mut loader = loader(dataset(&[5], 6), 0, 1, 6);
        let batches = drain(&mut loader)?;
        assert_eq!(batches[0].events[0].substitute_index, 4);
        Ok(())
    }

    #[test]
    fn test_fully_corrupt_dataset_is_fatal() {
        let mut loader = loader(dataset(&[0, 1, 2], 3), 0, 1, 2);
        let err = loader.next_batch(&Device::Cpu).unwrap_err();
        assert!(matches!(err, EvalError::DatasetUnreadable { total: 3 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_padding_substitutions_are_not_reported() -> Result<()> {
        // rank 1 of 2 owns [1, 3); sample 2 is corrupt and also pads the batch
        let mut loader = loader(dataset(&[2], 3), 1, 2, 3);
        let batches = drain(&mut loader)?;
        assert_eq!(batches[0].ignore, vec![false, false, true]);
        assert_eq!(batches[0].events[0].substitute_index, 1);
        assert_eq!(batches[0].substitutions(), 1);
        Ok(())
    }

    #[test]
    fn test_max_batches_and_early_drop() -> Result<()> {
        let mut capped = loader(dataset(&[], 20), 0, 1, 2).with_max_batches(Some(3));
        assert_eq!(capped.num_batches(), 3);
        assert_eq!(drain(&mut capped)?.len(), 3);

        let mut partial = loader(dataset(&[], 20), 0, 1, 2);
        assert!(partial.next_batch(&Device::Cpu)?.is_some());
        drop(partial);
        Ok(())
    }

    #[test]
    fn test_reset_advances_epoch_and_restarts() -> Result<()> {
        let mut loader = loader(dataset(&[], 4), 0, 1, 2);
        assert_eq!(drain(&mut loader)?.len(), 2);
        assert!(loader.next_batch(&Device::Cpu)?.is_none());
        loader.reset();
        assert_eq!(loader.epoch(), 1);
        assert_eq!(drain(&mut loader)?.len(), 2);
        Ok(())
    }
}
