/// Configuration for a sharded evaluation run
///
/// Loaded from JSON; every field except `data_dir` has a default so a config
/// file can be as small as `{"data_dir": "/data/imagenet/val"}`.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::{EvalError, Result};

/// Where normalization and layout conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Normalize on the CPU, upload the finished f32 tensor
    Host,
    /// Upload raw pixels, convert/normalize/permute on the compute device
    Device,
}

/// Memory layout of the image tensor handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    /// [batch, channels, height, width]
    Nchw,
    /// [batch, height, width, channels]
    Nhwc,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Dataset root with one subdirectory per class
    pub data_dir: PathBuf,

    /// Architecture name resolved through the model registry
    pub arch: String,

    /// Batch size per rank
    pub batch_size: usize,

    /// Decode/augment worker threads per rank
    pub workers: usize,

    /// Number of prepared batches buffered ahead of compute
    pub prefetch_depth: usize,

    /// Emit a progress record every N batches
    pub print_freq: usize,

    /// Side of the square crop fed to the model
    pub crop_size: usize,

    /// Shorter-side resize target before the eval centre crop
    pub val_size: usize,

    /// Feed NHWC instead of NCHW
    pub channels_last: bool,

    /// Where normalization runs
    pub target: ExecutionTarget,

    /// Use CUDA/Metal when compiled in and available
    pub prefer_accelerator: bool,

    /// Base seed; each rank uses `seed + rank`
    pub seed: u64,

    /// Checkpoint to resume from (missing file is not fatal)
    pub resume: Option<PathBuf>,

    /// Checkpoint whose model weights initialize the classifier
    pub init: Option<PathBuf>,

    /// Stop after this many batches (profiling)
    pub max_batches: Option<usize>,

    /// Override the class count discovered from the dataset
    pub num_classes: Option<usize>,

    /// Accuracy cut-offs to report
    pub topk: Vec<usize>,

    /// How long a collective may wait for missing participants
    pub collective_timeout_secs: u64,

    /// Accelerator ordinal on this node; the global rank when unset
    pub local_rank: Option<usize>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            arch: "convnet".to_string(),
            batch_size: 32,
            workers: 4,
            prefetch_depth: 2,
            print_freq: 10,
            crop_size: 224,
            val_size: 256,
            channels_last: false,
            target: ExecutionTarget::Host,
            prefer_accelerator: true,
            seed: 12,
            resume: None,
            init: None,
            max_batches: None,
            num_classes: None,
            topk: vec![1, 5],
            collective_timeout_secs: 300,
            local_rank: None,
        }
    }
}

impl EvalConfig {
    /// Load and validate a JSON config file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            EvalError::Configuration(format!("cannot open config {}: {}", path.display(), e))
        })?;
        let config: EvalConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EvalError::Configuration(
                "batch_size must be > 0".to_string(),
            ));
        }

        if self.workers == 0 || self.prefetch_depth == 0 {
            return Err(EvalError::Configuration(
                "workers and prefetch_depth must be > 0".to_string(),
            ));
        }

        if self.print_freq == 0 {
            return Err(EvalError::Configuration(
                "print_freq must be > 0".to_string(),
            ));
        }

        if self.crop_size == 0 || self.val_size < self.crop_size {
            return Err(EvalError::Configuration(format!(
                "crop_size must be > 0 and val_size ({}) must be >= crop_size ({})",
                self.val_size, self.crop_size
            )));
        }

        if self.arch.trim().is_empty() {
            return Err(EvalError::Configuration("arch must not be empty".to_string()));
        }

        if self.topk.is_empty() || self.topk.contains(&0) {
            return Err(EvalError::Configuration(format!(
                "topk must be a non-empty list of positive cut-offs, got {:?}",
                self.topk
            )));
        }

        if self.collective_timeout_secs == 0 {
            return Err(EvalError::Configuration(
                "collective_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.num_classes == Some(0) {
            return Err(EvalError::Configuration(
                "num_classes must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Like `validate`, and also require the dataset directory to exist
    pub fn validate_with_dataset(&self) -> Result<()> {
        self.validate()?;
        if !self.data_dir.is_dir() {
            return Err(EvalError::Configuration(format!(
                "dataset directory {} does not exist",
                self.data_dir.display()
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> ChannelLayout {
        if self.channels_last {
            ChannelLayout::Nhwc
        } else {
            ChannelLayout::Nchw
        }
    }

    /// Accelerator ordinal for the given global rank
    ///
    /// Multi-node runs must set `local_rank`, since global ranks past the
    /// node's device count name no device.
    pub fn device_ordinal(&self, rank: usize) -> usize {
        self.local_rank.unwrap_or(rank)
    }

    /// Seed used by the given rank's augmentation RNG
    pub fn rank_seed(&self, rank: usize) -> u64 {
        self.seed.wrapping_add(rank as u64)
    }
}
