/// Checkpoint persistence with safetensors
///
/// A checkpoint is one safetensors file. Model tensors are stored under
/// `model.<name>`, optimizer tensors under `optimizer.<name>`, and the run
/// state lives in the header metadata.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use crate::{EvalError, Result};

pub const CHECKPOINT_FORMAT: &str = "sharded-eval";
pub const CHECKPOINT_VERSION: u32 = 1;

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Progress carried across save and resume
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunState {
    pub epoch: usize,
    /// Best top-1 accuracy observed so far
    pub best_metric: f64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_metric: 0.0,
        }
    }
}

impl RunState {
    /// Fold in a new metric; returns true when it is a new best
    pub fn observe(&mut self, metric: f64) -> bool {
        if metric > self.best_metric {
            self.best_metric = metric;
            true
        } else {
            false
        }
    }
}

/// Everything needed to continue a run
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub arch: String,
    pub state: RunState,
    pub model_state: HashMap<String, Tensor>,
    pub optimizer_state: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn new(arch: impl Into<String>, state: RunState, model_state: HashMap<String, Tensor>) -> Self {
        Self {
            arch: arch.into(),
            state,
            model_state,
            optimizer_state: HashMap::new(),
        }
    }

    pub fn with_optimizer_state(mut self, optimizer_state: HashMap<String, Tensor>) -> Self {
        self.optimizer_state = optimizer_state;
        self
    }

    pub fn epoch(&self) -> usize {
        self.state.epoch
    }

    pub fn best_metric(&self) -> f64 {
        self.state.best_metric
    }
}

/// Reads and writes checkpoint files
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStore;

impl CheckpointStore {
    /// Write `checkpoint` to `path` atomically
    ///
    /// The file is written to `<path>.partial`, synced, then renamed over
    /// `path`, so readers see either the old or the new checkpoint.
    pub fn save<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: Vec<(String, Tensor)> =
            Vec::with_capacity(checkpoint.model_state.len() + checkpoint.optimizer_state.len());
        for (prefix, group) in [
            (MODEL_PREFIX, &checkpoint.model_state),
            (OPTIMIZER_PREFIX, &checkpoint.optimizer_state),
        ] {
            for (name, tensor) in group {
                tensors.push((format!("{}{}", prefix, name), tensor.to_device(&Device::Cpu)?));
            }
        }
        tensors.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert("version".to_string(), CHECKPOINT_VERSION.to_string());
        metadata.insert("epoch".to_string(), checkpoint.state.epoch.to_string());
        // Display for f64 is the shortest text that parses back to the same value
        metadata.insert("best_metric".to_string(), checkpoint.state.best_metric.to_string());
        metadata.insert("arch".to_string(), checkpoint.arch.clone());

        let bytes = safetensors::serialize(tensors, &Some(metadata)).map_err(|e| {
            EvalError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to serialize checkpoint: {}", e),
            ))
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(path);
        {
            let mut file = File::create(&partial)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&partial, path)?;

        log::info!(
            "Saved checkpoint {:?} (epoch {}, best {:.3}, {} tensors)",
            path,
            checkpoint.state.epoch,
            checkpoint.state.best_metric,
            checkpoint.model_state.len() + checkpoint.optimizer_state.len()
        );
        Ok(())
    }

    /// Read a checkpoint, placing every tensor on `device`
    ///
    /// # Returns
    /// `CheckpointNotFound` when the file is absent, `CorruptCheckpoint` when
    /// it cannot be parsed or its metadata is invalid
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Checkpoint> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(EvalError::CheckpointNotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        let corrupt = |reason: String| EvalError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let meta = header
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupt("missing header metadata".to_string()))?;
        let field = |key: &str| {
            meta.get(key)
                .ok_or_else(|| corrupt(format!("missing metadata key '{}'", key)))
        };

        let format = field("format")?;
        if format != CHECKPOINT_FORMAT {
            return Err(corrupt(format!("unexpected format '{}'", format)));
        }
        let version: u32 = field("version")?
            .parse()
            .map_err(|_| corrupt("unparseable version".to_string()))?;
        if version != CHECKPOINT_VERSION {
            return Err(corrupt(format!(
                "unsupported version {} (expected {})",
                version, CHECKPOINT_VERSION
            )));
        }
        let epoch: usize = field("epoch")?
            .parse()
            .map_err(|_| corrupt("unparseable epoch".to_string()))?;
        let best_metric: f64 = field("best_metric")?
            .parse()
            .map_err(|_| corrupt("unparseable best_metric".to_string()))?;
        let arch = field("arch")?.clone();

        let tensors = candle_core::safetensors::load_buffer(&bytes, device)
            .map_err(|e| corrupt(e.to_string()))?;
        let mut model_state = HashMap::new();
        let mut optimizer_state = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                model_state.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer_state.insert(rest.to_string(), tensor);
            } else {
                return Err(corrupt(format!("tensor '{}' has no known prefix", name)));
            }
        }

        log::debug!(
            "Loaded checkpoint {:?}: {} model / {} optimizer tensors",
            path,
            model_state.len(),
            optimizer_state.len()
        );

        Ok(Checkpoint {
            arch,
            state: RunState { epoch, best_metric },
            model_state,
            optimizer_state,
        })
    }

    /// Load a checkpoint to continue a run on `device`
    pub fn resume<P: AsRef<Path>>(path: P, device: &Device) -> Result<Checkpoint> {
        let path = path.as_ref();
        let checkpoint = Self::load(path, device)?;
        log::info!(
            "=> loaded checkpoint {:?} (epoch {}, best_metric {})",
            path,
            checkpoint.state.epoch,
            checkpoint.state.best_metric
        );
        Ok(checkpoint)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample_checkpoint() -> candle_core::Result<Checkpoint> {
        let device = Device::Cpu;
        let mut model = HashMap::new();
        model.insert("head.weight".to_string(), Tensor::randn(0f32, 1.0, (3, 4), &device)?);
        model.insert("head.bias".to_string(), Tensor::zeros(3, DType::F32, &device)?);
        let mut optimizer = HashMap::new();
        optimizer.insert("head.weight.momentum".to_string(), Tensor::ones((3, 4), DType::F32, &device)?);
        Ok(Checkpoint::new(
            "linear",
            RunState {
                epoch: 17,
                best_metric: 0.1 + 0.2,
            },
            model,
        )
        .with_optimizer_state(optimizer))
    }

    #[test]
    fn test_round_trip_is_exact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.safetensors");
        let original = sample_checkpoint()?;
        CheckpointStore::save(&path, &original)?;

        let loaded = CheckpointStore::load(&path, &Device::Cpu)?;
        assert_eq!(loaded.state, original.state);
        assert_eq!(loaded.best_metric().to_bits(), (0.1f64 + 0.2).to_bits());
        assert_eq!(loaded.arch, "linear");
        assert_eq!(loaded.optimizer_state.len(), 1);
        for (name, tensor) in &original.model_state {
            let a = tensor.flatten_all()?.to_vec1::<f32>()?;
            let b = loaded.model_state[name].flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(a, b, "{}", name);
        }
        assert!(!partial_path(&path).exists());
        Ok(())
    }

    #[test]
    fn test_save_overwrites_and_creates_parent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("ckpt.safetensors");
        let mut checkpoint = sample_checkpoint()?;
        CheckpointStore::save(&path, &checkpoint)?;
        checkpoint.state.epoch = 18;
        CheckpointStore::save(&path, &checkpoint)?;
        assert_eq!(CheckpointStore::resume(&path, &Device::Cpu)?.epoch(), 18);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = CheckpointStore::load("/no/such/ckpt.safetensors", &Device::Cpu).unwrap_err();
        assert!(matches!(err, EvalError::CheckpointNotFound(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_garbage_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, b"\x10\x00\x00\x00\x00\x00\x00\x00{not json")?;
        let err = CheckpointStore::load(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, EvalError::CorruptCheckpoint { .. }));
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn test_foreign_metadata_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("foreign.safetensors");
        let tensor = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        let bytes = safetensors::serialize(vec![("w".to_string(), tensor)], &Some(metadata)).unwrap();
        fs::write(&path, bytes)?;
        assert!(matches!(
            CheckpointStore::load(&path, &Device::Cpu),
            Err(EvalError::CorruptCheckpoint { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_run_state_tracks_best() {
        let mut state = RunState::default();
        assert!(state.observe(40.0));
        assert!(!state.observe(39.0));
        assert!(state.observe(41.5));
        assert_eq!(state.best_metric, 41.5);
    }
}
