//! Sharded evaluation harness
//!
//! Evaluates an image classifier over a held-out dataset split across worker
//! ranks, and combines per-rank running metrics into one globally-correct
//! result.
//!
//! # Pipeline
//!
//! - **Reader**: deterministic, lossless sharding with ignore-flagged padding
//! - **Pipeline**: decode, crop/resize, mirror, normalize, layout conversion
//! - **Runner**: forward pass, cross-entropy loss, top-k accuracy
//! - **Aggregator**: weighted running stats plus a collective (sum, count) reduce
//! - **Checkpoint**: atomic save and device-agnostic resume
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sharded_eval::{EvalConfig, Evaluator, LocalContext, ModelRegistry};
//! use sharded_eval::data::ImageFolder;
//!
//! let config = EvalConfig::from_path("eval.json")?;
//! let dataset = Arc::new(ImageFolder::from_directory(&config.data_dir)?);
//! let mut evaluator = Evaluator::new(config, Arc::new(LocalContext), dataset, &ModelRegistry::with_builtin())?;
//! let summary = evaluator.validate()?;
//! println!("Prec@1 {:.3} Prec@5 {:.3}", summary.top1, summary.top5);
//! ```

pub mod config;
pub mod data;
pub mod distributed;
pub mod evaluation;
pub mod models;
pub mod utils;

use std::fmt;
use std::path::PathBuf;

// Re-export commonly used items
pub use config::{EvalConfig, ExecutionTarget};
pub use distributed::{DistributedContext, ExecutionContext, LocalContext};
pub use evaluation::{Evaluator, EvaluationSummary};
pub use models::{Classifier, ModelRegistry};

/// Pipeline stage an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Reader,
    Pipeline,
    Inference,
    Reduce,
    Checkpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Reader => "reader",
            Stage::Pipeline => "pipeline",
            Stage::Inference => "inference",
            Stage::Reduce => "reduce",
            Stage::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data quality error: {0}")]
    DataQuality(String),

    #[error("No decodable sample among {total} dataset entries")]
    DatasetUnreadable { total: usize },

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{stage} stage failed: {source}")]
    Staged {
        stage: Stage,
        #[source]
        source: Box<EvalError>,
    },
}

impl EvalError {
    /// Stage recorded on the outermost `Staged` wrapper, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EvalError::Staged { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error with stage wrappers removed.
    pub fn root(&self) -> &EvalError {
        match self {
            EvalError::Staged { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the run must stop on this error.
    ///
    /// Missing checkpoints and single corrupt samples are recoverable by the
    /// caller; everything else terminates the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.root(),
            EvalError::CheckpointNotFound(_) | EvalError::DataQuality(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Attach the failing stage to an error on its way up.
pub trait StageContext<T> {
    fn in_stage(self, stage: Stage) -> Result<T>;
}

impl<T, E: Into<EvalError>> StageContext<T> for std::result::Result<T, E> {
    fn in_stage(self, stage: Stage) -> Result<T> {
        self.map_err(|err| match err.into() {
            // keep the innermost stage, it is the one that actually failed
            staged @ EvalError::Staged { .. } => staged,
            other => EvalError::Staged {
                stage,
                source: Box::new(other),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapping_keeps_innermost() {
        let inner: Result<()> = Err(EvalError::Collective("timeout".into()));
        let err = inner
            .in_stage(Stage::Reduce)
            .in_stage(Stage::Setup)
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Reduce));
        assert!(err.is_fatal());
        assert!(err.to_string().starts_with("reduce stage failed"));
    }

    #[test]
    fn test_fatality_taxonomy() {
        assert!(!EvalError::CheckpointNotFound(PathBuf::from("x")).is_fatal());
        assert!(!EvalError::DataQuality("bad jpeg".into()).is_fatal());
        assert!(EvalError::CorruptCheckpoint {
            path: PathBuf::from("x"),
            reason: "truncated".into()
        }
        .is_fatal());
        assert!(EvalError::Configuration("world_size".into()).is_fatal());
        assert!(EvalError::DatasetUnreadable { total: 3 }.is_fatal());
    }
}
