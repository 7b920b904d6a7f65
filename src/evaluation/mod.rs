/// Evaluation: inference, metric aggregation, checkpoints and the driver
pub mod checkpoint;
pub mod evaluator;
pub mod metrics;
pub mod runner;

pub use checkpoint::{Checkpoint, CheckpointStore, RunState};
pub use evaluator::{EvaluationSummary, Evaluator};
pub use metrics::{MetricAggregator, ProgressRecord, RunningStat};
pub use runner::{BatchOutcome, Criterion, CrossEntropyCriterion, InferenceRunner};
