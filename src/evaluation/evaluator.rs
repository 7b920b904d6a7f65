/// Evaluation driver
///
/// Wires one rank's shard, pipeline, model and metrics together. Every rank
/// builds its own `Evaluator`; the only point where ranks meet is the metric
/// reduce at the end of `validate`.
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::checkpoint::{Checkpoint, CheckpointStore, RunState};
use super::metrics::MetricAggregator;
use super::runner::InferenceRunner;
use crate::config::EvalConfig;
use crate::data::{
    BatchDataLoader, Mode, PipelineConfig, PrefetchLoader, PreprocessingPipeline, SampleOrder,
    SampleSource, ShardSpec, ShardedDatasetReader,
};
use crate::distributed::ExecutionContext;
use crate::models::{load_init_weights, Classifier, ModelRegistry, ModelSpec};
use crate::utils::select_device;
use crate::{EvalError, Result, Stage, StageContext};

/// Globally reduced result of one evaluation pass
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub top1: f64,
    pub top5: f64,
    /// Every requested cut-off with its accuracy
    pub topk: Vec<(usize, f64)>,
    pub loss: f64,
    /// Real samples evaluated across all ranks
    pub samples: u64,
    /// Corrupt samples substituted across all ranks
    pub substitutions: u64,
    /// Batches processed by each rank
    pub batches: usize,
    /// Whether top-1 improved on the run's best metric
    pub is_best: bool,
}

impl fmt::Display for EvaluationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " * Prec@1 {:.3} Prec@5 {:.3}", self.top1, self.top5)
    }
}

pub struct Evaluator {
    config: EvalConfig,
    ctx: Arc<dyn ExecutionContext>,
    device: Device,
    model: Box<dyn Classifier>,
    runner: InferenceRunner,
    loader: PrefetchLoader,
    state: RunState,
    optimizer_state: HashMap<String, Tensor>,
    num_classes: usize,
}

impl Evaluator {
    /// Build an evaluator on the device picked for this rank
    pub fn new(
        config: EvalConfig,
        ctx: Arc<dyn ExecutionContext>,
        dataset: Arc<dyn SampleSource>,
        registry: &ModelRegistry,
    ) -> Result<Self> {
        let device = select_device(config.prefer_accelerator, config.device_ordinal(ctx.rank()));
        Self::with_device(config, ctx, dataset, registry, device)
    }

    /// Build an evaluator on an explicit device
    ///
    /// # Arguments
    /// * `config` - Validated run configuration
    /// * `ctx` - Rank identity and collective
    /// * `dataset` - Full dataset; this rank reads only its shard
    /// * `registry` - Architectures resolvable by `config.arch`
    /// * `device` - Where tensors and the model live
    pub fn with_device(
        config: EvalConfig,
        ctx: Arc<dyn ExecutionContext>,
        dataset: Arc<dyn SampleSource>,
        registry: &ModelRegistry,
        device: Device,
    ) -> Result<Self> {
        config.validate().in_stage(Stage::Setup)?;
        let spec = ShardSpec::new(ctx.rank(), ctx.world_size()).in_stage(Stage::Setup)?;
        let reader = ShardedDatasetReader::new(
            dataset.len(),
            spec,
            config.batch_size,
            SampleOrder::Sequential,
        )
        .in_stage(Stage::Reader)?;

        let num_classes = config.num_classes.unwrap_or_else(|| dataset.num_classes());
        if num_classes == 0 {
            return Err(EvalError::Configuration(
                "dataset has no classes".to_string(),
            ))
            .in_stage(Stage::Setup);
        }

        log::info!(
            "Rank {}/{}: shard {:?} ({} samples), {} batches of {} on {:?}",
            ctx.rank(),
            ctx.world_size(),
            reader.shard_range(),
            reader.shard_len(),
            reader.batches_per_epoch(),
            config.batch_size,
            device
        );

        let pipeline = PreprocessingPipeline::new(PipelineConfig::from_eval_config(
            &config,
            Mode::Eval,
            ctx.rank(),
        ))
        .in_stage(Stage::Setup)?;
        let loader = PrefetchLoader::new(dataset, reader, pipeline, config.workers, config.prefetch_depth)
            .in_stage(Stage::Setup)?
            .with_max_batches(config.max_batches);

        let model_spec = ModelSpec::new(num_classes, config.crop_size, config.layout());
        let mut model = registry
            .build(&config.arch, &model_spec, &device)
            .in_stage(Stage::Setup)?;
        if let Some(init) = &config.init {
            load_init_weights(model.as_mut(), init, &device).in_stage(Stage::Checkpoint)?;
        }

        let runner = InferenceRunner::new(&config.topk);

        Ok(Self {
            config,
            ctx,
            device,
            model,
            runner,
            loader,
            state: RunState::default(),
            optimizer_state: HashMap::new(),
            num_classes,
        })
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &dyn Classifier {
        self.model.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Batches this rank processes per pass
    pub fn num_batches(&self) -> usize {
        self.loader.num_batches()
    }

    /// Restore state from `config.resume`, if set
    ///
    /// # Returns
    /// `true` when a checkpoint was applied. A missing file only logs a
    /// warning; an unreadable one is fatal.
    pub fn resume(&mut self) -> Result<bool> {
        let Some(path) = self.config.resume.clone() else {
            return Ok(false);
        };

        let checkpoint = match CheckpointStore::resume(&path, &self.device) {
            Ok(checkpoint) => checkpoint,
            Err(EvalError::CheckpointNotFound(missing)) => {
                log::warn!("=> no checkpoint found at {:?}", missing);
                return Ok(false);
            }
            Err(e) => return Err(e).in_stage(Stage::Checkpoint),
        };

        if checkpoint.arch != self.config.arch {
            log::warn!(
                "Checkpoint was saved for arch '{}', evaluating '{}'",
                checkpoint.arch,
                self.config.arch
            );
        }
        self.model
            .load_state_dict(&checkpoint.model_state)
            .in_stage(Stage::Checkpoint)?;
        self.state = checkpoint.state;
        self.optimizer_state = checkpoint.optimizer_state;
        Ok(true)
    }

    /// Run one full pass over this rank's shard and reduce across ranks
    pub fn validate(&mut self) -> Result<EvaluationSummary> {
        self.model.set_training(false);
        let mut metrics = MetricAggregator::new(&self.config.topk, self.ctx.world_size());
        metrics.start_timer();

        let batches = match self.run_pass(&mut metrics) {
            Ok(batches) => batches,
            Err(e) => {
                // drop the in-flight stream so the next pass restarts this epoch
                self.loader.set_epoch(self.loader.epoch());
                return Err(e);
            }
        };
        self.loader.reset();

        metrics
            .reduce_across_ranks(self.ctx.as_ref())
            .in_stage(Stage::Reduce)?;

        let topk: Vec<(usize, f64)> = self
            .runner
            .ks()
            .iter()
            .zip(&metrics.topk)
            .map(|(&k, stat)| (k, stat.avg))
            .collect();
        let top1 = metrics.avg_topk(1).unwrap_or(0.0);
        let top5 = metrics.avg_topk(5).unwrap_or(0.0);
        let is_best = self.state.observe(top1);

        let summary = EvaluationSummary {
            top1,
            top5,
            topk,
            loss: metrics.loss.avg,
            samples: metrics.samples().round() as u64,
            substitutions: metrics.substitutions(),
            batches,
            is_best,
        };

        if self.ctx.is_primary() {
            log::info!("{}", summary);
            if summary.substitutions > 0 {
                log::warn!("{} corrupt samples were substituted", summary.substitutions);
            }
        }
        Ok(summary)
    }

    fn run_pass(&mut self, metrics: &mut MetricAggregator) -> Result<usize> {
        let total = self.loader.num_batches();
        let mut batches = 0;
        while let Some(batch) = self
            .loader
            .next_batch(&self.device)
            .in_stage(Stage::Pipeline)?
        {
            let outcome = self
                .runner
                .run(self.model.as_ref(), &batch)
                .in_stage(Stage::Inference)?;
            metrics.record(
                outcome.loss,
                &outcome.accuracies(),
                outcome.valid,
                batch.substitutions(),
            );
            batches += 1;

            if self.ctx.is_primary() && (batches % self.config.print_freq == 0 || batches == total) {
                log::info!("{}", metrics.progress(batches, total, self.config.batch_size));
            }
        }
        Ok(batches)
    }

    /// Write the current run state, model and carried optimizer state
    ///
    /// Only the primary rank writes; other ranks return immediately.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if !self.ctx.is_primary() {
            return Ok(());
        }
        let model_state = self.model.state_dict().in_stage(Stage::Checkpoint)?;
        let checkpoint = Checkpoint::new(self.config.arch.clone(), self.state, model_state)
            .with_optimizer_state(self.optimizer_state.clone());
        CheckpointStore::save(path, &checkpoint).in_stage(Stage::Checkpoint)
    }
}
