/// Sharded evaluation CLI
///
/// Single process:
///   evaluate --data /data/val --arch convnet --init best.safetensors
///
/// Multi process (one invocation per rank):
///   RANK=1 WORLD_SIZE=4 MASTER_ADDR=10.0.0.1:29500 evaluate --config eval.json
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sharded_eval::data::{ImageFolder, SampleSource, ShardSpec};
use sharded_eval::distributed::TcpGroup;
use sharded_eval::{
    DistributedContext, EvalConfig, EvalError, Evaluator, ExecutionContext, LocalContext,
    ModelRegistry, Stage, StageContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate an image classifier over a sharded dataset", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "JSON evaluation config")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Dataset root with one directory per class")]
    data: Option<PathBuf>,

    #[arg(short, long, help = "Model architecture")]
    arch: Option<String>,

    #[arg(short, long, help = "Batch size per rank")]
    batch_size: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Checkpoint to resume from")]
    resume: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Checkpoint to take model weights from")]
    init: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Write a checkpoint after evaluating")]
    save_checkpoint: Option<PathBuf>,

    #[arg(long, help = "Stop after this many batches")]
    max_batches: Option<usize>,

    #[arg(long, env = "RANK", default_value_t = 0)]
    rank: usize,

    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    world_size: usize,

    #[arg(long, env = "MASTER_ADDR", default_value = "127.0.0.1:29500")]
    master_addr: String,

    #[arg(long, env = "LOCAL_RANK", help = "Accelerator ordinal on this node")]
    local_rank: Option<usize>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        let stage = err
            .downcast_ref::<EvalError>()
            .and_then(EvalError::stage)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "setup".to_string());
        log::error!("evaluation failed in {} stage: {:#}", stage, err);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> sharded_eval::Result<EvalConfig> {
    let mut config = match &args.config {
        Some(path) => EvalConfig::from_path(path)?,
        None => EvalConfig::default(),
    };

    if let Some(data) = &args.data {
        config.data_dir = data.clone();
    }
    if let Some(arch) = &args.arch {
        config.arch = arch.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.resume.is_some() {
        config.resume = args.resume.clone();
    }
    if args.init.is_some() {
        config.init = args.init.clone();
    }
    if args.max_batches.is_some() {
        config.max_batches = args.max_batches;
    }
    if args.local_rank.is_some() {
        config.local_rank = args.local_rank;
    }

    config.validate_with_dataset()?;
    Ok(config)
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args).in_stage(Stage::Setup)?;
    ShardSpec::new(args.rank, args.world_size).in_stage(Stage::Setup)?;

    let ctx: Arc<dyn ExecutionContext> = if args.world_size > 1 {
        let timeout = Duration::from_secs(config.collective_timeout_secs);
        let group = TcpGroup::connect(args.rank, args.world_size, &args.master_addr, timeout)
            .in_stage(Stage::Setup)?;
        Arc::new(DistributedContext::new(Arc::new(group)))
    } else {
        Arc::new(LocalContext)
    };

    let dataset: Arc<dyn SampleSource> =
        Arc::new(ImageFolder::from_directory(&config.data_dir).in_stage(Stage::Setup)?);

    if ctx.is_primary() {
        log::info!("=> evaluating '{}' on {} samples", config.arch, dataset.len());
    }

    let registry = ModelRegistry::with_builtin();
    let mut evaluator = Evaluator::new(config, ctx, dataset, &registry)?;
    evaluator.resume()?;
    let summary = evaluator.validate()?;

    if let Some(path) = &args.save_checkpoint {
        evaluator.save_checkpoint(path)?;
    }

    log::info!(
        "Rank done: {} samples, {} substitutions, loss {:.4}",
        summary.samples,
        summary.substitutions,
        summary.loss
    );
    Ok(())
}
