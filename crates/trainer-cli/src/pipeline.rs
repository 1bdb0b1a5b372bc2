//! Training driver: load shards, build the tagger, run the epoch loop with
//! periodic evaluation, track metrics and keep the best-F1 checkpoint.

use std::path::{Path, PathBuf};

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;

use shards::{BatchingConfig, EpochBatchIterator, ShardReader, IGNORE_INDEX};
use token_cls::{
    load_checkpoint, CheckpointMeta, CheckpointWriter, LinearWarmupDecay, LossSpec,
    MetricsHistory, OptimMethod, OptimizerSettings, TaggerConfig, TaskConfig,
    TokenClassificationTask, TransformerTagger,
};

use crate::config::{build_tagger_config, load_model_toml};
use crate::tracking::{FanoutSink, JsonlRunLog, MetricSink, RunInfo, TracingSink};

/// Tracking project all runs are filed under.
const PROJECT: &str = "grammarly";

/// Fraction of an epoch's optimizer steps spent warming up the LR.
const WARMUP_EPOCHS: f64 = 1.5;

/// Arguments for the `train-token-cls` binary.
#[derive(clap::Args, Debug, Clone, Serialize)]
#[command(rename_all = "snake_case")]
pub struct TrainArgs {
    /// Run name, used in the experiment name and checkpoint path.
    #[arg(long)]
    pub run_name: String,
    /// Free-text description stored with the run.
    #[arg(long)]
    pub notes: String,
    /// Directory of training shards.
    #[arg(long)]
    pub training_path: PathBuf,
    /// Directory of validation shards.
    #[arg(long)]
    pub valid_path: PathBuf,
    /// Root directory for checkpoints and run logs.
    #[arg(long)]
    pub ckp_path: PathBuf,

    #[arg(long, default_value = "token_classification")]
    pub task_name: String,
    /// Model name; overrides the `[model] name` from `--model_config`.
    /// Falls back to `distilroberta-base` when neither is given.
    #[arg(long)]
    pub model_version: Option<String>,
    #[arg(long, default_value = "grammarly")]
    pub db_name: String,
    /// `cpu`, `cuda`, `cuda:N` or `wgpu`. GPU devices need the `wgpu` feature.
    #[arg(long, default_value = "cuda")]
    pub device: String,
    /// Weight of the positive class in the training loss.
    #[arg(long, default_value_t = 5.0)]
    pub pos_weight: f64,
    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,
    /// Number of top encoder blocks left trainable.
    #[arg(long, default_value_t = 3)]
    pub unfreeze_layer: usize,
    /// Cap on batches per training epoch; lowered to the dataset's batch count.
    #[arg(long, default_value_t = 500)]
    pub batches_per_epoch: usize,
    #[arg(long, default_value_t = 600)]
    pub max_sentences_per_batch: usize,
    #[arg(long, default_value_t = 10_000)]
    pub max_tokens_per_batch: usize,
    #[arg(long, default_value_t = 256)]
    pub max_sentence_length: usize,
    /// `adam` or `adamw`.
    #[arg(long, default_value = "adam")]
    pub optim_method: String,
    #[arg(long, default_value_t = 0.01)]
    pub weight_decay: f64,
    #[arg(long, default_value_t = 5e-5)]
    pub lr: f64,
    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,
    /// Evaluate (and checkpoint) every N epochs, plus after the first.
    #[arg(long, default_value_t = 5)]
    pub eval_every: usize,
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    /// TOML file with a `[model]` table of architecture overrides.
    #[arg(long)]
    pub model_config: Option<PathBuf>,
    /// Pretrained weights (burn record) to start from.
    #[arg(long)]
    pub init_checkpoint: Option<PathBuf>,
    /// Extension of shard files inside the data directories.
    #[arg(long, default_value = "arrow")]
    pub shard_ext: String,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Probability above which a token is predicted positive.
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f64,
    /// `batch-index` or `completed`.
    #[arg(long, default_value = "batch-index")]
    pub accumulation_gating: String,
}

impl TrainArgs {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.epochs >= 1, "--epochs must be >= 1");
        anyhow::ensure!(self.eval_every >= 1, "--eval_every must be >= 1");
        anyhow::ensure!(
            self.gradient_accumulation_steps >= 1,
            "--gradient_accumulation_steps must be >= 1"
        );
        anyhow::ensure!(self.batches_per_epoch >= 1, "--batches_per_epoch must be >= 1");
        Ok(())
    }
}

/// Compute device selected by `--device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChoice {
    Cpu,
    /// Discrete GPU by index.
    Gpu(usize),
    /// Whatever adapter wgpu considers best.
    BestAvailable,
}

impl std::str::FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Gpu(0)),
            "wgpu" => Ok(Self::BestAvailable),
            other => match other.strip_prefix("cuda:") {
                Some(idx) => Ok(Self::Gpu(
                    idx.parse()
                        .map_err(|e| anyhow::anyhow!("Invalid device index in '{other}': {e}"))?,
                )),
                None => anyhow::bail!("Unknown device '{other}' (expected cpu, cuda, cuda:N or wgpu)"),
            },
        }
    }
}

/// Derived step counts for the LR schedule and early stopping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepPlan {
    pub batches_per_epoch: usize,
    pub steps_per_epoch: usize,
    pub num_warmup_steps: f64,
    pub num_training_steps: usize,
}

impl StepPlan {
    pub fn new(batches_per_epoch: usize, accumulation_steps: usize, epochs: usize) -> Self {
        let steps_per_epoch = batches_per_epoch / accumulation_steps;
        Self {
            batches_per_epoch,
            steps_per_epoch,
            num_warmup_steps: steps_per_epoch as f64 * WARMUP_EPOCHS,
            num_training_steps: steps_per_epoch * epochs,
        }
    }
}

/// `{run_name}-{task_name}-{db_name}-{model_name}-{dd-mm-yy_HH-MM-SS}`
pub fn experiment_name(args: &TrainArgs, model_name: &str, now: chrono::DateTime<chrono::Local>) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        args.run_name,
        args.task_name,
        args.db_name,
        model_name,
        now.format("%d-%m-%y_%H-%M-%S")
    )
}

/// Everything resolved before a backend is chosen.
struct RunPlan {
    args: TrainArgs,
    tagger: TaggerConfig,
    exp_name: String,
    steps: StepPlan,
    method: OptimMethod,
    task_config: TaskConfig,
    train_epochs: EpochBatchIterator,
    valid_epochs: EpochBatchIterator,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub exp_name: String,
    pub epochs: usize,
    pub global_step: usize,
    pub best_f_score: f64,
    pub best_epoch: Option<usize>,
    pub checkpoint_dir: PathBuf,
    pub run_log: PathBuf,
}

fn load_split(dir: &Path, ext: &str, batching: BatchingConfig) -> anyhow::Result<EpochBatchIterator> {
    let paths = ShardReader::list_shards(dir, ext)?;
    anyhow::ensure!(!paths.is_empty(), "No .{ext} shards found in {}", dir.display());
    let summary = ShardReader::read_summary(&paths)?;
    tracing::info!(
        dir = %dir.display(),
        shards = paths.len(),
        sentences = summary.records,
        labelled = summary.labelled_tokens,
        positive_rate = format!("{:.3}", summary.positive_rate()),
        "Loading shards"
    );
    let records = ShardReader::read_multiple(&paths)?;
    EpochBatchIterator::new(records, batching)
}

/// Tagger config from defaults, `--model_config` and `--model_version`,
/// checked against the longest sentence the batcher will produce.
fn resolve_tagger(args: &TrainArgs) -> anyhow::Result<TaggerConfig> {
    let overrides = match &args.model_config {
        Some(path) => load_model_toml(path)?.model,
        None => Default::default(),
    };
    let tagger = build_tagger_config(&overrides, args.model_version.as_deref());
    anyhow::ensure!(
        args.max_sentence_length <= tagger.max_position_embeddings,
        "--max_sentence_length {} exceeds the model's {} position embeddings",
        args.max_sentence_length,
        tagger.max_position_embeddings
    );
    Ok(tagger)
}

fn plan(args: TrainArgs) -> anyhow::Result<RunPlan> {
    args.validate()?;
    let method: OptimMethod = args.optim_method.parse()?;

    let tagger = resolve_tagger(&args)?;

    let batching = BatchingConfig {
        pad_token_id: tagger.pad_token_id as i64,
        ignore_index: IGNORE_INDEX,
        max_tokens_per_batch: args.max_tokens_per_batch,
        max_sentences_per_batch: args.max_sentences_per_batch,
        max_sentence_length: args.max_sentence_length,
        max_batches_per_epoch: Some(args.batches_per_epoch),
        seed: args.seed,
    };
    let train_epochs = load_split(&args.training_path, &args.shard_ext, batching.clone())?;
    let valid_epochs = load_split(
        &args.valid_path,
        &args.shard_ext,
        BatchingConfig { max_batches_per_epoch: None, ..batching },
    )?;

    let mut batches_per_epoch = args.batches_per_epoch;
    if batches_per_epoch != train_epochs.len() {
        tracing::info!(
            requested = batches_per_epoch,
            available = train_epochs.len(),
            "Adjusting batches_per_epoch to the training set"
        );
        batches_per_epoch = train_epochs.len();
    }
    let steps = StepPlan::new(batches_per_epoch, args.gradient_accumulation_steps, args.epochs);
    anyhow::ensure!(
        steps.steps_per_epoch >= 1,
        "{batches_per_epoch} batches per epoch is fewer than gradient_accumulation_steps={}",
        args.gradient_accumulation_steps
    );

    let task_config = TaskConfig::new()
        .with_gradient_accumulation_steps(args.gradient_accumulation_steps)
        .with_steps_per_epoch(steps.steps_per_epoch)
        .with_threshold(args.threshold)
        .with_max_grad_norm(args.max_grad_norm)
        .with_accumulation_gating(args.accumulation_gating.parse()?);
    task_config.validate()?;

    let exp_name = experiment_name(&args, &tagger.name, chrono::Local::now());
    tracing::info!(exp_name = %exp_name, "RUNNING EXPERIMENT");

    Ok(RunPlan {
        args,
        tagger,
        exp_name,
        steps,
        method,
        task_config,
        train_epochs,
        valid_epochs,
    })
}

/// Parse, plan and run training on the device named by `--device`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<RunSummary> {
    let device: DeviceChoice = args.device.parse()?;
    let plan = plan(args)?;

    match device {
        DeviceChoice::Cpu => train_on::<Autodiff<NdArray<f32>>>(plan, NdArrayDevice::Cpu),
        #[cfg(feature = "wgpu")]
        DeviceChoice::Gpu(idx) => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            train_on::<Autodiff<Wgpu>>(plan, WgpuDevice::DiscreteGpu(idx))
        }
        #[cfg(feature = "wgpu")]
        DeviceChoice::BestAvailable => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            train_on::<Autodiff<Wgpu>>(plan, WgpuDevice::BestAvailable)
        }
        #[cfg(not(feature = "wgpu"))]
        other => anyhow::bail!("Device {other:?} requires building with the `wgpu` feature"),
    }
}

fn train_on<B: AutodiffBackend>(plan: RunPlan, device: B::Device) -> anyhow::Result<RunSummary> {
    B::seed(plan.args.seed);

    let model: TransformerTagger<B> = match &plan.args.init_checkpoint {
        Some(path) => {
            tracing::info!(path = %path.display(), "Initializing from checkpoint");
            load_checkpoint::<B>(path, &plan.tagger, &device)?
        }
        None => plan.tagger.init::<B>(&device),
    };
    let model = model.freeze_below(plan.args.unfreeze_layer);

    let settings = OptimizerSettings {
        method: plan.method,
        weight_decay: plan.args.weight_decay,
    };
    match plan.method {
        OptimMethod::Adam => {
            let optimizer = settings.init_adam::<B, TransformerTagger<B>>();
            fit(plan, model, optimizer, device)
        }
        OptimMethod::AdamW => {
            let optimizer = settings.init_adamw::<B, TransformerTagger<B>>();
            fit(plan, model, optimizer, device)
        }
    }
}

fn run_config(plan: &RunPlan) -> anyhow::Result<serde_json::Value> {
    let mut config = serde_json::to_value(&plan.args)?;
    if let (Some(map), serde_json::Value::Object(steps)) = (config.as_object_mut(), serde_json::to_value(plan.steps)?) {
        map.extend(steps);
        map.insert("model".to_string(), serde_json::to_value(&plan.tagger)?);
    }
    Ok(config)
}

fn fit<B, O>(
    mut plan: RunPlan,
    mut model: TransformerTagger<B>,
    mut optimizer: O,
    device: B::Device,
) -> anyhow::Result<RunSummary>
where
    B: AutodiffBackend,
    O: Optimizer<TransformerTagger<B>, B>,
{
    let args = plan.args.clone();
    let writer = CheckpointWriter::for_run(&args.ckp_path, &args.run_name, &args.db_name, &plan.tagger.name)?;
    writer.save_config(&plan.tagger)?;

    let run_log = args.ckp_path.join(&args.run_name).join("runs").join(format!("{}.jsonl", plan.exp_name));
    let mut sink = FanoutSink::new()
        .with(JsonlRunLog::create(&run_log)?)
        .with(TracingSink);
    sink.log_config(&RunInfo {
        project: PROJECT.to_string(),
        name: plan.exp_name.clone(),
        job_type: args.task_name.clone(),
        notes: args.notes.clone(),
        config: run_config(&plan)?,
    })?;

    let mut scheduler = LinearWarmupDecay::new(args.lr, plan.steps.num_warmup_steps, plan.steps.num_training_steps);
    let mut task = TokenClassificationTask::new(
        plan.exp_name.clone(),
        plan.task_config.clone(),
        plan.tagger.pad_token_id as i64,
    )?;
    let train_loss = LossSpec::default().with_pos_weight(args.pos_weight);
    let eval_loss = LossSpec::default();
    let mut history = MetricsHistory::new();

    for epoch in 1..=args.epochs {
        let batches = plan.train_epochs.next_epoch_itr(true);
        let (trained, outcome) = task.train(model, &mut optimizer, &mut scheduler, batches, &device, &train_loss)?;
        model = trained;

        tracing::info!(
            epoch,
            acc = format!("{:.4}", outcome.accuracy),
            loss = format!("{:.4}", outcome.loss),
            lr = format!("{:.2e}", outcome.last_lr),
            "epoch done"
        );
        sink.log(
            &[("train_loss", outcome.loss), ("train_accuracy", outcome.accuracy)],
            epoch - 1,
        )?;

        if epoch % args.eval_every == 0 || epoch == 1 {
            let batches = plan.valid_epochs.next_epoch_itr(true);
            let scores = task.eval(&model.valid(), batches, &device, &eval_loss)?;
            for warning in scores.health_check() {
                tracing::warn!(epoch, "{warning}");
            }
            sink.log(&scores.to_metrics(), epoch - 1)?;

            let is_best = scores.eval_f_score > history.best_f_score();
            history.push(epoch, scores);
            writer.save(
                &model,
                &CheckpointMeta {
                    epoch,
                    global_step: task.global_step(),
                    is_best,
                    train_loss: outcome.loss,
                    train_accuracy: outcome.accuracy,
                    scores,
                },
            )?;
        }
    }

    let summary = RunSummary {
        exp_name: plan.exp_name,
        epochs: args.epochs,
        global_step: task.global_step(),
        best_f_score: history.best_f_score(),
        best_epoch: history.best_epoch(),
        checkpoint_dir: writer.root().to_path_buf(),
        run_log,
    };
    tracing::info!(
        best_f_score = format!("{:.4}", summary.best_f_score),
        best_epoch = ?summary.best_epoch,
        global_step = summary.global_step,
        "Training complete"
    );
    Ok(summary)
}
