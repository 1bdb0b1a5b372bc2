//! Token classification task: one training epoch, one evaluation epoch.
//!
//! The task owns no model or optimizer. Each call receives them, runs a full
//! pass over the batches it is given and returns the updated model together
//! with the epoch summary.

use std::fmt;
use std::str::FromStr;

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use shards::{TokenBatch, IGNORE_INDEX};

use crate::model::bridge::{scalar, to_device, TensorBatch};
use crate::model::classifier::{ensure_fits, TokenClassifier};
use crate::training::clip::clip_grad_norm;
use crate::training::loss::{masked_sequence_loss, LossSpec, TokenLoss};
use crate::training::metrics::{compute_correct, Correctness, EvalScores};
use crate::training::schedule::LrSchedule;

/// When the optimizer and scheduler step during gradient accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccumulationGating {
    /// Step when `batch_idx % accumulation_steps == 0`, using only the
    /// current batch's gradients. Earlier gradients in the window are dropped.
    #[default]
    BatchIndex,
    /// Sum gradients over `accumulation_steps` batches, then step once.
    Completed,
}

impl fmt::Display for AccumulationGating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchIndex => write!(f, "batch-index"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for AccumulationGating {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch-index" => Ok(Self::BatchIndex),
            "completed" => Ok(Self::Completed),
            other => anyhow::bail!("unknown accumulation gating '{other}' (expected batch-index or completed)"),
        }
    }
}

/// Hyper-parameters of the task loop.
#[derive(Config, Debug)]
pub struct TaskConfig {
    /// Batches per optimizer step.
    #[config(default = 1)]
    pub gradient_accumulation_steps: usize,
    /// Optimizer steps after which a training epoch stops early.
    #[config(default = 500)]
    pub steps_per_epoch: usize,
    /// Probability above which a token is predicted positive.
    #[config(default = 0.5)]
    pub threshold: f64,
    #[config(default = "AccumulationGating::BatchIndex")]
    pub accumulation_gating: AccumulationGating,
    /// Joint L2 norm the gradients are clipped to before each optimizer
    /// step. Non-positive disables clipping.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    /// Batches between progress logs.
    #[config(default = 50)]
    pub log_interval: usize,
}

impl TaskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.gradient_accumulation_steps >= 1,
            "gradient_accumulation_steps must be >= 1"
        );
        anyhow::ensure!(self.steps_per_epoch >= 1, "steps_per_epoch must be >= 1");
        anyhow::ensure!(
            self.threshold > 0.0 && self.threshold < 1.0,
            "threshold must be in (0, 1), got {}",
            self.threshold
        );
        Ok(())
    }
}

/// Summary of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TrainOutcome {
    /// Sum of (accumulation-scaled) batch losses over `batches / accumulation_steps`.
    pub loss: f64,
    /// Correct predictions over valid labels; 0 when there were none.
    pub accuracy: f64,
    pub batches: usize,
    pub optimizer_steps: usize,
    /// LR handed to the last optimizer step.
    pub last_lr: f64,
}

/// Host-side masks for one device batch.
struct BatchMasks<B: Backend> {
    attention: Tensor<B, 2>,
    labels: Tensor<B, 2, Bool>,
}

pub struct TokenClassificationTask {
    pub name: String,
    config: TaskConfig,
    pad_token_id: i64,
    ignore_index: i64,
    global_step: usize,
}

impl TokenClassificationTask {
    pub fn new(name: impl Into<String>, config: TaskConfig, pad_token_id: i64) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            pad_token_id,
            ignore_index: IGNORE_INDEX,
            global_step: 0,
        })
    }

    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn pad_token_id(&self) -> i64 {
        self.pad_token_id
    }

    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Optimizer steps accounted so far across all training epochs.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    fn masks<B: Backend>(&self, batch: &TensorBatch<B>) -> BatchMasks<B> {
        BatchMasks {
            attention: batch.input_ids.clone().not_equal_elem(self.pad_token_id).float(),
            labels: batch.labels.clone().not_equal_elem(self.ignore_index),
        }
    }

    /// Forward one batch; returns `(logits, masked loss)`.
    fn forward_loss<B, M>(
        &self,
        model: &M,
        batch: &TensorBatch<B>,
        masks: &BatchMasks<B>,
        loss_fn: &TokenLoss,
    ) -> (Tensor<B, 2>, Tensor<B, 1>)
    where
        B: Backend,
        M: TokenClassifier<B>,
    {
        let logits = model
            .forward(batch.input_ids.clone(), masks.attention.clone())
            .logits
            .squeeze::<2>(2);
        let loss = masked_sequence_loss(
            loss_fn,
            logits.clone(),
            batch.labels.clone(),
            masks.labels.clone(),
        );
        (logits, loss)
    }

    /// Run one training epoch.
    ///
    /// The loss is built from `loss_spec` before the first batch is pulled, so
    /// an unsupported loss kind fails without touching the data. Stops early
    /// once `steps_per_epoch` optimizer steps' worth of batches were seen.
    pub fn train<B, M, O, S, I>(
        &mut self,
        mut model: M,
        optimizer: &mut O,
        scheduler: &mut S,
        batches: I,
        device: &B::Device,
        loss_spec: &LossSpec,
    ) -> anyhow::Result<(M, TrainOutcome)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + TokenClassifier<B>,
        O: Optimizer<M, B>,
        S: LrSchedule + ?Sized,
        I: IntoIterator<Item = TokenBatch>,
    {
        let loss_fn = loss_spec.build()?;
        let accum = self.config.gradient_accumulation_steps;
        let stop_after = accum * self.config.steps_per_epoch;

        let mut accumulator = GradientsAccumulator::new();
        let mut pending = 0usize;

        let mut total_loss = 0.0;
        let mut n_valid = 0usize;
        let mut n_correct = 0usize;
        let mut n_batches = 0usize;
        let mut optimizer_steps = 0usize;
        let mut last_lr = scheduler.current();

        for (batch_idx, host) in batches.into_iter().enumerate() {
            ensure_fits(&model, host.seq_len)?;
            let batch = to_device::<B>(&host, device);
            let masks = self.masks(&batch);

            let (logits, loss) = self.forward_loss(&model, &batch, &masks, &loss_fn);
            let loss = if accum > 1 { loss.div_scalar(accum as f64) } else { loss };
            let loss_value = scalar(loss.clone());

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            let ready = match self.config.accumulation_gating {
                AccumulationGating::BatchIndex => (batch_idx % accum == 0).then_some(grads),
                AccumulationGating::Completed => {
                    accumulator.accumulate(&model, grads);
                    pending += 1;
                    (pending == accum).then(|| {
                        pending = 0;
                        accumulator.grads()
                    })
                }
            };
            if let Some(mut grads) = ready {
                let grad_norm = clip_grad_norm::<B, M>(&model, &mut grads, self.config.max_grad_norm);
                last_lr = scheduler.step();
                model = optimizer.step(last_lr, model, grads);
                optimizer_steps += 1;
                tracing::trace!(batch = batch_idx, grad_norm, lr = last_lr, "optimizer step");
            }

            let correct = compute_correct(
                logits.detach(),
                batch.labels,
                masks.labels,
                self.config.threshold,
            )?;
            n_batches += 1;
            total_loss += loss_value;
            n_valid += correct.len();
            n_correct += correct.n_correct;

            if self.config.log_interval > 0 && batch_idx % self.config.log_interval == 0 {
                tracing::debug!(
                    batch = batch_idx,
                    loss = format!("{loss_value:.4}"),
                    tokens = host.num_tokens(),
                    "training batch"
                );
            }

            if n_batches == stop_after {
                break;
            }
        }

        anyhow::ensure!(n_batches > 0, "training epoch produced no batches");
        if pending > 0 {
            tracing::debug!(pending, "dropping incomplete gradient accumulation window");
        }

        let steps = n_batches as f64 / accum as f64;
        self.global_step += steps.floor() as usize;

        let outcome = TrainOutcome {
            loss: total_loss / steps,
            accuracy: if n_valid == 0 { 0.0 } else { n_correct as f64 / n_valid as f64 },
            batches: n_batches,
            optimizer_steps,
            last_lr,
        };
        tracing::info!(
            task = %self.name,
            batches = outcome.batches,
            optimizer_steps = outcome.optimizer_steps,
            global_step = self.global_step,
            loss = format!("{:.4}", outcome.loss),
            accuracy = format!("{:.4}", outcome.accuracy),
            "train epoch done"
        );
        Ok((model, outcome))
    }

    /// Run one evaluation epoch without gradients.
    ///
    /// Predictions and labels are gathered over the whole epoch before
    /// scoring, so accuracy is over the concatenated vectors rather than a
    /// mean of per-batch accuracies.
    pub fn eval<B, M, I>(
        &self,
        model: &M,
        batches: I,
        device: &B::Device,
        loss_spec: &LossSpec,
    ) -> anyhow::Result<EvalScores>
    where
        B: Backend,
        M: TokenClassifier<B>,
        I: IntoIterator<Item = TokenBatch>,
    {
        let loss_fn = loss_spec.build()?;

        let mut total_loss = 0.0;
        let mut steps = 0usize;
        let mut all = Correctness::default();

        for host in batches {
            ensure_fits(model, host.seq_len)?;
            let batch = to_device::<B>(&host, device);
            let masks = self.masks(&batch);
            let (logits, loss) = self.forward_loss(model, &batch, &masks, &loss_fn);

            let correct = compute_correct(logits, batch.labels, masks.labels, self.config.threshold)?;
            all.n_correct += correct.n_correct;
            all.preds.extend(correct.preds);
            all.labels.extend(correct.labels);

            total_loss += scalar(loss);
            steps += 1;
        }
        anyhow::ensure!(steps > 0, "evaluation epoch produced no batches");

        let scores = EvalScores::from_predictions(total_loss / steps as f64, &all.preds, &all.labels);
        tracing::info!(
            task = %self.name,
            batches = steps,
            tokens = all.len(),
            loss = format!("{:.4}", scores.eval_loss),
            acc = format!("{:.4}", scores.eval_acc),
            prec = format!("{:.4}", scores.eval_prec),
            rec = format!("{:.4}", scores.eval_rec),
            f1 = format!("{:.4}", scores.eval_f_score),
            "eval epoch done"
        );
        Ok(scores)
    }
}
