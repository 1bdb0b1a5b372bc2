//! Integration tests for the token-cls crate.
//!
//! Exercise the task loop end to end on NdArray backends: early stopping,
//! loss bookkeeping under gradient accumulation, epoch-level evaluation
//! scores and inference output shape. Synthetic batches only.

use std::cell::Cell;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::nn::{Embedding, EmbeddingConfig};
use burn::optim::{AdamConfig, SgdConfig};
use burn::prelude::*;
use shards::{TokenBatch, TokenRecord, IGNORE_INDEX};

use token_cls::{
    inference, masked_sequence_loss, to_device, AccumulationGating, ConstantLr, EvalScores,
    LinearWarmupDecay, LossSpec, TaskConfig, TokenClassificationTask, TokenClassifier,
    TokenClassifierOutput,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const PAD: i64 = 1;

// ---------------------------------------------------------------------------
// Test models
// ---------------------------------------------------------------------------

/// Logit of a token is `id - 10`: ids above 10 predict 1, below predict 0.
struct LookupLogits;

impl<B: Backend> TokenClassifier<B> for LookupLogits {
    fn forward(&self, input_ids: Tensor<B, 2, Int>, _mask: Tensor<B, 2>) -> TokenClassifierOutput<B> {
        TokenClassifierOutput {
            logits: input_ids.float().sub_scalar(10.0).unsqueeze_dim::<3>(2),
        }
    }
}

/// One trainable logit per vocabulary entry.
#[derive(Module, Debug)]
struct PerTokenBias<B: Backend> {
    bias: Embedding<B>,
}

impl<B: Backend> PerTokenBias<B> {
    fn new(vocab: usize, device: &B::Device) -> Self {
        Self {
            bias: EmbeddingConfig::new(vocab, 1).init(device),
        }
    }

    fn weights(&self) -> Vec<f32> {
        self.bias.weight.val().into_data().convert::<f32>().to_vec().unwrap()
    }
}

impl<B: Backend> TokenClassifier<B> for PerTokenBias<B> {
    fn forward(&self, input_ids: Tensor<B, 2, Int>, _mask: Tensor<B, 2>) -> TokenClassifierOutput<B> {
        TokenClassifierOutput {
            logits: self.bias.forward(input_ids),
        }
    }
}

/// Two per-token logit tables summed; both receive the same gradient.
#[derive(Module, Debug)]
struct TwoTables<B: Backend> {
    first: Embedding<B>,
    second: Embedding<B>,
}

impl<B: Backend> TwoTables<B> {
    fn new(vocab: usize, device: &B::Device) -> Self {
        Self {
            first: EmbeddingConfig::new(vocab, 1).init(device),
            second: EmbeddingConfig::new(vocab, 1).init(device),
        }
    }

    fn weights(&self) -> Vec<f32> {
        let mut w: Vec<f32> = self.first.weight.val().into_data().convert::<f32>().to_vec().unwrap();
        w.extend(self.second.weight.val().into_data().convert::<f32>().to_vec::<f32>().unwrap());
        w
    }
}

impl<B: Backend> TokenClassifier<B> for TwoTables<B> {
    fn forward(&self, input_ids: Tensor<B, 2, Int>, _mask: Tensor<B, 2>) -> TokenClassifierOutput<B> {
        TokenClassifierOutput {
            logits: self.first.forward(input_ids.clone()) + self.second.forward(input_ids),
        }
    }
}

// ---------------------------------------------------------------------------
// Data helpers
// ---------------------------------------------------------------------------

fn row(ids: &[i64], labels: &[i64]) -> TokenRecord {
    TokenRecord::new(ids.to_vec(), labels.to_vec())
}

fn batch(rows: &[TokenRecord]) -> TokenBatch {
    TokenBatch::from_records(rows, PAD, IGNORE_INDEX)
}

fn training_batches(n: usize) -> Vec<TokenBatch> {
    (0..n)
        .map(|i| {
            let a = 2 + (i as i64 % 5);
            batch(&[
                row(&[0, a, a + 1, 2], &[IGNORE_INDEX, 1, 0, IGNORE_INDEX]),
                row(&[0, a + 2, 2], &[IGNORE_INDEX, (i % 2) as i64, IGNORE_INDEX]),
            ])
        })
        .collect()
}

fn task(config: TaskConfig) -> TokenClassificationTask {
    TokenClassificationTask::new("test", config, PAD).unwrap()
}

fn bce(x: f64, y: f64) -> f64 {
    (1.0 - y) * x + (1.0 + (-x.abs()).exp()).ln() + (-x).max(0.0)
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[test]
fn test_early_stop_consumes_exactly_n_batches() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let mut optim = AdamConfig::new().init();
    let mut sched = ConstantLr(1e-2);
    let mut task = task(TaskConfig::new().with_steps_per_epoch(3));

    let pulled = Cell::new(0usize);
    let batches = training_batches(10).into_iter().inspect(|_| pulled.set(pulled.get() + 1));

    let (_, out) = task
        .train(model, &mut optim, &mut sched, batches, &device, &LossSpec::default())
        .unwrap();
    assert_eq!(pulled.get(), 3, "no batch may be pulled past the stop point");
    assert_eq!(out.batches, 3);
    assert_eq!(out.optimizer_steps, 3);
    assert_eq!(task.global_step(), 3);
}

#[test]
fn test_accumulation_step_counts() {
    let device = Default::default();
    for gating in [AccumulationGating::BatchIndex, AccumulationGating::Completed] {
        let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
        let mut optim = AdamConfig::new().init();
        let mut sched = ConstantLr(1e-2);
        let mut task = task(
            TaskConfig::new()
                .with_gradient_accumulation_steps(2)
                .with_steps_per_epoch(2)
                .with_accumulation_gating(gating),
        );

        let (_, out) = task
            .train(model, &mut optim, &mut sched, training_batches(9), &device, &LossSpec::default())
            .unwrap();
        assert_eq!(out.batches, 4, "{gating}: stop after accum * steps_per_epoch batches");
        // BatchIndex steps at indices 0 and 2; Completed after batches 2 and 4.
        assert_eq!(out.optimizer_steps, 2, "{gating}");
        assert_eq!(task.global_step(), 2);
    }
}

#[test]
fn test_reported_loss_matches_recomputation() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let reference = model.valid();
    let mut optim = AdamConfig::new().init();
    // LR 0 keeps parameters fixed, so every batch sees the reference weights.
    let mut sched = ConstantLr(0.0);
    let mut task = task(TaskConfig::new().with_gradient_accumulation_steps(2).with_steps_per_epoch(100));

    let data = training_batches(3);
    let (trained, out) = task
        .train(model, &mut optim, &mut sched, data.clone(), &device, &LossSpec::default().with_pos_weight(5.0))
        .unwrap();
    assert_eq!(trained.weights(), reference.weights());

    let loss_fn = LossSpec::default().with_pos_weight(5.0).build().unwrap();
    let mut sum = 0.0;
    for host in &data {
        let b = to_device::<TestBackend>(host, &device);
        let mask = b.labels.clone().not_equal_elem(IGNORE_INDEX);
        let logits = reference
            .forward(b.input_ids.clone(), b.input_ids.clone().not_equal_elem(PAD).float())
            .logits
            .squeeze::<2>(2);
        let l: f64 = masked_sequence_loss(&loss_fn, logits, b.labels, mask).into_scalar().elem();
        sum += l / 2.0;
    }
    let expected = sum / 1.5;
    assert!((out.loss - expected).abs() < 1e-5, "expected {expected}, got {}", out.loss);
    assert_eq!(task.global_step(), 1, "floor(3 / 2)");
}

/// Size of one plain-SGD update (lr 1) on `TwoTables` under `max_grad_norm`.
fn sgd_update_norm(max_grad_norm: f64) -> f64 {
    let device = Default::default();
    let model = TwoTables::<TestAutodiffBackend>::new(16, &device);
    let before = model.weights();
    let mut optim = SgdConfig::new().init();
    let mut sched = ConstantLr(1.0);
    let mut task = task(TaskConfig::new().with_steps_per_epoch(1).with_max_grad_norm(max_grad_norm));

    let (model, out) = task
        .train(model, &mut optim, &mut sched, training_batches(1), &device, &LossSpec::default())
        .unwrap();
    assert_eq!(out.optimizer_steps, 1);
    before
        .iter()
        .zip(model.weights())
        .map(|(a, b)| ((b - a) as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[test]
fn test_gradient_clipping_bounds_the_joint_norm() {
    let unclipped = sgd_update_norm(0.0);
    let limit = 1e-3;
    assert!(unclipped > 10.0 * limit, "gradient too small to exercise clipping: {unclipped}");

    // Clipping each table separately would allow sqrt(2) * limit.
    let clipped = sgd_update_norm(limit);
    assert!((clipped - limit).abs() < 1e-5, "update norm {clipped}, limit {limit}");
}

#[test]
fn test_training_moves_weights_and_schedule_starts_at_zero() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let before = model.weights();
    let mut optim = AdamConfig::new().init();
    let mut sched = LinearWarmupDecay::new(0.1, 1.0, 10);
    let mut task = task(TaskConfig::new().with_steps_per_epoch(4));

    let (model, out) = task
        .train(model, &mut optim, &mut sched, training_batches(4), &device, &LossSpec::default())
        .unwrap();
    assert_eq!(sched.steps_taken(), 4);
    assert_ne!(model.weights(), before);
    assert!(out.loss.is_finite());
    assert!((0.0..=1.0).contains(&out.accuracy));
}

#[test]
fn test_unsupported_loss_fails_before_any_batch() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let mut optim = AdamConfig::new().init();
    let mut sched = ConstantLr(1e-3);
    let mut task = task(TaskConfig::new());
    let spec = LossSpec { kind: "hinge".to_string(), pos_weight: None };

    let batches = std::iter::from_fn(|| -> Option<TokenBatch> { panic!("batch pulled") });
    let err = task
        .train(model, &mut optim, &mut sched, batches, &device, &spec)
        .err()
        .expect("unsupported loss must fail");
    assert!(err.to_string().contains("not yet implemented"), "{err}");

    let batches = std::iter::from_fn(|| -> Option<TokenBatch> { panic!("batch pulled") });
    assert!(task.eval::<TestBackend, _, _>(&LookupLogits, batches, &device, &spec).is_err());
}

#[test]
fn test_empty_epoch_is_an_error() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let mut optim = AdamConfig::new().init();
    let mut sched = ConstantLr(1e-3);
    let mut task = task(TaskConfig::new());
    let res = task.train(model, &mut optim, &mut sched, Vec::new(), &device, &LossSpec::default());
    assert!(res.is_err());
    assert!(task.eval::<TestBackend, _, _>(&LookupLogits, Vec::new(), &device, &LossSpec::default()).is_err());
}

#[test]
fn test_no_valid_labels_reports_zero_accuracy() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let mut optim = AdamConfig::new().init();
    let mut sched = ConstantLr(1e-3);
    let mut task = task(TaskConfig::new());
    let unlabelled = vec![batch(&[row(&[0, 5, 2], &[IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX])])];
    let (_, out) = task
        .train(model, &mut optim, &mut sched, unlabelled, &device, &LossSpec::default())
        .unwrap();
    assert_eq!(out.accuracy, 0.0);
    assert_eq!(out.loss, 0.0);
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Two batches whose per-batch accuracies (0.5, 1.0) average to 0.75 while
/// the concatenated accuracy is 4/6.
fn eval_batches() -> Vec<TokenBatch> {
    vec![
        batch(&[row(&[11, 9, 11], &[1, 0, 0]), row(&[9], &[1])]),
        batch(&[row(&[11, 11], &[1, 1])]),
    ]
}

#[test]
fn test_two_batch_eval_matches_hand_computation() {
    let device = Default::default();
    let task = task(TaskConfig::new());
    let scores: EvalScores = task
        .eval::<TestBackend, _, _>(&LookupLogits, eval_batches(), &device, &LossSpec::default())
        .unwrap();

    // preds  [1, 0, 1, 0, 1, 1]
    // labels [1, 0, 0, 1, 1, 1]
    // class 1: tp 3 fp 1 fn 1 → 0.75; class 0: tp 1 fp 1 fn 1 → 0.5
    assert!((scores.eval_acc - 4.0 / 6.0).abs() < 1e-9, "acc {}", scores.eval_acc);
    assert!((scores.eval_acc - 0.75).abs() > 1e-3, "must not average per-batch accuracies");
    assert!((scores.eval_prec - 0.625).abs() < 1e-9);
    assert!((scores.eval_rec - 0.625).abs() < 1e-9);
    assert!((scores.eval_f_score - 0.625).abs() < 1e-9);

    let batch1 = ((bce(1.0, 1.0) + bce(-1.0, 0.0) + bce(1.0, 0.0)) / 3.0 + bce(-1.0, 1.0) / 3.0) / 2.0;
    let batch2 = (bce(1.0, 1.0) + bce(1.0, 1.0)) / 2.0;
    let expected_loss = (batch1 + batch2) / 2.0;
    assert!(
        (scores.eval_loss - expected_loss).abs() < 1e-5,
        "expected {expected_loss}, got {}",
        scores.eval_loss
    );
}

#[test]
fn test_eval_threshold_changes_predictions() {
    let device = Default::default();
    // sigmoid(1) = 0.73: a 0.8 threshold turns every prediction negative.
    let task = task(TaskConfig::new().with_threshold(0.8));
    let scores = task
        .eval::<TestBackend, _, _>(&LookupLogits, eval_batches(), &device, &LossSpec::default())
        .unwrap();
    assert!((scores.eval_acc - 2.0 / 6.0).abs() < 1e-9, "acc {}", scores.eval_acc);
}

#[test]
fn test_eval_on_valid_model_after_training() {
    let device = Default::default();
    let model = PerTokenBias::<TestAutodiffBackend>::new(16, &device);
    let mut optim = AdamConfig::new().init();
    let mut sched = ConstantLr(5e-2);
    let mut task = task(TaskConfig::new().with_steps_per_epoch(8));
    let (model, _) = task
        .train(model, &mut optim, &mut sched, training_batches(8), &device, &LossSpec::default())
        .unwrap();

    let scores = task
        .eval(&model.valid(), training_batches(3), &device, &LossSpec::default())
        .unwrap();
    assert!(scores.eval_loss.is_finite());
    assert!((0.0..=1.0).contains(&scores.eval_f_score));
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

#[test]
fn test_inference_lengths_and_order() {
    let device = Default::default();
    // Token mask: 0 marks a word start, IGNORE_INDEX everything else.
    let batches = vec![
        batch(&[
            row(&[0, 11, 12, 9, 2], &[IGNORE_INDEX, 0, IGNORE_INDEX, 0, IGNORE_INDEX]),
            row(&[0, 9, 2], &[IGNORE_INDEX, 0, IGNORE_INDEX]),
        ]),
        batch(&[row(&[0, 12, 11, 11, 9, 2], &[IGNORE_INDEX, 0, 0, 0, 0, IGNORE_INDEX])]),
    ];
    let expected_lengths: Vec<usize> = vec![2, 1, 4];

    let preds = inference::<TestBackend, _, _>(&LookupLogits, batches, &device, PAD, IGNORE_INDEX, 0.5).unwrap();
    let lengths: Vec<usize> = preds.iter().map(Vec::len).collect();
    assert_eq!(lengths, expected_lengths);
    assert_eq!(preds, vec![vec![1, 0], vec![0], vec![1, 1, 1, 0]]);
}
