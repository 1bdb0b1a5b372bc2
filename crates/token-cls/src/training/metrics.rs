use std::collections::BTreeMap;

use burn::prelude::*;

use crate::model::bridge::{bool_values, float_values, int_values};

/// Outcome of thresholding one batch against its gold labels.
///
/// `preds` and `labels` hold only the positions kept by the mask, in
/// row-major order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correctness {
    pub n_correct: usize,
    pub preds: Vec<i64>,
    pub labels: Vec<i64>,
}

impl Correctness {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Threshold logits and compare with labels at the masked-in positions.
///
/// A prediction is `1` when `sigmoid(logit) > threshold`, else `0`.
/// Positions where `mask` is false are dropped entirely, so their logits and
/// labels never influence the result.
pub fn compute_correct_slices(
    logits: &[f32],
    labels: &[i64],
    mask: &[bool],
    threshold: f64,
) -> Correctness {
    debug_assert_eq!(logits.len(), labels.len());
    debug_assert_eq!(logits.len(), mask.len());

    let mut out = Correctness::default();
    for ((&logit, &label), &keep) in logits.iter().zip(labels).zip(mask) {
        if !keep {
            continue;
        }
        let pred = i64::from(sigmoid(logit as f64) > threshold);
        if pred == label {
            out.n_correct += 1;
        }
        out.preds.push(pred);
        out.labels.push(label);
    }
    out
}

/// Tensor front-end to [`compute_correct_slices`].
///
/// `logits`, `labels` and `mask` share the same shape `(batch, seq_len)`.
pub fn compute_correct<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 2, Int>,
    mask: Tensor<B, 2, Bool>,
    threshold: f64,
) -> anyhow::Result<Correctness> {
    anyhow::ensure!(
        logits.dims() == labels.dims() && labels.dims() == mask.dims(),
        "shape mismatch: logits {:?}, labels {:?}, mask {:?}",
        logits.dims(),
        labels.dims(),
        mask.dims()
    );
    let logits = float_values(logits)?;
    let labels = int_values(labels)?;
    let mask = bool_values(mask)?;
    Ok(compute_correct_slices(&logits, &labels, &mask, threshold))
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Fraction of positions where `preds[i] == labels[i]`. Zero when empty.
pub fn accuracy(preds: &[i64], labels: &[i64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = preds.iter().zip(labels).filter(|(p, l)| p == l).count();
    correct as f64 / labels.len() as f64
}

/// Macro-averaged precision, recall and F1.
///
/// Averages over every class appearing in either `labels` or `preds`.
/// Undefined ratios (zero denominators) count as 0.
pub fn macro_precision_recall_f1(preds: &[i64], labels: &[i64]) -> (f64, f64, f64) {
    // class -> (tp, fp, fn)
    let mut counts: BTreeMap<i64, (usize, usize, usize)> = BTreeMap::new();
    for (&p, &l) in preds.iter().zip(labels) {
        if p == l {
            counts.entry(p).or_default().0 += 1;
        } else {
            counts.entry(p).or_default().1 += 1;
            counts.entry(l).or_default().2 += 1;
        }
    }
    if counts.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let (mut p_sum, mut r_sum, mut f_sum) = (0.0, 0.0, 0.0);
    for &(tp, fp, fn_) in counts.values() {
        let p = ratio(tp, tp + fp);
        let r = ratio(tp, tp + fn_);
        let f = if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) };
        p_sum += p;
        r_sum += r;
        f_sum += f;
    }
    let n = counts.len() as f64;
    (p_sum / n, r_sum / n, f_sum / n)
}

/// Scores reported after an evaluation epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EvalScores {
    pub eval_loss: f64,
    pub eval_acc: f64,
    pub eval_prec: f64,
    pub eval_rec: f64,
    pub eval_f_score: f64,
}

impl EvalScores {
    /// Score from epoch-level prediction and label vectors plus the mean loss.
    pub fn from_predictions(eval_loss: f64, preds: &[i64], labels: &[i64]) -> Self {
        let (eval_prec, eval_rec, eval_f_score) = macro_precision_recall_f1(preds, labels);
        Self {
            eval_loss,
            eval_acc: accuracy(preds, labels),
            eval_prec,
            eval_rec,
            eval_f_score,
        }
    }

    /// Flatten into the fixed key set used by metric sinks.
    pub fn to_metrics(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("eval_loss", self.eval_loss),
            ("eval_acc", self.eval_acc),
            ("eval_prec", self.eval_prec),
            ("eval_rec", self.eval_rec),
            ("eval_f_score", self.eval_f_score),
        ]
    }

    /// Warnings for degenerate evaluation results.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.eval_loss.is_finite() {
            warnings.push(format!("eval loss is not finite ({})", self.eval_loss));
        }
        if self.eval_f_score == 0.0 {
            warnings.push("macro F1 is zero; the model may predict a single class".to_string());
        }
        if self.eval_acc > 0.0 && self.eval_f_score < 0.5 * self.eval_acc {
            warnings.push(format!(
                "accuracy {:.3} far above F1 {:.3}; classes are likely imbalanced",
                self.eval_acc, self.eval_f_score
            ));
        }
        warnings
    }
}

/// Evaluation scores recorded per epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricsHistory {
    entries: Vec<(usize, EvalScores)>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, epoch: usize, scores: EvalScores) {
        self.entries.push((epoch, scores));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&(usize, EvalScores)> {
        self.entries.last()
    }

    /// Highest F1 seen so far, or 0.0 before any evaluation.
    pub fn best_f_score(&self) -> f64 {
        self.entries
            .iter()
            .map(|(_, s)| s.eval_f_score)
            .fold(0.0, f64::max)
    }

    /// Epoch of the first evaluation reaching [`Self::best_f_score`].
    pub fn best_epoch(&self) -> Option<usize> {
        let best = self.best_f_score();
        self.entries
            .iter()
            .find(|(_, s)| s.eval_f_score == best && best > 0.0)
            .map(|(e, _)| *e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_compute_correct_slices_basic() {
        // sigmoid: 2.0 → 0.88, -1.0 → 0.27, 0.0 → 0.5 (not > 0.5)
        let logits = [2.0_f32, -1.0, 0.0, 3.0];
        let labels = [1_i64, 1, 0, -100];
        let mask = [true, true, true, false];
        let c = compute_correct_slices(&logits, &labels, &mask, 0.5);
        assert_eq!(c.preds, vec![1, 0, 0]);
        assert_eq!(c.labels, vec![1, 1, 0]);
        assert_eq!(c.n_correct, 2);
    }

    #[test]
    fn test_masked_positions_never_change_count() {
        let labels = [1_i64, 0, 1, 0, 1];
        let mask = [true, false, true, false, true];
        let base = compute_correct_slices(&[1.0, 0.0, -1.0, 0.0, 2.0], &labels, &mask, 0.5);

        for masked_logit in [-50.0_f32, -0.1, 0.1, 50.0] {
            let logits = [1.0, masked_logit, -1.0, -masked_logit, 2.0];
            let c = compute_correct_slices(&logits, &labels, &mask, 0.5);
            assert_eq!(c, base, "masked logit {masked_logit} changed the result");
        }
        let other_labels = [1_i64, 1, 1, 1, 1];
        let c = compute_correct_slices(&[1.0, 0.0, -1.0, 0.0, 2.0], &other_labels, &mask, 0.5);
        assert_eq!(c.n_correct, base.n_correct);
    }

    #[test]
    fn test_threshold_is_respected() {
        let c = compute_correct_slices(&[0.5], &[1], &[true], 0.7);
        assert_eq!(c.preds, vec![0], "sigmoid(0.5)=0.62 is below 0.7");
        let c = compute_correct_slices(&[0.5], &[1], &[true], 0.6);
        assert_eq!(c.preds, vec![1]);
    }

    #[test]
    fn test_compute_correct_tensor_matches_slices() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[2.0_f32, -1.0, 0.0], [0.3, -0.3, 5.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::from([[1_i64, 1, -100], [1, 0, -100]]),
            &device,
        );
        let mask = labels.clone().not_equal_elem(-100);
        let c = compute_correct(logits, labels, mask, 0.5).unwrap();
        assert_eq!(c.preds, vec![1, 0, 1, 0]);
        assert_eq!(c.labels, vec![1, 1, 1, 0]);
        assert_eq!(c.n_correct, 3);
    }

    #[test]
    fn test_compute_correct_rejects_shape_mismatch() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let labels = Tensor::<TestBackend, 2, Int>::zeros([2, 2], &device);
        let mask = labels.clone().equal_elem(0);
        assert!(compute_correct(logits, labels, mask, 0.5).is_err());
    }

    #[test]
    fn test_macro_scores_hand_computed() {
        // class 1: tp=2 fp=1 fn=1 → p=2/3 r=2/3 f=2/3
        // class 0: tp=1 fp=1 fn=1 → p=1/2 r=1/2 f=1/2
        let preds = [1_i64, 1, 1, 0, 0];
        let labels = [1_i64, 1, 0, 1, 0];
        let (p, r, f) = macro_precision_recall_f1(&preds, &labels);
        let expected = (2.0 / 3.0 + 0.5) / 2.0;
        assert!((p - expected).abs() < 1e-12);
        assert!((r - expected).abs() < 1e-12);
        assert!((f - expected).abs() < 1e-12);
    }

    #[test]
    fn test_macro_scores_zero_division() {
        // Never predicts 1: class 1 has p=0 (0/0), r=0.
        let preds = [0_i64, 0, 0, 0];
        let labels = [0_i64, 0, 1, 1];
        let (p, r, f) = macro_precision_recall_f1(&preds, &labels);
        // class 0: p=2/4 r=1 f=2/3
        assert!((p - 0.25).abs() < 1e-12);
        assert!((r - 0.5).abs() < 1e-12);
        assert!((f - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_macro_scores_single_class_present() {
        let (p, r, f) = macro_precision_recall_f1(&[0, 0], &[0, 0]);
        assert_eq!((p, r, f), (1.0, 1.0, 1.0));
        assert_eq!(macro_precision_recall_f1(&[], &[]), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_eval_scores_keys_and_health() {
        let s = EvalScores::from_predictions(0.3, &[0, 0, 0, 0], &[0, 0, 0, 1]);
        let keys: Vec<_> = s.to_metrics().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["eval_loss", "eval_acc", "eval_prec", "eval_rec", "eval_f_score"]);
        assert!((s.eval_acc - 0.75).abs() < 1e-12);

        let inverted = EvalScores::from_predictions(0.3, &[1, 1], &[0, 0]);
        assert_eq!(inverted.eval_f_score, 0.0);
        assert!(!inverted.health_check().is_empty());
        let diverged = EvalScores { eval_loss: f64::NAN, ..s };
        assert!(diverged.health_check().iter().any(|w| w.contains("not finite")));

        let good = EvalScores::from_predictions(0.1, &[0, 1], &[0, 1]);
        assert!(good.health_check().is_empty(), "{:?}", good.health_check());
    }

    #[test]
    fn test_history_tracks_best() {
        let mut h = MetricsHistory::new();
        assert_eq!(h.best_f_score(), 0.0);
        assert_eq!(h.best_epoch(), None);
        h.push(1, EvalScores { eval_f_score: 0.4, ..Default::default() });
        h.push(5, EvalScores { eval_f_score: 0.6, ..Default::default() });
        h.push(10, EvalScores { eval_f_score: 0.5, ..Default::default() });
        assert_eq!(h.len(), 3);
        assert_eq!(h.best_f_score(), 0.6);
        assert_eq!(h.best_epoch(), Some(5));
        assert_eq!(h.last().map(|(e, _)| *e), Some(10));
    }
}
