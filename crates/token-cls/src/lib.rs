//! Binary token classification on burn.
//!
//! A transformer encoder tags every token with one logit. Training uses a
//! masked, positively weighted binary cross-entropy with optional gradient
//! accumulation; evaluation reports macro precision/recall/F1 over the whole
//! epoch; inference thresholds per-token probabilities at the word positions
//! selected by a token mask.

pub mod inference;
pub mod model;
pub mod training;

pub use inference::{inference, TokenTagger};
pub use model::bridge::{to_device, TensorBatch};
pub use model::classifier::{ensure_fits, TokenClassifier, TokenClassifierOutput};
pub use model::tagger::{TaggerConfig, TransformerTagger};
pub use training::checkpoint::{load_checkpoint, load_meta, load_tagger_config, CheckpointMeta, CheckpointWriter};
pub use training::clip::{clip_grad_norm, global_grad_norm};
pub use training::loss::{get_loss_fn, masked_sequence_loss, LossError, LossKind, LossSpec, Reduction, TokenLoss};
pub use training::metrics::{compute_correct, compute_correct_slices, Correctness, EvalScores, MetricsHistory};
pub use training::optim::{OptimError, OptimMethod, OptimizerSettings};
pub use training::schedule::{ConstantLr, LinearWarmupDecay, LrSchedule};
pub use training::task::{AccumulationGating, TaskConfig, TokenClassificationTask, TrainOutcome};
