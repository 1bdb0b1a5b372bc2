//! Checkpoint layout on disk:
//!
//! ```text
//! {root}/tagger_config.json
//! {root}/ckp_{epoch}.mpk     model record
//! {root}/ckp_{epoch}.json    CheckpointMeta
//! {root}/model_best.mpk      copy of the best epoch so far
//! {root}/model_best.json
//! ```

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::model::tagger::{TaggerConfig, TransformerTagger};
use crate::training::metrics::EvalScores;

const BEST_STEM: &str = "model_best";
const CONFIG_FILE: &str = "tagger_config.json";

/// Metadata saved next to each model record.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub global_step: usize,
    pub is_best: bool,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub scores: EvalScores,
}

pub struct CheckpointWriter {
    root: PathBuf,
    recorder: NamedMpkFileRecorder<FullPrecisionSettings>,
}

impl CheckpointWriter {
    /// Create the checkpoint directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| anyhow::anyhow!("Failed to create checkpoint dir {}: {e}", root.display()))?;
        Ok(Self {
            root,
            recorder: NamedMpkFileRecorder::new(),
        })
    }

    /// `{ckp_path}/{run_name}/{db_name}/{model_name}`
    pub fn for_run(
        ckp_path: &Path,
        run_name: &str,
        db_name: &str,
        model_name: &str,
    ) -> anyhow::Result<Self> {
        Self::new(ckp_path.join(run_name).join(db_name).join(model_name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn best_path(&self) -> PathBuf {
        self.root.join(format!("{BEST_STEM}.mpk"))
    }

    pub fn save_config(&self, config: &TaggerConfig) -> anyhow::Result<PathBuf> {
        let path = self.root.join(CONFIG_FILE);
        config
            .save(&path)
            .map_err(|e| anyhow::anyhow!("Failed to save tagger config to {}: {e}", path.display()))?;
        Ok(path)
    }

    /// Write `ckp_{epoch}` and, when `meta.is_best`, refresh `model_best`.
    ///
    /// Returns the path of the model record.
    pub fn save<B: Backend>(
        &self,
        model: &TransformerTagger<B>,
        meta: &CheckpointMeta,
    ) -> anyhow::Result<PathBuf> {
        let stem = self.root.join(format!("ckp_{}", meta.epoch));
        model
            .clone()
            .save_file(&stem, &self.recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save model at epoch {}: {e}", meta.epoch))?;
        let record_path = stem.with_extension("mpk");

        let meta_path = stem.with_extension("json");
        serde_json::to_writer_pretty(
            std::fs::File::create(&meta_path)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", meta_path.display()))?,
            meta,
        )?;

        if meta.is_best {
            std::fs::copy(&record_path, self.best_path())?;
            std::fs::copy(&meta_path, self.root.join(format!("{BEST_STEM}.json")))?;
        }

        tracing::info!(
            epoch = meta.epoch,
            is_best = meta.is_best,
            path = %record_path.display(),
            "Saved checkpoint"
        );
        Ok(record_path)
    }
}

/// Rebuild a tagger from `config` and load weights from `path`.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    config: &TaggerConfig,
    device: &B::Device,
) -> anyhow::Result<TransformerTagger<B>> {
    let model = config
        .init::<B>(device)
        .load_file(
            path,
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    Ok(model)
}

/// Read the metadata stored next to a model record.
pub fn load_meta(record_path: &Path) -> anyhow::Result<CheckpointMeta> {
    let meta_path = record_path.with_extension("json");
    let meta = serde_json::from_reader(
        std::fs::File::open(&meta_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
    )
    .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;
    Ok(meta)
}

/// Read `tagger_config.json` from a checkpoint directory.
pub fn load_tagger_config(dir: &Path) -> anyhow::Result<TaggerConfig> {
    let path = dir.join(CONFIG_FILE);
    TaggerConfig::load(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load tagger config from {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;
    use crate::model::classifier::TokenClassifier;

    type TestBackend = NdArray<f32>;

    fn tiny() -> TaggerConfig {
        TaggerConfig::new()
            .with_name("tiny".to_string())
            .with_vocab_size(16)
            .with_max_position_embeddings(8)
            .with_d_model(8)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(8)
            .with_dropout(0.0)
    }

    fn meta(epoch: usize, is_best: bool, f1: f64) -> CheckpointMeta {
        CheckpointMeta {
            epoch,
            global_step: epoch * 10,
            is_best,
            train_loss: 0.5,
            train_accuracy: 0.8,
            scores: EvalScores { eval_f_score: f1, ..Default::default() },
        }
    }

    #[test]
    fn test_layout_and_best_copy() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny();
        let model = config.init::<TestBackend>(&device);

        let writer = CheckpointWriter::for_run(tmp.path(), "run", "db", &config.name).unwrap();
        assert_eq!(writer.root(), tmp.path().join("run/db/tiny"));
        writer.save_config(&config).unwrap();

        let p1 = writer.save(&model, &meta(1, true, 0.4)).unwrap();
        let p5 = writer.save(&model, &meta(5, false, 0.3)).unwrap();
        assert!(p1.ends_with("ckp_1.mpk") && p1.exists());
        assert!(p5.ends_with("ckp_5.mpk") && p5.exists());
        assert!(writer.root().join("ckp_5.json").exists());

        let best = load_meta(&writer.best_path()).unwrap();
        assert_eq!(best.epoch, 1, "non-best save must not replace model_best");

        writer.save(&model, &meta(10, true, 0.6)).unwrap();
        assert_eq!(load_meta(&writer.best_path()).unwrap(), meta(10, true, 0.6));

        let reloaded = load_tagger_config(writer.root()).unwrap();
        assert_eq!(reloaded.name, "tiny");
        assert_eq!(reloaded.d_model, 8);
    }

    #[test]
    fn test_load_restores_weights() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny();
        let model = config.init::<TestBackend>(&device);
        let writer = CheckpointWriter::new(tmp.path()).unwrap();
        let path = writer.save(&model, &meta(2, false, 0.0)).unwrap();

        let loaded = load_checkpoint::<TestBackend>(&path, &config, &device).unwrap();
        let ids = Tensor::<TestBackend, 2, Int>::from_data(TensorData::from([[0_i64, 3, 4, 2]]), &device);
        let mask = Tensor::<TestBackend, 2>::ones([1, 4], &device);

        let a: Vec<f32> = model.forward(ids.clone(), mask.clone()).logits.into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.forward(ids, mask).logits.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let device = Default::default();
        let err = load_checkpoint::<TestBackend>(Path::new("/nonexistent/ckp_1.mpk"), &tiny(), &device);
        assert!(err.is_err());
    }
}
