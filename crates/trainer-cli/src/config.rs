//! TOML model config loading for the trainer CLI.
//!
//! A model TOML has a single `[model]` table whose fields override the
//! `TaggerConfig` defaults; anything left out keeps its default.

use std::path::Path;

use serde::Deserialize;
use token_cls::TaggerConfig;

/// Top-level structure of a model config file.
#[derive(Debug, Default, Deserialize)]
pub struct ModelToml {
    #[serde(default)]
    pub model: ModelOverrides,
}

/// Optional overrides for `TaggerConfig` fields.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelOverrides {
    pub name: Option<String>,
    pub vocab_size: Option<usize>,
    pub max_position_embeddings: Option<usize>,
    pub d_model: Option<usize>,
    pub n_heads: Option<usize>,
    pub n_layers: Option<usize>,
    pub d_ff: Option<usize>,
    pub dropout: Option<f64>,
    pub pad_token_id: Option<usize>,
}

/// Load and deserialize a `ModelToml` from a TOML file.
pub fn load_model_toml(path: &Path) -> anyhow::Result<ModelToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read model config {}: {e}", path.display()))?;
    let config: ModelToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded model config");
    Ok(config)
}

/// Build a `TaggerConfig` from defaults, TOML overrides and the CLI model name.
///
/// Priority chain: `TaggerConfig` defaults < TOML values < `--model_version`.
/// The head always has a single output.
pub fn build_tagger_config(overrides: &ModelOverrides, model_version: Option<&str>) -> TaggerConfig {
    let mut config = TaggerConfig::new().with_num_labels(1);

    if let Some(name) = &overrides.name {
        config.name = name.clone();
    }
    if let Some(v) = overrides.vocab_size {
        config.vocab_size = v;
    }
    if let Some(v) = overrides.max_position_embeddings {
        config.max_position_embeddings = v;
    }
    if let Some(v) = overrides.d_model {
        config.d_model = v;
    }
    if let Some(v) = overrides.n_heads {
        config.n_heads = v;
    }
    if let Some(v) = overrides.n_layers {
        config.n_layers = v;
    }
    if let Some(v) = overrides.d_ff {
        config.d_ff = v;
    }
    if let Some(v) = overrides.dropout {
        config.dropout = v;
    }
    if let Some(v) = overrides.pad_token_id {
        config.pad_token_id = v;
    }

    if let Some(name) = model_version {
        config.name = name.to_string();
    }
    config
}
