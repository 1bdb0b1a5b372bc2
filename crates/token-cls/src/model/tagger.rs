use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;

use crate::model::classifier::{TokenClassifier, TokenClassifierOutput};

/// Configuration for the transformer token tagger.
///
/// Defaults mirror the dimensions of `distilroberta-base`. Positions are
/// numbered from 0, so sequences may be at most `max_position_embeddings`
/// long.
///
/// ```text
/// (batch, seq) token ids
///   → token embedding + position embedding → LayerNorm → Dropout
///   → n_layers × transformer encoder block (padding masked)
///   → Linear(d_model → num_labels)
///   → logits: (batch, seq, num_labels)
/// ```
#[derive(Config, Debug)]
pub struct TaggerConfig {
    /// Model identifier, used in checkpoint paths and run names.
    #[config(default = "String::from(\"distilroberta-base\")")]
    pub name: String,
    #[config(default = 50265)]
    pub vocab_size: usize,
    /// Longest sequence the position embedding can index.
    #[config(default = 514)]
    pub max_position_embeddings: usize,
    #[config(default = 768)]
    pub d_model: usize,
    #[config(default = 12)]
    pub n_heads: usize,
    #[config(default = 6)]
    pub n_layers: usize,
    #[config(default = 3072)]
    pub d_ff: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    /// Token id used for padding; padded positions are masked out of attention.
    #[config(default = 1)]
    pub pad_token_id: usize,
    /// Output width of the classification head. Binary tagging uses 1.
    #[config(default = 1)]
    pub num_labels: usize,
}

/// Transformer encoder with a per-token classification head.
#[derive(Module, Debug)]
pub struct TransformerTagger<B: Backend> {
    token_embedding: Embedding<B>,
    position_embedding: Embedding<B>,
    embedding_norm: LayerNorm<B>,
    /// One single-layer encoder per block so blocks can be frozen individually.
    blocks: Vec<TransformerEncoder<B>>,
    dropout: Dropout,
    classifier: Linear<B>,
}

impl TaggerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransformerTagger<B> {
        let blocks = (0..self.n_layers)
            .map(|_| {
                TransformerEncoderConfig::new(self.d_model, self.d_ff, self.n_heads, 1)
                    .with_dropout(self.dropout)
                    .init(device)
            })
            .collect();

        TransformerTagger {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.d_model).init(device),
            position_embedding: EmbeddingConfig::new(self.max_position_embeddings, self.d_model)
                .init(device),
            embedding_norm: LayerNormConfig::new(self.d_model).init(device),
            blocks,
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(self.d_model, self.num_labels).init(device),
        }
    }
}

impl<B: Backend> TransformerTagger<B> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Keep only the top `trainable_top` encoder blocks and the classifier
    /// head trainable; embeddings and lower blocks stop receiving gradients.
    pub fn freeze_below(mut self, trainable_top: usize) -> Self {
        let first_trainable = self.blocks.len().saturating_sub(trainable_top);

        self.token_embedding = self.token_embedding.no_grad();
        self.position_embedding = self.position_embedding.no_grad();
        self.embedding_norm = self.embedding_norm.no_grad();
        self.blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| if i < first_trainable { block.no_grad() } else { block })
            .collect();

        tracing::info!(
            frozen_blocks = first_trainable,
            trainable_blocks = self.blocks.len() - first_trainable,
            "Froze embeddings and lower encoder blocks"
        );
        self
    }
}

impl<B: Backend> TokenClassifier<B> for TransformerTagger<B> {
    fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2>,
    ) -> TokenClassifierOutput<B> {
        let [batch, seq] = input_ids.dims();
        let device = input_ids.device();

        let positions = Tensor::<B, 1, Int>::arange(0..seq as i64, &device)
            .unsqueeze::<2>()
            .expand([batch, seq]);

        let x = self.token_embedding.forward(input_ids) + self.position_embedding.forward(positions);
        let mut x = self.dropout.forward(self.embedding_norm.forward(x));

        let mask_pad = attention_mask.equal_elem(0.0);
        for block in &self.blocks {
            x = block.forward(TransformerEncoderInput::new(x).mask_pad(mask_pad.clone()));
        }

        TokenClassifierOutput {
            logits: self.classifier.forward(x),
        }
    }

    fn max_positions(&self) -> Option<usize> {
        Some(self.position_embedding.weight.val().dims()[0])
    }
}
