//! Tensor bridge: explicit movement of host batches onto a burn device and
//! extraction of tensor contents back into plain vectors.
//!
//! Every host → device transfer in the task loop goes through
//! [`to_device`], so data movement is a visible, testable step rather than
//! an implicit side effect of the forward pass.

use burn::prelude::*;
use burn::tensor::TensorData;
use shards::TokenBatch;

/// A padded batch resident on a burn device.
///
/// `labels` holds gold labels for training/evaluation and the token-validity
/// mask for inference; both use the same ignore sentinel.
#[derive(Debug, Clone)]
pub struct TensorBatch<B: Backend> {
    /// Token ids, shape `(batch, seq_len)`.
    pub input_ids: Tensor<B, 2, Int>,
    /// Labels or token mask, shape `(batch, seq_len)`.
    pub labels: Tensor<B, 2, Int>,
}

impl<B: Backend> TensorBatch<B> {
    pub fn dims(&self) -> [usize; 2] {
        self.input_ids.dims()
    }
}

/// Copy a host batch onto `device`.
///
/// # Panics
/// Panics if the batch arrays do not match `batch_size * seq_len`.
pub fn to_device<B: Backend>(batch: &TokenBatch, device: &B::Device) -> TensorBatch<B> {
    let shape = [batch.batch_size, batch.seq_len];
    assert_eq!(batch.input_ids.len(), batch.batch_size * batch.seq_len, "input_ids length");
    assert_eq!(batch.labels.len(), batch.batch_size * batch.seq_len, "labels length");

    TensorBatch {
        input_ids: Tensor::from_data(TensorData::new(batch.input_ids.clone(), shape), device),
        labels: Tensor::from_data(TensorData::new(batch.labels.clone(), shape), device),
    }
}

/// Extract float values (row-major) from a tensor of any rank.
pub fn float_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read float tensor: {e:?}"))
}

/// Extract integer values (row-major) from an int tensor of any rank.
pub fn int_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>,
) -> anyhow::Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("Failed to read int tensor: {e:?}"))
}

/// Extract boolean values (row-major) from a bool tensor of any rank.
pub fn bool_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Bool>,
) -> anyhow::Result<Vec<bool>> {
    tensor
        .into_data()
        .to_vec::<bool>()
        .map_err(|e| anyhow::anyhow!("Failed to read bool tensor: {e:?}"))
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
