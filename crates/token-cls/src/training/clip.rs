//! Gradient-norm clipping over all trainable parameters at once.
//!
//! burn's optimizer-level `GradientClippingConfig::Norm` clips each parameter
//! tensor on its own. Here the norm is taken over the concatenation of every
//! gradient in a `GradientsParams`, and all of them are rescaled together.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Added to the norm before dividing.
const NORM_EPS: f64 = 1e-6;

struct SquaredNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    total: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) else {
            return;
        };
        self.total += grad.clone().mul(grad).sum().into_scalar().elem::<f64>();
    }
}

struct ScaleGrads<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f64,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        self.grads
            .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
    }
}

/// L2 norm of all gradients in `grads` that belong to `model`'s parameters.
pub fn global_grad_norm<B, M>(model: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm::<B> {
        grads,
        total: 0.0,
        backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.total.sqrt()
}

/// Rescale `grads` so their joint L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. A non-positive `max_norm` leaves the
/// gradients untouched.
pub fn clip_grad_norm<B, M>(model: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_grad_norm::<B, M>(model, grads);
    if max_norm <= 0.0 {
        return norm;
    }
    let scale = max_norm / (norm + NORM_EPS);
    if scale < 1.0 {
        let mut visitor = ScaleGrads::<B> {
            grads,
            scale,
            backend: PhantomData,
        };
        model.visit(&mut visitor);
    }
    norm
}
