//! Root Mean Square Layer Normalization.
//!
//! # Formula
//!
//! `RMSNorm(x) = x / sqrt(mean(x^2) + eps) * scale`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{Result, RuneError};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable per-dimension scale.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given scale vector.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 1 {
            return Err(RuneError::ShapeMismatch {
                name: "rmsnorm.weight".into(),
                expected: vec![dims.iter().product()],
                actual: dims.to_vec(),
            });
        }
        let hidden_size = dims[0];
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with unit scale.
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Self::new(weight, eps)
    }

    /// Forward pass over the last dimension of `x` [..., hidden_size].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;

        // 1/sqrt(mean + eps)
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the scale tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}
