//! SwiGLU gated feed-forward.
//!
//! # Formula
//!
//! `SwiGLU(x) = (x @ up_proj * silu(x @ gate_proj)) @ down_proj`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::linear;
use crate::error::{Result, RuneError};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    /// W1, the linear branch: [hidden, intermediate]
    up_proj: Tensor,
    /// Wgate, the gated branch: [hidden, intermediate]
    gate_proj: Tensor,
    /// W2: [intermediate, hidden]
    down_proj: Tensor,
    /// Hidden dimension.
    hidden_size: usize,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl SwiGluMlp {
    /// Create a new SwiGLU MLP with given weights.
    pub fn new(up_proj: Tensor, gate_proj: Tensor, down_proj: Tensor) -> Result<Self> {
        let (hidden_size, intermediate_size) = up_proj.dims2()?;

        for (name, tensor, expected) in [
            ("gate_proj", &gate_proj, [hidden_size, intermediate_size]),
            ("down_proj", &down_proj, [intermediate_size, hidden_size]),
        ] {
            if tensor.dims() != expected {
                return Err(RuneError::ShapeMismatch {
                    name: name.into(),
                    expected: expected.to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
        }

        Ok(Self {
            up_proj,
            gate_proj,
            down_proj,
            hidden_size,
            intermediate_size,
        })
    }

    /// Create a new SwiGLU MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let up_proj = Tensor::randn(0.0f32, 0.02, &[hidden_size, intermediate_size], device)?;
        let gate_proj = Tensor::randn(0.0f32, 0.02, &[hidden_size, intermediate_size], device)?;
        let down_proj = Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?;
        Self::new(up_proj, gate_proj, down_proj)
    }

    /// Create with zeros (for testing specific behaviors).
    pub fn zeros(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let up_proj = Tensor::zeros(&[hidden_size, intermediate_size], DType::F32, device)?;
        let gate_proj = Tensor::zeros(&[hidden_size, intermediate_size], DType::F32, device)?;
        let down_proj = Tensor::zeros(&[intermediate_size, hidden_size], DType::F32, device)?;
        Self::new(up_proj, gate_proj, down_proj)
    }

    /// Forward pass over `x` [..., hidden_size].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let up = linear(x, &self.up_proj)?;
        let gate = linear(x, &self.gate_proj)?;

        let activated = (up * silu(&gate)?)?;

        linear(&activated, &self.down_proj)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mlp_forward_shapes() {
        let mlp = SwiGluMlp::random(32, 64, &Device::Cpu).unwrap();
        assert_eq!(mlp.hidden_size(), 32);
        assert_eq!(mlp.intermediate_size(), 64);

        let x = Tensor::randn(0.0f32, 1.0, &[4, 32], &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[4, 32]);

        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 32], &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[2, 16, 32]);
    }

    #[test]
    fn mlp_zeros_gives_zeros() {
        let mlp = SwiGluMlp::zeros(16, 32, &Device::Cpu).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[1, 16], &Device::Cpu).unwrap();
        let sum: f32 = mlp.forward(&x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(sum < 1e-6, "Expected near-zero output, got sum={}", sum);
    }

    #[test]
    fn mlp_matches_hand_computation() {
        // hidden = 1, intermediate = 1: out = (x*u) * silu(x*g) * d
        let dev = Device::Cpu;
        let mlp = SwiGluMlp::new(
            Tensor::new(&[[2.0f32]], &dev).unwrap(),
            Tensor::new(&[[0.5f32]], &dev).unwrap(),
            Tensor::new(&[[3.0f32]], &dev).unwrap(),
        )
        .unwrap();

        let x = Tensor::new(&[[1.5f32]], &dev).unwrap();
        let out: Vec<Vec<f32>> = mlp.forward(&x).unwrap().to_vec2().unwrap();

        let z = 1.5f32 * 0.5;
        let silu = z / (1.0 + (-z).exp());
        let expected = (1.5 * 2.0) * silu * 3.0;
        assert!((out[0][0] - expected).abs() < 1e-5);
    }

    #[test]
    fn mlp_rejects_mismatched_weights() {
        let dev = Device::Cpu;
        let result = SwiGluMlp::new(
            Tensor::zeros((8, 16), DType::F32, &dev).unwrap(),
            Tensor::zeros((8, 16), DType::F32, &dev).unwrap(),
            Tensor::zeros((8, 16), DType::F32, &dev).unwrap(),
        );
        assert!(matches!(result, Err(RuneError::ShapeMismatch { .. })));
    }

    #[test]
    fn mlp_silu_activation() {
        let x = Tensor::new(&[0.0f32, 1.0, -1.0], &Device::Cpu).unwrap();
        let vals: Vec<f32> = silu(&x).unwrap().to_vec1().unwrap();

        assert!(vals[0].abs() < 1e-6);
        assert!(vals[1] > 0.0);
        assert!(vals[2] < 0.0);
        assert!(vals[1].abs() > vals[2].abs());
    }
}
