//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position by rotating each adjacent pair of query/key
//! dimensions `(2i, 2i+1)` by the angle `p * theta^(-2i/d)`. The dot product
//! of a rotated query and key then depends only on their relative offset.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{Result, RuneError};
use candle_core::{Device, Tensor};

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine cache: [max_seq_len, head_dim / 2]
    cos_cache: Tensor,
    /// Sine cache: [max_seq_len, head_dim / 2]
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `max_seq_len` - Number of positions to precompute
    /// * `theta` - Base frequency (10000.0 by default)
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(RuneError::InvalidConfig(format!(
                "rope head_dim must be even and positive, got {head_dim}"
            )));
        }

        // Inverse frequencies: 1 / theta^(2i/d) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (max_seq_len, 1), device)?;

        // [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_heads, seq_len, head_dim]
    /// * `offset` - Absolute position of the first row
    pub fn apply(&self, query: &Tensor, key: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = query.dims()[2];
        let (cos, sin) = self.angles(offset, seq_len)?;

        let query_rot = self.rotate_pairs(query, &cos, &sin)?;
        let key_rot = self.rotate_pairs(key, &cos, &sin)?;

        Ok((query_rot, key_rot))
    }

    /// cos/sin rows for positions `[offset, offset + len)`.
    fn angles(&self, offset: usize, len: usize) -> Result<(Tensor, Tensor)> {
        if offset + len > self.max_seq_len {
            return Err(RuneError::SequenceTooLong {
                len: offset + len,
                max: self.max_seq_len,
            });
        }
        let cos = self.cos_cache.narrow(0, offset, len)?;
        let sin = self.sin_cache.narrow(0, offset, len)?;
        Ok((cos, sin))
    }

    /// Rotate each `(2i, 2i+1)` pair of the last dimension.
    fn rotate_pairs(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        let half_dim = head_dim / 2;

        // [.., half_dim, 2]: even lane 0, odd lane 1
        let pairs = x.reshape((batch, heads, seq_len, half_dim, 2))?;
        let x0 = pairs.narrow(4, 0, 1)?;
        let x1 = pairs.narrow(4, 1, 1)?;

        // [1, 1, seq_len, half_dim, 1] for broadcasting
        let cos = cos.reshape((1, 1, seq_len, half_dim, 1))?;
        let sin = sin.reshape((1, 1, seq_len, half_dim, 1))?;

        // [x0, x1] -> [x0*cos - x1*sin, x0*sin + x1*cos]
        let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
        let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

        let rotated = Tensor::cat(&[out0, out1], 4)?;
        Ok(rotated.reshape((batch, heads, seq_len, head_dim))?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
