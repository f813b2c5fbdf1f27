//! Transformer layer implementation.
//!
//! A single pre-norm decoder block:
//! - RMSNorm → causal self-attention (RoPE) → residual add
//! - RMSNorm → SwiGLU MLP → residual add
//!
//! The cached (generation) and uncached (training) paths run the same
//! attention core; they differ only in where keys and values come from.

use super::{linear, LayerCache, RmsNorm, RotaryEmbedding, SwiGluMlp};
use crate::error::{Result, RuneError};
use candle_core::{Device, Tensor, D};

/// Multi-head causal self-attention projections.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [hidden_size, num_heads * head_dim]
    q_proj: Tensor,
    /// Key projection: [hidden_size, num_heads * head_dim]
    k_proj: Tensor,
    /// Value projection: [hidden_size, num_heads * head_dim]
    v_proj: Tensor,
    /// Output projection: [num_heads * head_dim, hidden_size]
    o_proj: Tensor,
    /// Number of attention heads.
    num_heads: usize,
    /// Head dimension.
    head_dim: usize,
    /// Hidden size.
    hidden_size: usize,
}

impl Attention {
    /// Create attention with random weights (for testing).
    pub fn random(hidden_size: usize, num_heads: usize, device: &Device) -> Result<Self> {
        let proj = || Tensor::randn(0.0f32, 0.02, &[hidden_size, hidden_size], device);
        Self::new(proj()?, proj()?, proj()?, proj()?, num_heads)
    }

    /// Create attention with provided weights.
    pub fn new(
        q_proj: Tensor,
        k_proj: Tensor,
        v_proj: Tensor,
        o_proj: Tensor,
        num_heads: usize,
    ) -> Result<Self> {
        let (hidden_size, _) = q_proj.dims2()?;
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(RuneError::InvalidConfig(format!(
                "hidden size {hidden_size} not divisible into {num_heads} heads"
            )));
        }

        for (name, tensor) in [
            ("q_proj", &q_proj),
            ("k_proj", &k_proj),
            ("v_proj", &v_proj),
            ("o_proj", &o_proj),
        ] {
            if tensor.dims() != [hidden_size, hidden_size] {
                return Err(RuneError::ShapeMismatch {
                    name: name.into(),
                    expected: vec![hidden_size, hidden_size],
                    actual: tensor.dims().to_vec(),
                });
            }
        }

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            head_dim: hidden_size / num_heads,
            hidden_size,
        })
    }

    /// Forward pass computing Q, K, V projections.
    ///
    /// Returns (query, key, value), each [batch, num_heads, seq_len, head_dim].
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;

        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        let q = split(linear(x, &self.q_proj)?)?;
        let k = split(linear(x, &self.k_proj)?)?;
        let v = split(linear(x, &self.v_proj)?)?;

        Ok((q, k, v))
    }

    /// Merge heads and apply the output projection.
    ///
    /// Input: [batch, num_heads, seq_len, head_dim]
    /// Output: [batch, seq_len, hidden_size]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let (batch, _, seq_len, _) = attn_output.dims4()?;

        let merged = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        linear(&merged, &self.o_proj)
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    /// Pre-attention norm.
    input_norm: RmsNorm,
    /// Self-attention.
    attention: Attention,
    /// Pre-MLP norm.
    post_attention_norm: RmsNorm,
    /// MLP.
    mlp: SwiGluMlp,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl TransformerLayer {
    /// Create a new transformer layer.
    pub fn new(
        input_norm: RmsNorm,
        attention: Attention,
        post_attention_norm: RmsNorm,
        mlp: SwiGluMlp,
        layer_idx: usize,
    ) -> Self {
        Self {
            input_norm,
            attention,
            post_attention_norm,
            mlp,
            layer_idx,
        }
    }

    /// Create a transformer layer with random weights (for testing).
    pub fn random(
        hidden_size: usize,
        intermediate_size: usize,
        num_heads: usize,
        eps: f64,
        layer_idx: usize,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            input_norm: RmsNorm::ones(hidden_size, eps, device)?,
            attention: Attention::random(hidden_size, num_heads, device)?,
            post_attention_norm: RmsNorm::ones(hidden_size, eps, device)?,
            mlp: SwiGluMlp::random(hidden_size, intermediate_size, device)?,
            layer_idx,
        })
    }

    /// Forward pass over a whole sequence without KV cache.
    ///
    /// Positions start at 0 and a causal mask is applied.
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    pub fn forward(&self, hidden_states: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        self.block(hidden_states, rope, None)
    }

    /// Forward pass with KV cache for autoregressive generation.
    ///
    /// New tokens are placed at positions `[cache.seq_len(), cache.seq_len() + seq_len)`;
    /// their keys and values are appended to the cache and attention runs
    /// against everything cached so far.
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    pub fn forward_with_cache(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        self.block(hidden_states, rope, Some(cache))
    }

    fn block(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let normed = self.input_norm.forward(hidden_states)?;
        let attn_output = self.self_attention(&normed, rope, cache)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.post_attention_norm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        Ok((hidden_states + mlp_output)?)
    }

    fn self_attention(
        &self,
        normed: &Tensor,
        rope: &RotaryEmbedding,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let (q, k, v) = self.attention.project(normed)?;

        let offset = cache.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        let (q, k) = rope.apply(&q, &k, offset)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };

        // A single new query sees every cached key; only spans need masking.
        let query_len = q.dims()[2];
        let mask = if query_len > 1 {
            Some(create_causal_mask(query_len, offset, q.device())?)
        } else {
            None
        };

        let attn_output = self.compute_attention(&q, &k, &v, mask.as_ref())?;
        self.attention.output(&attn_output)
    }

    /// Compute scaled dot-product attention.
    fn compute_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let scale = 1.0 / (self.attention.head_dim() as f64).sqrt();

        // Q @ K^T / sqrt(d)
        let scores = (q.matmul(&k.transpose(2, 3)?)? * scale)?;

        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };

        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        Ok(attn_weights.matmul(v)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &SwiGluMlp {
        &self.mlp
    }
}

/// Create a causal attention mask for `query_len` new positions that follow
/// `offset` cached ones.
///
/// Shape [1, 1, query_len, offset + query_len]; entry (i, j) is 0 when key `j`
/// is at or before the query's absolute position `offset + i`, -inf otherwise.
pub fn create_causal_mask(query_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let key_len = offset + query_len;
    let mask_data: Vec<f32> = (0..query_len)
        .flat_map(|i| {
            (0..key_len).map(move |j| if j > offset + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    let mask = Tensor::from_slice(&mask_data, (query_len, key_len), device)?;

    // Add batch and head dimensions
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LayerCache;
    use crate::test_util::max_abs_diff;

    fn create_test_layer() -> (TransformerLayer, RotaryEmbedding) {
        let layer = TransformerLayer::random(32, 64, 4, 1e-5, 0, &Device::Cpu).unwrap();
        let rope = RotaryEmbedding::new(8, 64, 10000.0, &Device::Cpu).unwrap();
        (layer, rope)
    }

    #[test]
    fn attention_projection_shapes() {
        let attn = Attention::random(32, 4, &Device::Cpu).unwrap();
        assert_eq!(attn.head_dim(), 8);

        let x = Tensor::randn(0.0f32, 1.0, &[2, 5, 32], &Device::Cpu).unwrap();
        let (q, k, v) = attn.project(&x).unwrap();

        assert_eq!(q.dims(), &[2, 4, 5, 8]);
        assert_eq!(k.dims(), &[2, 4, 5, 8]);
        assert_eq!(v.dims(), &[2, 4, 5, 8]);
    }

    #[test]
    fn attention_output_shape() {
        let attn = Attention::random(32, 4, &Device::Cpu).unwrap();
        let attn_output = Tensor::randn(0.0f32, 1.0, &[2, 4, 5, 8], &Device::Cpu).unwrap();
        assert_eq!(attn.output(&attn_output).unwrap().dims(), &[2, 5, 32]);
    }

    #[test]
    fn attention_rejects_bad_heads() {
        let w = || Tensor::zeros((30, 30), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(Attention::new(w(), w(), w(), w(), 4).is_err());
    }

    #[test]
    fn layer_forward_shape() {
        let (layer, rope) = create_test_layer();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 16, 32], &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&x, &rope).unwrap().dims(), &[1, 16, 32]);
        assert_eq!(layer.layer_idx(), 0);
    }

    #[test]
    fn causal_mask_shape() {
        let mask = create_causal_mask(16, 0, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 16, 16]);

        let mask = create_causal_mask(3, 5, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 8]);
    }

    #[test]
    fn causal_mask_values() {
        let mask = create_causal_mask(2, 2, &Device::Cpu).unwrap();
        let vals: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        // Query 0 sits at absolute position 2: keys 0..=2 visible.
        assert!(vals[0][..3].iter().all(|v| v.is_finite()));
        assert!(vals[0][3].is_infinite());
        // Query 1 at position 3 sees everything.
        assert!(vals[1].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn cached_steps_match_full_pass() {
        let (layer, rope) = create_test_layer();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 6, 32], &Device::Cpu).unwrap();
        let full = layer.forward(&x, &rope).unwrap();

        // Prefill 3, then 3 single-token steps.
        let mut cache = LayerCache::new(64);
        let mut outputs = vec![layer
            .forward_with_cache(&x.narrow(1, 0, 3).unwrap(), &rope, &mut cache)
            .unwrap()];
        for t in 3..6 {
            let step = x.narrow(1, t, 1).unwrap();
            outputs.push(layer.forward_with_cache(&step, &rope, &mut cache).unwrap());
        }
        let incremental = Tensor::cat(&outputs, 1).unwrap();

        assert_eq!(cache.seq_len(), 6);
        assert!(max_abs_diff(&full, &incremental).unwrap() < 1e-4);
    }

    #[test]
    fn later_positions_do_not_leak_backwards() {
        let (layer, rope) = create_test_layer();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 5, 32], &Device::Cpu).unwrap();

        // Replace the last position with different content.
        let head = x.narrow(1, 0, 4).unwrap();
        let other = Tensor::randn(0.0f32, 1.0, &[1, 1, 32], &Device::Cpu).unwrap();
        let y = Tensor::cat(&[&head, &other], 1).unwrap();

        let out_x = layer.forward(&x, &rope).unwrap().narrow(1, 0, 4).unwrap();
        let out_y = layer.forward(&y, &rope).unwrap().narrow(1, 0, 4).unwrap();
        assert!(max_abs_diff(&out_x, &out_y).unwrap() < 1e-6);
    }
}
