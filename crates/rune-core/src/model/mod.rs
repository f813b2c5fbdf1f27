//! Model definition and weights.
//!
//! Provides the decoder-only transformer:
//! - Model configuration
//! - Building blocks (RoPE, RMSNorm, attention, SwiGLU)
//! - KV cache for incremental decoding
//! - Weight storage and safetensors checkpoints

mod config;
mod embedding;
mod kv_cache;
mod layer;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;
mod weights;

pub use config::ModelConfig;
pub use embedding::TokenEmbedding;
pub use kv_cache::{KvCache, LayerCache};
pub use layer::{create_causal_mask, Attention, TransformerLayer};
pub use mlp::SwiGluMlp;
pub use rmsnorm::RmsNorm;
pub use rope::RotaryEmbedding;
pub use transformer::Transformer;
pub use weights::{Checkpoint, Weights};

use crate::error::Result;
use candle_core::Tensor;

/// `x @ weight` for `x` [..., in] and `weight` [in, out].
///
/// Leading dimensions are flattened so the product is a plain 2D matmul.
pub(crate) fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let in_dim = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 1].iter().product();
    let out_dim = weight.dims()[1];

    let flat = x.reshape((rows, in_dim))?;
    let out = flat.matmul(weight)?;

    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(out_dim);
    Ok(out.reshape(out_shape)?)
}
