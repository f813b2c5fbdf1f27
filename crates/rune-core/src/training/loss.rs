//! Masked next-token cross-entropy.

use crate::error::Result;
use candle_core::{Tensor, D};

/// Mean negative log-likelihood over the positions where `mask` is 1.
///
/// * `logits` - [batch, seq_len, vocab_size]
/// * `targets` - [batch, seq_len] u32
/// * `mask` - [batch, seq_len] f32, 1.0 for supervised positions
///
/// Returns a scalar. When no position is supervised the loss is exactly 0,
/// and so is every gradient flowing from it.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;

    // [batch, seq_len]
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let masked_nll = (picked.neg()? * mask)?;
    let supervised = mask.sum_all()?.to_scalar::<f32>()?;

    Ok((masked_nll.sum_all()? / f64::from(supervised.max(1.0)))?)
}
