//! Token embedding lookup.

use crate::error::{Result, RuneError};
use candle_core::{Device, Tensor};

/// Learned `[vocab_size, embed_dim]` lookup table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    weight: Tensor,
    vocab_size: usize,
    embed_dim: usize,
}

impl TokenEmbedding {
    /// Wrap an existing embedding matrix.
    pub fn new(weight: Tensor) -> Result<Self> {
        let (vocab_size, embed_dim) = weight.dims2()?;
        Ok(Self {
            weight,
            vocab_size,
            embed_dim,
        })
    }

    /// Random embedding (for testing).
    pub fn random(vocab_size: usize, embed_dim: usize, device: &Device) -> Result<Self> {
        Self::new(Tensor::randn(0.0f32, 0.02, &[vocab_size, embed_dim], device)?)
    }

    /// Look up `ids` [batch, seq_len] (u32), giving [batch, seq_len, embed_dim].
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = ids.dims2()?;
        let flat = ids.flatten_all()?;
        let rows = self.weight.index_select(&flat, 0)?;
        Ok(rows.reshape((batch, seq_len, self.embed_dim))?)
    }

    /// Fail with [`RuneError::InvalidToken`] on the first id outside the table.
    pub fn check_ids(&self, ids: &[u32]) -> Result<()> {
        match ids.iter().find(|&&t| t as usize >= self.vocab_size) {
            Some(&token) => Err(RuneError::InvalidToken {
                token,
                vocab_size: self.vocab_size,
            }),
            None => Ok(()),
        }
    }

    /// The embedding matrix.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Embedding dimension.
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_rows() {
        let weight = Tensor::new(&[[0.0f32, 0.5], [1.0, 1.5], [2.0, 2.5]], &Device::Cpu).unwrap();
        let emb = TokenEmbedding::new(weight).unwrap();

        let ids = Tensor::new(&[[2u32, 0, 2]], &Device::Cpu).unwrap();
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2]);

        let vals: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(vals, vec![vec![2.0, 2.5], vec![0.0, 0.5], vec![2.0, 2.5]]);
    }

    #[test]
    fn out_of_range_ids_rejected() {
        let emb = TokenEmbedding::random(8, 4, &Device::Cpu).unwrap();
        assert!(emb.check_ids(&[0, 7]).is_ok());
        assert!(matches!(
            emb.check_ids(&[1, 8]),
            Err(RuneError::InvalidToken { token: 8, vocab_size: 8 })
        ));
    }
}
