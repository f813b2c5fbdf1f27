//! Model configuration.

use crate::error::{Result, RuneError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the transformer.
///
/// Every parameter shape in the model is derived from these fields; weights
/// loaded from disk are validated against them before any forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer blocks.
    pub layer_count: usize,
    /// Embedding / hidden dimension.
    pub embed_dim: usize,
    /// Number of attention heads.
    pub head_count: usize,
    /// Intermediate dimension of the gated feed-forward.
    pub ffn_dim: usize,
    /// Vocabulary size, special tokens included.
    pub vocab_size: usize,
    /// Context window in tokens.
    pub max_seq_len: usize,
    /// RoPE base frequency.
    pub rope_base: f64,
    /// RMS norm epsilon.
    pub norm_epsilon: f64,
    /// Reuse the token embedding as the output projection.
    #[serde(default = "default_tied")]
    pub tie_word_embeddings: bool,
}

fn default_tied() -> bool {
    true
}

impl ModelConfig {
    /// A tiny configuration for tests and smoke runs.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            layer_count: 2,
            embed_dim: 32,
            head_count: 4,
            ffn_dim: 64,
            vocab_size,
            max_seq_len: 64,
            rope_base: 10000.0,
            norm_epsilon: 1e-5,
            tie_word_embeddings: true,
        }
    }

    /// Dimension of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.head_count
    }

    /// Check that the configuration describes a buildable model.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RuneError::InvalidConfig(msg));

        if self.layer_count == 0 {
            return fail("layer_count must be positive".into());
        }
        if self.head_count == 0 || self.embed_dim == 0 {
            return fail("embed_dim and head_count must be positive".into());
        }
        if self.embed_dim % self.head_count != 0 {
            return fail(format!(
                "embed_dim {} not divisible by head_count {}",
                self.embed_dim, self.head_count
            ));
        }
        if self.head_dim() % 2 != 0 {
            return fail(format!("head_dim {} must be even for RoPE", self.head_dim()));
        }
        if self.ffn_dim == 0 {
            return fail("ffn_dim must be positive".into());
        }
        // The four special ids must exist.
        if self.vocab_size <= crate::tokens::PAD as usize {
            return fail(format!("vocab_size {} leaves no room for special tokens", self.vocab_size));
        }
        if self.max_seq_len < 2 {
            return fail("max_seq_len must be at least 2".into());
        }
        if !(self.rope_base > 0.0) || !(self.norm_epsilon > 0.0) {
            return fail("rope_base and norm_epsilon must be positive".into());
        }
        Ok(())
    }

    /// Expected parameter names and shapes, in a stable order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.embed_dim;
        let f = self.ffn_dim;
        let mut shapes = vec![("embed_tokens".to_string(), vec![self.vocab_size, d])];

        for i in 0..self.layer_count {
            let p = format!("layers.{i}");
            shapes.push((format!("{p}.input_norm"), vec![d]));
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                shapes.push((format!("{p}.attn.{proj}"), vec![d, d]));
            }
            shapes.push((format!("{p}.post_attention_norm"), vec![d]));
            shapes.push((format!("{p}.mlp.up_proj"), vec![d, f]));
            shapes.push((format!("{p}.mlp.gate_proj"), vec![d, f]));
            shapes.push((format!("{p}.mlp.down_proj"), vec![f, d]));
        }

        shapes.push(("norm".to_string(), vec![d]));
        if !self.tie_word_embeddings {
            shapes.push(("lm_head".to_string(), vec![d, self.vocab_size]));
        }
        shapes
    }

    /// Total number of scalar parameters.
    pub fn param_count(&self) -> usize {
        self.parameter_shapes()
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            layer_count: 6,
            embed_dim: 384,
            head_count: 6,
            ffn_dim: 1536,
            vocab_size: 8192,
            max_seq_len: 256,
            rope_base: 10000.0,
            norm_epsilon: 1e-5,
            tie_word_embeddings: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = ModelConfig {
            head_count: 5,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(RuneError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_odd_head_dim() {
        let config = ModelConfig {
            embed_dim: 36,
            head_count: 4,
            ..ModelConfig::tiny(16)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_vocab_without_specials() {
        assert!(ModelConfig::tiny(3).validate().is_err());
        assert!(ModelConfig::tiny(5).validate().is_ok());
    }

    #[test]
    fn parameter_shapes_follow_tying() {
        let tied = ModelConfig::tiny(16);
        assert!(!tied.parameter_shapes().iter().any(|(n, _)| n == "lm_head"));

        let untied = ModelConfig {
            tie_word_embeddings: false,
            ..tied.clone()
        };
        let shapes = untied.parameter_shapes();
        let (_, lm_head) = shapes.iter().find(|(n, _)| n == "lm_head").unwrap();
        assert_eq!(lm_head, &vec![32, 16]);
        assert_eq!(untied.param_count(), tied.param_count() + 32 * 16);
    }

    #[test]
    fn parameter_count_per_layer() {
        let config = ModelConfig::tiny(16);
        // embed + final norm + per layer (2 norms, 4 attn, 3 ffn)
        let per_layer = 2 * 32 + 4 * 32 * 32 + 3 * 32 * 64;
        assert_eq!(config.param_count(), 16 * 32 + 32 + 2 * per_layer);
    }

    #[test]
    fn json_roundtrip_with_defaulted_tying() {
        let json = r#"{
            "layer_count": 2, "embed_dim": 32, "head_count": 4, "ffn_dim": 64,
            "vocab_size": 16, "max_seq_len": 64, "rope_base": 10000.0,
            "norm_epsilon": 1e-5
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(config.tie_word_embeddings);
        assert_eq!(config, ModelConfig::tiny(16));
    }
}
