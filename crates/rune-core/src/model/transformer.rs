//! Transformer model implementation.
//!
//! Three entry points share the same layer stack:
//! - [`Transformer::prefill`] encodes a prompt into a fresh [`KvCache`]
//! - [`Transformer::step`] advances a cache by one token
//! - [`Transformer::training_forward`] runs a padded batch with no cache
//!
//! Incremental decoding through `prefill` + `step` produces the same logits
//! as one uncached pass over the whole sequence.

use super::{
    Attention, KvCache, ModelConfig, RmsNorm, RotaryEmbedding, SwiGluMlp, TokenEmbedding,
    TransformerLayer, Weights,
};
use crate::error::{Result, RuneError};
use candle_core::{Device, Tensor};

/// A decoder-only transformer.
///
/// Read-only once built; any number of generation sessions may share one
/// instance, each with its own [`KvCache`].
pub struct Transformer {
    /// Model configuration.
    config: ModelConfig,
    /// Token embedding.
    embed_tokens: TokenEmbedding,
    /// Decoder blocks.
    layers: Vec<TransformerLayer>,
    /// Final norm.
    norm: RmsNorm,
    /// Output projection [embed_dim, vocab_size].
    lm_head: Tensor,
    /// Shared rotary tables.
    rope: RotaryEmbedding,
    /// Device for computation.
    device: Device,
}

impl Transformer {
    /// Build a transformer from named weights.
    ///
    /// Weights are validated against `config` first; nothing runs on a
    /// mismatched parameter set.
    pub fn new(config: ModelConfig, weights: &Weights) -> Result<Self> {
        config.validate()?;
        weights.validate(&config)?;

        let device = weights.device().clone();
        let eps = config.norm_epsilon;

        let embed_tokens = TokenEmbedding::new(weights.get_tensor("embed_tokens")?)?;

        let mut layers = Vec::with_capacity(config.layer_count);
        for i in 0..config.layer_count {
            let p = format!("layers.{i}");
            let get = |suffix: &str| weights.get_tensor(&format!("{p}.{suffix}"));

            let attention = Attention::new(
                get("attn.q_proj")?,
                get("attn.k_proj")?,
                get("attn.v_proj")?,
                get("attn.o_proj")?,
                config.head_count,
            )?;
            let mlp = SwiGluMlp::new(get("mlp.up_proj")?, get("mlp.gate_proj")?, get("mlp.down_proj")?)?;

            layers.push(TransformerLayer::new(
                RmsNorm::new(get("input_norm")?, eps)?,
                attention,
                RmsNorm::new(get("post_attention_norm")?, eps)?,
                mlp,
                i,
            ));
        }

        let norm = RmsNorm::new(weights.get_tensor("norm")?, eps)?;

        let lm_head = if config.tie_word_embeddings {
            embed_tokens.weight().t()?
        } else {
            weights.get_tensor("lm_head")?
        };

        let rope = RotaryEmbedding::new(config.head_dim(), config.max_seq_len, config.rope_base, &device)?;

        tracing::debug!(
            layers = config.layer_count,
            embed_dim = config.embed_dim,
            vocab_size = config.vocab_size,
            params = config.param_count(),
            "Built transformer"
        );

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            device,
        })
    }

    /// Randomly initialized transformer, reproducible from `seed`.
    pub fn random(config: ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        let weights = Weights::random(&config, seed, device)?;
        Self::new(config, &weights)
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// An empty cache sized for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.config.layer_count, self.config.max_seq_len)
    }

    /// Encode `tokens` starting at the cache's current length.
    ///
    /// Returns next-token logits [vocab_size] for the final position. The
    /// keys and values of every token are left in `cache`.
    pub fn prefill(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        self.check_cache(cache)?;
        if tokens.is_empty() {
            return Err(RuneError::EmptyBatch("prefill needs at least one token".into()));
        }
        let len = cache.seq_len() + tokens.len();
        if len > self.config.max_seq_len {
            return Err(RuneError::PromptTooLong {
                len,
                max: self.config.max_seq_len,
            });
        }
        self.embed_tokens.check_ids(tokens)?;

        let logits = self.forward_cached(tokens, cache)?;
        tracing::trace!(tokens = tokens.len(), cached = cache.seq_len(), "Prefill");
        Ok(logits)
    }

    /// Feed one token at position `cache.seq_len()`.
    ///
    /// Returns next-token logits [vocab_size]; the cache grows by one.
    pub fn step(&self, token: u32, cache: &mut KvCache) -> Result<Tensor> {
        self.check_cache(cache)?;
        if cache.remaining() == 0 {
            return Err(RuneError::CacheOverflow {
                len: cache.seq_len() + 1,
                max: self.config.max_seq_len,
            });
        }
        self.embed_tokens.check_ids(&[token])?;
        self.forward_cached(&[token], cache)
    }

    /// Uncached forward over a batch.
    ///
    /// * `input_ids` - [batch, seq_len] u32 token ids
    ///
    /// Returns logits [batch, seq_len, vocab_size]. Every position attends
    /// only to itself and earlier positions of the same row.
    pub fn training_forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_seq_len {
            return Err(RuneError::SequenceTooLong {
                len: seq_len,
                max: self.config.max_seq_len,
            });
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rope)?;
        }
        self.head(&hidden)
    }

    /// Logits [seq_len, vocab_size] for every position of one sequence.
    pub fn forward_all(&self, tokens: &[u32]) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(RuneError::EmptyBatch("forward needs at least one token".into()));
        }
        self.embed_tokens.check_ids(tokens)?;

        let input_ids = Tensor::from_slice(tokens, (1, tokens.len()), &self.device)?;
        Ok(self.training_forward(&input_ids)?.squeeze(0)?)
    }

    fn forward_cached(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        let input_ids = Tensor::from_slice(tokens, (1, tokens.len()), &self.device)?;

        let mut hidden = self.embed_tokens.forward(&input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward_with_cache(&hidden, &self.rope, cache.layer_mut(i))?;
        }

        // Only the last position is needed for the next token.
        let last = hidden.narrow(1, tokens.len() - 1, 1)?;
        Ok(self.head(&last)?.flatten_all()?)
    }

    /// A cache built by [`new_cache`](Self::new_cache) on a model of this shape.
    fn check_cache(&self, cache: &KvCache) -> Result<()> {
        if cache.num_layers() != self.layers.len() {
            return Err(RuneError::CacheMismatch(format!(
                "cache has {} layers, model has {}",
                cache.num_layers(),
                self.layers.len()
            )));
        }
        if cache.max_seq_len() != self.config.max_seq_len {
            return Err(RuneError::CacheMismatch(format!(
                "cache holds {} positions, model max_seq_len is {}",
                cache.max_seq_len(),
                self.config.max_seq_len
            )));
        }
        Ok(())
    }

    /// Final norm and output projection.
    fn head(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(hidden)?;
        super::linear(&normed, &self.lm_head)
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish()
    }
}
