//! KV cache for incremental decoding.
//!
//! Each layer keeps its rotated keys and values for every position seen so
//! far in the session. A cache belongs to exactly one generation session and
//! is dropped with it.

use crate::error::{Result, RuneError};
use candle_core::Tensor;

/// KV cache for a single layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Cached keys: [batch, num_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, num_heads, seq_len, head_dim]
    value: Option<Tensor>,
    /// Context window.
    max_seq_len: usize,
}

impl LayerCache {
    /// Create a new empty layer cache bounded by `max_seq_len` positions.
    pub fn new(max_seq_len: usize) -> Self {
        Self {
            key: None,
            value: None,
            max_seq_len,
        }
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Get the current sequence length in cache.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Append new KV to cache and return concatenated KV.
    ///
    /// Returns (key, value) tensors that include all cached + new tokens.
    /// Fails without modifying the cache if the append would exceed the
    /// context window.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let new_len = self.seq_len() + key.dims()[2];
        if new_len > self.max_seq_len {
            return Err(RuneError::CacheOverflow {
                len: new_len,
                max: self.max_seq_len,
            });
        }

        let (new_key, new_value) = match (&self.key, &self.value) {
            (Some(cached_k), Some(cached_v)) => {
                // Concatenate along sequence dimension (dim 2)
                let k = Tensor::cat(&[cached_k, key], 2)?;
                let v = Tensor::cat(&[cached_v, value], 2)?;
                (k, v)
            }
            _ => (key.clone(), value.clone()),
        };

        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());

        Ok((new_key, new_value))
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Full KV cache for all layers of one session.
#[derive(Debug)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerCache>,
    /// Context window.
    max_seq_len: usize,
}

impl KvCache {
    /// Create a new KV cache for the given number of layers.
    pub fn new(num_layers: usize, max_seq_len: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::new(max_seq_len)).collect();
        Self { layers, max_seq_len }
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> &mut LayerCache {
        &mut self.layers[layer_idx]
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer_idx: usize) -> &LayerCache {
        &self.layers[layer_idx]
    }

    /// Get the current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    /// Positions left before the context window is full.
    pub fn remaining(&self) -> usize {
        self.max_seq_len - self.seq_len()
    }

    /// Context window.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Clear all layer caches.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.first().map(|l| l.is_empty()).unwrap_or(true)
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zeros(seq: usize) -> Tensor {
        Tensor::zeros((1, 4, seq, 8), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn layer_cache_empty() {
        let cache = LayerCache::new(16);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn layer_cache_append() {
        let mut cache = LayerCache::new(16);

        let (k, v) = cache.append(&zeros(4), &zeros(4)).unwrap();
        assert_eq!(k.dims(), &[1, 4, 4, 8]);
        assert_eq!(v.dims(), &[1, 4, 4, 8]);
        assert_eq!(cache.seq_len(), 4);

        let (k, v) = cache.append(&zeros(1), &zeros(1)).unwrap();
        assert_eq!(k.dims(), &[1, 4, 5, 8]);
        assert_eq!(v.dims(), &[1, 4, 5, 8]);
        assert_eq!(cache.seq_len(), 5);
    }

    #[test]
    fn layer_cache_rejects_overflow() {
        let mut cache = LayerCache::new(4);
        cache.append(&zeros(3), &zeros(3)).unwrap();

        let err = cache.append(&zeros(2), &zeros(2)).unwrap_err();
        assert!(matches!(err, RuneError::CacheOverflow { len: 5, max: 4 }));
        // Rejected append leaves the cache untouched.
        assert_eq!(cache.seq_len(), 3);

        cache.append(&zeros(1), &zeros(1)).unwrap();
        assert_eq!(cache.seq_len(), 4);
    }

    #[test]
    fn kv_cache_creation() {
        let cache = KvCache::new(6, 256);
        assert_eq!(cache.num_layers(), 6);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert_eq!(cache.remaining(), 256);
    }

    #[test]
    fn kv_cache_clear() {
        let mut cache = KvCache::new(2, 16);
        cache.layer_mut(0).append(&zeros(4), &zeros(4)).unwrap();
        cache.layer_mut(1).append(&zeros(4), &zeros(4)).unwrap();

        assert!(!cache.is_empty());
        assert_eq!(cache.seq_len(), 4);
        assert_eq!(cache.remaining(), 12);
        assert_eq!(cache.layer(1).seq_len(), 4);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }
}
