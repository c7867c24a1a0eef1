//! KV-cache for autoregressive decoding
//!
//! Stores key and value tensors from previous positions so each generation
//! step only computes attention for the new token. Each layer stores
//! tensors of shape `[batch, num_kv_heads, seq_len, head_dim]`.

use candle_core::Tensor;

/// Per-layer key/value cache for one decode sequence.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Cached key tensors per layer.
    pub keys: Vec<Option<Tensor>>,
    /// Cached value tensors per layer.
    pub values: Vec<Option<Tensor>>,
}

impl KvCache {
    /// Create an empty cache for the given number of layers.
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Current cached sequence length (0 if empty).
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    /// Number of layers.
    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Mutable key/value slots for one layer.
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cache_is_empty() {
        let cache = KvCache::new(32);
        assert_eq!(cache.n_layers(), 32);
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_layer_mut_starts_unset() {
        let mut cache = KvCache::new(4);
        let (k, v) = cache.layer_mut(2);
        assert!(k.is_none());
        assert!(v.is_none());
    }
}
