//! Attention key/value cache snapshots

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Per-layer key and value tensors for a token prefix.
///
/// `k_cache` and `v_cache` hold one entry per layer. Every layer covers
/// exactly `token_ids.len()` tokens, so each layer length is a whole multiple
/// of the token count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefixCache {
    pub k_cache: Vec<Vec<f16>>,
    pub v_cache: Vec<Vec<f16>>,
    pub token_ids: Vec<i32>,
}

impl PrefixCache {
    pub fn num_layers(&self) -> usize {
        self.k_cache.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    /// Elements stored per token in each layer
    pub fn token_width(&self) -> Option<usize> {
        let tokens = self.num_tokens();
        if tokens == 0 {
            return None;
        }
        self.k_cache.first().map(|layer| layer.len() / tokens)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k_cache.len() != self.v_cache.len() {
            return Err(invalid(format!(
                "{} key layers but {} value layers",
                self.k_cache.len(),
                self.v_cache.len()
            )));
        }
        let tokens = self.num_tokens();
        if tokens == 0 {
            if self.k_cache.iter().chain(&self.v_cache).any(|l| !l.is_empty()) {
                return Err(invalid("layers hold data for an empty token prefix".to_string()));
            }
            return Ok(());
        }
        let width = self.token_width().unwrap_or(0);
        for (layer, (k, v)) in self.k_cache.iter().zip(&self.v_cache).enumerate() {
            if k.len() != v.len() {
                return Err(invalid(format!(
                    "layer {}: key length {} differs from value length {}",
                    layer,
                    k.len(),
                    v.len()
                )));
            }
            if k.len() % tokens != 0 || k.len() / tokens != width {
                return Err(invalid(format!(
                    "layer {}: {} elements do not cover {} tokens",
                    layer,
                    k.len(),
                    tokens
                )));
            }
        }
        Ok(())
    }

    /// Keep only the first `tokens` tokens of every layer
    pub fn truncate(&mut self, tokens: usize) {
        if tokens >= self.num_tokens() {
            return;
        }
        if let Some(width) = self.token_width() {
            for layer in self.k_cache.iter_mut().chain(self.v_cache.iter_mut()) {
                layer.truncate(tokens * width);
            }
        }
        self.token_ids.truncate(tokens);
    }
}

fn invalid(message: String) -> SessionError {
    SessionError::invalid_argument("prefix_cache", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(layers: usize, tokens: usize, width: usize) -> PrefixCache {
        let layer: Vec<f16> = (0..tokens * width).map(|i| f16::from_f32(i as f32)).collect();
        PrefixCache {
            k_cache: vec![layer.clone(); layers],
            v_cache: vec![layer; layers],
            token_ids: (0..tokens as i32).collect(),
        }
    }

    #[test]
    fn test_valid_cache() {
        let cache = cache(4, 10, 8);
        assert!(cache.validate().is_ok());
        assert_eq!(cache.num_layers(), 4);
        assert_eq!(cache.token_width(), Some(8));
    }

    #[test]
    fn test_layer_mismatch() {
        let mut broken = cache(4, 10, 8);
        broken.v_cache.pop();
        assert!(broken.validate().is_err());

        let mut broken = cache(2, 10, 8);
        broken.k_cache[1].pop();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_truncate() {
        let mut cache = cache(2, 10, 4);
        cache.truncate(3);
        assert_eq!(cache.num_tokens(), 3);
        assert_eq!(cache.k_cache[0].len(), 12);
        assert!(cache.validate().is_ok());
    }
}
