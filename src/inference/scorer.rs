//! Scorer interface consumed by the decode loop.
//!
//! A scorer maps a `(lanes, window_len)` token window, plus an optional per-layer cache, to
//! next-token logits of shape `(lanes, vocab)`. Whatever cache it hands back is reordered by
//! the decode loop with the same lane permutation applied to history and context rows.

use candle_core::{Device, Result, Tensor};

use crate::model::Gpt;

/// Per-layer key/value tensors with the lane axis first.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<(Tensor, Tensor)>,
}

impl KvCache {
    #[must_use]
    pub fn new(layers: Vec<(Tensor, Tensor)>) -> Self {
        Self { layers }
    }

    #[must_use]
    pub fn layers(&self) -> &[(Tensor, Tensor)] {
        &self.layers
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of lanes held by the cache, or `None` if it has no layers.
    ///
    /// # Errors
    /// Returns an error if the first key tensor is a scalar.
    pub fn lanes(&self) -> Result<Option<usize>> {
        self.layers.first().map(|(k, _)| k.dim(0)).transpose()
    }

    /// Gather every layer along the lane axis. `permutation[new_lane] = source_lane`.
    ///
    /// # Errors
    /// Returns an error if an index is out of range or tensor operations fail.
    pub fn reorder(&self, permutation: &Tensor) -> Result<Self> {
        let layers = self
            .layers
            .iter()
            .map(|(k, v)| {
                Ok((
                    k.index_select(permutation, 0)?.contiguous()?,
                    v.index_select(permutation, 0)?.contiguous()?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}

/// Output of one scorer call.
#[derive(Debug, Clone)]
pub struct ScorerOutput {
    /// Raw next-token scores, `(lanes, vocab)`.
    pub logits: Tensor,
    pub cache: Option<KvCache>,
}

/// A causal sequence model that scores next-token continuations.
pub trait Scorer {
    fn device(&self) -> &Device;

    fn vocab_size(&self) -> usize;

    /// Score the last position of each lane of `context`.
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    fn score(&mut self, context: &Tensor, cache: Option<&KvCache>) -> Result<ScorerOutput>;
}

/// The GPT scorer recomputes the whole sliding window every step and keeps no cache, so
/// window slides never invalidate position-dependent state.
impl Scorer for Gpt {
    fn device(&self) -> &Device {
        Gpt::device(self)
    }

    fn vocab_size(&self) -> usize {
        self.config().vocab_size
    }

    fn score(&mut self, context: &Tensor, _cache: Option<&KvCache>) -> Result<ScorerOutput> {
        Ok(ScorerOutput {
            logits: self.forward_last(context)?,
            cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_gathers_lane_axis() {
        let device = Device::Cpu;
        let k = Tensor::new(&[[0f32, 0.0], [1.0, 1.0], [2.0, 2.0]], &device).unwrap();
        let v = (&k * 10.0).unwrap();
        let cache = KvCache::new(vec![(k.clone(), v), (k.clone(), k)]);

        let perm = Tensor::new(&[2u32, 2, 0], &device).unwrap();
        let reordered = cache.reorder(&perm).unwrap();

        assert_eq!(reordered.num_layers(), 2);
        assert_eq!(reordered.lanes().unwrap(), Some(3));
        let (k0, v0) = &reordered.layers()[0];
        assert_eq!(
            k0.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 2.0], vec![2.0, 2.0], vec![0.0, 0.0]]
        );
        assert_eq!(
            v0.to_vec2::<f32>().unwrap(),
            vec![vec![20.0, 20.0], vec![20.0, 20.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn test_empty_cache_has_no_lanes() {
        let cache = KvCache::new(Vec::new());
        assert_eq!(cache.lanes().unwrap(), None);
        let perm = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert_eq!(cache.reorder(&perm).unwrap().num_layers(), 0);
    }
}
