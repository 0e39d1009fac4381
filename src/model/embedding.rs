//! Embedding layers for the transformer.
//!
//! Token embedding and learned absolute position embedding.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use super::config::ModelConfig;

/// Token embedding layer (`wte`).
pub struct TokenEmbedding {
    embedding: Embedding,
}

impl TokenEmbedding {
    /// Create a new token embedding layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.vocab_size, config.n_embd, vb)?;
        Ok(Self { embedding })
    }

    /// Look up embeddings for `(batch, seq_len)` token ids.
    ///
    /// # Errors
    /// Returns an error if embedding lookup fails.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(token_ids)
    }

    /// Embedding weights, reused by the tied LM head.
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

/// Learned absolute position embedding (`wpe`).
pub struct PositionEmbedding {
    embedding: Embedding,
    block_size: usize,
}

impl PositionEmbedding {
    /// Create a new position embedding table of `block_size` rows.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.block_size, config.n_embd, vb)?;
        Ok(Self {
            embedding,
            block_size: config.block_size,
        })
    }

    /// Position embeddings for a sequence of length `seq_len`, shape `(1, seq_len, n_embd)`.
    ///
    /// # Errors
    /// Returns an error if `seq_len` exceeds the table or tensor ops fail.
    #[allow(clippy::cast_possible_truncation)]
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.block_size {
            return Err(candle_core::Error::Msg(format!(
                "position {seq_len} exceeds block_size {}",
                self.block_size
            )));
        }
        let device = self.embedding.embeddings().device();
        let positions = Tensor::arange(0u32, seq_len as u32, device)?;
        self.embedding.forward(&positions)?.unsqueeze(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_position_embedding_shape_and_bounds() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny(16);
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let wpe = PositionEmbedding::new(&config, vb).unwrap();

        let out = wpe.forward(5).unwrap();
        assert_eq!(out.dims(), &[1, 5, config.n_embd]);
        assert!(wpe.forward(config.block_size + 1).is_err());
    }
}
