use serde::{Deserialize, Serialize};

/// Vocabulary size assumed when a checkpoint config omits it (GPT-2 BPE).
pub const DEFAULT_VOCAB_SIZE: usize = 50257;

/// GPT hyperparameters as stored in a checkpoint's `config.json`.
///
/// This configuration must match the exported weights exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum sequence length the position table covers
    pub block_size: usize,
    /// Vocabulary size
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Number of transformer blocks
    pub n_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Whether linear layers and layer norms carry bias terms
    #[serde(default = "default_bias")]
    pub bias: bool,
}

fn default_vocab_size() -> usize {
    DEFAULT_VOCAB_SIZE
}

fn default_bias() -> bool {
    true
}

impl ModelConfig {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns an error if the configuration is internally inconsistent.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.n_head == 0 {
            return Err("n_head must be positive");
        }
        if !self.n_embd.is_multiple_of(self.n_head) {
            return Err("n_embd must be divisible by n_head");
        }
        if self.vocab_size == 0 {
            return Err("vocab_size must be positive");
        }
        if self.block_size == 0 {
            return Err("block_size must be positive");
        }
        Ok(())
    }

    /// Tiny config for tests and smoke runs.
    #[must_use]
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            block_size: 64,
            vocab_size,
            n_layer: 2,
            n_head: 2,
            n_embd: 32,
            bias: true,
        }
    }

    /// GPT-2 small (124M parameters).
    #[must_use]
    pub fn gpt2() -> Self {
        Self {
            block_size: 1024,
            vocab_size: DEFAULT_VOCAB_SIZE,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            bias: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::gpt2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_vocab_size_defaults_to_gpt2() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"block_size":8,"n_layer":1,"n_head":1,"n_embd":4}"#).unwrap();
        assert_eq!(cfg.vocab_size, DEFAULT_VOCAB_SIZE);
        assert!(cfg.bias);
    }

    #[test]
    fn test_zero_heads_rejected() {
        let cfg = ModelConfig {
            n_head: 0,
            ..ModelConfig::tiny(10)
        };
        assert!(cfg.validate().is_err());
    }
}
