//! GPT decoder-only transformer.
//!
//! GPT-2 layout: learned token and position embeddings, pre-norm blocks, tied LM head.

use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder};

use super::attention::create_causal_mask;
use super::config::ModelConfig;
use super::embedding::{PositionEmbedding, TokenEmbedding};
use super::layers::{TransformerBlock, layer_norm};

/// Decoder-only causal language model.
pub struct Gpt {
    wte: TokenEmbedding,
    wpe: PositionEmbedding,
    blocks: Vec<TransformerBlock>,
    ln_f: LayerNorm,
    /// Projects n_embd -> vocab_size; tied to `wte` unless the checkpoint stores its own.
    lm_head: Linear,
    config: ModelConfig,
    device: Device,
}

impl Gpt {
    /// Build the model from a variable builder rooted at the checkpoint's top level.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let device = vb.device().clone();
        let tvb = vb.pp("transformer");

        let wte = TokenEmbedding::new(&config, tvb.pp("wte"))?;
        let wpe = PositionEmbedding::new(&config, tvb.pp("wpe"))?;

        let blocks = (0..config.n_layer)
            .map(|i| TransformerBlock::new(&config, tvb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = layer_norm(&config, tvb.pp("ln_f"))?;

        let lm_head = if vb.pp("lm_head").contains_tensor("weight") {
            candle_nn::linear_no_bias(config.n_embd, config.vocab_size, vb.pp("lm_head"))?
        } else {
            Linear::new(wte.weights().clone(), None)
        };

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config,
            device,
        })
    }

    /// Logits of shape `(batch, seq_len, vocab_size)` for `(batch, seq_len)` token ids.
    ///
    /// # Errors
    /// Returns an error if the sequence exceeds `block_size` or tensor operations fail.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, t) = input_ids.dims2()?;
        if t > self.config.block_size {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {t} exceeds block_size {}",
                self.config.block_size
            )));
        }

        let tok_emb = self.wte.forward(input_ids)?;
        let pos_emb = self.wpe.forward(t)?;
        let mut x = tok_emb.broadcast_add(&pos_emb)?;

        let mask = create_causal_mask(t, &self.device)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }

        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)
    }

    /// Logits for the last position only, shape `(batch, vocab_size)`.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward_last(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        let (_, t, _) = logits.dims3()?;
        logits.narrow(1, t - 1, 1)?.squeeze(1)
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Load a model from a safetensors file.
///
/// # Errors
/// Returns an error if file loading or model construction fails.
pub fn load_model(path: &Path, config: ModelConfig, device: &Device) -> Result<Gpt> {
    let data = std::fs::read(path)?;
    load_model_from_bytes(&data, config, device, None)
}

/// Load a model from in-memory safetensors bytes, optionally under a tensor-name prefix.
///
/// # Errors
/// Returns an error if the buffer cannot be parsed as safetensors or model construction fails.
pub fn load_model_from_bytes(
    data: &[u8],
    config: ModelConfig,
    device: &Device,
    prefix: Option<&str>,
) -> Result<Gpt> {
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), DType::F32, device)?;
    let vb = match prefix {
        Some(p) => vb.pp(p),
        None => vb,
    };
    Gpt::new(config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let bad_config = ModelConfig {
            n_embd: 100,
            n_head: 3,
            ..ModelConfig::gpt2()
        };
        assert!(bad_config.validate().is_err());
        assert!(ModelConfig::gpt2().validate().is_ok());
    }

    #[test]
    fn test_forward_shapes_with_random_init() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny(11);
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = Gpt::new(config.clone(), vb).unwrap();
        let input = Tensor::zeros((3, 7), DType::U32, &device).unwrap();

        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[3, 7, config.vocab_size]);
        let last = model.forward_last(&input).unwrap();
        assert_eq!(last.dims(), &[3, config.vocab_size]);
    }

    #[test]
    fn test_sequence_longer_than_block_size_errors() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny(11);
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Gpt::new(config.clone(), vb).unwrap();

        let input = Tensor::zeros((1, config.block_size + 1), DType::U32, &device).unwrap();
        assert!(model.forward(&input).is_err());
    }
}
