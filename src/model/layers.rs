//! Common transformer layers.
//!
//! Layer norm, MLP, and pre-norm TransformerBlock in the GPT-2 layout (`ln_1`, `attn`,
//! `ln_2`, `mlp` under each `h.{i}`).

use candle_core::{Result, Tensor};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder};

use super::attention::CausalSelfAttention;
use super::config::ModelConfig;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Build a layer norm that honours `config.bias`.
///
/// Bias-free checkpoints store only `weight`, so the bias tensor is not requested from `vb`.
///
/// # Arguments
/// * `config` - Model configuration (`n_embd`, `bias`)
/// * `vb` - Variable builder rooted at the norm, e.g. `h.0.ln_1`
///
/// # Errors
/// Returns an error if weight loading fails.
#[allow(clippy::needless_pass_by_value)]
pub fn layer_norm(config: &ModelConfig, vb: VarBuilder) -> Result<LayerNorm> {
    if config.bias {
        let ln_cfg = candle_nn::LayerNormConfig {
            eps: LAYER_NORM_EPS,
            ..Default::default()
        };
        candle_nn::layer_norm(config.n_embd, ln_cfg, vb)
    } else {
        let weight = vb.get(config.n_embd, "weight")?;
        Ok(LayerNorm::new_no_bias(weight, LAYER_NORM_EPS))
    }
}

/// Feed-forward network with GELU activation.
///
/// Standard transformer MLP with 4x hidden expansion: c_fc -> GELU -> c_proj.
pub struct MLP {
    /// Up projection (n_embd -> 4 * n_embd)
    c_fc: Linear,
    /// Down projection (4 * n_embd -> n_embd)
    c_proj: Linear,
}

impl MLP {
    /// Create a new MLP layer.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let hidden_dim = 4 * n_embd;

        // GPT-2 checkpoints carry biases; bias-free variants set `bias: false`.
        let c_fc = candle_nn::linear_b(n_embd, hidden_dim, config.bias, vb.pp("c_fc"))?;
        let c_proj = candle_nn::linear_b(hidden_dim, n_embd, config.bias, vb.pp("c_proj"))?;

        Ok(Self { c_fc, c_proj })
    }

    /// Forward pass through the MLP.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&h)
    }
}

/// Transformer block with pre-norm architecture.
///
/// Structure: LayerNorm -> Attention -> Residual -> LayerNorm -> MLP -> Residual
pub struct TransformerBlock {
    /// Layer norm before attention
    ln_1: LayerNorm,
    /// Causal self-attention
    attn: CausalSelfAttention,
    /// Layer norm before the MLP
    ln_2: LayerNorm,
    /// Feed-forward network
    mlp: MLP,
}

impl TransformerBlock {
    /// Create a new transformer block.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder rooted at `transformer.h.{i}`
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: layer_norm(config, vb.pp("ln_2"))?,
            mlp: MLP::new(config, vb.pp("mlp"))?,
        })
    }

    /// Forward pass through the block.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd)
    /// * `mask` - Additive causal mask from [`super::attention::create_causal_mask`]
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        // Attention with residual
        let h = self.attn.forward(&self.ln_1.forward(x)?, mask)?;
        let x = (x + h)?;

        // MLP with residual
        let h = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        x + h
    }
}
