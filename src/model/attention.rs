//! Causal self-attention.
//!
//! Multi-head attention over a fused `c_attn` projection, as stored in GPT-2 checkpoints.

use candle_core::{D, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::ModelConfig;

/// Multi-head causal self-attention with a fused QKV projection.
pub struct CausalSelfAttention {
    /// Combined query, key, value projection (n_embd -> 3 * n_embd)
    c_attn: Linear,
    /// Output projection (n_embd -> n_embd)
    c_proj: Linear,
    /// Number of attention heads
    n_head: usize,
    /// Embedding dimension
    n_embd: usize,
    /// Dimension per head (n_embd / n_head)
    head_dim: usize,
}

impl CausalSelfAttention {
    /// Create a new causal self-attention layer.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder rooted at `transformer.h.{i}.attn`
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let c_attn = candle_nn::linear_b(n_embd, 3 * n_embd, config.bias, vb.pp("c_attn"))?;
        let c_proj = candle_nn::linear_b(n_embd, n_embd, config.bias, vb.pp("c_proj"))?;

        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            n_embd,
            head_dim: config.head_dim(),
        })
    }

    /// Forward pass for causal self-attention.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, n_embd)
    /// * `mask` - Additive causal mask of shape (1, 1, seq_len, seq_len)
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, n_embd)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    #[allow(clippy::many_single_char_names)]
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, self.n_embd)?;
        let k = qkv.narrow(D::Minus1, self.n_embd, self.n_embd)?;
        let v = qkv.narrow(D::Minus1, 2 * self.n_embd, self.n_embd)?;

        // (B, T, C) -> (B, n_head, T, head_dim)
        let split = |t_: Tensor| -> Result<Tensor> {
            t_.reshape((b, t, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(q)?;
        let k = split(k)?;
        let v = split(v)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let att = (q.matmul(&k_t)? * scale)?;
        // Masked positions become -inf before softmax.
        let att = att.broadcast_add(mask)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v)?;

        // (B, n_head, T, head_dim) -> (B, T, C)
        let y = y
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.n_embd))?;
        self.c_proj.forward(&y)
    }
}

/// Additive causal mask of shape `(1, 1, T, T)`: 0 where `j <= i`, `-inf` above the diagonal.
///
/// # Arguments
/// * `seq_len` - Sequence length
/// * `device` - Device to create the tensor on
///
/// # Errors
/// Returns an error if tensor creation fails.
pub fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask_data: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(mask_data, (seq_len, seq_len), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}
