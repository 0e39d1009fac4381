pub mod attention;
pub mod config;
pub mod embedding;
pub mod layers;
pub mod transformer;

// Re-exports for convenience
pub use attention::{CausalSelfAttention, create_causal_mask};
pub use config::ModelConfig;
pub use embedding::{PositionEmbedding, TokenEmbedding};
pub use layers::{MLP, TransformerBlock};
pub use transformer::{Gpt, load_model, load_model_from_bytes};
