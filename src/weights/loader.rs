use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use safetensors::SafeTensors;
use tracing::{debug, warn};

use crate::model::{Gpt, ModelConfig, load_model_from_bytes};

/// Prefix written in front of every tensor name by checkpoints saved from a compiled module.
pub const COMPILED_PREFIX: &str = "_orig_mod";

const WTE_NAME: &str = "transformer.wte.weight";

/// Load a model from a weights file on disk, reading `config.json` from the same directory when
/// available.
///
/// # Errors
/// Returns an error if the weights or config cannot be loaded, or if the config disagrees with
/// the stored embedding table.
pub fn load_external_model(model_path: &Path, device: &Device) -> Result<Gpt> {
    let config = load_config_for_model(model_path)?;
    let data = std::fs::read(model_path)
        .with_context(|| format!("read weights {}", model_path.display()))?;
    load_bytes(&data, config, device).context("load external weights")
}

/// Resolve `config.json` next to the weights, falling back to GPT-2 small.
///
/// # Errors
/// Returns an error if a present config file cannot be read, parsed, or validated.
pub fn load_config_for_model(model_path: &Path) -> Result<ModelConfig> {
    let Some(config_path) = model_path.parent().map(|p| p.join("config.json")) else {
        return Ok(ModelConfig::default());
    };
    if !config_path.exists() {
        warn!(
            path = %config_path.display(),
            "config.json not found; assuming GPT-2 small hyperparameters"
        );
        return Ok(ModelConfig::default());
    }

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    if value.get("vocab_size").is_none() {
        warn!(
            vocab_size = crate::model::config::DEFAULT_VOCAB_SIZE,
            "vocab_size not found in config; assuming GPT-2 vocabulary"
        );
    }
    let cfg: ModelConfig =
        serde_json::from_value(value).with_context(|| format!("parse {}", config_path.display()))?;
    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("invalid ModelConfig")?;
    Ok(cfg)
}

/// Detect the tensor-name prefix used by a checkpoint, if any.
#[must_use]
pub fn detect_prefix(safetensors: &SafeTensors<'_>) -> Option<&'static str> {
    let compiled = format!("{COMPILED_PREFIX}.");
    let names = safetensors.names();
    (!names.is_empty() && names.iter().all(|n| n.starts_with(&compiled))).then_some(COMPILED_PREFIX)
}

fn load_bytes(data: &[u8], config: ModelConfig, device: &Device) -> Result<Gpt> {
    let Ok(safetensors) = SafeTensors::deserialize(data) else {
        // Not safetensors; the var builder reports a better error.
        return load_model_from_bytes(data, config, device, None).context("load weights bytes");
    };

    let prefix = detect_prefix(&safetensors);
    if let Some(p) = prefix {
        debug!(prefix = p, "stripping compiled-module tensor prefix");
    }

    let wte_name = match prefix {
        Some(p) => format!("{p}.{WTE_NAME}"),
        None => WTE_NAME.to_string(),
    };
    if let Ok(wte) = safetensors.tensor(&wte_name) {
        let rows = wte.shape().first().copied().unwrap_or_default();
        if rows != config.vocab_size {
            anyhow::bail!(
                "config vocab_size {} does not match {wte_name} with {rows} rows; \
check config.json next to the weights",
                config.vocab_size
            );
        }
    }

    load_model_from_bytes(data, config, device, prefix).context("load float safetensors")
}
