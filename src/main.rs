//! Beam-search decoding CLI.
//!
//! Reads token-id queries as JSON Lines, decodes them in batches with a GPT checkpoint, and
//! writes `{"id", "tokens", "score"}` lines.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use beam_gen::data::{Collator, read_context, read_requests, write_results};
use beam_gen::inference::{DecodeConfig, run};
use beam_gen::model::ModelConfig;
use beam_gen::weights::loader as weights_loader;

/// Constrained batched beam-search decoding for GPT checkpoints.
#[derive(Debug, Parser)]
#[command(
    name = "beam-gen",
    version,
    about = "Decode token-id queries with constrained batched beam search",
    long_about = "Decodes each query with beam search over a causal GPT model, applying \
                  repetition penalty, minimum length, and no-repeat n-gram constraints.\n\n\
                  Input and output are token ids; tokenization happens elsewhere."
)]
struct Cli {
    /// Path to model weights (safetensors); config.json is read from the same directory
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// JSON array of token ids prepended to every query as padding context
    #[arg(long)]
    context: Option<PathBuf>,

    /// JSON Lines file of `{"id": .., "query": [..]}` requests
    #[arg(long)]
    data: Option<PathBuf>,

    /// JSON file with a full decode config; overrides the individual flags below
    #[arg(long)]
    decode_config: Option<PathBuf>,

    /// Batch size
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Beam width
    #[arg(long, default_value = "4")]
    beam: usize,

    /// Number of tokens to generate
    #[arg(long, default_value = "256")]
    max_length: usize,

    /// Minimum number of tokens before an end marker may be chosen
    #[arg(long, default_value = "0")]
    min_length: usize,

    /// Length penalty exponent
    #[arg(long, default_value = "0")]
    length_penalty: f32,

    /// Repetition penalty factor (1.0 = disabled)
    #[arg(long, default_value = "1.0")]
    repetition_penalty: f32,

    /// No-repeat n-gram size (0 = disabled)
    #[arg(long, default_value = "6")]
    no_repeat_ngram_size: usize,

    /// Sliding context window length, including padding context
    #[arg(long, default_value = "1024")]
    seq_len: usize,

    /// End-marker token ids
    #[arg(long = "eos", value_delimiter = ',', default_value = "50256")]
    eos: Vec<u32>,

    /// Padding token id
    #[arg(long, default_value = "50256")]
    pad: u32,

    /// Write results here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print model and decode configuration and exit
    #[arg(long)]
    info: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut decode_cfg = decode_config(&cli)?;

    if cli.info {
        return print_info(&cli, &decode_cfg);
    }

    let model_path = cli.model.as_deref().context(
        "No model provided. Usage: beam-gen --model model.safetensors --data requests.jsonl",
    )?;
    let data_path = cli.data.as_deref().context(
        "No requests provided. Pass --data with a JSON Lines file of {\"id\", \"query\"} lines.",
    )?;

    let device = candle_core::Device::Cpu;
    info!(path = %model_path.display(), "loading model");
    let mut model = weights_loader::load_external_model(model_path, &device)
        .context("Failed to load model")?;

    let block_size = model.config().block_size;
    if decode_cfg.seq_len > block_size {
        warn!(
            seq_len = decode_cfg.seq_len,
            block_size, "seq_len exceeds the model's block_size; clamping"
        );
        decode_cfg.seq_len = block_size;
    }

    let context = match cli.context.as_deref() {
        Some(path) => read_context(path)?,
        None => Vec::new(),
    };
    let requests = read_requests(data_path)?;
    info!(
        requests = requests.len(),
        context_tokens = context.len(),
        "decoding"
    );

    let collator = Collator::new(context, decode_cfg.seq_len, decode_cfg.pad_token_id);
    let mut out: Box<dyn Write> = match cli.output.as_deref() {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    for (idx, batch) in collator
        .batches(&requests, decode_cfg.batch_size)
        .enumerate()
    {
        let start = Instant::now();
        let results = run(&batch, &mut model, &decode_cfg)
            .with_context(|| format!("decode batch {idx}"))?;
        let elapsed_ms: u64 = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        info!(batch = idx, items = batch.len(), elapsed_ms, "batch decoded");
        write_results(&mut out, &results)?;
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn decode_config(cli: &Cli) -> Result<DecodeConfig> {
    let cfg = if let Some(path) = &cli.decode_config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read decode config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
    } else {
        DecodeConfig {
            batch_size: cli.batch_size,
            num_beams: cli.beam,
            max_length: cli.max_length,
            min_length: cli.min_length,
            length_penalty: cli.length_penalty,
            repetition_penalty: cli.repetition_penalty,
            no_repeat_ngram_size: cli.no_repeat_ngram_size,
            seq_len: cli.seq_len,
            eos_token_ids: cli.eos.clone(),
            pad_token_id: cli.pad,
        }
    };
    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("invalid decode config")?;
    Ok(cfg)
}

fn print_info(cli: &Cli, decode_cfg: &DecodeConfig) -> Result<()> {
    let model_cfg = match cli.model.as_deref() {
        Some(path) => weights_loader::load_config_for_model(path)?,
        None => ModelConfig::default(),
    };
    let payload = serde_json::json!({
        "model": model_cfg,
        "decode": decode_cfg,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
