use std::{path::PathBuf, str::FromStr};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use convolution::{GridMask, PaddingMask};
use layers::Mode;
use pervasive::{
    greedy_decode, Action, DecodeOptions, EmbeddingTable, GridModel, ModelConfig, TrainOutput,
};
use serde_json::{Number, Value};

fn main() {
    // `log` records from the library crates are forwarded to this subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    if let Err(err) = run() {
        eprintln!("pervasive failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Grid seq2seq demo on random embeddings", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON model config")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a top-level config value"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value_t = 2, help = "Sequences in the training batch")]
    batch: usize,

    #[arg(long, default_value_t = 6, help = "Source length of the longest sequence")]
    source_len: usize,

    #[arg(long, default_value_t = 4, help = "Target length of every sequence")]
    target_len: usize,

    #[arg(long, default_value_t = 0.5, help = "Write probability needed to emit a token")]
    threshold: f32,

    #[arg(long, default_value_t = 8, help = "Maximum tokens to emit while decoding")]
    max_len: usize,

    #[arg(long, default_value_t = 0)]
    bos: u32,

    #[arg(long, default_value_t = 1)]
    eos: u32,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    key: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if key.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.batch == 0 || args.source_len == 0 || args.target_len == 0 {
        bail!("batch, source length and target length must be positive");
    }

    let mut config = ModelConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let device = Device::Cpu;
    let embeddings = EmbeddingTable::randn(
        config.vocab_size,
        config.decoder_embed_dim,
        &device,
        DType::F32,
    )?;
    let tied = config
        .share_decoder_input_output_embed
        .then(|| embeddings.weight());
    let model = GridModel::new(&config, &device, DType::F32, tied)?;
    println!(
        "model: {:?} network, {} layers, {} parameter tensors",
        config.network,
        config.num_layers,
        model.named_parameters().len()
    );

    let source = Tensor::randn(
        0f32,
        1.0,
        (args.batch, args.source_len, config.encoder_embed_dim),
        &device,
    )?;
    let lengths: Vec<usize> = (0..args.batch)
        .map(|b| args.source_len.saturating_sub(b).max(1))
        .collect();
    let source_mask = PaddingMask::from_lengths(&device, &lengths, args.source_len)?;
    let mask = GridMask::new(Some(source_mask), None);

    let ids = reference_ids(args.batch, args.target_len, config.vocab_size, args.bos);
    let target_ids = Tensor::new(ids.as_slice(), &device)?
        .reshape((args.batch, args.target_len + 1))?;
    let previous = embeddings.lookup(&target_ids.narrow(1, 0, args.target_len)?)?;
    let reference = target_ids.narrow(1, 1, args.target_len)?;

    let output = model.forward_train(&source, &previous, &mask, &reference, Mode::Train)?;
    summarize_training(&output, &lengths)?;

    let options = DecodeOptions {
        bos: args.bos,
        eos: args.eos,
        max_len: args.max_len,
        threshold: args.threshold,
    };
    let single = source.narrow(0, 0, 1)?;
    let decoded = greedy_decode(&model, &single, &embeddings, &options)?;
    let actions: String = decoded
        .actions
        .iter()
        .map(|action| match action {
            Action::Read => 'R',
            Action::Write => 'W',
        })
        .collect();
    println!("decode: tokens {:?}", decoded.tokens);
    println!("decode: actions {actions}");
    println!("decode: delays {:?}", decoded.delays);
    Ok(())
}

/// Deterministic reference sequences, each starting with `bos`.
fn reference_ids(batch: usize, target_len: usize, vocab: usize, bos: u32) -> Vec<u32> {
    (0..batch)
        .flat_map(|b| {
            (0..=target_len).map(move |t| {
                if t == 0 {
                    bos
                } else {
                    ((b * 7 + t * 3 + 2) % vocab) as u32
                }
            })
        })
        .collect()
}

fn summarize_training(output: &TrainOutput, lengths: &[usize]) -> Result<()> {
    let (batch, tgt_len, src_len, vocab) = output.log_probs.dims4()?;
    println!("train: log-probabilities [{batch}, {tgt_len}, {src_len}, {vocab}]");

    let scores = output.scores.to_vec3::<f32>()?;
    let writes = output.write_labels.to_vec3::<f32>()?;
    let gamma = output.gamma.to_vec2::<f32>()?;
    for (b, &len) in lengths.iter().enumerate() {
        let full_context: f32 =
            scores[b].iter().map(|row| row[len - 1]).sum::<f32>() / tgt_len as f32;
        let boundaries: Vec<usize> = writes[b]
            .iter()
            .map(|row| row.iter().position(|&w| w > 0.5).unwrap_or(len - 1))
            .collect();
        let mean_gain = gamma[b].iter().sum::<f32>() / tgt_len as f32;
        println!(
            "train: sequence {b} (source {len}): mean log-likelihood {full_context:.4}, oracle boundaries {boundaries:?}, mean gain {mean_gain:.4}"
        );
    }
    log::info!(
        "controller outputs {:?}, observations {:?}",
        output.controls.dims(),
        output.observations.dims()
    );
    Ok(())
}

fn apply_overrides(config: ModelConfig, overrides: &[OverrideArg]) -> Result<ModelConfig> {
    let mut value = serde_json::to_value(config).context("serializing config for overrides")?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("config did not serialize to an object"))?;
    for entry in overrides {
        if !fields.contains_key(&entry.key) {
            bail!("unknown config key '{}'", entry.key);
        }
        fields.insert(entry.key.clone(), parse_override_value(&entry.value));
    }
    serde_json::from_value(value).context("applying config overrides")
}

fn parse_override_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = raw.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = raw.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}
