use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use rwkv_chat::{ChatOptions, Sampler, Tokenizer};

#[derive(Parser, Debug)]
#[command(name = "rwkv-chat", about = "Tokenizer and sampler tools for RWKV chat models")]
struct Cli {
    /// JSON file with generation options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dictionary file (`<id> <literal> <length>` per line) replacing the bundled sample
    #[arg(long, global = true)]
    vocab: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the token ids of a text.
    Encode { text: String },
    /// Print the text of token ids.
    Decode { ids: Vec<usize> },
    /// Sample a token id from a logits vector.
    Sample {
        #[arg(required = true, allow_hyphen_values = true)]
        logits: Vec<f32>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        top_p: Option<f32>,
        /// Seed for the draw; defaults to the clock
        #[arg(long)]
        seed: Option<u64>,
        /// Logit bias as `id=value`, repeatable
        #[arg(long = "bias", value_parser = parse_bias)]
        bias: Vec<(usize, f32)>,
    },
    /// Show dictionary statistics.
    Vocab,
}

fn parse_bias(arg: &str) -> std::result::Result<(usize, f32), String> {
    let (id, value) = arg.split_once('=').ok_or("expected id=value")?;
    let id = id.trim().parse().map_err(|e| format!("bad token id: {e}"))?;
    let value = value.trim().parse().map_err(|e| format!("bad bias: {e}"))?;
    Ok((id, value))
}

fn clock_seed() -> u64 {
    let now = Utc::now();
    now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp()) as u64
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => ChatOptions::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ChatOptions::default(),
    };

    let tokenizer = match &cli.vocab {
        Some(path) => Tokenizer::load(path)
            .with_context(|| format!("loading dictionary {}", path.display()))?,
        None => Tokenizer::bundled().context("bundled dictionary is corrupt")?,
    };

    match cli.command {
        Command::Encode { text } => {
            let ids = tokenizer.encode(&text);
            let ids: Vec<String> = ids.iter().map(usize::to_string).collect();
            println!("{}", ids.join(" "));
        }
        Command::Decode { ids } => {
            println!("{}", tokenizer.decode_text(&ids));
        }
        Command::Sample { mut logits, temperature, top_p, seed, bias } => {
            let seed = seed.unwrap_or_else(clock_seed);
            let temperature = temperature.unwrap_or(options.temperature);
            let top_p = top_p.unwrap_or(options.top_p);
            if let Some(&(id, _)) = bias.iter().find(|(id, _)| *id >= logits.len()) {
                bail!("bias for token {} but only {} logits given", id, logits.len());
            }
            let bias: HashMap<usize, f32> = bias.into_iter().collect();

            let mut sampler = Sampler::new(temperature, top_p, StdRng::seed_from_u64(seed));
            let token = sampler.sample_logits(&mut logits, &bias)?;
            info!(seed, temperature, top_p, "sampled");
            println!("{}", token);
            let probs: Vec<String> = logits.iter().map(|p| format!("{:.4}", p)).collect();
            println!("{}", probs.join(" "));
        }
        Command::Vocab => {
            let vocab = &tokenizer.vocab;
            println!("tokens: {}", vocab.len);
            println!("id bound: {}", vocab.id_bound());
            println!("max token length: {}", vocab.max_token_length);
            println!("trie nodes: {}", vocab.trie.nodes.len());
        }
    }
    Ok(())
}
