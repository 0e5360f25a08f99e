//! genloop CLI: model metadata inspection

use clap::{Parser, Subcommand};
use genloop_rs::{ModelBundle, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "genloop-cli")]
#[command(about = "Greedy decode-loop driver for session-based LLM inference", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show model metadata from a local model directory
    Info {
        /// Path to model directory (config.json + weights)
        #[arg(short, long)]
        model: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("genloop_rs=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { model } => show_model_info(&model),
    }
}

fn show_model_info(model_path: &str) -> Result<()> {
    let bundle = ModelBundle::from_dir(model_path)?;
    let config = &bundle.config;

    println!("Model Information");
    println!("=================");
    println!("Hidden size: {}", config.hidden_size);
    println!("Layers: {}", config.num_hidden_layers);
    println!("Attention heads: {}", config.num_attention_heads);
    println!("KV heads: {}", config.num_kv_heads());
    println!("Head dim: {}", config.head_dim());
    println!("Vocab size: {}", config.vocab_size);
    println!("Precision: {}", config.precision()?);
    println!("Stop tokens: {:?}", config.eos_token_ids);
    println!("KV cache template: {:?}", config.kv_cache_shape());
    println!("Weights: {} bytes", bundle.weights().len());
    if let Some(data) = bundle.external_data() {
        println!("External data: {} bytes", data.len());
    }

    Ok(())
}
