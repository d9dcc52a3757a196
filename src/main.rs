//! grpo-trainer: GRPO fine-tuning from the command line.
//!
//! Subcommands:
//!
//! - `train`        -- Fine-tune the built-in policy on a prompt/answer dataset
//! - `inspect-data` -- Validate and summarise a dataset file
//! - `config`       -- Print the default configuration as JSON

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use grpo_trainer::config::GrpoRunConfig;
use grpo_trainer::data::load_examples;
use grpo_trainer::model::{ByteTokenizer, HfTokenizer, TextTokenizer, TinyCausalLm, TinyLmConfig};
use grpo_trainer::reward::{AnswerMatchReward, CombinedReward, FormatReward};
use grpo_trainer::training::{FanoutSink, GrpoTrainer, JsonlSink, MetricsSink, TracingSink};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// GRPO fine-tuning for causal language models.
#[derive(Parser)]
#[command(name = "grpo-trainer", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the policy with GRPO.
    Train {
        /// Training data: JSON array or JSON lines of `{prompt, answer}`
        /// objects or `[prompt, answer]` pairs.
        #[arg(long, default_value = "data/train.jsonl")]
        data: PathBuf,

        /// Override the number of rollout steps per iteration.
        #[arg(long)]
        num_steps: Option<usize>,

        /// Override the sampling seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Where to save the trained policy (safetensors).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also append metrics records to this JSON lines file.
        #[arg(long)]
        metrics: Option<PathBuf>,
    },

    /// Validate and summarise a dataset file.
    InspectData {
        #[arg(default_value = "data/train.jsonl")]
        path: PathBuf,
    },

    /// Print the default configuration.
    Config,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<GrpoRunConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => GrpoRunConfig::default(),
    };

    match cli.command {
        Commands::Train {
            data,
            num_steps,
            seed,
            output,
            metrics,
        } => {
            let mut config = config;
            if let Some(n) = num_steps {
                config.training.num_steps = n;
            }
            if seed.is_some() {
                config.training.seed = seed;
            }
            if output.is_some() {
                config.model.output_path = output;
            }
            cmd_train(&config, &data, metrics.as_deref())
        }
        Commands::InspectData { path } => cmd_inspect_data(&path),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&GrpoRunConfig::default())?);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_train(config: &GrpoRunConfig, data_path: &Path, metrics_path: Option<&Path>) -> Result<()> {
    let examples = load_examples(data_path)?;
    tracing::info!(path = %data_path.display(), examples = examples.len(), "Loaded training data");

    let tokenizer: Box<dyn TextTokenizer> = match &config.model.tokenizer_path {
        Some(path) => {
            tracing::info!(
                path = %path.display(),
                eos = %config.model.eos_token,
                "Using Hugging Face tokenizer"
            );
            Box::new(HfTokenizer::from_file(
                path,
                &config.model.eos_token,
                config.model.pad_token.as_deref(),
            )?)
        }
        None => {
            tracing::info!("Using byte-level tokenizer");
            Box::new(ByteTokenizer::new())
        }
    };

    let devices = config.resolve_devices()?;
    let primary = devices
        .first()
        .context("No compute devices configured")?
        .clone();
    let policy = TinyCausalLm::new(
        TinyLmConfig {
            vocab_size: tokenizer.vocab_size(),
            hidden_size: config.model.hidden_size,
        },
        &primary,
    )?;

    let reward = CombinedReward::new(vec![
        Box::new(AnswerMatchReward::new()?),
        Box::new(FormatReward),
    ]);

    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink)];
    if let Some(path) = metrics_path {
        sinks.push(Box::new(JsonlSink::create(path)?));
    }
    let mut sink = FanoutSink::new(sinks);

    let trainer = GrpoTrainer::new(config.training.clone())?;
    let trained = trainer.train(policy, devices, &tokenizer, &examples, &reward, &mut sink)?;

    if let Some(path) = &config.model.output_path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        trained.save(path)?;
        tracing::info!(path = %path.display(), "Saved trained policy");
    }

    Ok(())
}

fn cmd_inspect_data(path: &Path) -> Result<()> {
    let examples = load_examples(path)?;

    println!("Dataset: {}", path.display());
    println!("  Examples: {}", examples.len());
    if examples.is_empty() {
        return Ok(());
    }

    let mean_prompt =
        examples.iter().map(|e| e.prompt.len()).sum::<usize>() as f64 / examples.len() as f64;
    println!("  Mean prompt length: {mean_prompt:.1} bytes");
    println!();

    for example in examples.iter().take(5) {
        println!("  Prompt: {}", example.prompt);
        println!("  Answer: {}", example.answer);
        println!();
    }
    if examples.len() > 5 {
        println!("  ... and {} more", examples.len() - 5);
    }

    Ok(())
}
