use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Complete configuration for a GRPO fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoRunConfig {
    pub training: TrainingConfig,
    pub model: ModelConfig,
    /// Compute devices the policy is replicated across (`"cpu"`, `"cuda:N"`,
    /// `"metal:N"`). At least two are required.
    pub devices: Vec<String>,
}

/// Hyperparameters of the outer/inner GRPO loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Outer iterations; the reference model is refreshed at the start of each (default: 1).
    pub num_iterations: usize,
    /// Rollouts generated per outer iteration (default: 500).
    pub num_steps: usize,
    /// Prompts sampled per rollout (default: 7).
    pub batch_size: usize,
    /// Completions sampled per prompt, the GRPO group size (default: 12).
    pub num_generations: usize,
    /// Maximum number of new tokens per completion (default: 400).
    pub max_completion_length: usize,
    /// KL penalty coefficient (default: 0.04).
    pub beta: f64,
    /// AdamW learning rate (default: 5e-6).
    pub learning_rate: f64,
    /// Gradient steps taken on each rollout (default: 1).
    pub mu: usize,
    /// Ratio clipping range (default: 0.1).
    pub epsilon: f64,
    /// Global gradient-norm clip (default: 0.1).
    pub max_grad_norm: f64,
    /// Seed for batch and token sampling; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Policy model and tokenizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden width of the built-in causal LM (default: 64).
    pub hidden_size: usize,
    /// Path to a `tokenizer.json`; the byte-level tokenizer is used when absent.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    /// End-of-sequence token of the `tokenizer.json` vocabulary (default: `<|endoftext|>`).
    #[serde(default = "default_eos_token")]
    pub eos_token: String,
    /// Padding token of the `tokenizer.json` vocabulary; falls back to the
    /// end-of-sequence token when absent.
    #[serde(default)]
    pub pad_token: Option<String>,
    /// Where to write the trained policy as safetensors.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

fn default_eos_token() -> String {
    "<|endoftext|>".into()
}

impl Default for GrpoRunConfig {
    fn default() -> Self {
        Self {
            training: TrainingConfig::default(),
            model: ModelConfig {
                hidden_size: 64,
                tokenizer_path: None,
                eos_token: default_eos_token(),
                pad_token: None,
                output_path: None,
            },
            devices: vec!["cpu".into(), "cpu".into()],
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_iterations: 1,
            num_steps: 500,
            batch_size: 7,
            num_generations: 12,
            max_completion_length: 400,
            beta: 0.04,
            learning_rate: 5e-6,
            mu: 1,
            epsilon: 0.1,
            max_grad_norm: 0.1,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Reject hyperparameters the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.num_generations == 0 {
            bail!("num_generations must be at least 1");
        }
        if self.max_completion_length == 0 {
            bail!("max_completion_length must be at least 1");
        }
        if self.mu == 0 {
            bail!("mu must be at least 1");
        }
        if !(0.0..1.0).contains(&self.epsilon) {
            bail!("epsilon must lie in [0, 1), got {}", self.epsilon);
        }
        if self.beta < 0.0 {
            bail!("beta must be non-negative, got {}", self.beta);
        }
        if self.max_grad_norm <= 0.0 {
            bail!("max_grad_norm must be positive, got {}", self.max_grad_norm);
        }
        Ok(())
    }
}

impl GrpoRunConfig {
    /// Resolve the configured device names into candle devices.
    pub fn resolve_devices(&self) -> Result<Vec<Device>> {
        self.devices.iter().map(|d| parse_device(d)).collect()
    }
}

/// Parse `"cpu"`, `"cuda:N"` or `"metal:N"` into a [`Device`].
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let (kind, ordinal) = name
        .split_once(':')
        .with_context(|| format!("Unrecognised device '{name}'"))?;
    let ordinal: usize = ordinal
        .parse()
        .with_context(|| format!("Invalid device ordinal in '{name}'"))?;
    let device = match kind {
        "cuda" => Device::new_cuda(ordinal),
        "metal" => Device::new_metal(ordinal),
        other => bail!("Unsupported device kind '{other}'"),
    };
    device.with_context(|| format!("Failed to open device '{name}'"))
}
