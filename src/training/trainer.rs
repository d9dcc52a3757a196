//! The GRPO training loop.
//!
//! ```text
//! for iteration in 1..=num_iterations:
//!     reference <- frozen copy of policy
//!     optimizer <- fresh AdamW over policy parameters
//!     for step in 1..=num_steps:
//!         batch   <- batch_size distinct examples
//!         rollout <- sample completions, snapshot old/ref log-probs
//!         repeat mu times:
//!             loss <- GRPO loss(policy, rollout)
//!             backward, all-reduce replica grads, clip global grad norm
//!             optimizer step on the primary, re-sync replicas
//!             emit metrics record
//! ```
//!
//! Optimizer state is reset at each reference refresh.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::TrainingConfig;
use crate::data::{sample_batch, Example};
use crate::model::{CausalLm, DataParallel, TextTokenizer};
use crate::reward::RewardFn;

use super::grpo::grpo_loss;
use super::metrics::{MetricsSink, StepRecord};
use super::rollout::generate_rollout_data;

/// Rescale `grads` in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f32> {
    let mut sum_sq = 0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
        }
    }
    let total_norm = sum_sq.sqrt();

    if f64::from(total_norm) > max_norm {
        let scale = max_norm / (f64::from(total_norm) + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(total_norm)
}

/// Runs GRPO fine-tuning with a fixed configuration.
pub struct GrpoTrainer {
    config: TrainingConfig,
    run_id: String,
}

impl GrpoTrainer {
    /// Create a trainer, validating the configuration.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Identifier stamped on every metrics record of this trainer.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Fine-tune `policy` and return it unwrapped.
    ///
    /// The policy is replicated across `devices` for the duration of
    /// training.
    ///
    /// # Errors
    ///
    /// Fails before training starts when fewer than two devices are given or
    /// the batch size exceeds the dataset. Any failure during rollout, loss,
    /// backward or optimizer stepping is returned with the iteration and step
    /// it happened at.
    pub fn train<M, T, F>(
        &self,
        policy: M,
        devices: Vec<Device>,
        tokenizer: &T,
        train_data: &[Example],
        reward_fn: &F,
        sink: &mut dyn MetricsSink,
    ) -> Result<M>
    where
        M: CausalLm,
        T: TextTokenizer + ?Sized,
        F: RewardFn + ?Sized,
    {
        let cfg = &self.config;
        let policy = DataParallel::new(policy, devices)
            .context("Cannot start GRPO training")?;
        if cfg.batch_size > train_data.len() {
            anyhow::bail!(
                "Batch size {} exceeds the {} available training examples",
                cfg.batch_size,
                train_data.len()
            );
        }

        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            run_id = %self.run_id,
            replicas = policy.num_replicas(),
            examples = train_data.len(),
            num_iterations = cfg.num_iterations,
            num_steps = cfg.num_steps,
            mu = cfg.mu,
            "Starting GRPO training"
        );

        for iteration in 1..=cfg.num_iterations {
            info!(iteration, "Refreshing reference model");
            let reference = policy
                .module()
                .frozen_copy()
                .with_context(|| format!("Reference snapshot failed at iteration {iteration}"))?;

            let vars = policy.trainable_vars();
            let mut optimizer = AdamW::new(
                vars.clone(),
                ParamsAdamW {
                    lr: cfg.learning_rate,
                    ..Default::default()
                },
            )?;

            for step in 1..=cfg.num_steps {
                let batch = sample_batch(train_data, cfg.batch_size, &mut rng)?;
                let rollout = generate_rollout_data(
                    &policy,
                    &reference,
                    tokenizer,
                    &batch,
                    cfg.num_generations,
                    cfg.max_completion_length,
                    &mut rng,
                )
                .with_context(|| {
                    format!("Rollout generation failed at iteration {iteration}, step {step}")
                })?;

                for grpo_iteration in 1..=cfg.mu {
                    let at = || {
                        format!(
                            "iteration {iteration}, step {step}, GRPO iteration {grpo_iteration}"
                        )
                    };

                    let out = grpo_loss(&policy, &rollout, reward_fn, cfg.beta, cfg.epsilon)
                        .with_context(|| format!("Loss computation failed at {}", at()))?;
                    let mut grads = out
                        .loss
                        .backward()
                        .with_context(|| format!("Backward pass failed at {}", at()))?;
                    policy
                        .reduce_gradients(&mut grads)
                        .with_context(|| format!("Gradient all-reduce failed at {}", at()))?;
                    let grad_norm = clip_grad_norm(&vars, &mut grads, cfg.max_grad_norm)?;
                    optimizer
                        .step(&grads)
                        .with_context(|| format!("Optimizer step failed at {}", at()))?;
                    policy
                        .sync_replicas()
                        .with_context(|| format!("Replica sync failed at {}", at()))?;

                    let loss = out.loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                    debug!(loss, grad_norm, "Applied GRPO update");

                    let record = StepRecord {
                        run_id: self.run_id.clone(),
                        timestamp: Utc::now(),
                        iteration,
                        step,
                        grpo_iteration,
                        loss,
                        average_reward: out.average_reward,
                        mean_kl: out.mean_kl,
                        clip_fraction: out.clip_fraction,
                        grad_norm,
                    };
                    if let Err(e) = sink.record(&record) {
                        warn!(error = %e, iteration, step, "Metrics sink rejected record");
                    }
                }
            }
        }

        info!(run_id = %self.run_id, "GRPO training complete");
        Ok(policy.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ByteTokenizer, TinyCausalLm, TinyLmConfig};
    use crate::reward::Message;
    use crate::training::metrics::MemorySink;
    use candle_core::Tensor;

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            num_iterations: 2,
            num_steps: 2,
            batch_size: 2,
            num_generations: 3,
            max_completion_length: 4,
            beta: 0.04,
            learning_rate: 1e-2,
            mu: 2,
            epsilon: 0.2,
            max_grad_norm: 1.0,
            seed: Some(17),
        }
    }

    fn model() -> TinyCausalLm {
        TinyCausalLm::new(
            TinyLmConfig {
                vocab_size: ByteTokenizer.vocab_size(),
                hidden_size: 8,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn data() -> Vec<Example> {
        ["1+1", "2+2", "3+3"]
            .iter()
            .enumerate()
            .map(|(i, p)| Example {
                prompt: p.to_string(),
                answer: ((i + 1) * 2).to_string(),
            })
            .collect()
    }

    /// Rewards longer completions so groups have non-zero spread.
    fn length_reward(_: &[String], c: &[Vec<Message>], _: &[String]) -> Vec<f32> {
        c.iter()
            .enumerate()
            .map(|(i, m)| m[0].content.len() as f32 + (i % 3) as f32)
            .collect()
    }

    #[test]
    fn test_rejects_single_device() {
        let trainer = GrpoTrainer::new(small_config()).unwrap();
        let mut sink = MemorySink::default();
        let err = trainer
            .train(
                model(),
                vec![Device::Cpu],
                &ByteTokenizer,
                &data(),
                &length_reward,
                &mut sink,
            )
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("at least 2"));
        assert!(sink.records.is_empty());
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let trainer = GrpoTrainer::new(TrainingConfig {
            batch_size: 5,
            ..small_config()
        })
        .unwrap();
        let mut sink = MemorySink::default();
        let result = trainer.train(
            model(),
            vec![Device::Cpu, Device::Cpu],
            &ByteTokenizer,
            &data(),
            &length_reward,
            &mut sink,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(GrpoTrainer::new(TrainingConfig {
            mu: 0,
            ..small_config()
        })
        .is_err());
    }

    #[test]
    fn test_training_emits_records_and_updates_policy() {
        let trainer = GrpoTrainer::new(small_config()).unwrap();
        let initial = model();
        let before: Vec<Vec<f32>> = initial
            .trainable_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        let mut sink = MemorySink::default();
        let trained = trainer
            .train(
                initial,
                vec![Device::Cpu, Device::Cpu],
                &ByteTokenizer,
                &data(),
                &length_reward,
                &mut sink,
            )
            .unwrap();

        // 2 iterations x 2 steps x mu 2
        assert_eq!(sink.records.len(), 8);
        let first = &sink.records[0];
        assert_eq!((first.iteration, first.step, first.grpo_iteration), (1, 1, 1));
        let last = sink.records.last().unwrap();
        assert_eq!((last.iteration, last.step, last.grpo_iteration), (2, 2, 2));
        assert!(sink.records.iter().all(|r| r.loss.is_finite()));
        assert!(sink.records.iter().all(|r| r.run_id == trainer.run_id()));

        assert!(!trained.is_frozen());
        let after: Vec<Vec<f32>> = trained
            .trainable_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_ne!(before, after);
    }

    #[test]
    fn test_training_across_three_replicas() {
        let trainer = GrpoTrainer::new(TrainingConfig {
            num_iterations: 1,
            num_steps: 2,
            mu: 1,
            ..small_config()
        })
        .unwrap();
        let mut sink = MemorySink::default();
        let trained = trainer
            .train(
                model(),
                vec![Device::Cpu; 3],
                &ByteTokenizer,
                &data(),
                &length_reward,
                &mut sink,
            )
            .unwrap();
        assert_eq!(sink.records.len(), 2);
        assert!(sink
            .records
            .iter()
            .all(|r| r.loss.is_finite() && r.grad_norm.is_finite()));
        assert_eq!(trained.trainable_vars().len(), 5);
    }

    #[test]
    fn test_sink_failure_does_not_abort() {
        struct Broken(usize);
        impl MetricsSink for Broken {
            fn record(&mut self, _: &StepRecord) -> Result<()> {
                self.0 += 1;
                anyhow::bail!("disk full")
            }
        }

        let trainer = GrpoTrainer::new(TrainingConfig {
            num_iterations: 1,
            num_steps: 1,
            mu: 1,
            ..small_config()
        })
        .unwrap();
        let mut sink = Broken(0);
        let result = trainer.train(
            model(),
            vec![Device::Cpu, Device::Cpu],
            &ByteTokenizer,
            &data(),
            &length_reward,
            &mut sink,
        );
        assert!(result.is_ok());
        assert_eq!(sink.0, 1);
    }

    #[test]
    fn test_clip_grad_norm_scales_to_max() {
        let var = Var::from_tensor(&Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap()).unwrap();
        let loss = (var.as_tensor() * var.as_tensor()).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        // d/dx sum(x^2) = 2x = [6, 8], norm 10
        let norm = clip_grad_norm(&[var.clone()], &mut grads, 1.0).unwrap();
        assert!((norm - 10.0).abs() < 1e-5);
        let g = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-4);
        assert!((g[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() {
        let var = Var::from_tensor(&Tensor::new(&[0.1f32], &Device::Cpu).unwrap()).unwrap();
        let loss = var.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(&[var.clone()], &mut grads, 5.0).unwrap();
        assert!((norm - 1.0).abs() < 1e-6);
        let g = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![1.0]);
    }
}
