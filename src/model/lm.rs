//! The causal language model seam.
//!
//! Anything that maps token ids plus an attention mask to next-token logits
//! can be trained. Sampling-based generation is provided on top of `forward`,
//! and [`without_grad`] marks the inference-only regions of the trainer.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor, Var};
use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;

/// Parameters of sampling-based generation.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Sample from the distribution; greedy decoding when false.
    pub do_sample: bool,
    pub temperature: f64,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    /// Stop as soon as every row has emitted end-of-sequence. When false,
    /// finished rows are padded until `max_new_tokens` is spent.
    pub early_stopping: bool,
}

/// A causal language model.
pub trait CausalLm: Send + Sync {
    /// Logits of shape `(batch, seq, vocab)` for `u32` ids and mask of shape `(batch, seq)`.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Device holding the parameters.
    fn device(&self) -> &Device;

    /// Parameters updated by the optimizer. Empty for frozen models.
    ///
    /// The order is stable, so the vars of a [`replicate`](Self::replicate)d
    /// copy line up index by index with the original's.
    fn trainable_vars(&self) -> Vec<Var>;

    /// Deep copy of the parameters with gradient tracking disabled.
    fn frozen_copy(&self) -> Result<Self>
    where
        Self: Sized;

    /// Trainable copy of the parameters placed on `device`.
    ///
    /// The copy owns its own variables; keeping it in step with the original
    /// is the caller's job.
    fn replicate(&self, device: &Device) -> Result<Self>
    where
        Self: Sized,
    {
        bail!("This model cannot be replicated onto {:?}", device.location())
    }

    /// Autoregressively extend `input_ids` by up to `max_new_tokens` tokens.
    ///
    /// Returns the prompt followed by the generated tokens, shape
    /// `(batch, prompt_len + generated)`. Rows that emit end-of-sequence keep
    /// receiving `pad_token_id`; see [`GenerationConfig::early_stopping`].
    fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        let (batch, _) = input_ids.dims2()?;
        let device = input_ids.device().clone();
        let mut ids = input_ids.clone();
        let mut mask = attention_mask.clone();
        let mut finished = vec![false; batch];

        for _ in 0..config.max_new_tokens {
            let logits = self.forward(&ids, &mask)?.detach();
            let (_, seq, _) = logits.dims3()?;
            let last = logits
                .narrow(1, seq - 1, 1)?
                .squeeze(1)?
                .to_dtype(candle_core::DType::F32)?
                .to_vec2::<f32>()?;

            let mut next = Vec::with_capacity(batch);
            for (row, row_logits) in last.iter().enumerate() {
                if finished[row] {
                    next.push(config.pad_token_id);
                    continue;
                }
                let token = if config.do_sample {
                    sample_token(row_logits, config.temperature, rng)?
                } else {
                    argmax(row_logits)
                };
                if token == config.eos_token_id {
                    finished[row] = true;
                }
                next.push(token);
            }

            let next = Tensor::from_vec(next, (batch, 1), &device)?;
            let ones = Tensor::ones((batch, 1), mask.dtype(), &device)?;
            ids = Tensor::cat(&[&ids, &next], 1)?;
            mask = Tensor::cat(&[&mask, &ones], 1)?;

            if config.early_stopping && finished.iter().all(|f| *f) {
                break;
            }
        }

        Ok(ids)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0 as u32
}

/// Draw one token from `softmax(logits / temperature)`.
pub fn sample_token(logits: &[f32], temperature: f64, rng: &mut dyn RngCore) -> Result<u32> {
    if temperature <= 0.0 {
        bail!("Sampling temperature must be positive, got {temperature}");
    }
    let scaled: Vec<f64> = logits.iter().map(|&l| l as f64 / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = scaled.iter().map(|l| (l - max).exp()).collect();
    let dist = WeightedIndex::new(&weights)?;
    Ok(dist.sample(rng) as u32)
}

// ---------------------------------------------------------------------------
// Gradient scopes
// ---------------------------------------------------------------------------

/// Values whose tensors can be cut from the autograd graph.
pub trait Detach {
    fn detach_all(self) -> Self;
}

impl Detach for Tensor {
    fn detach_all(self) -> Self {
        self.detach()
    }
}

impl<T: Detach> Detach for Vec<T> {
    fn detach_all(self) -> Self {
        self.into_iter().map(Detach::detach_all).collect()
    }
}

impl<A: Detach, B: Detach> Detach for (A, B) {
    fn detach_all(self) -> Self {
        (self.0.detach_all(), self.1.detach_all())
    }
}

/// Run `f` as inference: every tensor it returns is detached, so nothing
/// computed inside can contribute to a later backward pass.
pub fn without_grad<T: Detach>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f().map(Detach::detach_all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Always predicts token `next` with overwhelming probability.
    struct Constant {
        vocab: usize,
        next: u32,
        device: Device,
    }

    impl CausalLm for Constant {
        fn forward(&self, input_ids: &Tensor, _mask: &Tensor) -> Result<Tensor> {
            let (b, t) = input_ids.dims2()?;
            let mut row = vec![-50f32; self.vocab];
            row[self.next as usize] = 50.0;
            let data: Vec<f32> = std::iter::repeat(row).take(b * t).flatten().collect();
            Ok(Tensor::from_vec(data, (b, t, self.vocab), &self.device)?)
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn trainable_vars(&self) -> Vec<Var> {
            Vec::new()
        }

        fn frozen_copy(&self) -> Result<Self> {
            Ok(Self {
                vocab: self.vocab,
                next: self.next,
                device: self.device.clone(),
            })
        }
    }

    fn gen_config(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens,
            do_sample: true,
            temperature: 1.0,
            pad_token_id: 0,
            eos_token_id: 3,
            early_stopping: true,
        }
    }

    #[test]
    fn test_generate_stops_when_all_rows_finish() {
        let model = Constant {
            vocab: 4,
            next: 3,
            device: Device::Cpu,
        };
        let ids = Tensor::new(&[[1u32, 2], [2, 1]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 2), candle_core::DType::U32, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let out = model.generate(&ids, &mask, &gen_config(5), &mut rng).unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3], vec![2, 1, 3]]);
    }

    #[test]
    fn test_generate_pads_to_budget_without_early_stopping() {
        let model = Constant {
            vocab: 4,
            next: 3,
            device: Device::Cpu,
        };
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 2), candle_core::DType::U32, &Device::Cpu).unwrap();
        let config = GenerationConfig {
            early_stopping: false,
            ..gen_config(4)
        };
        let mut rng = StdRng::seed_from_u64(7);
        let out = model.generate(&ids, &mask, &config, &mut rng).unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3, 0, 0, 0]]);
    }

    #[test]
    fn test_generate_respects_token_budget() {
        let model = Constant {
            vocab: 4,
            next: 2,
            device: Device::Cpu,
        };
        let ids = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 1), candle_core::DType::U32, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let out = model.generate(&ids, &mask, &gen_config(4), &mut rng).unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 2, 2, 2]]);
    }

    #[test]
    fn test_sample_token_rejects_zero_temperature() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_token(&[0.0, 1.0], 0.0, &mut rng).is_err());
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
    }
}
