//! GRPO loss.
//!
//! For every completion token, with ratio r = exp(log pi_theta - log pi_old)
//! and group-relative advantage A:
//!
//!   surrogate = min(r * A, clip(r, 1 - eps, 1 + eps) * A)
//!   kl        = exp(log pi_ref - log pi_theta) - (log pi_ref - log pi_theta) - 1
//!   per_token = surrogate - beta * kl
//!
//! and the scalar loss is the negated mean over rows of each row's masked
//! per-token mean:
//!
//!   loss = -mean_i( sum_t(per_token * mask) / max(1, sum_t(mask)) )

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::model::CausalLm;
use crate::reward::RewardFn;

use super::advantage::compute_group_advantages;
use super::logprob::compute_log_probs;
use super::rollout::RolloutBatch;

/// Output of one GRPO loss evaluation.
#[derive(Debug, Clone)]
pub struct GrpoLossOutput {
    /// Scalar loss; the only tensor in the system that carries gradients.
    pub loss: Tensor,
    /// Mean raw reward over all rows.
    pub average_reward: f32,
    /// Mean per-token KL estimate over valid tokens.
    pub mean_kl: f32,
    /// Fraction of valid tokens whose ratio fell outside the clip range.
    pub clip_fraction: f32,
}

/// Per-token `min(r * A, clip(r, 1 - eps, 1 + eps) * A)`.
///
/// `ratio` is `(rows, len)` and `advantages` is `(rows, 1)`.
pub fn clipped_surrogate(ratio: &Tensor, advantages: &Tensor, epsilon: f64) -> Result<Tensor> {
    let low = Tensor::full((1.0 - epsilon) as f32, ratio.dims(), ratio.device())?;
    let high = Tensor::full((1.0 + epsilon) as f32, ratio.dims(), ratio.device())?;
    let clipped = ratio.maximum(&low)?.minimum(&high)?;
    let surr1 = ratio.broadcast_mul(advantages)?;
    let surr2 = clipped.broadcast_mul(advantages)?;
    Ok(surr1.minimum(&surr2)?)
}

/// Per-token `exp(ref - cur) - (ref - cur) - 1`: non-negative, zero where the
/// two log-probabilities agree.
pub fn kl_penalty(ref_log_probs: &Tensor, log_probs: &Tensor) -> Result<Tensor> {
    let diff = (ref_log_probs - log_probs)?;
    Ok(((diff.exp()? - &diff)? - 1.0)?)
}

/// Combine the per-token terms into the scalar loss.
///
/// All tensors are `(rows, len)` except `advantages`, which is `(rows, 1)`.
/// Rows whose mask is all zeros contribute 0 rather than dividing by zero.
pub fn grpo_objective(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    ref_log_probs: &Tensor,
    advantages: &Tensor,
    completion_mask: &Tensor,
    beta: f64,
    epsilon: f64,
) -> Result<Tensor> {
    let ratio = (log_probs - old_log_probs)?.exp()?;
    let surrogate = clipped_surrogate(&ratio, advantages, epsilon)?;
    let kl = kl_penalty(ref_log_probs, log_probs)?;
    let per_token = (surrogate - (kl * beta)?)?;

    let mask = completion_mask.to_dtype(DType::F32)?;
    let token_counts = mask.sum(1)?;
    let token_counts = token_counts.maximum(&token_counts.ones_like()?)?;
    let row_means = (per_token * &mask)?.sum(1)?.broadcast_div(&token_counts)?;
    Ok(row_means.mean_all()?.neg()?)
}

/// Mean of `values` over positions where `mask` is set.
fn masked_mean(values: &[Vec<f32>], mask: &[Vec<f32>]) -> f32 {
    let (sum, count) = values
        .iter()
        .flatten()
        .zip(mask.iter().flatten())
        .filter(|(_, m)| **m > 0.0)
        .fold((0.0f32, 0usize), |(s, c), (v, _)| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Evaluate the GRPO loss of `policy` on a rollout.
///
/// Recomputes the completion log-probabilities with gradient tracking, scores
/// each row with `reward_fn`, and combines everything via [`grpo_objective`].
///
/// # Errors
///
/// Fails when the reward function does not return exactly one score per row.
pub fn grpo_loss<M, F>(
    policy: &M,
    rollout: &RolloutBatch,
    reward_fn: &F,
    beta: f64,
    epsilon: f64,
) -> Result<GrpoLossOutput>
where
    M: CausalLm + ?Sized,
    F: RewardFn + ?Sized,
{
    let device = policy.device();
    let log_probs = compute_log_probs(
        policy,
        &rollout.input_ids,
        &rollout.attention_mask,
        rollout.logits_to_keep,
    )?;

    let rewards = reward_fn
        .score(
            &rollout.repeated_prompts,
            &rollout.formatted_completions,
            &rollout.repeated_answers,
        )
        .context("Reward function failed")?;
    let rows = rollout.num_rows();
    if rewards.len() != rows {
        bail!(
            "Reward function returned {} scores for {rows} completion rows",
            rewards.len()
        );
    }
    let average_reward = rewards.iter().sum::<f32>() / rows as f32;

    let advantages = compute_group_advantages(&rewards, rollout.num_generations)?;
    let advantages = Tensor::from_vec(advantages, (rows, 1), device)?;

    let loss = grpo_objective(
        &log_probs,
        &rollout.old_log_probs,
        &rollout.ref_log_probs,
        &advantages,
        &rollout.completion_mask,
        beta,
        epsilon,
    )?;

    let (mean_kl, clip_fraction) = {
        let log_probs = log_probs.detach();
        let mask = rollout.completion_mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let kl = kl_penalty(&rollout.ref_log_probs, &log_probs)?.to_vec2::<f32>()?;
        let ratio = (&log_probs - &rollout.old_log_probs)?.exp()?.to_vec2::<f32>()?;
        let (low, high) = ((1.0 - epsilon) as f32, (1.0 + epsilon) as f32);
        let clipped: Vec<Vec<f32>> = ratio
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&r| if r < low || r > high { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        (masked_mean(&kl, &mask), masked_mean(&clipped, &mask))
    };

    debug!(
        average_reward,
        mean_kl, clip_fraction, "GRPO loss computed for {rows} rows"
    );

    Ok(GrpoLossOutput {
        loss,
        average_reward,
        mean_kl,
        clip_fraction,
    })
}
