//! Group-relative advantage estimation.
//!
//! Rewards are standardised within each prompt's generation group rather
//! than across the whole batch:
//!
//!   A_i = (R_i - mean(R_group)) / (std(R_group) + 1e-4)
//!
//! The additive constant keeps groups with identical rewards (std = 0) at an
//! advantage of exactly zero instead of NaN.

use anyhow::{bail, Result};

/// Added to the group standard deviation before dividing.
pub const ADVANTAGE_EPS: f32 = 1e-4;

/// Mean and sample standard deviation (Bessel-corrected) of one group.
///
/// A group of one has no spread, so its standard deviation is 0.
pub fn group_stats(rewards: &[f32]) -> (f32, f32) {
    if rewards.is_empty() {
        return (0.0, 0.0);
    }
    let n = rewards.len() as f32;
    let mean = rewards.iter().sum::<f32>() / n;
    if rewards.len() < 2 {
        return (mean, 0.0);
    }
    let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// Standardise `rewards` within consecutive groups of `group_size` rows.
///
/// # Errors
///
/// Fails when `group_size` is zero or does not divide the number of rewards.
pub fn compute_group_advantages(rewards: &[f32], group_size: usize) -> Result<Vec<f32>> {
    if group_size == 0 {
        bail!("Group size must be at least 1");
    }
    if rewards.len() % group_size != 0 {
        bail!(
            "{} rewards cannot be split into groups of {group_size}",
            rewards.len()
        );
    }

    let mut advantages = Vec::with_capacity(rewards.len());
    for group in rewards.chunks(group_size) {
        let (mean, std) = group_stats(group);
        advantages.extend(group.iter().map(|r| (r - mean) / (std + ADVANTAGE_EPS)));
    }
    Ok(advantages)
}
