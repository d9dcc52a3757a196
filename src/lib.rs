//! GRPO: Group Relative Policy Optimization for causal language models.
//!
//! Fine-tunes a policy model against a scalar reward function. Completions are
//! sampled in groups per prompt, rewards are normalised within each group to
//! form advantages, and the policy is updated with a clipped surrogate
//! objective plus a KL penalty towards a frozen reference snapshot.

pub mod config;
pub mod data;
pub mod model;
pub mod reward;
pub mod training;
