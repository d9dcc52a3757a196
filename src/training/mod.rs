//! GRPO training.
//!
//! This module implements the rollout / loss / update cycle of Group Relative
//! Policy Optimization: completions are sampled in groups per prompt, rewards
//! are standardised within each group, and the policy is updated with a
//! clipped importance-ratio objective plus a KL penalty towards a periodically
//! refreshed reference model.

pub mod advantage;
pub mod grpo;
pub mod logprob;
pub mod metrics;
pub mod rollout;
pub mod trainer;

pub use advantage::{compute_group_advantages, group_stats};
pub use grpo::{clipped_surrogate, grpo_loss, grpo_objective, kl_penalty, GrpoLossOutput};
pub use logprob::{compute_log_probs, selective_log_softmax};
pub use metrics::{FanoutSink, JsonlSink, MemorySink, MetricsSink, StepRecord, TracingSink};
pub use rollout::{
    create_completion_mask, generate_completions, generate_rollout_data, Completions,
    RolloutBatch,
};
pub use trainer::{clip_grad_norm, GrpoTrainer};
