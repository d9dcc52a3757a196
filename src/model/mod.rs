//! Model and tokenizer seams for the GRPO trainer.
//!
//! This module provides:
//! - [`lm::CausalLm`] -- the policy/reference interface (forward, sampling,
//!   frozen snapshots) and the [`lm::without_grad`] inference scope.
//! - [`parallel::DataParallel`] -- row-sharded replication of a policy.
//! - [`tiny::TinyCausalLm`] -- a small built-in trainable causal LM.
//! - [`tokenizer`] -- the tokenizer interface with byte-level and
//!   Hugging Face implementations.

pub mod lm;
pub mod parallel;
pub mod tiny;
pub mod tokenizer;

pub use lm::{without_grad, CausalLm, Detach, GenerationConfig};
pub use parallel::DataParallel;
pub use tiny::{TinyCausalLm, TinyLmConfig};
pub use tokenizer::{ByteTokenizer, HfTokenizer, PaddedBatch, PaddingSide, TextTokenizer};
