//! Rollout generation.
//!
//! A rollout samples `num_generations` completions for every prompt in a
//! batch and snapshots the old-policy and reference log-probabilities of the
//! completion tokens. Rows are grouped contiguously by prompt:
//!
//! ```text
//! row 0 .. G-1     -> prompt 0
//! row G .. 2G-1    -> prompt 1
//! ...
//! ```
//!
//! Everything here runs inside [`without_grad`]; the resulting
//! [`RolloutBatch`] is a frozen snapshot reused by up to `mu` loss steps.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use rand::RngCore;
use tracing::debug;

use crate::data::Example;
use crate::model::{without_grad, CausalLm, Detach, GenerationConfig, PaddingSide, TextTokenizer};
use crate::reward::Message;

use super::logprob::compute_log_probs;

/// Validity mask for one completion row: ones up to and including the first
/// `eos_token_id`, zeros after it; all ones when the row has no terminator.
pub fn completion_mask_row(ids: &[u32], eos_token_id: u32) -> Vec<u32> {
    let cut = ids
        .iter()
        .position(|&t| t == eos_token_id)
        .map_or(ids.len(), |i| i + 1);
    (0..ids.len()).map(|j| u32::from(j < cut)).collect()
}

/// Apply [`completion_mask_row`] to every row of a `(batch, len)` id tensor.
pub fn create_completion_mask(completion_ids: &Tensor, eos_token_id: u32) -> Result<Tensor> {
    let (batch, len) = completion_ids.dims2()?;
    let rows = completion_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let mask: Vec<u32> = rows
        .iter()
        .flat_map(|row| completion_mask_row(row, eos_token_id))
        .collect();
    Ok(Tensor::from_vec(mask, (batch, len), completion_ids.device())?)
}

/// Prompt and completion tensors for `batch * num_generations` rows.
#[derive(Debug, Clone)]
pub struct Completions {
    pub prompt_ids: Tensor,
    pub prompt_mask: Tensor,
    pub completion_ids: Tensor,
    pub completion_mask: Tensor,
}

impl Detach for Completions {
    fn detach_all(self) -> Self {
        Self {
            prompt_ids: self.prompt_ids.detach(),
            prompt_mask: self.prompt_mask.detach(),
            completion_ids: self.completion_ids.detach(),
            completion_mask: self.completion_mask.detach(),
        }
    }
}

/// Row indices `[0, 0, .., 1, 1, ..]` repeating each of `rows` `times` times.
fn repeat_interleave_index(rows: usize, times: usize) -> Vec<u32> {
    (0..rows as u32)
        .flat_map(|r| std::iter::repeat(r).take(times))
        .collect()
}

/// Sample `num_generations` completions per prompt from `model`.
pub fn generate_completions<M, T>(
    model: &M,
    tokenizer: &T,
    prompts: &[String],
    num_generations: usize,
    max_completion_length: usize,
    rng: &mut dyn RngCore,
) -> Result<Completions>
where
    M: CausalLm + ?Sized,
    T: TextTokenizer + ?Sized,
{
    if prompts.is_empty() {
        bail!("Cannot generate completions for an empty prompt batch");
    }
    if num_generations == 0 {
        bail!("num_generations must be at least 1");
    }

    without_grad(|| {
        let encoded = tokenizer.encode_batch(prompts, PaddingSide::Left)?;
        let prompt_len = encoded.width();
        if prompt_len == 0 {
            bail!("Every prompt encoded to zero tokens");
        }
        let (prompt_ids, prompt_mask) = encoded.to_tensors(model.device())?;

        let index = Tensor::from_vec(
            repeat_interleave_index(prompts.len(), num_generations),
            prompts.len() * num_generations,
            model.device(),
        )?;
        let prompt_ids = prompt_ids.index_select(&index, 0)?;
        let prompt_mask = prompt_mask.index_select(&index, 0)?;

        let config = GenerationConfig {
            max_new_tokens: max_completion_length,
            do_sample: true,
            temperature: 1.0,
            pad_token_id: tokenizer.pad_token_id(),
            eos_token_id: tokenizer.eos_token_id(),
            early_stopping: false,
        };
        let outputs = model.generate(&prompt_ids, &prompt_mask, &config, rng)?;
        let (_, total_len) = outputs.dims2()?;
        let completion_ids = outputs.narrow(1, prompt_len, total_len - prompt_len)?;
        let completion_mask = create_completion_mask(&completion_ids, tokenizer.eos_token_id())?;

        debug!(
            rows = prompts.len() * num_generations,
            prompt_len,
            completion_len = total_len - prompt_len,
            "Sampled completions"
        );

        Ok(Completions {
            prompt_ids,
            prompt_mask,
            completion_ids,
            completion_mask,
        })
    })
}

/// Snapshot of one rollout, consumed by the GRPO loss.
#[derive(Debug, Clone)]
pub struct RolloutBatch {
    /// Prompt followed by completion, `(rows, prompt_len + completion_len)`.
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    /// `(rows, completion_len)`, see [`completion_mask_row`].
    pub completion_mask: Tensor,
    /// Completion log-probabilities under the policy at rollout time.
    pub old_log_probs: Tensor,
    /// Completion log-probabilities under the reference model.
    pub ref_log_probs: Tensor,
    pub formatted_completions: Vec<Vec<Message>>,
    pub repeated_prompts: Vec<String>,
    pub repeated_answers: Vec<String>,
    /// Completion length: the number of trailing positions scored.
    pub logits_to_keep: usize,
    /// Number of prompt groups.
    pub batch_size: usize,
    pub num_generations: usize,
}

impl RolloutBatch {
    /// Rows in the flattened generation axis, `batch_size * num_generations`.
    pub fn num_rows(&self) -> usize {
        self.batch_size * self.num_generations
    }
}

impl Detach for RolloutBatch {
    fn detach_all(self) -> Self {
        Self {
            input_ids: self.input_ids.detach(),
            attention_mask: self.attention_mask.detach(),
            completion_mask: self.completion_mask.detach(),
            old_log_probs: self.old_log_probs.detach(),
            ref_log_probs: self.ref_log_probs.detach(),
            ..self
        }
    }
}

/// Generate completions for `batch` and snapshot everything the loss needs.
#[allow(clippy::too_many_arguments)]
pub fn generate_rollout_data<P, R, T>(
    policy: &P,
    reference: &R,
    tokenizer: &T,
    batch: &[Example],
    num_generations: usize,
    max_completion_length: usize,
    rng: &mut dyn RngCore,
) -> Result<RolloutBatch>
where
    P: CausalLm + ?Sized,
    R: CausalLm + ?Sized,
    T: TextTokenizer + ?Sized,
{
    let prompts: Vec<String> = batch.iter().map(|e| e.prompt.clone()).collect();
    let answers: Vec<String> = batch.iter().map(|e| e.answer.clone()).collect();

    without_grad(|| {
        let completions = generate_completions(
            policy,
            tokenizer,
            &prompts,
            num_generations,
            max_completion_length,
            rng,
        )
        .context("Completion sampling failed")?;

        let input_ids = Tensor::cat(&[&completions.prompt_ids, &completions.completion_ids], 1)?;
        let attention_mask =
            Tensor::cat(&[&completions.prompt_mask, &completions.completion_mask], 1)?;
        let (_, logits_to_keep) = completions.completion_ids.dims2()?;
        if logits_to_keep == 0 {
            bail!("Generation produced no completion tokens");
        }

        let old_log_probs =
            compute_log_probs(policy, &input_ids, &attention_mask, logits_to_keep)?;
        let ref_log_probs =
            compute_log_probs(reference, &input_ids, &attention_mask, logits_to_keep)?;

        let formatted_completions = completions
            .completion_ids
            .to_vec2::<u32>()?
            .iter()
            .map(|row| Ok(vec![Message::new(tokenizer.decode(row, true)?)]))
            .collect::<Result<Vec<_>>>()?;

        let repeat = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .flat_map(|s| std::iter::repeat(s.clone()).take(num_generations))
                .collect()
        };

        Ok(RolloutBatch {
            input_ids,
            attention_mask,
            completion_mask: completions.completion_mask,
            old_log_probs,
            ref_log_probs,
            formatted_completions,
            repeated_prompts: repeat(&prompts),
            repeated_answers: repeat(&answers),
            logits_to_keep,
            batch_size: prompts.len(),
            num_generations,
        })
    })
}
