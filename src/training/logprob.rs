//! Per-token log-probabilities of realised tokens.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};

use crate::model::CausalLm;

/// Log-probability each position assigned to its realised token.
///
/// `logits` is `(batch, seq, vocab)` and `input_ids` is `(batch, seq)`; the
/// result is `(batch, seq)` in `f32`. The log-softmax subtracts the row max
/// before exponentiating, so very unlikely tokens stay finite.
pub fn selective_log_softmax(logits: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let index = input_ids.to_dtype(DType::U32)?.contiguous()?.unsqueeze(2)?;
    Ok(log_probs.contiguous()?.gather(&index, 2)?.squeeze(2)?)
}

/// Log-probabilities of the last `logits_to_keep` tokens of each row.
///
/// Position `i` predicts token `i + 1`, so the final position's prediction is
/// dropped and the targets are the ids shifted left by one. Both are then
/// cut to their trailing `logits_to_keep` positions, which lines each kept
/// prediction up with the completion token it produced. Output shape is
/// `(batch, logits_to_keep)`.
pub fn compute_log_probs<M: CausalLm + ?Sized>(
    model: &M,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    logits_to_keep: usize,
) -> Result<Tensor> {
    let (_, seq) = input_ids.dims2()?;
    if logits_to_keep == 0 || logits_to_keep >= seq {
        bail!(
            "Cannot score the last {logits_to_keep} tokens of a length-{seq} sequence; \
             at least one context token must precede them"
        );
    }

    let logits = model.forward(input_ids, attention_mask)?;
    let shifted_len = seq - 1;
    let start = shifted_len - logits_to_keep;

    let logits = logits.narrow(1, 0, shifted_len)?.narrow(1, start, logits_to_keep)?;
    let targets = input_ids.narrow(1, 1, shifted_len)?.narrow(1, start, logits_to_keep)?;
    selective_log_softmax(&logits, &targets)
}
