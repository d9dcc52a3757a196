//! Tokenizer seam used by rollout generation.
//!
//! The trainer only needs to encode prompts into padded id batches, decode
//! completions back to text, and know the pad / end-of-sequence ids. Two
//! implementations are provided: a dependency-free byte-level tokenizer and an
//! adapter over a Hugging Face `tokenizer.json`.

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Tensor};

/// Which side of a sequence receives padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    Right,
}

/// A batch of token sequences padded to a common width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl PaddedBatch {
    /// Pad `sequences` to the longest one with `pad_id`.
    pub fn from_sequences(sequences: Vec<Vec<u32>>, pad_id: u32, side: PaddingSide) -> Self {
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(sequences.len());
        let mut attention_mask = Vec::with_capacity(sequences.len());

        for seq in sequences {
            let pad = width - seq.len();
            let mut ids = Vec::with_capacity(width);
            let mut mask = Vec::with_capacity(width);
            match side {
                PaddingSide::Left => {
                    ids.extend(std::iter::repeat(pad_id).take(pad));
                    mask.extend(std::iter::repeat(0).take(pad));
                    mask.extend(std::iter::repeat(1).take(seq.len()));
                    ids.extend(seq);
                }
                PaddingSide::Right => {
                    mask.extend(std::iter::repeat(1).take(seq.len()));
                    mask.extend(std::iter::repeat(0).take(pad));
                    ids.extend(seq);
                    ids.extend(std::iter::repeat(pad_id).take(pad));
                }
            }
            input_ids.push(ids);
            attention_mask.push(mask);
        }

        Self {
            input_ids,
            attention_mask,
        }
    }

    /// Number of sequences in the batch.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Padded width shared by every row.
    pub fn width(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    /// Materialise `(input_ids, attention_mask)` as `u32` tensors of shape `(batch, width)`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.len(), self.width());
        let ids = Tensor::from_vec(self.input_ids.concat(), shape, device)?;
        let mask = Tensor::from_vec(self.attention_mask.concat(), shape, device)?;
        Ok((ids, mask))
    }
}

/// Text <-> token id conversion.
pub trait TextTokenizer: Send + Sync {
    /// Encode a single text without special tokens or padding.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids back to text, optionally dropping special tokens.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn pad_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;

    /// Encode a list of texts into a padded batch.
    fn encode_batch(&self, texts: &[String], side: PaddingSide) -> Result<PaddedBatch> {
        let sequences = texts
            .iter()
            .map(|t| self.encode(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(PaddedBatch::from_sequences(
            sequences,
            self.pad_token_id(),
            side,
        ))
    }
}

impl<T: TextTokenizer + ?Sized> TextTokenizer for Box<T> {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self).decode(ids, skip_special_tokens)
    }

    fn pad_token_id(&self) -> u32 {
        (**self).pad_token_id()
    }

    fn eos_token_id(&self) -> u32 {
        (**self).eos_token_id()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }
}

// ---------------------------------------------------------------------------
// Byte-level tokenizer
// ---------------------------------------------------------------------------

/// Maps every UTF-8 byte to its own id, with two special tokens appended.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: u32 = 256;
    pub const EOS: u32 = 257;

    pub fn new() -> Self {
        Self
    }
}

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::new();
        let mut bytes = Vec::new();
        for &id in ids {
            match id {
                0..=255 => bytes.push(id as u8),
                Self::PAD | Self::EOS => {
                    if !skip_special_tokens {
                        out.push_str(&String::from_utf8_lossy(&bytes));
                        bytes.clear();
                        out.push_str(if id == Self::PAD { "<pad>" } else { "<eos>" });
                    }
                }
                other => bail!("Token id {other} is outside the byte vocabulary"),
            }
        }
        out.push_str(&String::from_utf8_lossy(&bytes));
        Ok(out)
    }

    fn pad_token_id(&self) -> u32 {
        Self::PAD
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }

    fn vocab_size(&self) -> usize {
        258
    }
}

// ---------------------------------------------------------------------------
// Hugging Face tokenizer adapter
// ---------------------------------------------------------------------------

/// Adapter over a `tokenizers` tokenizer loaded from `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    /// Load a tokenizer file and resolve its special tokens.
    ///
    /// When `pad_token` is absent (or unknown to the vocabulary) the
    /// end-of-sequence token doubles as padding.
    pub fn from_file(
        path: impl AsRef<Path>,
        eos_token: &str,
        pad_token: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {e}", path.display()))?;
        let eos_id = inner
            .token_to_id(eos_token)
            .ok_or_else(|| anyhow!("End-of-sequence token '{eos_token}' not in vocabulary"))?;
        let pad_id = pad_token
            .and_then(|t| inner.token_to_id(t))
            .unwrap_or(eos_id);
        Ok(Self {
            inner,
            pad_id,
            eos_id,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Detokenization failed: {e}"))
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_padding() {
        let batch = PaddedBatch::from_sequences(vec![vec![1, 2, 3], vec![4]], 0, PaddingSide::Left);
        assert_eq!(batch.input_ids, vec![vec![1, 2, 3], vec![0, 0, 4]]);
        assert_eq!(batch.attention_mask, vec![vec![1, 1, 1], vec![0, 0, 1]]);
        assert_eq!(batch.width(), 3);
    }

    #[test]
    fn test_right_padding() {
        let batch =
            PaddedBatch::from_sequences(vec![vec![7], vec![8, 9]], 5, PaddingSide::Right);
        assert_eq!(batch.input_ids, vec![vec![7, 5], vec![8, 9]]);
        assert_eq!(batch.attention_mask, vec![vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn test_to_tensors_shape() {
        let batch = PaddedBatch::from_sequences(vec![vec![1, 2], vec![3]], 0, PaddingSide::Left);
        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 2]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![1, 1], vec![0, 1]]);
    }

    #[test]
    fn test_byte_tokenizer_roundtrip_skips_specials() {
        let tok = ByteTokenizer::new();
        let mut ids = tok.encode("hi!").unwrap();
        ids.push(ByteTokenizer::EOS);
        ids.push(ByteTokenizer::PAD);
        assert_eq!(tok.decode(&ids, true).unwrap(), "hi!");
        assert_eq!(tok.decode(&ids, false).unwrap(), "hi!<eos><pad>");
    }

    #[test]
    fn test_byte_tokenizer_rejects_unknown_id() {
        assert!(ByteTokenizer::new().decode(&[999], true).is_err());
    }

    #[test]
    fn test_encode_batch_uses_pad_id() {
        let tok = ByteTokenizer::new();
        let batch = tok
            .encode_batch(&["ab".to_string(), "c".to_string()], PaddingSide::Left)
            .unwrap();
        assert_eq!(batch.input_ids[1][0], ByteTokenizer::PAD);
        assert_eq!(batch.input_ids[1][1], u32::from(b'c'));
    }
}
