//! Training examples and batch sampling.
//!
//! Samples arrive either as `{"prompt": .., "answer": ..}` objects or as
//! `[prompt, answer]` pairs. Both are resolved into [`Example`] once, when the
//! data is loaded, so nothing downstream inspects the representation again.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A training sample as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Mapping { prompt: String, answer: String },
    Pair(String, String),
}

/// A prompt with its reference answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub prompt: String,
    pub answer: String,
}

impl From<Sample> for Example {
    fn from(sample: Sample) -> Self {
        match sample {
            Sample::Mapping { prompt, answer } | Sample::Pair(prompt, answer) => {
                Self { prompt, answer }
            }
        }
    }
}

/// Parse examples from a JSON array or from JSON lines.
///
/// A leading `[` is ambiguous: it opens either a whole-file array or a first
/// `[prompt, answer]` record. The array reading is tried first and the
/// line-by-line reading is the fallback.
pub fn parse_examples(text: &str) -> Result<Vec<Example>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        if let Ok(samples) = serde_json::from_str::<Vec<Sample>>(trimmed) {
            return Ok(samples.into_iter().map(Example::from).collect());
        }
    }
    let samples = trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Sample>(line)
                .with_context(|| format!("Failed to parse sample on line {}", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(samples.into_iter().map(Example::from).collect())
}

/// Load examples from a `.json` or `.jsonl` file.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read training data from {}", path.display()))?;
    parse_examples(&text).with_context(|| format!("Invalid training data in {}", path.display()))
}

/// Draw `batch_size` distinct examples. Successive draws are independent, so
/// an example may reappear in a later batch.
pub fn sample_batch<R: Rng + ?Sized>(
    examples: &[Example],
    batch_size: usize,
    rng: &mut R,
) -> Result<Vec<Example>> {
    if batch_size == 0 {
        bail!("Cannot sample an empty batch");
    }
    if batch_size > examples.len() {
        bail!(
            "Batch size {batch_size} exceeds the {} available training examples",
            examples.len()
        );
    }
    Ok(examples
        .choose_multiple(rng, batch_size)
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_mixed_array() {
        let text = r#"[{"prompt": "2+2?", "answer": "4"}, ["3+3?", "6"]]"#;
        let examples = parse_examples(text).unwrap();
        assert_eq!(
            examples,
            vec![
                Example {
                    prompt: "2+2?".into(),
                    answer: "4".into()
                },
                Example {
                    prompt: "3+3?".into(),
                    answer: "6".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_jsonl_skips_blank_lines() {
        let text = "{\"prompt\": \"a\", \"answer\": \"b\"}\n\n[\"c\", \"d\"]\n";
        let examples = parse_examples(text).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].answer, "d");
    }

    #[test]
    fn test_parse_jsonl_of_pairs() {
        let examples = parse_examples("[\"a\", \"b\"]\n[\"c\", \"d\"]\n").unwrap();
        assert_eq!(
            examples,
            vec![
                Example {
                    prompt: "a".into(),
                    answer: "b".into()
                },
                Example {
                    prompt: "c".into(),
                    answer: "d".into()
                },
            ]
        );

        let single = parse_examples("[\"a\", \"b\"]\n").unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].prompt, "a");
    }

    #[test]
    fn test_parse_array_of_pairs() {
        let examples = parse_examples(r#"[["a", "b"], ["c", "d"]]"#).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].answer, "d");
    }

    #[test]
    fn test_parse_reports_line() {
        let err = parse_examples("[\"a\", \"b\"]x").unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
        let err = parse_examples("{\"prompt\": \"a\", \"answer\": \"b\"}\n{bad}").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn test_sample_batch_without_replacement() {
        let examples: Vec<Example> = (0..10)
            .map(|i| Example {
                prompt: format!("p{i}"),
                answer: i.to_string(),
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(3);
        let batch = sample_batch(&examples, 10, &mut rng).unwrap();
        let mut prompts: Vec<_> = batch.iter().map(|e| e.prompt.clone()).collect();
        prompts.sort();
        prompts.dedup();
        assert_eq!(prompts.len(), 10);
    }

    #[test]
    fn test_sample_batch_bounds() {
        let examples = vec![Example {
            prompt: "p".into(),
            answer: "a".into(),
        }];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_batch(&examples, 0, &mut rng).is_err());
        assert!(sample_batch(&examples, 2, &mut rng).is_err());
        assert_eq!(sample_batch(&examples, 1, &mut rng).unwrap().len(), 1);
    }
}
