//! Reward functions scoring sampled completions.
//!
//! The trainer treats rewards as an opaque callable: parallel lists of
//! prompts, chat-formatted completions and reference answers go in, one score
//! per row comes out. Any closure with that shape is a [`RewardFn`]; the
//! built-in scorers below let the CLI run without user code.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One chat message of a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Scores one completion per row; the output must have one entry per row,
/// in row order.
pub trait RewardFn {
    fn score(
        &self,
        prompts: &[String],
        completions: &[Vec<Message>],
        answers: &[String],
    ) -> Result<Vec<f32>>;
}

impl<F> RewardFn for F
where
    F: Fn(&[String], &[Vec<Message>], &[String]) -> Vec<f32>,
{
    fn score(
        &self,
        prompts: &[String],
        completions: &[Vec<Message>],
        answers: &[String],
    ) -> Result<Vec<f32>> {
        Ok(self(prompts, completions, answers))
    }
}

fn first_content(messages: &[Message]) -> &str {
    messages.first().map(|m| m.content.as_str()).unwrap_or("")
}

/// Rewards completions whose `<answer>` block matches the reference answer:
/// 2.0 for an exact match, 1.5 when both parse to the same number, else 0.
pub struct AnswerMatchReward {
    answer_block: Regex,
    number: Regex,
}

impl AnswerMatchReward {
    pub fn new() -> Result<Self> {
        Ok(Self {
            answer_block: Regex::new(r"(?s)<answer>(.*?)</answer>")?,
            number: Regex::new(r"-?\d+(?:\.\d+)?")?,
        })
    }

    /// Text of the last `<answer>...</answer>` block, trimmed.
    pub fn extract_answer<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.answer_block
            .captures_iter(text)
            .last()
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
    }

    /// The single number in `text`, if there is exactly one.
    pub fn extract_single_number(&self, text: &str) -> Option<f64> {
        let mut found = self.number.find_iter(text);
        let first = found.next()?;
        if found.next().is_some() {
            return None;
        }
        first.as_str().parse().ok()
    }

    fn score_one(&self, completion: &str, answer: &str) -> f32 {
        let Some(extracted) = self.extract_answer(completion) else {
            return 0.0;
        };
        let answer = answer.trim();
        if extracted == answer {
            return 2.0;
        }
        match (
            self.extract_single_number(extracted),
            self.extract_single_number(answer),
        ) {
            (Some(a), Some(b)) if (a - b).abs() < 1e-9 => 1.5,
            _ => 0.0,
        }
    }
}

impl RewardFn for AnswerMatchReward {
    fn score(
        &self,
        _prompts: &[String],
        completions: &[Vec<Message>],
        answers: &[String],
    ) -> Result<Vec<f32>> {
        Ok(completions
            .iter()
            .zip(answers)
            .map(|(c, a)| self.score_one(first_content(c), a))
            .collect())
    }
}

/// 0.2 for each reasoning/answer tag present in the completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatReward;

impl FormatReward {
    const TAGS: [&'static str; 4] = ["<reasoning>", "</reasoning>", "<answer>", "</answer>"];
}

impl RewardFn for FormatReward {
    fn score(
        &self,
        _prompts: &[String],
        completions: &[Vec<Message>],
        _answers: &[String],
    ) -> Result<Vec<f32>> {
        Ok(completions
            .iter()
            .map(|c| {
                let text = first_content(c);
                Self::TAGS.iter().filter(|t| text.contains(*t)).count() as f32 * 0.2
            })
            .collect())
    }
}

/// Row-wise sum of several reward functions.
pub struct CombinedReward {
    parts: Vec<Box<dyn RewardFn>>,
}

impl CombinedReward {
    pub fn new(parts: Vec<Box<dyn RewardFn>>) -> Self {
        Self { parts }
    }
}

impl RewardFn for CombinedReward {
    fn score(
        &self,
        prompts: &[String],
        completions: &[Vec<Message>],
        answers: &[String],
    ) -> Result<Vec<f32>> {
        let mut total = vec![0.0; completions.len()];
        for part in &self.parts {
            for (t, s) in total.iter_mut().zip(part.score(prompts, completions, answers)?) {
                *t += s;
            }
        }
        Ok(total)
    }
}
