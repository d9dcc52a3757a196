//! Per-step training records and the sinks that receive them.
//!
//! A sink failing never stops training: the trainer logs the error and moves
//! on to the next step.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One record per inner GRPO iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Identifier shared by every record of one training run.
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// Outer iteration (1-indexed).
    pub iteration: usize,
    /// Rollout step within the iteration (1-indexed).
    pub step: usize,
    /// Gradient step on the current rollout (1-indexed).
    pub grpo_iteration: usize,
    pub loss: f32,
    pub average_reward: f32,
    pub mean_kl: f32,
    pub clip_fraction: f32,
    /// Global gradient norm before clipping.
    pub grad_norm: f32,
}

/// Destination for training records.
pub trait MetricsSink {
    fn record(&mut self, record: &StepRecord) -> Result<()>;
}

/// Emits each record as a structured `info` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, r: &StepRecord) -> Result<()> {
        info!(
            iteration = r.iteration,
            step = r.step,
            grpo_iteration = r.grpo_iteration,
            loss = format!("{:.4}", r.loss),
            average_reward = format!("{:.2}", r.average_reward),
            kl = r.mean_kl,
            clip_fraction = r.clip_fraction,
            grad_norm = r.grad_norm,
            "GRPO step"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<StepRecord>,
}

impl MetricsSink for MemorySink {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Forwards each record to several sinks, reporting the first failure after
/// all of them have been tried.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutSink {
    fn record(&mut self, record: &StepRecord) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.record(record) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
