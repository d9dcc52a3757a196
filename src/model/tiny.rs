//! A small trainable causal language model.
//!
//! Each position sees its own token embedding and the mask-weighted mean of
//! the embeddings at or before it, so padding never leaks into the context:
//!
//! ```text
//! e_t   = Embed(x_t)
//! c_t   = sum_{s<=t} m_s e_s / max(1, sum_{s<=t} m_s)
//! h_t   = tanh(W_mix [e_t ; c_t] + b_mix)
//! logit = W_head h_t + b_head
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::lm::CausalLm;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TinyLmConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
}

pub struct TinyCausalLm {
    embed: Embedding,
    mix: Linear,
    head: Linear,
    config: TinyLmConfig,
    device: Device,
    /// Backing store of trainable parameters; `None` for frozen copies.
    varmap: Option<VarMap>,
}

impl TinyCausalLm {
    /// Build a freshly initialised, trainable model on `device`.
    pub fn new(config: TinyLmConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut model = Self::load(vb, config, device)?;
        model.varmap = Some(varmap);
        Ok(model)
    }

    fn load(vb: VarBuilder, config: TinyLmConfig, device: &Device) -> Result<Self> {
        let embed = embedding(config.vocab_size, config.hidden_size, vb.pp("embed"))?;
        let mix = linear(2 * config.hidden_size, config.hidden_size, vb.pp("mix"))?;
        let head = linear(config.hidden_size, config.vocab_size, vb.pp("head"))?;
        Ok(Self {
            embed,
            mix,
            head,
            config,
            device: device.clone(),
            varmap: None,
        })
    }

    pub fn config(&self) -> TinyLmConfig {
        self.config
    }

    pub fn is_frozen(&self) -> bool {
        self.varmap.is_none()
    }

    /// Write the parameters to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        match &self.varmap {
            Some(varmap) => Ok(varmap.save(path)?),
            None => bail!("Frozen model copies cannot be checkpointed"),
        }
    }

    fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let varmap = self
            .varmap
            .as_ref()
            .ok_or_else(|| anyhow!("Model has no trainable parameter store"))?;
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("Parameter store lock poisoned"))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect()
    }
}

impl CausalLm for TinyCausalLm {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let emb = self.embed.forward(input_ids)?;

        // causal[t, s] = 1 for s <= t
        let causal: Vec<f32> = (0..seq)
            .flat_map(|t| (0..seq).map(move |s| if s <= t { 1.0 } else { 0.0 }))
            .collect();
        let causal = Tensor::from_vec(causal, (seq, seq), &self.device)?;
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(1)?;
        let weights = mask.broadcast_mul(&causal)?;
        let denom = weights.sum_keepdim(2)?;
        let denom = denom.maximum(&denom.ones_like()?)?;
        let context = weights.matmul(&emb)?.broadcast_div(&denom)?;

        let hidden = self.mix.forward(&Tensor::cat(&[&emb, &context], 2)?)?.tanh()?;
        Ok(self.head.forward(&hidden)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let Some(varmap) = &self.varmap else {
            return Vec::new();
        };
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut named: Vec<_> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, var)| var.clone()).collect()
    }

    fn frozen_copy(&self) -> Result<Self> {
        if self.is_frozen() {
            bail!("Cannot snapshot an already frozen model");
        }
        let tensors = self.named_tensors()?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &self.device);
        Self::load(vb, self.config, &self.device)
    }

    fn replicate(&self, device: &Device) -> Result<Self> {
        let tensors = self.named_tensors()?;
        let replica = Self::new(self.config, device)?;
        {
            let varmap = replica
                .varmap
                .as_ref()
                .ok_or_else(|| anyhow!("Fresh model has no trainable parameter store"))?;
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("Parameter store lock poisoned"))?;
            for (name, var) in data.iter() {
                let source = tensors
                    .get(name)
                    .ok_or_else(|| anyhow!("Parameter '{name}' missing from source model"))?;
                var.set(&source.to_device(device)?)?;
            }
        }
        Ok(replica)
    }
}
