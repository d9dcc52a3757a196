//! Data-parallel replication of a causal LM.
//!
//! The wrapped module is the primary copy and lives on the first device.
//! Every other device holds a trainable replica. A forward pass splits the
//! batch into contiguous row shards, runs shard `i` on device `i` in a scoped
//! worker thread, moves the logits back to the primary device and
//! concatenates them in row order.
//!
//! One backward pass through the concatenation therefore deposits gradients
//! on every replica's own variables. [`DataParallel::reduce_gradients`] sums
//! them into the primary's entries of the [`GradStore`], and after the
//! optimizer has stepped the primary, [`DataParallel::sync_replicas`] copies
//! the new parameters back out.

use anyhow::{anyhow, bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use tracing::debug;

use super::lm::CausalLm;

pub struct DataParallel<M> {
    module: M,
    /// One replica per device after the first, in device order.
    replicas: Vec<M>,
    devices: Vec<Device>,
}

impl<M: CausalLm> DataParallel<M> {
    /// Replicate `module` across `devices`.
    ///
    /// `devices[0]` must be where `module`'s parameters live; a replica is
    /// created on each remaining device.
    ///
    /// # Errors
    ///
    /// Fails when fewer than two devices are given, when the first device is
    /// not the module's device, or when the module cannot be replicated.
    pub fn new(module: M, devices: Vec<Device>) -> Result<Self> {
        if devices.len() < 2 {
            bail!(
                "Data-parallel training needs at least 2 compute devices, got {}",
                devices.len()
            );
        }
        if !devices[0].same_device(module.device()) {
            bail!(
                "The first device ({:?}) must hold the policy parameters, which live on {:?}",
                devices[0].location(),
                module.device().location()
            );
        }

        let primary_vars = module.trainable_vars().len();
        let mut replicas = Vec::with_capacity(devices.len() - 1);
        for (i, device) in devices.iter().enumerate().skip(1) {
            let replica = module.replicate(device)?;
            if replica.trainable_vars().len() != primary_vars {
                bail!(
                    "Replica {i} has {} parameters, the primary has {primary_vars}",
                    replica.trainable_vars().len()
                );
            }
            replicas.push(replica);
        }
        debug!(replicas = devices.len(), "Replicated policy");

        Ok(Self {
            module,
            replicas,
            devices,
        })
    }

    /// Number of devices the policy runs on, primary included.
    pub fn num_replicas(&self) -> usize {
        self.devices.len()
    }

    /// The wrapped module.
    pub fn module(&self) -> &M {
        &self.module
    }

    /// Unwrap, dropping the replicas.
    pub fn into_inner(self) -> M {
        self.module
    }

    fn replica(&self, index: usize) -> &M {
        match index {
            0 => &self.module,
            i => &self.replicas[i - 1],
        }
    }

    /// Sum every replica's gradients into the primary's entries of `grads`.
    ///
    /// Replica gradients are moved to the primary device first. Variables no
    /// shard touched are left out.
    pub fn reduce_gradients(&self, grads: &mut GradStore) -> Result<()> {
        let replica_vars: Vec<Vec<Var>> =
            self.replicas.iter().map(CausalLm::trainable_vars).collect();
        let primary = self.module.device();

        for (idx, var) in self.module.trainable_vars().iter().enumerate() {
            let mut total = grads.get(var.as_tensor()).cloned();
            for vars in &replica_vars {
                let Some(grad) = grads.get(vars[idx].as_tensor()) else {
                    continue;
                };
                let grad = grad.to_device(primary)?;
                total = Some(match total {
                    Some(t) => (t + grad)?,
                    None => grad,
                });
            }
            if let Some(total) = total {
                grads.insert(var.as_tensor(), total);
            }
        }
        Ok(())
    }

    /// Copy the primary's parameters onto every replica.
    pub fn sync_replicas(&self) -> Result<()> {
        let primary_vars = self.module.trainable_vars();
        for replica in &self.replicas {
            for (src, dst) in primary_vars.iter().zip(replica.trainable_vars()) {
                dst.set(&src.as_tensor().to_device(dst.device())?)?;
            }
        }
        Ok(())
    }
}

/// Split `rows` into at most `parts` contiguous, near-equal `(start, len)` ranges.
fn shard_ranges(rows: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.min(rows).max(1);
    let base = rows / parts;
    let extra = rows % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = (start, len);
            start += len;
            range
        })
        .filter(|(_, len)| *len > 0)
        .collect()
}

impl<M: CausalLm> CausalLm for DataParallel<M> {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (rows, _) = input_ids.dims2()?;
        let ranges = shard_ranges(rows, self.devices.len());
        if ranges.len() <= 1 {
            return self.module.forward(input_ids, attention_mask);
        }
        debug!(rows, shards = ranges.len(), "Scattering forward pass");

        let primary = self.module.device();
        let outputs: Vec<Result<Tensor>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .enumerate()
                .map(|(i, &(start, len))| {
                    let replica = self.replica(i);
                    scope.spawn(move || -> Result<Tensor> {
                        let device = replica.device();
                        let ids = input_ids.narrow(0, start, len)?.to_device(device)?;
                        let mask = attention_mask.narrow(0, start, len)?.to_device(device)?;
                        Ok(replica.forward(&ids, &mask)?.to_device(primary)?)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow!("Replica worker panicked")))
                })
                .collect()
        });

        let shards = outputs.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&shards, 0)?)
    }

    fn device(&self) -> &Device {
        self.module.device()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.module.trainable_vars()
    }

    fn frozen_copy(&self) -> Result<Self> {
        bail!("Snapshot the wrapped module instead of the data-parallel wrapper")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tiny::{TinyCausalLm, TinyLmConfig};
    use candle_core::DType;

    fn tiny() -> TinyCausalLm {
        TinyCausalLm::new(
            TinyLmConfig {
                vocab_size: 9,
                hidden_size: 6,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_requires_two_devices() {
        let err = DataParallel::new(tiny(), vec![Device::Cpu]).err().unwrap();
        assert!(err.to_string().contains("at least 2"));
        assert!(DataParallel::new(tiny(), vec![]).is_err());

        let dp = DataParallel::new(tiny(), vec![Device::Cpu, Device::Cpu]).unwrap();
        assert_eq!(dp.num_replicas(), 2);
        assert_eq!(dp.replicas.len(), 1);
    }

    #[test]
    fn test_frozen_module_cannot_be_replicated() {
        let frozen = tiny().frozen_copy().unwrap();
        assert!(DataParallel::new(frozen, vec![Device::Cpu, Device::Cpu]).is_err());
    }

    #[test]
    fn test_shard_ranges() {
        assert_eq!(shard_ranges(5, 2), vec![(0, 3), (3, 2)]);
        assert_eq!(shard_ranges(1, 4), vec![(0, 1)]);
        assert_eq!(shard_ranges(6, 3), vec![(0, 2), (2, 2), (4, 2)]);
        assert!(shard_ranges(0, 2).is_empty());
    }

    #[test]
    fn test_forward_matches_unwrapped() {
        let dp = DataParallel::new(tiny(), vec![Device::Cpu; 3]).unwrap();
        let ids = Tensor::new(&[[1u32, 2], [3, 4], [5, 6], [7, 8], [0, 1]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((5, 2), DType::U32, &Device::Cpu).unwrap();
        let sharded = dp.forward(&ids, &mask).unwrap();
        let direct = dp.module().forward(&ids, &mask).unwrap();
        assert_eq!(sharded.dims(), &[5, 2, 9]);
        assert!(max_abs_diff(&sharded, &direct) < 1e-5);
    }

    #[test]
    fn test_reduced_gradients_match_single_device() {
        let dp = DataParallel::new(tiny(), vec![Device::Cpu; 3]).unwrap();
        let ids = Tensor::new(&[[1u32, 2], [3, 4], [5, 6], [7, 8]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((4, 2), DType::U32, &Device::Cpu).unwrap();

        let loss = dp.forward(&ids, &mask).unwrap().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        // Each replica's own variables received gradients from its shard.
        for replica in &dp.replicas {
            for var in replica.trainable_vars() {
                assert!(grads.get(var.as_tensor()).is_some());
            }
        }
        dp.reduce_gradients(&mut grads).unwrap();

        let direct_loss = dp
            .module()
            .forward(&ids, &mask)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let direct = direct_loss.backward().unwrap();
        for var in dp.trainable_vars() {
            let reduced = grads.get(var.as_tensor()).unwrap();
            let expected = direct.get(var.as_tensor()).unwrap();
            assert!(max_abs_diff(reduced, expected) < 1e-4);
        }
    }

    #[test]
    fn test_sync_replicas_after_update() {
        let dp = DataParallel::new(tiny(), vec![Device::Cpu, Device::Cpu]).unwrap();
        for var in dp.trainable_vars() {
            let bumped = (var.as_tensor() + 0.5).unwrap();
            var.set(&bumped).unwrap();
        }
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 2), DType::U32, &Device::Cpu).unwrap();
        let primary = dp.module().forward(&ids, &mask).unwrap();

        let stale = dp.replicas[0].forward(&ids, &mask).unwrap();
        assert!(max_abs_diff(&primary, &stale) > 1e-3);

        dp.sync_replicas().unwrap();
        let synced = dp.replicas[0].forward(&ids, &mask).unwrap();
        assert!(max_abs_diff(&primary, &synced) < 1e-6);
    }

    #[test]
    fn test_wrapper_cannot_be_snapshotted() {
        let dp = DataParallel::new(tiny(), vec![Device::Cpu, Device::Cpu]).unwrap();
        assert!(dp.frozen_copy().is_err());
        assert!(dp.module().frozen_copy().is_ok());
    }
}
