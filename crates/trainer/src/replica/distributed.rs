use log::info;
use tch::{nn, Device, Kind, Tensor};
use vqa_core::Batch;

use super::collective::{all_reduce_mean, broadcast_from_root, Collective};
use super::{backward_piece, empty_batch_error, BackwardSpec, MicroBatchOutput, ModelHandle, ReplicaCoordinator};
use crate::error::Result;

/// One full replica per process. Rank 0's initial parameters are broadcast
/// at construction; afterwards every rank applies the same averaged
/// gradients, so parameters stay identical without further broadcasts.
pub struct DistributedCoordinator {
    model: ModelHandle,
    group: Box<dyn Collective>,
    training: bool,
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("model", &self.model)
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .finish()
    }
}

impl DistributedCoordinator {
    pub fn new(model: ModelHandle, mut group: Box<dyn Collective>) -> Result<Self> {
        broadcast_from_root(group.as_mut(), &model.named_trainable())?;
        info!(
            "rank {}: parameters synchronized with rank 0",
            group.rank()
        );
        Ok(Self {
            model,
            group,
            training: true,
        })
    }

    /// Gradients of every trainable parameter. A parameter without one first
    /// gets a zero gradient of its own, so all ranks exchange the same names
    /// and the reduced mean lands on the parameter.
    fn gradients(&self) -> Result<Vec<(String, Tensor)>> {
        let named = self.model.named_trainable();
        for (_, param) in &named {
            if !param.grad().defined() {
                param.f_sum(Kind::Float)?.f_mul_scalar(0.0)?.f_backward()?;
            }
        }
        Ok(named
            .into_iter()
            .map(|(name, param)| (name, param.grad()))
            .collect())
    }
}

impl ReplicaCoordinator for DistributedCoordinator {
    fn forward_backward(&mut self, batch: &Batch, spec: &BackwardSpec) -> Result<MicroBatchOutput> {
        if batch.is_empty() {
            return Err(empty_batch_error());
        }
        self.model.check_batch(batch)?;
        backward_piece(&self.model, batch, 1.0, spec, self.training)
    }

    fn synchronize_gradients(&mut self) -> Result<()> {
        let grads = self.gradients()?;
        all_reduce_mean(self.group.as_mut(), &grads)
    }

    fn after_step(&mut self) -> Result<()> {
        Ok(())
    }

    fn discard_gradients(&mut self) {
        self.model.zero_grad();
    }

    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        self.model.check_batch(batch)?;
        let batch = batch.to_device(self.model.device());
        Ok(self.model.logits(&batch, self.training, false))
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.model.vs
    }

    fn device(&self) -> Device {
        self.model.device()
    }

    fn is_primary(&self) -> bool {
        self.group.rank() == 0
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }
}
