use tch::{nn, Device, Tensor};
use vqa_core::Batch;

use super::{backward_piece, empty_batch_error, BackwardSpec, MicroBatchOutput, ModelHandle, ReplicaCoordinator};
use crate::error::Result;

/// One model on one device; synchronization is a no-op.
#[derive(Debug)]
pub struct SingleDevice {
    model: ModelHandle,
    training: bool,
}

impl SingleDevice {
    pub fn new(model: ModelHandle) -> Self {
        Self {
            model,
            training: true,
        }
    }
}

impl ReplicaCoordinator for SingleDevice {
    fn forward_backward(&mut self, batch: &Batch, spec: &BackwardSpec) -> Result<MicroBatchOutput> {
        if batch.is_empty() {
            return Err(empty_batch_error());
        }
        self.model.check_batch(batch)?;
        backward_piece(&self.model, batch, 1.0, spec, self.training)
    }

    fn synchronize_gradients(&mut self) -> Result<()> {
        Ok(())
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
}
