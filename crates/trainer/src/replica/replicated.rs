use std::collections::HashMap;

use log::debug;
use rayon::prelude::*;
use tch::{nn, Device, Tensor};
use vqa_core::Batch;

use super::{backward_piece, empty_batch_error, BackwardSpec, MicroBatchOutput, ModelHandle, ReplicaCoordinator};
use crate::error::{Result, TrainError};

/// One replica per device inside this process. Replica 0 is the logical
/// model; the others are refreshed from it after every optimizer step.
///
/// A micro-batch is split into contiguous shards, one per replica, and each
/// replica optionally walks its shard in chunks of `chunk_size`. Every piece
/// backpropagates its loss weighted by its share of the micro-batch, so
/// summing the replica gradients into replica 0 yields the gradient of the
/// whole micro-batch.
#[derive(Debug)]
pub struct ReplicatedCoordinator {
    replicas: Vec<ModelHandle>,
    chunk_size: Option<i64>,
    training: bool,
}

impl ReplicatedCoordinator {
    pub fn new(replicas: Vec<ModelHandle>, chunk_size: Option<i64>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(TrainError::config("replicated mode needs at least one replica"));
        }
        let mut coordinator = Self {
            replicas,
            chunk_size,
            training: true,
        };
        coordinator.broadcast()?;
        Ok(coordinator)
    }

    fn primary(&self) -> &ModelHandle {
        &self.replicas[0]
    }

    fn broadcast(&mut self) -> Result<()> {
        let (primary, rest) = self.replicas.split_at_mut(1);
        for replica in rest {
            replica.vs.copy(&primary[0].vs)?;
        }
        Ok(())
    }
}

impl ReplicaCoordinator for ReplicatedCoordinator {
    fn forward_backward(&mut self, batch: &Batch, spec: &BackwardSpec) -> Result<MicroBatchOutput> {
        if batch.is_empty() {
            return Err(empty_batch_error());
        }
        self.primary().check_batch(batch)?;
        let total = batch.len() as f64;
        let shards = batch.shard(self.replicas.len());
        let chunk_size = self.chunk_size;
        let training = self.training;

        let outputs = self
            .replicas
            .par_iter()
            .zip(shards.par_iter())
            .map(|(replica, shard)| {
                let pieces = match chunk_size {
                    Some(size) => shard.chunks(size),
                    None => vec![shard.narrow(0, shard.len())],
                };
                pieces.iter().try_fold(MicroBatchOutput::default(), |acc, piece| -> Result<MicroBatchOutput> {
                    let weight = piece.len() as f64 / total;
                    Ok(acc.merge(backward_piece(replica, piece, weight, spec, training)?))
                })
            })
            .collect::<Result<Vec<MicroBatchOutput>>>()?;

        Ok(outputs
            .into_iter()
            .fold(MicroBatchOutput::default(), MicroBatchOutput::merge))
    }

    fn synchronize_gradients(&mut self) -> Result<()> {
        let (primary, rest) = self.replicas.split_at(1);
        let device = primary[0].device();
        let targets: HashMap<String, Tensor> = primary[0].named_trainable().into_iter().collect();

        tch::no_grad(|| -> Result<()> {
            for replica in rest {
                for (name, param) in replica.named_trainable() {
                    let grad = param.grad();
                    if !grad.defined() {
                        continue;
                    }
                    let mut target = match targets.get(&name) {
                        Some(t) => t.grad(),
                        None => continue,
                    };
                    if target.defined() {
                        let _ = target.f_add_(&grad.to_device(device))?;
                    }
                }
                replica.zero_grad();
            }
            Ok(())
        })?;
        debug!("reduced gradients from {} replicas", rest.len());
        Ok(())
    }

    fn after_step(&mut self) -> Result<()> {
        self.broadcast()
    }

    fn discard_gradients(&mut self) {
        for replica in &self.replicas {
            replica.zero_grad();
        }
    }

    fn forward(&self, batch: &Batch) -> Result<Tensor> {
        let primary = self.primary();
        primary.check_batch(batch)?;
        let batch = batch.to_device(primary.device());
        Ok(primary.logits(&batch, self.training, false))
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.replicas[0].vs
    }

    fn device(&self) -> Device {
        self.primary().device()
    }
}
