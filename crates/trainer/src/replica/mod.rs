//! One logical model, whatever the number of copies that compute it.
//!
//! Every coordinator exposes the same cycle: `forward_backward` once per
//! micro-batch, then `synchronize_gradients`, an optimizer step on
//! [`ReplicaCoordinator::var_store`], and `after_step`. The var store handed
//! out is always the single logical parameter set, which is what the
//! optimizer updates and what checkpoints serialize.

pub mod collective;
mod distributed;
mod replicated;
mod single;

use std::fmt;
use std::path::Path;

use log::info;
use tch::{nn, Device, Kind, Tensor};
use vqa_core::safetensors_util::load_var_store;
use vqa_core::{build_model, Batch, ModelConfig, ModelKind, VqaModel};

use crate::config::{PrecisionMode, ReplicaMode};
use crate::error::{Result, TrainError};
use crate::loss::{batch_score, instance_bce_with_logits};
use crate::precision::PrecisionPolicy;

pub use collective::{Collective, LocalGroup, TcpGroup};
pub use distributed::DistributedCoordinator;
pub use replicated::ReplicatedCoordinator;
pub use single::SingleDevice;

/// A model and the var store that owns its parameters.
pub struct ModelHandle {
    pub vs: nn::VarStore,
    pub net: Box<dyn VqaModel>,
    config: ModelConfig,
    num_labels: i64,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("device", &self.vs.device())
            .field("net", &self.net)
            .field("num_labels", &self.num_labels)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(device: Device, kind: ModelKind, config: &ModelConfig, num_labels: i64) -> Self {
        let vs = nn::VarStore::new(device);
        let net = build_model(kind, &vs.root(), config, num_labels);
        Self {
            vs,
            net,
            config: config.clone(),
            num_labels,
        }
    }

    /// Like [`ModelHandle::new`], then overwrites parameters from a
    /// safetensors file when one is given.
    pub fn with_weights(
        device: Device,
        kind: ModelKind,
        config: &ModelConfig,
        num_labels: i64,
        weights: Option<&Path>,
    ) -> Result<Self> {
        let mut handle = Self::new(device, kind, config, num_labels);
        if let Some(path) = weights {
            let report = load_var_store(&mut handle.vs, path)?;
            info!(
                "loaded {} tensors from {:?} ({} missing, {} unexpected)",
                report.loaded,
                path,
                report.missing.len(),
                report.unexpected.len()
            );
        }
        Ok(handle)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Rejects a batch whose shapes disagree with each other or with the
    /// dimensions this model was built for.
    pub fn check_batch(&self, batch: &Batch) -> Result<()> {
        batch.validate()?;
        let labels = batch.target.size()[1];
        if labels != self.num_labels {
            return Err(TrainError::Data(format!(
                "batch has {} answer labels, model predicts {}",
                labels, self.num_labels
            )));
        }
        let feature_size = batch.features.size()[2];
        if feature_size != self.config.v_feature_size {
            return Err(TrainError::Data(format!(
                "region features are {} wide, model expects {}",
                feature_size, self.config.v_feature_size
            )));
        }
        let spatial_size = batch.spatials.size()[2];
        if spatial_size != self.config.v_spatial_size {
            return Err(TrainError::Data(format!(
                "region boxes are {} wide, model expects {}",
                spatial_size, self.config.v_spatial_size
            )));
        }
        let tokens = batch.question.size()[1];
        if tokens > self.config.max_position_embeddings {
            return Err(TrainError::Data(format!(
                "{} question tokens exceed the {} positions of the model",
                tokens, self.config.max_position_embeddings
            )));
        }
        Ok(())
    }

    /// Trainable variables keyed by name, in name order.
    pub fn named_trainable(&self) -> Vec<(String, Tensor)> {
        let mut named: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    pub fn logits(&self, batch: &Batch, train: bool, autocast: bool) -> Tensor {
        let device = self.device();
        let forward = || self.net.forward_t(batch.inputs(), train);
        let logits = if autocast && device.is_cuda() {
            tch::autocast(true, forward)
        } else {
            forward()
        };
        logits.to_kind(Kind::Float)
    }

    pub fn zero_grad(&self) {
        for (_, param) in self.named_trainable() {
            let mut grad = param.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }
}

/// How the loss of a micro-batch is turned into gradients.
#[derive(Debug, Clone)]
pub struct BackwardSpec {
    /// Gradient accumulation factor the loss is divided by.
    pub loss_divisor: f64,
    /// Scales the loss before backward and selects autocast.
    pub precision: PrecisionPolicy,
}

impl Default for BackwardSpec {
    fn default() -> Self {
        Self {
            loss_divisor: 1.0,
            precision: PrecisionPolicy::new(PrecisionMode::Full),
        }
    }
}

/// Per micro-batch values reported back to the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MicroBatchOutput {
    /// Loss over the whole micro-batch, before scaling and division.
    pub loss: f64,
    /// Summed credit of the predictions.
    pub score: f64,
    pub examples: i64,
}

impl MicroBatchOutput {
    fn merge(self, other: MicroBatchOutput) -> Self {
        Self {
            loss: self.loss + other.loss,
            score: self.score + other.score,
            examples: self.examples + other.examples,
        }
    }
}

/// Runs forward and backward for `piece` on `model`. `weight` is the share of
/// the full micro-batch this piece represents, so per-piece gradients sum to
/// the gradient of the full micro-batch.
fn backward_piece(
    model: &ModelHandle,
    piece: &Batch,
    weight: f64,
    spec: &BackwardSpec,
    train: bool,
) -> Result<MicroBatchOutput> {
    let piece = piece.to_device(model.device());
    let logits = model.logits(&piece, train, spec.precision.is_reduced());
    let loss = instance_bce_with_logits(&logits, &piece.target)?;
    let value = loss.f_double_value(&[])?;

    let objective = spec
        .precision
        .scale_loss(&loss.f_mul_scalar(weight / spec.loss_divisor)?);
    objective.f_backward()?;

    Ok(MicroBatchOutput {
        loss: value * weight,
        score: batch_score(&logits.detach(), &piece.target)?,
        examples: piece.len(),
    })
}

pub trait ReplicaCoordinator: Send {
    /// Forward and backward for one micro-batch; gradients accumulate until
    /// [`ReplicaCoordinator::synchronize_gradients`].
    fn forward_backward(&mut self, batch: &Batch, spec: &BackwardSpec) -> Result<MicroBatchOutput>;

    /// Leaves the combined gradients of every replica on the logical
    /// parameters. Called once per logical step, before the optimizer.
    fn synchronize_gradients(&mut self) -> Result<()>;

    /// Propagates freshly stepped parameters to the other replicas.
    fn after_step(&mut self) -> Result<()>;

    /// Clears gradients everywhere without applying them.
    fn discard_gradients(&mut self);

    /// Logits for `batch` on the logical model, `[B, L]`.
    fn forward(&self, batch: &Batch) -> Result<Tensor>;

    fn set_training(&mut self, training: bool);

    /// The logical parameter set.
    fn var_store(&self) -> &nn::VarStore;

    fn device(&self) -> Device;

    /// Only the primary writes checkpoints and logs.
    fn is_primary(&self) -> bool {
        true
    }

    /// Processes whose batches together make up one logical step.
    fn world_size(&self) -> usize {
        1
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        self.var_store().trainable_variables()
    }
}

/// Picks `count` devices for in-process replicas: one CUDA device each when
/// enough are present, the primary device repeated otherwise.
pub fn replica_devices(primary: Device, count: usize) -> Vec<Device> {
    if primary.is_cuda() && tch::Cuda::device_count() as usize >= count {
        (0..count).map(Device::Cuda).collect()
    } else {
        vec![primary; count]
    }
}

/// Builds the coordinator selected by `mode`. `build` creates one model copy
/// on the given device; it is called once per replica.
pub fn build_coordinator(
    mode: &ReplicaMode,
    device: Device,
    build: impl Fn(Device) -> Result<ModelHandle>,
) -> Result<Box<dyn ReplicaCoordinator>> {
    match mode {
        ReplicaMode::Single => Ok(Box::new(SingleDevice::new(build(device)?))),
        ReplicaMode::Replicated {
            devices,
            chunk_size,
        } => {
            let replicas = replica_devices(device, *devices)
                .into_iter()
                .map(&build)
                .collect::<Result<Vec<_>>>()?;
            info!("replicating model over {} devices", replicas.len());
            Ok(Box::new(ReplicatedCoordinator::new(replicas, *chunk_size)?))
        }
        ReplicaMode::Distributed {
            rank,
            world_size,
            master_addr,
        } => {
            let device = match device {
                Device::Cuda(_) => Device::Cuda(rank % tch::Cuda::device_count().max(1) as usize),
                other => other,
            };
            let group = TcpGroup::connect(*rank, *world_size, master_addr)?;
            info!("rank {} of {} joined group at {}", rank, world_size, master_addr);
            Ok(Box::new(DistributedCoordinator::new(build(device)?, Box::new(group))?))
        }
    }
}

fn empty_batch_error() -> TrainError {
    TrainError::Data("empty micro-batch".to_string())
}
