pub mod accumulator;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod precision;
pub mod replica;
pub mod schedule;
pub mod step_state;
pub mod train;

pub use accumulator::{Accumulation, GradientAccumulator};
pub use checkpoint::{load_checkpoint, CheckpointWriter};
pub use config::{PrecisionMode, ReplicaMode, ScheduleKind, Split, TrainingConfig};
pub use dataset::{DataLoader, DataSource, FeatureDataset};
pub use error::{Result, TrainError};
pub use evaluator::{evaluate, EvalResult};
pub use precision::PrecisionPolicy;
pub use replica::{build_coordinator, ModelHandle, ReplicaCoordinator};
pub use schedule::LrSchedule;
pub use step_state::StepState;
pub use train::{EpochSummary, Phase, Trainer};
