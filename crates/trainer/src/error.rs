use std::path::PathBuf;

use thiserror::Error;
use vqa_core::ModelError;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("dataset error: {0}")]
    Data(String),

    #[error("collective error: {0}")]
    Collective(String),

    #[error("failed to write checkpoint {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: ModelError,
    },

    #[error("epoch {epoch}, step {step}: {source}")]
    Step {
        epoch: usize,
        step: u64,
        #[source]
        source: Box<TrainError>,
    },
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        TrainError::Config(msg.into())
    }

    /// Attaches the loop position to an error raised inside an epoch.
    pub fn at(self, epoch: usize, step: u64) -> Self {
        match self {
            already @ TrainError::Step { .. } => already,
            other => TrainError::Step {
                epoch,
                step,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
