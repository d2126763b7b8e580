use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;
use tch::nn;
use vqa_core::safetensors_util::{load_var_store, save_var_store, LoadReport};
use vqa_core::ModelConfig;

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};

pub const CONFIG_FILE: &str = "command.txt";

/// Writes one parameter file per epoch into a run directory. Files are never
/// pruned; a failed write is returned to the caller.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    run_dir: PathBuf,
}

#[derive(Serialize)]
struct ResolvedConfig<'a> {
    training: &'a TrainingConfig,
    model: &'a ModelConfig,
}

impl CheckpointWriter {
    pub fn new<P: Into<PathBuf>>(run_dir: P) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.run_dir.join(format!("model_epoch_{}.safetensors", epoch))
    }

    /// Creates the run directory and records the resolved configuration in it.
    pub fn write_config(&self, training: &TrainingConfig, model: &ModelConfig) -> Result<PathBuf> {
        fs::create_dir_all(&self.run_dir)?;
        let path = self.run_dir.join(CONFIG_FILE);
        let text = serde_yaml::to_string(&ResolvedConfig { training, model })?;
        fs::write(&path, text)?;
        Ok(path)
    }

    pub fn write(&self, vs: &nn::VarStore, epoch: usize) -> Result<PathBuf> {
        let path = self.path_for(epoch);
        save_var_store(vs, &path).map_err(|source| TrainError::Checkpoint {
            path: path.clone(),
            source,
        })?;
        info!("** ** * Saving fine-tuned model to {:?} ** ** *", path);
        Ok(path)
    }
}

/// Restores parameters written by [`CheckpointWriter::write`].
pub fn load_checkpoint<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<LoadReport> {
    Ok(load_var_store(vs, path)?)
}
