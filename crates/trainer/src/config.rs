use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use vqa_core::ModelKind;

use crate::error::{Result, TrainError};

/// Which dataset pair to train and evaluate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Train on `train`, evaluate on `val`.
    Train,
    /// Train on `trainval`, evaluate on `minval`.
    Trainval,
}

impl Split {
    pub fn train_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Trainval => "trainval",
        }
    }

    pub fn eval_name(self) -> &'static str {
        match self {
            Split::Train => "val",
            Split::Trainval => "minval",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PrecisionMode {
    Full,
    /// Reduced precision with a loss scale fixed at `scale`.
    ReducedStatic { scale: f64 },
    /// Reduced precision with a loss scale that backs off on overflow.
    ReducedDynamic,
}

impl PrecisionMode {
    /// `loss_scale == 0` selects dynamic scaling, any positive value a static one.
    pub fn from_flags(fp16: bool, loss_scale: f64) -> Self {
        match (fp16, loss_scale) {
            (false, _) => PrecisionMode::Full,
            (true, s) if s == 0.0 => PrecisionMode::ReducedDynamic,
            (true, s) => PrecisionMode::ReducedStatic { scale: s },
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self, PrecisionMode::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplicaMode {
    Single,
    /// One replica per device inside this process.
    Replicated {
        devices: usize,
        /// Sub-batch size each replica processes at a time.
        chunk_size: Option<i64>,
    },
    /// One replica per process, gradients all-reduced over TCP.
    Distributed {
        rank: usize,
        world_size: usize,
        master_addr: String,
    },
}

impl ReplicaMode {
    pub fn world_size(&self) -> usize {
        match self {
            ReplicaMode::Distributed { world_size, .. } => *world_size,
            _ => 1,
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            ReplicaMode::Distributed { rank, .. } => *rank,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Linear warmup over `warmup_proportion` of training, then linear decay to 0.
    WarmupLinear { floor: f64 },
    /// Linear warmup over a fixed number of steps, then step decay at milestones.
    WarmupMilestones {
        warmup_iterations: u64,
        warmup_factor: f64,
        milestones: Vec<u64>,
        ratio: f64,
    },
}

impl ScheduleKind {
    pub fn default_milestones() -> Self {
        ScheduleKind::WarmupMilestones {
            warmup_iterations: 1000,
            warmup_factor: 0.2,
            milestones: vec![15000, 18000, 20000, 21000],
            ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub run_name: String,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Directory holding `<split>.safetensors` feature files.
    pub data_root: PathBuf,
    pub split: Split,
    /// Overrides the training file derived from `data_root` and `split`.
    pub train_features: Option<PathBuf>,
    pub eval_features: Option<PathBuf>,
    pub model_config_file: Option<PathBuf>,
    pub model_kind: ModelKind,
    pub from_pretrained: Option<PathBuf>,
    /// Examples per logical step; each micro-batch holds
    /// `batch_size / gradient_accumulation_steps`.
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub warmup_proportion: f64,
    pub schedule: ScheduleKind,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub log_every: usize,
    pub precision: PrecisionMode,
    pub replica: ReplicaMode,
    pub num_workers: usize,
    pub seed: u64,
    pub no_cuda: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_name: String::new(),
            output_dir: PathBuf::from("save"),
            log_dir: PathBuf::from("logs"),
            data_root: PathBuf::from("data/VQA"),
            split: Split::Train,
            train_features: None,
            eval_features: None,
            model_config_file: None,
            model_kind: ModelKind::TwoStream,
            from_pretrained: None,
            batch_size: 128,
            gradient_accumulation_steps: 1,
            epochs: 30,
            learning_rate: 5e-5,
            warmup_proportion: 0.01,
            schedule: ScheduleKind::WarmupLinear { floor: 0.0 },
            weight_decay: 0.01,
            max_grad_norm: 0.25,
            log_every: 20,
            precision: PrecisionMode::Full,
            replica: ReplicaMode::Single,
            num_workers: 4,
            seed: 42,
            no_cuda: false,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn micro_batch_size(&self) -> usize {
        self.batch_size / self.gradient_accumulation_steps.max(1)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_name)
    }

    pub fn train_file(&self) -> PathBuf {
        self.train_features.clone().unwrap_or_else(|| {
            self.data_root
                .join(format!("{}.safetensors", self.split.train_name()))
        })
    }

    pub fn eval_file(&self) -> PathBuf {
        self.eval_features.clone().unwrap_or_else(|| {
            self.data_root
                .join(format!("{}.safetensors", self.split.eval_name()))
        })
    }

    /// Rejects configurations the loop cannot run. Called before any device
    /// or file is touched.
    pub fn validate(&self) -> Result<()> {
        if self.gradient_accumulation_steps < 1 {
            return Err(TrainError::config(format!(
                "Invalid gradient_accumulation_steps parameter: {}, should be >= 1",
                self.gradient_accumulation_steps
            )));
        }
        if self.micro_batch_size() == 0 {
            return Err(TrainError::config(format!(
                "batch_size {} is smaller than gradient_accumulation_steps {}",
                self.batch_size, self.gradient_accumulation_steps
            )));
        }
        if self.run_name.trim().is_empty() {
            return Err(TrainError::config("run name is required"));
        }
        if self.run_name.contains(['/', '\\']) {
            return Err(TrainError::config(format!(
                "run name `{}` must not contain path separators",
                self.run_name
            )));
        }
        if self.epochs == 0 {
            return Err(TrainError::config("epochs must be at least 1"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainError::config("learning_rate must be positive"));
        }
        if !(0.0..1.0).contains(&self.warmup_proportion) {
            return Err(TrainError::config("warmup_proportion must be in [0, 1)"));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(TrainError::config("max_grad_norm must be positive"));
        }
        if self.log_every == 0 {
            return Err(TrainError::config("log_every must be at least 1"));
        }

        match &self.schedule {
            ScheduleKind::WarmupLinear { floor } if !(0.0..=1.0).contains(floor) => {
                return Err(TrainError::config("warmup floor must be in [0, 1]"));
            }
            ScheduleKind::WarmupMilestones {
                milestones, ratio, ..
            } => {
                if milestones.windows(2).any(|w| w[0] > w[1]) {
                    return Err(TrainError::config("milestones must be sorted ascending"));
                }
                if !(*ratio > 0.0 && *ratio <= 1.0) {
                    return Err(TrainError::config("milestone ratio must be in (0, 1]"));
                }
            }
            _ => {}
        }

        if let PrecisionMode::ReducedStatic { scale } = self.precision {
            if !(scale >= 1.0) {
                return Err(TrainError::config("static loss scale must be >= 1"));
            }
        }

        match &self.replica {
            ReplicaMode::Single => {}
            ReplicaMode::Replicated {
                devices,
                chunk_size,
            } => {
                if *devices == 0 {
                    return Err(TrainError::config("replicated mode needs at least one device"));
                }
                if chunk_size.map_or(false, |c| c < 1) {
                    return Err(TrainError::config("chunk_size must be at least 1"));
                }
            }
            ReplicaMode::Distributed {
                rank, world_size, ..
            } => {
                if *world_size == 0 || rank >= world_size {
                    return Err(TrainError::config(format!(
                        "rank {} is outside world of size {}",
                        rank, world_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Timestamp plus a random suffix, used when no run name is given.
pub fn default_run_name() -> String {
    let stamp = chrono::Utc::now().format("%d-%b-%y-%H%M%S-%a");
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}_{:0>6}", stamp, suffix)
}
