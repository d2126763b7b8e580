use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use tch::Device;

use vqa_core::{ModelConfig, ModelKind};
use vqa_trainer::config::default_run_name;
use vqa_trainer::{PrecisionMode, ReplicaMode, Split, Trainer, TrainingConfig};

const TRAINING_CONFIG: &str = "configs/training_config.yaml";
const MODEL_CONFIG: &str = "configs/model_config.yaml";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SplitArg {
    Train,
    Trainval,
}

/// Fine-tune a vision-and-language model for question answering.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML training config; values given on the command line win
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model config (YAML or JSON)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// `train` evaluates on val, `trainval` on minval
    #[arg(long, value_enum)]
    split: Option<SplitArg>,

    /// Directory holding `<split>.safetensors` feature files
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    train_file: Option<PathBuf>,

    #[arg(long)]
    eval_file: Option<PathBuf>,

    /// Use the single-stream baseline instead of the two-stream model
    #[arg(long)]
    baseline: bool,

    /// Initialise from a safetensors checkpoint
    #[arg(long)]
    from_pretrained: Option<PathBuf>,

    /// Examples per optimizer step, across accumulation
    #[arg(long)]
    train_batch_size: Option<usize>,

    #[arg(long)]
    num_train_epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Fraction of training spent in linear warmup
    #[arg(long)]
    warmup_proportion: Option<f64>,

    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,

    /// Train in reduced precision with loss scaling
    #[arg(long)]
    fp16: bool,

    /// 0 selects a dynamic scale, any positive value a static one
    #[arg(long, default_value_t = 0.0)]
    loss_scale: f64,

    /// Number of in-process replicas
    #[arg(long)]
    replicas: Option<usize>,

    /// Chunk size each replica walks its shard in
    #[arg(long)]
    use_chunk: Option<i64>,

    /// Rank of this process in distributed training
    #[arg(long)]
    local_rank: Option<usize>,

    #[arg(long, default_value_t = 1)]
    world_size: usize,

    #[arg(long, default_value = "127.0.0.1:29500")]
    master_addr: String,

    #[arg(long)]
    num_workers: Option<usize>,

    /// Run name; a timestamp is used when absent
    #[arg(long)]
    save_name: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    no_cuda: bool,
}

impl Cli {
    fn training_config(&self) -> Result<TrainingConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| Some(PathBuf::from(TRAINING_CONFIG)).filter(|p| p.exists()));
        let mut config = match path {
            Some(path) => TrainingConfig::from_yaml_file(&path)
                .with_context(|| format!("reading training config {:?}", path))?,
            None => TrainingConfig::default(),
        };

        if let Some(split) = self.split {
            config.split = match split {
                SplitArg::Train => Split::Train,
                SplitArg::Trainval => Split::Trainval,
            };
        }
        if let Some(dir) = &self.data_root {
            config.data_root = dir.clone();
        }
        if self.train_file.is_some() {
            config.train_features = self.train_file.clone();
        }
        if self.eval_file.is_some() {
            config.eval_features = self.eval_file.clone();
        }
        if self.config_file.is_some() {
            config.model_config_file = self.config_file.clone();
        }
        if self.baseline {
            config.model_kind = ModelKind::SingleStream;
        }
        if self.from_pretrained.is_some() {
            config.from_pretrained = self.from_pretrained.clone();
        }
        if let Some(v) = self.train_batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.num_train_epochs {
            config.epochs = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.warmup_proportion {
            config.warmup_proportion = v;
        }
        if let Some(v) = self.gradient_accumulation_steps {
            config.gradient_accumulation_steps = v;
        }
        if self.fp16 {
            config.precision = PrecisionMode::from_flags(true, self.loss_scale);
        }
        if let Some(rank) = self.local_rank {
            config.replica = ReplicaMode::Distributed {
                rank,
                world_size: self.world_size,
                master_addr: self.master_addr.clone(),
            };
        } else if let Some(devices) = self.replicas {
            config.replica = ReplicaMode::Replicated {
                devices,
                chunk_size: self.use_chunk,
            };
        }
        if let Some(v) = self.num_workers {
            config.num_workers = v;
        }
        if let Some(name) = &self.save_name {
            config.run_name = name.clone();
        }
        if config.run_name.is_empty() {
            config.run_name = default_run_name();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.no_cuda |= self.no_cuda;
        Ok(config)
    }
}

fn model_config(path: Option<&Path>) -> Result<ModelConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| Some(PathBuf::from(MODEL_CONFIG)).filter(|p| p.exists()));
    match path {
        Some(path) => {
            ModelConfig::from_file(&path).with_context(|| format!("reading model config {:?}", path))
        }
        None => Ok(ModelConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = cli.training_config()?;
    config.validate().context("invalid training configuration")?;
    let model_config = model_config(config.model_config_file.as_deref())?;

    let device = if config.no_cuda {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    info!("device: {:?}, run: {}", device, config.run_name);

    let mut trainer = Trainer::from_config(config, model_config, device)
        .context("failed to set up training")?;
    let summaries = trainer.run().context("training failed")?;

    if let Some(last) = summaries.last() {
        info!(
            "finished {} epochs; final eval score {:.2} ({:.2})",
            summaries.len(),
            100.0 * last.eval.score,
            100.0 * last.eval.upper_bound
        );
    }
    Ok(())
}
