use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use tch::Device;
use vqa_core::{Batch, ModelConfig};

use crate::accumulator::{Accumulation, GradientAccumulator};
use crate::checkpoint::CheckpointWriter;
use crate::config::TrainingConfig;
use crate::dataset::{DataLoader, DataSource, FeatureDataset};
use crate::error::{Result, TrainError};
use crate::evaluator::{evaluate, EvalResult};
use crate::metrics::{JsonlSink, LogSink, MetricsSink};
use crate::optim::{clip_grad_norm, group_parameters, no_decay, BertAdam, Optimizer};
use crate::precision::PrecisionPolicy;
use crate::replica::{build_coordinator, BackwardSpec, MicroBatchOutput, ModelHandle, ReplicaCoordinator};
use crate::schedule::LrSchedule;
use crate::step_state::StepState;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Epoch,
    MicroStep,
    Accumulate,
    Fire,
    EndOfEpoch,
    Evaluate,
    Checkpoint,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Sum over micro-batches of the micro-batch loss times its size.
    pub total_loss: f64,
    /// Credit earned on this rank, as a percentage of the training split size.
    pub train_score: f64,
    pub eval: EvalResult,
    /// Logical steps completed during the epoch, skipped ones included.
    pub steps: u64,
    /// Steps skipped because of a gradient overflow.
    pub skipped_steps: usize,
    pub checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    config: TrainingConfig,
    model_config: ModelConfig,
    coordinator: Box<dyn ReplicaCoordinator>,
    optimizer: Box<dyn Optimizer>,
    precision: PrecisionPolicy,
    accumulator: GradientAccumulator,
    schedule: LrSchedule,
    train_loader: DataLoader,
    eval_loader: DataLoader,
    checkpoints: CheckpointWriter,
    sinks: Vec<Box<dyn MetricsSink>>,
    state: StepState,
    phase: Phase,
    total_steps: u64,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        model_config: ModelConfig,
        coordinator: Box<dyn ReplicaCoordinator>,
        train: Arc<dyn DataSource>,
        eval: Arc<dyn DataSource>,
    ) -> Result<Self> {
        config.validate()?;
        let accumulator = GradientAccumulator::new(config.gradient_accumulation_steps)?;
        let micro_batch = config.micro_batch_size();
        let world_size = coordinator.world_size();
        let rank = config.replica.rank();

        let train_loader = DataLoader::new(Arc::clone(&train), micro_batch)
            .shuffle(config.seed)
            .partition(rank, world_size)
            .workers(config.num_workers);
        if train_loader.is_empty() {
            return Err(TrainError::Data("training split is empty".to_string()));
        }
        if eval.num_labels() != train.num_labels() {
            return Err(TrainError::Data(format!(
                "evaluation split has {} answer labels, training split {}",
                eval.num_labels(),
                train.num_labels()
            )));
        }
        let eval_loader = DataLoader::new(eval, micro_batch).workers(config.num_workers);

        let per_epoch = accumulator.fires_in(train_loader.num_examples() / micro_batch);
        let total_steps = ((per_epoch * config.epochs) / world_size).max(1) as u64;

        let learning_rate = config.learning_rate;
        let groups = group_parameters(
            coordinator.var_store(),
            no_decay,
            |_| learning_rate,
            config.weight_decay,
        );
        let optimizer = Box::new(BertAdam::new(groups));

        Ok(Self {
            precision: PrecisionPolicy::new(config.precision),
            schedule: LrSchedule::new(config.schedule.clone(), config.warmup_proportion),
            checkpoints: CheckpointWriter::new(config.run_dir()),
            sinks: vec![Box::new(LogSink)],
            config,
            model_config,
            coordinator,
            optimizer,
            accumulator,
            train_loader,
            eval_loader,
            state: StepState::new(),
            phase: Phase::Idle,
            total_steps,
        })
    }

    /// Loads both splits named by `config`, builds the coordinator on
    /// `device` and opens a JSON-lines scalar log on the primary.
    pub fn from_config(config: TrainingConfig, model_config: ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);

        let train: Arc<dyn DataSource> = Arc::new(FeatureDataset::load(config.train_file())?);
        let eval: Arc<dyn DataSource> = Arc::new(FeatureDataset::load(config.eval_file())?);
        let num_labels = train.num_labels();
        info!(
            "{} training and {} evaluation examples, {} answer labels",
            train.num_examples(),
            eval.num_examples(),
            num_labels
        );

        let kind = config.model_kind;
        let pretrained = config.from_pretrained.clone();
        let coordinator = build_coordinator(&config.replica, device, |d| {
            ModelHandle::with_weights(d, kind, &model_config, num_labels, pretrained.as_deref())
        })?;

        let scalars = config.log_dir.join(&config.run_name).join("scalars.jsonl");
        let primary = coordinator.is_primary();
        let mut trainer = Self::new(config, model_config, coordinator, train, eval)?;
        if primary {
            trainer = trainer.with_sink(Box::new(JsonlSink::create(scalars)?));
        }
        Ok(trainer)
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replaces the loss-scale policy derived from the config.
    pub fn with_precision(mut self, precision: PrecisionPolicy) -> Self {
        self.precision = precision;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn coordinator(&self) -> &dyn ReplicaCoordinator {
        self.coordinator.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn precision(&self) -> &PrecisionPolicy {
        &self.precision
    }

    pub fn checkpoints(&self) -> &CheckpointWriter {
        &self.checkpoints
    }

    /// Trains for the configured number of epochs, evaluating and
    /// checkpointing after each one.
    pub fn run(&mut self) -> Result<Vec<EpochSummary>> {
        if self.coordinator.is_primary() {
            let path = self.checkpoints.write_config(&self.config, &self.model_config)?;
            info!("resolved configuration written to {:?}", path);
        }
        info!("***** Running training *****");
        info!("  Num examples = {}", self.train_loader.num_examples());
        info!("  Micro batch size = {}", self.config.micro_batch_size());
        info!("  Accumulation steps = {}", self.accumulator.steps());
        info!("  Num steps = {}", self.total_steps);

        let mut summaries = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            summaries.push(self.run_epoch(epoch)?);
        }
        self.phase = Phase::Done;
        for sink in &mut self.sinks {
            sink.flush();
        }
        Ok(summaries)
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<EpochSummary> {
        self.phase = Phase::Epoch;
        self.coordinator.discard_gradients();
        self.coordinator.set_training(true);
        self.state = self.state.start_epoch();

        let steps_before = self.state.global_step;
        let skipped_before = self.precision.overflow_count();
        let batches = self.train_loader.len() as f64;
        let mut total_loss = 0.0;
        let mut train_score = 0.0;
        let mut window = Instant::now();

        for batch in self.train_loader.iter(epoch) {
            let step = self.state.global_step;
            let batch = batch.map_err(|e| e.at(epoch, step))?;
            let out = self.micro_step(&batch).map_err(|e| e.at(epoch, step))?;

            total_loss += out.loss * out.examples as f64;
            train_score += out.score;

            if self.state.should_log(self.config.log_every) {
                let (state, smoothed) = self.state.take_smoothed_loss();
                self.state = state;
                if self.coordinator.is_primary() {
                    info!(
                        "[{}][Ep: {:.2}][Iter: {}][Time: {:5.2}s][Loss: {:.5}]",
                        chrono::Local::now().format("%H:%M:%S"),
                        epoch as f64 + self.state.epoch_step as f64 / batches,
                        self.state.iteration,
                        window.elapsed().as_secs_f64(),
                        smoothed
                    );
                }
                window = Instant::now();
            }
        }

        self.phase = Phase::EndOfEpoch;
        let step = self.state.global_step;
        let train_score = 100.0 * train_score / self.train_loader.num_examples() as f64;

        self.phase = Phase::Evaluate;
        self.coordinator.set_training(false);
        let eval = evaluate(self.coordinator.as_ref(), &self.eval_loader).map_err(|e| e.at(epoch, step))?;
        self.coordinator.set_training(true);
        self.plot(step, eval.score, "score", "val");

        info!(
            "\tEpoch {}: loss: {:.4}, score: {:.2}",
            epoch, total_loss, train_score
        );
        info!(
            "\teval score: {:.2} ({:.2})",
            100.0 * eval.score,
            100.0 * eval.upper_bound
        );

        self.phase = Phase::Checkpoint;
        let checkpoint = if self.coordinator.is_primary() {
            Some(
                self.checkpoints
                    .write(self.coordinator.var_store(), epoch)
                    .map_err(|e| e.at(epoch, step))?,
            )
        } else {
            None
        };

        Ok(EpochSummary {
            epoch,
            total_loss,
            train_score,
            eval,
            steps: self.state.global_step - steps_before,
            skipped_steps: self.precision.overflow_count() - skipped_before,
            checkpoint,
        })
    }

    /// Forward and backward for one micro-batch, then an optimizer step if
    /// the batch closes a logical step.
    fn micro_step(&mut self, batch: &Batch) -> Result<MicroBatchOutput> {
        self.phase = Phase::MicroStep;
        debug!(
            "micro-batch {}/{} of step {}",
            self.accumulator.micro_index(self.state.epoch_step) + 1,
            self.accumulator.steps(),
            self.state.global_step
        );

        let spec = BackwardSpec {
            loss_divisor: self.accumulator.loss_divisor(),
            precision: self.precision.clone(),
        };
        let out = self.coordinator.forward_backward(batch, &spec)?;
        self.plot(self.state.iteration, out.loss, "loss", "train");

        let decision = self.accumulator.decide(self.state.epoch_step);
        match decision {
            Accumulation::Fire => {
                self.phase = Phase::Fire;
                self.fire()?;
            }
            Accumulation::Accumulate => self.phase = Phase::Accumulate,
        }
        self.state = self.state.after_micro_batch(out.loss, decision);
        Ok(out)
    }

    fn fire(&mut self) -> Result<()> {
        self.coordinator.synchronize_gradients()?;
        let params = self.coordinator.trainable_variables();

        if self.precision.has_overflow(&params)? {
            self.precision.update(true);
            self.coordinator.discard_gradients();
            self.plot(self.state.global_step, self.precision.loss_scale(), "loss_scale", "train");
            return Ok(());
        }

        self.precision.unscale_gradients(&params)?;
        let grad_norm = clip_grad_norm(&params, self.config.max_grad_norm)?;

        let multiplier = self.schedule.multiplier(self.state.global_step, self.total_steps);
        self.optimizer.apply_multiplier(multiplier);
        self.optimizer.step()?;
        self.coordinator.discard_gradients();
        self.coordinator.after_step()?;
        self.precision.update(false);

        let step = self.state.global_step;
        let lr = self.config.learning_rate * multiplier;
        self.plot(step, lr, "learning_rate", "train");
        self.plot(step, grad_norm, "grad_norm", "train");
        if self.precision.is_dynamic() {
            self.plot(step, self.precision.loss_scale(), "loss_scale", "train");
        }
        Ok(())
    }

    fn plot(&mut self, step: u64, value: f64, series: &str, split: &str) {
        if !self.coordinator.is_primary() {
            return;
        }
        for sink in &mut self.sinks {
            sink.line_plot(step, value, series, split);
        }
    }
}
