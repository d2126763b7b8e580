use crate::accumulator::Accumulation;

/// Loop counters. Every transition returns a new value; the loop owns the
/// only copy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepState {
    /// Completed logical steps since the start of training.
    pub global_step: u64,
    /// Micro-batches processed since the start of training; the x axis of
    /// per-micro-batch scalars.
    pub iteration: u64,
    /// Micro-batches processed in the current epoch.
    pub epoch_step: usize,
    pub running_loss: f64,
    pub running_count: usize,
}

impl StepState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the per-epoch counters. Gradients of an unfinished logical step
    /// are discarded by the caller.
    pub fn start_epoch(self) -> Self {
        Self {
            epoch_step: 0,
            running_loss: 0.0,
            running_count: 0,
            ..self
        }
    }

    pub fn after_micro_batch(self, loss: f64, decision: Accumulation) -> Self {
        let global_step = match decision {
            Accumulation::Fire => self.global_step + 1,
            Accumulation::Accumulate => self.global_step,
        };
        Self {
            global_step,
            iteration: self.iteration + 1,
            epoch_step: self.epoch_step + 1,
            running_loss: self.running_loss + loss,
            running_count: self.running_count + 1,
        }
    }

    pub fn should_log(&self, log_every: usize) -> bool {
        self.epoch_step != 0 && self.epoch_step % log_every.max(1) == 0
    }

    /// Mean loss since the last call, and the state with the window cleared.
    pub fn take_smoothed_loss(self) -> (Self, f64) {
        let mean = if self.running_count == 0 {
            0.0
        } else {
            self.running_loss / self.running_count as f64
        };
        (
            Self {
                running_loss: 0.0,
                running_count: 0,
                ..self
            },
            mean,
        )
    }
}
