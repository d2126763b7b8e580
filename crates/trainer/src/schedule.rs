//! Learning-rate multipliers.
//!
//! The schedule is a pure function of the global optimizer step; the loop
//! multiplies the result into the base rate of every parameter group when a
//! logical step fires.

use crate::config::ScheduleKind;

#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    kind: ScheduleKind,
    warmup_proportion: f64,
}

impl LrSchedule {
    pub fn new(kind: ScheduleKind, warmup_proportion: f64) -> Self {
        Self {
            kind,
            warmup_proportion,
        }
    }

    /// Multiplier for the step about to be applied, given the number of
    /// steps already taken and the planned total.
    pub fn multiplier(&self, step: u64, total_steps: u64) -> f64 {
        match &self.kind {
            ScheduleKind::WarmupLinear { floor } => {
                let progress = step as f64 / total_steps.max(1) as f64;
                warmup_linear(progress, self.warmup_proportion, *floor)
            }
            ScheduleKind::WarmupMilestones {
                warmup_iterations,
                warmup_factor,
                milestones,
                ratio,
            } => {
                if step < *warmup_iterations {
                    let alpha = step as f64 / *warmup_iterations as f64;
                    warmup_factor * (1.0 - alpha) + alpha
                } else {
                    ratio.powi(milestone_rank(milestones, step) as i32)
                }
            }
        }
    }
}

/// Linear ramp from `floor` to 1 over `[0, warmup)`, then linear decay that
/// reaches 0 at `progress == 1` and stays there.
pub fn warmup_linear(progress: f64, warmup: f64, floor: f64) -> f64 {
    if progress < warmup {
        floor + (1.0 - floor) * progress / warmup
    } else {
        ((progress - 1.0) / (warmup - 1.0)).max(0.0)
    }
}

/// Number of milestones at or below `iteration`. `milestones` must be sorted.
pub fn milestone_rank(milestones: &[u64], iteration: u64) -> usize {
    milestones.partition_point(|&m| m <= iteration)
}
