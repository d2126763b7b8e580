use crate::error::{Result, TrainError};

/// What the loop does with the gradients of the micro-batch just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulation {
    /// Keep the gradients and move on to the next micro-batch.
    Accumulate,
    /// Apply the accumulated gradients.
    Fire,
}

/// Groups `steps` consecutive micro-batches into one logical optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientAccumulator {
    steps: usize,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Result<Self> {
        if steps < 1 {
            return Err(TrainError::config(format!(
                "Invalid gradient_accumulation_steps parameter: {}, should be >= 1",
                steps
            )));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// `counter` is the zero-based index of the micro-batch within the epoch.
    pub fn decide(&self, counter: usize) -> Accumulation {
        if (counter + 1) % self.steps == 0 {
            Accumulation::Fire
        } else {
            Accumulation::Accumulate
        }
    }

    /// Position of `counter` inside its logical step, in `[0, steps)`.
    pub fn micro_index(&self, counter: usize) -> usize {
        counter % self.steps
    }

    /// Factor the loss is divided by before backward so that accumulated
    /// gradients average over the logical step.
    pub fn loss_divisor(&self) -> f64 {
        self.steps as f64
    }

    /// Logical steps completed after `micro_batches` micro-batches.
    pub fn fires_in(&self, micro_batches: usize) -> usize {
        micro_batches / self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_steps_is_rejected() {
        assert!(matches!(
            GradientAccumulator::new(0),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn single_step_fires_every_time() {
        let acc = GradientAccumulator::new(1).unwrap();
        assert!((0..5).all(|i| acc.decide(i) == Accumulation::Fire));
        assert_eq!(acc.loss_divisor(), 1.0);
    }

    #[test]
    fn fires_on_last_micro_batch_of_each_group() {
        let acc = GradientAccumulator::new(3).unwrap();
        let fired: Vec<usize> = (0..8)
            .filter(|&i| acc.decide(i) == Accumulation::Fire)
            .collect();
        assert_eq!(fired, vec![2, 5]);
    }

    proptest! {
        #[test]
        fn fire_count_is_floor_of_ratio(k in 1usize..16, n in 0usize..200) {
            let acc = GradientAccumulator::new(k).unwrap();
            let fires = (0..n).filter(|&i| acc.decide(i) == Accumulation::Fire).count();
            prop_assert_eq!(fires, n / k);
            prop_assert_eq!(acc.fires_in(n), n / k);
        }

        #[test]
        fn micro_index_stays_in_range(k in 1usize..16, i in 0usize..1000) {
            let acc = GradientAccumulator::new(k).unwrap();
            let idx = acc.micro_index(i);
            prop_assert!(idx < k);
            if acc.decide(i) == Accumulation::Fire {
                prop_assert_eq!(idx, k - 1);
            }
        }
    }
}
