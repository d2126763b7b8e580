use log::warn;
use tch::{Kind, Tensor};

use crate::config::PrecisionMode;
use crate::error::Result;

/// Dynamic loss-scale defaults.
pub const DEFAULT_INITIAL_SCALE: f64 = 4_294_967_296.0; // 2^32
pub const DEFAULT_SCALE_FACTOR: f64 = 2.0;
pub const DEFAULT_SCALE_WINDOW: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
enum ScaleState {
    Full,
    Static {
        scale: f64,
    },
    Dynamic {
        scale: f64,
        factor: f64,
        window: usize,
        stable_steps: usize,
    },
}

/// Loss scaling for reduced-precision training.
///
/// Master parameters and optimizer state stay `f32`; only the forward pass
/// runs under autocast. The loss is multiplied by the current scale before
/// backward and the gradients are divided by it before the optimizer sees
/// them. With a dynamic scale a non-finite gradient halves the scale and the
/// step is skipped; `window` consecutive finite steps double it.
#[derive(Debug, Clone)]
pub struct PrecisionPolicy {
    state: ScaleState,
    overflows: usize,
}

impl PrecisionPolicy {
    pub fn new(mode: PrecisionMode) -> Self {
        let state = match mode {
            PrecisionMode::Full => ScaleState::Full,
            PrecisionMode::ReducedStatic { scale } => ScaleState::Static { scale },
            PrecisionMode::ReducedDynamic => ScaleState::Dynamic {
                scale: DEFAULT_INITIAL_SCALE,
                factor: DEFAULT_SCALE_FACTOR,
                window: DEFAULT_SCALE_WINDOW,
                stable_steps: 0,
            },
        };
        Self {
            state,
            overflows: 0,
        }
    }

    pub fn dynamic(initial_scale: f64, factor: f64, window: usize) -> Self {
        Self {
            state: ScaleState::Dynamic {
                scale: initial_scale.max(1.0),
                factor,
                window: window.max(1),
                stable_steps: 0,
            },
            overflows: 0,
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self.state, ScaleState::Full)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.state, ScaleState::Dynamic { .. })
    }

    pub fn loss_scale(&self) -> f64 {
        match self.state {
            ScaleState::Full => 1.0,
            ScaleState::Static { scale } | ScaleState::Dynamic { scale, .. } => scale,
        }
    }

    /// Skipped steps so far.
    pub fn overflow_count(&self) -> usize {
        self.overflows
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        match self.state {
            ScaleState::Full => loss.shallow_clone(),
            _ => loss * self.loss_scale(),
        }
    }

    /// Divides every defined gradient by the current scale in place.
    pub fn unscale_gradients(&self, params: &[Tensor]) -> Result<()> {
        if !self.is_reduced() {
            return Ok(());
        }
        let inv = 1.0 / self.loss_scale();
        tch::no_grad(|| -> Result<()> {
            for p in params {
                let mut grad = p.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(inv)?;
                }
            }
            Ok(())
        })
    }

    /// True if any gradient holds a non-finite value. Only a dynamic scale
    /// looks; full precision and static scaling never skip a step.
    pub fn has_overflow(&self, params: &[Tensor]) -> Result<bool> {
        if !self.is_dynamic() {
            return Ok(false);
        }
        tch::no_grad(|| -> Result<bool> {
            for p in params {
                let grad = p.grad();
                if !grad.defined() {
                    continue;
                }
                let total = grad.f_sum(Kind::Double)?.f_double_value(&[])?;
                if !total.is_finite() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Records the outcome of a logical step and adjusts a dynamic scale.
    pub fn update(&mut self, overflow: bool) {
        if let ScaleState::Dynamic {
            scale,
            factor,
            window,
            stable_steps,
        } = &mut self.state
        {
            if overflow {
                let previous = *scale;
                *scale = (*scale / *factor).max(1.0);
                *stable_steps = 0;
                self.overflows += 1;
                warn!(
                    "gradient overflow, skipping step; loss scale {} -> {}",
                    previous, scale
                );
            } else {
                *stable_steps += 1;
                if *stable_steps >= *window {
                    *scale *= *factor;
                    *stable_steps = 0;
                }
            }
        }
    }
}
