use std::collections::BTreeMap;

use tch::{nn, Kind, Tensor};

use crate::error::Result;

/// Parameters sharing a learning rate and a weight decay.
#[derive(Debug)]
pub struct ParamGroup {
    pub names: Vec<String>,
    pub params: Vec<Tensor>,
    /// Rate the schedule multiplier is applied to.
    pub base_lr: f64,
    /// Rate used by the next [`Optimizer::step`].
    pub lr: f64,
    pub weight_decay: f64,
}

pub trait Optimizer: Send {
    /// Applies the pending gradients to every parameter.
    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self);

    fn groups(&self) -> &[ParamGroup];

    fn set_lr(&mut self, group: usize, lr: f64);

    /// Sets every group to `base_lr * multiplier`.
    fn apply_multiplier(&mut self, multiplier: f64) {
        let rates: Vec<f64> = self.groups().iter().map(|g| g.base_lr * multiplier).collect();
        for (i, lr) in rates.into_iter().enumerate() {
            self.set_lr(i, lr);
        }
    }
}

/// Names that are excluded from weight decay by default.
pub fn no_decay(name: &str) -> bool {
    name.contains("bias") || name.contains("norm")
}

/// Partitions the trainable variables of `vs` into groups keyed by
/// (decay excluded, learning rate). Excluded parameters get a weight decay of
/// 0, the rest `weight_decay`. Groups and the parameters inside them are in
/// name order.
pub fn group_parameters(
    vs: &nn::VarStore,
    exclude_from_decay: impl Fn(&str) -> bool,
    lr_for: impl Fn(&str) -> f64,
    weight_decay: f64,
) -> Vec<ParamGroup> {
    let mut named: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(_, t)| t.requires_grad())
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: BTreeMap<(bool, u64), ParamGroup> = BTreeMap::new();
    for (name, tensor) in named {
        let excluded = exclude_from_decay(&name);
        let lr = lr_for(&name);
        let group = groups
            .entry((excluded, lr.to_bits()))
            .or_insert_with(|| ParamGroup {
                names: Vec::new(),
                params: Vec::new(),
                base_lr: lr,
                lr,
                weight_decay: if excluded { 0.0 } else { weight_decay },
            });
        group.names.push(name);
        group.params.push(tensor);
    }
    groups.into_values().collect()
}

/// Adam as used for BERT fine-tuning: no bias correction, weight decay added
/// to the update rather than to the gradient.
#[derive(Debug)]
pub struct BertAdam {
    groups: Vec<ParamGroup>,
    /// First and second moments, lazily created, one per parameter.
    state: Vec<Vec<Option<(Tensor, Tensor)>>>,
    beta1: f64,
    beta2: f64,
    eps: f64,
}

impl BertAdam {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self::with_betas(groups, 0.9, 0.999, 1e-6)
    }

    pub fn with_betas(groups: Vec<ParamGroup>, beta1: f64, beta2: f64, eps: f64) -> Self {
        let state = groups
            .iter()
            .map(|g| (0..g.params.len()).map(|_| None).collect())
            .collect();
        Self {
            groups,
            state,
            beta1,
            beta2,
            eps,
        }
    }
}

impl Optimizer for BertAdam {
    fn step(&mut self) -> Result<()> {
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        tch::no_grad(|| -> Result<()> {
            for (group, state) in self.groups.iter().zip(self.state.iter_mut()) {
                for (param, slot) in group.params.iter().zip(state.iter_mut()) {
                    let grad = param.grad();
                    if !grad.defined() {
                        continue;
                    }
                    let grad = grad.to_kind(Kind::Float);
                    let (exp_avg, exp_avg_sq) = slot.get_or_insert_with(|| {
                        (Tensor::zeros_like(&grad), Tensor::zeros_like(&grad))
                    });

                    *exp_avg = &*exp_avg * beta1 + &grad * (1.0 - beta1);
                    *exp_avg_sq = &*exp_avg_sq * beta2 + grad.square() * (1.0 - beta2);

                    let mut update = &*exp_avg / (exp_avg_sq.sqrt() + eps);
                    if group.weight_decay > 0.0 {
                        update += param.to_kind(Kind::Float) * group.weight_decay;
                    }
                    let mut param = param.shallow_clone();
                    let _ = param.f_sub_(&(update * group.lr).to_kind(param.kind()))?;
                }
            }
            Ok(())
        })
    }

    fn zero_grad(&mut self) {
        for group in &self.groups {
            for param in &group.params {
                let mut grad = param.grad();
                if grad.defined() {
                    let _ = grad.detach_().zero_();
                }
            }
        }
    }

    fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn set_lr(&mut self, group: usize, lr: f64) {
        if let Some(g) = self.groups.get_mut(group) {
            g.lr = lr;
        }
    }
}

/// L2 norm over all gradients taken together.
pub fn grad_norm(params: &[Tensor]) -> Result<f64> {
    let mut total = 0.0;
    for p in params {
        let grad = p.grad();
        if grad.defined() {
            total += grad
                .f_to_kind(Kind::Double)?
                .f_square()?
                .f_sum(Kind::Double)?
                .f_double_value(&[])?;
        }
    }
    Ok(total.sqrt())
}

/// Rescales gradients in place so their global norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(params)?;
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        tch::no_grad(|| -> Result<()> {
            for p in params {
                let mut grad = p.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(coef)?;
                }
            }
            Ok(())
        })?;
    }
    Ok(norm)
}
