use tch::{Kind, Reduction, Tensor};

use crate::error::Result;

/// Mean binary cross-entropy over every (example, label) cell, multiplied by
/// the label width so the magnitude matches a per-example sum.
pub fn instance_bce_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let width = labels.size().last().copied().unwrap_or(1) as f64;
    let labels = labels.f_to_kind(logits.kind())?;
    let loss = logits.f_binary_cross_entropy_with_logits::<Tensor>(&labels, None, None, Reduction::Mean)?;
    Ok(loss.f_mul_scalar(width)?)
}

/// Per-cell credit: the target weight at the argmax position, zero
/// elsewhere. `[B, L]` in, `[B, L]` out.
pub fn compute_score_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let predicted = logits.f_argmax(1, true)?;
    let one_hot = Tensor::f_zeros(labels.size(), (Kind::Float, labels.device()))?
        .f_scatter_value(1, &predicted, 1.0)?;
    Ok(one_hot.f_mul(&labels.f_to_kind(Kind::Float)?)?)
}

/// Summed credit over a batch.
pub fn batch_score(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let credit = compute_score_with_logits(logits, labels)?;
    Ok(credit.f_sum(Kind::Double)?.f_double_value(&[])?)
}

/// Sum over the batch of each example's best attainable credit.
pub fn batch_upper_bound(labels: &Tensor) -> Result<f64> {
    let (best, _) = labels.f_to_kind(Kind::Double)?.f_max_dim(1, false)?;
    Ok(best.f_sum(Kind::Double)?.f_double_value(&[])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_on_the_labelled_answer_scores_one() {
        let labels = Tensor::from_slice(&[0f32, 1.0, 0.0]).view([1, 3]);
        let hit = Tensor::from_slice(&[0.1f32, 0.9, 0.2]).view([1, 3]);
        let miss = Tensor::from_slice(&[0.9f32, 0.1, 0.2]).view([1, 3]);
        assert_eq!(batch_score(&hit, &labels).unwrap(), 1.0);
        assert_eq!(batch_score(&miss, &labels).unwrap(), 0.0);
    }

    #[test]
    fn soft_targets_give_partial_credit() {
        let labels = Tensor::from_slice(&[0.3f32, 0.6, 0.0, 1.0, 0.0, 0.0]).view([2, 3]);
        let logits = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0]).view([2, 3]);
        let score = batch_score(&logits, &labels).unwrap();
        assert!((score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn upper_bound_is_sum_of_row_maxima() {
        let labels = Tensor::from_slice(&[0.3f32, 0.6, 0.0, 0.0, 0.0, 0.0, 1.0, 0.9, 0.0]).view([3, 3]);
        let bound = batch_upper_bound(&labels).unwrap() / 3.0;
        assert!((bound - (0.6 + 0.0 + 1.0) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn loss_is_mean_bce_times_label_width() {
        let logits = Tensor::zeros([2, 4], (Kind::Float, tch::Device::Cpu));
        let labels = Tensor::zeros([2, 4], (Kind::Float, tch::Device::Cpu));
        let loss = instance_bce_with_logits(&logits, &labels).unwrap().double_value(&[]);
        assert!((loss - 4.0 * std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn label_width_mismatch_is_an_error() {
        let logits = Tensor::from_slice(&[0.1f32, 0.2, 0.3, 0.4, 0.9]).view([1, 5]);
        let labels = Tensor::zeros([1, 4], (Kind::Float, tch::Device::Cpu));
        assert!(batch_score(&logits, &labels).is_err());
        assert!(instance_bce_with_logits(&logits, &labels).is_err());
    }
}
