use crate::dataset::DataLoader;
use crate::error::{Result, TrainError};
use crate::loss::{batch_score, batch_upper_bound};
use crate::replica::ReplicaCoordinator;

/// Mean credit and mean best-attainable credit over a held-out split, both
/// in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalResult {
    pub score: f64,
    pub upper_bound: f64,
}

/// Runs the whole loader through the logical model with gradients disabled.
/// The caller is responsible for switching the coordinator to inference mode.
pub fn evaluate(coordinator: &dyn ReplicaCoordinator, loader: &DataLoader) -> Result<EvalResult> {
    let total = loader.num_examples();
    if total == 0 {
        return Err(TrainError::Data("evaluation split is empty".to_string()));
    }

    let mut score = 0.0;
    let mut upper_bound = 0.0;
    for batch in loader.iter(0) {
        let batch = batch?;
        let (s, u) = tch::no_grad(|| -> Result<(f64, f64)> {
            let logits = coordinator.forward(&batch)?;
            let target = batch.target.to_device(logits.device());
            Ok((batch_score(&logits, &target)?, batch_upper_bound(&target)?))
        })?;
        score += s;
        upper_bound += u;
    }

    Ok(EvalResult {
        score: score / total as f64,
        upper_bound: upper_bound / total as f64,
    })
}
