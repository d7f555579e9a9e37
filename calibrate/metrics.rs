//! Scoring rules shared by the inner cross-validation and the CLI reports.

use ndarray::{ArrayView1, Zip};

/// Default clipping applied to probabilities and truncated predictions.
pub const DEFAULT_EPS: f64 = 1e-15;

/// Mean binary cross-entropy of `probabilities` against 0/1 `targets`.
/// Probabilities are clipped to `[eps, 1 - eps]` first, so a confident miss
/// costs a large but finite amount.
pub fn log_loss(targets: ArrayView1<f64>, probabilities: ArrayView1<f64>, eps: f64) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total = Zip::from(targets)
        .and(probabilities)
        .fold(0.0, |acc, &y, &p| {
            let p = p.clamp(eps, 1.0 - eps);
            acc - (y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        });
    total / targets.len() as f64
}

/// Mean squared error after clipping `predictions` symmetrically into
/// `[eps, 1 - eps]`. Used to score ridge fits, whose raw output is unbounded.
pub fn truncated_mean_squared_error(
    targets: ArrayView1<f64>,
    predictions: ArrayView1<f64>,
    eps: f64,
) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total = Zip::from(targets)
        .and(predictions)
        .fold(0.0, |acc, &y, &p| {
            let residual = y - p.clamp(eps, 1.0 - eps);
            acc + residual * residual
        });
    total / targets.len() as f64
}

/// Mean squared difference between probabilities and 0/1 outcomes.
pub fn brier_score(targets: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let total = Zip::from(targets)
        .and(probabilities)
        .fold(0.0, |acc, &y, &p| acc + (y - p) * (y - p));
    total / targets.len() as f64
}
