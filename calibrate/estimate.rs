// calibrate/estimate.rs

//! # Calibration Fitting
//!
//! Turns ground-truth labels and matching raw scores into a `SplineCalibrator`:
//!
//! 1.  **Knots:** sorted unique scores, thinned to `max_knots` with a seeded RNG
//!     (or every unique score, or the user's explicit knots).
//! 2.  **Basis:** the natural cubic spline design matrix over those knots.
//! 3.  **Regression:** labels regressed on the basis, with the regularization
//!     strength chosen by an inner cross-validation over a geometric grid.
//!
//! The scores should come from data the scoring model did not train on, such as
//! the out-of-fold scores assembled by the calibrated classifier.

use crate::basis::{self, natural_cubic_spline_basis, select_knots};
use crate::model::{CalibrationConfig, CalibrationMethod, SplineCalibrator};
use crate::regression::{self, LogisticRegressionCv, RidgeCv};
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

/// A comprehensive error type for the calibration fitting process.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Insufficient data for calibration: {0}")]
    InsufficientData(String),

    #[error("{labels} labels were supplied for {scores} scores.")]
    LengthMismatch { labels: usize, scores: usize },

    #[error("Calibration labels must be 0 or 1, but found {0}.")]
    NonBinaryLabels(f64),

    #[error("Invalid calibration configuration: {0}")]
    InvalidConfig(String),

    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] basis::BasisError),

    #[error("Regularized regression failed: {0}")]
    RegressionError(#[from] regression::RegressionError),
}

/// The main entry point for calibration fitting.
///
/// `labels` are 0/1 outcomes and `scores` the matching raw classifier scores.
/// Degenerate inputs (no samples, fewer than two distinct scores, fewer samples
/// than inner folds, or a single class under the logistic method) fail with
/// `CalibrationError::InsufficientData` instead of falling back to an identity
/// mapping.
pub fn fit_calibration(
    labels: ArrayView1<f64>,
    scores: ArrayView1<f64>,
    config: &CalibrationConfig,
) -> Result<SplineCalibrator, CalibrationError> {
    internal::validate_config(config)?;
    if labels.len() != scores.len() {
        return Err(CalibrationError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(CalibrationError::InsufficientData(
            "no samples were supplied".to_string(),
        ));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y != 0.0 && y != 1.0) {
        return Err(CalibrationError::NonBinaryLabels(bad));
    }
    if labels.len() < config.inner_folds {
        return Err(CalibrationError::InsufficientData(format!(
            "{} samples cannot fill {} inner cross-validation folds",
            labels.len(),
            config.inner_folds
        )));
    }

    // 1. Knot set, drawn with an explicit generator so repeated fits agree.
    let mut rng = StdRng::seed_from_u64(config.random_state);
    let knots = match select_knots(scores, &config.knots, config.max_knots, &mut rng) {
        Ok(knots) => knots,
        Err(basis::BasisError::TooFewKnots { found }) => {
            return Err(CalibrationError::InsufficientData(format!(
                "a spline needs at least 2 distinct scores, found {found}"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    log::info!(
        "Using {} knots between {:.6} and {:.6}.",
        knots.len(),
        knots[0],
        knots[knots.len() - 1]
    );

    // 2. Basis expansion of the training scores.
    let x_matrix = natural_cubic_spline_basis(scores, knots.view())?;

    // 3. Cross-validated regression.
    let grid = config.grid();
    let (min_strength, max_strength) = grid
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let fitted = match config.method {
        CalibrationMethod::Logistic => {
            let positives = labels.iter().filter(|&&y| y == 1.0).count();
            if positives == 0 || positives == labels.len() {
                return Err(CalibrationError::InsufficientData(format!(
                    "logistic calibration needs both classes, but every label is {}",
                    labels[0]
                )));
            }
            log::info!(
                "Trying {} values of C between {:e} and {:e}",
                grid.len(),
                min_strength,
                max_strength
            );
            let fitted =
                LogisticRegressionCv::new(grid, config.inner_folds).fit(x_matrix.view(), labels)?;
            log::info!("Best value found C = {:e}", fitted.selected_strength);
            fitted
        }
        CalibrationMethod::Ridge => {
            log::info!(
                "Trying {} values of alpha between {:e} and {:e}",
                grid.len(),
                min_strength,
                max_strength
            );
            let fitted = RidgeCv::new(grid, config.inner_folds).fit(x_matrix.view(), labels)?;
            log::info!("Best value found alpha = {:e}", fitted.selected_strength);
            fitted
        }
    };

    Ok(SplineCalibrator {
        method: config.method,
        selected_strength: fitted.selected_strength,
        force_prob: config.force_prob,
        eps: config.eps,
        knots,
        coefficients: fitted.coefficients,
    })
}

/// Internal module for estimation-specific implementation details.
mod internal {
    use super::*;

    pub(super) fn validate_config(config: &CalibrationConfig) -> Result<(), CalibrationError> {
        if config.max_knots < 2 {
            return Err(CalibrationError::InvalidConfig(format!(
                "max_knots must be at least 2, got {}",
                config.max_knots
            )));
        }
        if !(config.eps.is_finite() && config.eps >= 0.0 && config.eps < 0.5) {
            return Err(CalibrationError::InvalidConfig(format!(
                "eps must lie in [0, 0.5), got {}",
                config.eps
            )));
        }
        if config.inner_folds < 2 {
            return Err(CalibrationError::InvalidConfig(format!(
                "inner_folds must be at least 2, got {}",
                config.inner_folds
            )));
        }
        if let Some(grid) = &config.regularization_grid {
            if grid.is_empty() {
                return Err(CalibrationError::InvalidConfig(
                    "regularization_grid is empty".to_string(),
                ));
            }
            if let Some(bad) = grid.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
                return Err(CalibrationError::InvalidConfig(format!(
                    "regularization strengths must be positive and finite, got {bad}"
                )));
            }
        }
        Ok(())
    }
}
