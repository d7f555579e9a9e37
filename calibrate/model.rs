use crate::basis::{self, DEFAULT_MAX_KNOTS, KnotStrategy, natural_cubic_spline_basis};
use crate::metrics::DEFAULT_EPS;
use crate::regression::{self, DEFAULT_INNER_FOLDS};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format of a calibration
// configuration and of a fitted calibrator.

/// Default seed for knot subsampling.
pub const DEFAULT_RANDOM_STATE: u64 = 942;

/// The regression used to map the spline basis onto probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMethod {
    /// Penalized logistic regression scored by log-loss. The logit link keeps
    /// output inside (0, 1) without clipping.
    #[default]
    Logistic,
    /// Ridge regression scored by truncated squared error. Tends to do better on
    /// Brier score, worse on log-loss.
    Ridge,
}

/// Every recognized calibration option. Missing fields in a TOML file fall
/// back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub method: CalibrationMethod,
    pub max_knots: usize,
    /// Clip ridge output into `[eps, 1 - eps]`.
    pub force_prob: bool,
    pub eps: f64,
    /// Seed for knot subsampling.
    pub random_state: u64,
    /// Folds used to select the regularization strength.
    pub inner_folds: usize,
    /// Candidate strengths (`C` for logistic, `alpha` for ridge). `None`
    /// selects the method's default grid.
    pub regularization_grid: Option<Vec<f64>>,
    pub knots: KnotStrategy,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::Logistic,
            max_knots: DEFAULT_MAX_KNOTS,
            force_prob: true,
            eps: DEFAULT_EPS,
            random_state: DEFAULT_RANDOM_STATE,
            inner_folds: DEFAULT_INNER_FOLDS,
            regularization_grid: None,
            knots: KnotStrategy::Sample,
        }
    }
}

impl CalibrationConfig {
    /// The strengths that will be searched for the configured method.
    pub fn grid(&self) -> Vec<f64> {
        match (&self.regularization_grid, self.method) {
            (Some(grid), _) => grid.clone(),
            (None, CalibrationMethod::Logistic) => regression::LogisticRegressionCv::default_grid(),
            (None, CalibrationMethod::Ridge) => regression::RidgeCv::default_grid(),
        }
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

/// A fitted calibration function: raw classifier score to probability.
///
/// Holds the knot set and regression coefficients from one fit and is never
/// mutated afterwards. New scores are expanded on the stored knots, not on
/// knots recomputed from the new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineCalibrator {
    pub method: CalibrationMethod,
    /// Strength chosen by the inner cross-validation.
    pub selected_strength: f64,
    pub force_prob: bool,
    pub eps: f64,
    pub knots: Array1<f64>,
    /// One coefficient per basis column, intercept first.
    pub coefficients: Array1<f64>,
}

/// Custom error type for calibrator persistence and application.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Basis expansion of the scores failed: {0}")]
    BasisError(#[from] basis::BasisError),
    #[error("Calibrator has {coefficients} coefficients for {knots} knots; the file is malformed.")]
    CoefficientMismatch { coefficients: usize, knots: usize },
}

impl SplineCalibrator {
    /// Maps raw scores to calibrated probabilities.
    ///
    /// Scores outside the knot range are not clipped; the natural spline
    /// extrapolates linearly there. Logistic output is the logit-link mean and
    /// lies in `[0, 1]` by construction. Ridge output is the raw regression
    /// prediction, clipped into `[eps, 1 - eps]` when `force_prob` is set.
    pub fn calibrate(&self, scores: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        if self.coefficients.len() != self.knots.len() {
            return Err(ModelError::CoefficientMismatch {
                coefficients: self.coefficients.len(),
                knots: self.knots.len(),
            });
        }
        let basis_matrix = natural_cubic_spline_basis(scores, self.knots.view())?;

        let calibrated = match self.method {
            CalibrationMethod::Logistic => {
                regression::logistic_probabilities(basis_matrix.view(), self.coefficients.view())
            }
            CalibrationMethod::Ridge => {
                let mut raw =
                    regression::linear_predictor(basis_matrix.view(), self.coefficients.view());
                if self.force_prob {
                    let eps = self.eps;
                    raw.mapv_inplace(|p| p.clamp(eps, 1.0 - eps));
                }
                raw
            }
        };
        Ok(calibrated)
    }

    /// Saves the calibrator to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a calibrator from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let calibrator: Self = toml::from_str(&toml_string)?;
        if calibrator.coefficients.len() != calibrator.knots.len() {
            return Err(ModelError::CoefficientMismatch {
                coefficients: calibrator.coefficients.len(),
                knots: calibrator.knots.len(),
            });
        }
        Ok(calibrator)
    }
}
