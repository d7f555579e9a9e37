//! The classifier contract consumed by the calibrated classifier, plus a
//! penalized logistic regression that satisfies it.

use crate::estimate::CalibrationError;
use crate::folds::FoldError;
use crate::model::ModelError;
use crate::regression::{self, IrlsOptions, RegressionError, fit_penalized_logistic};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use thiserror::Error;

/// Errors raised by classifiers and by the calibrated classifier wrapping them.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("The classifier has not been fitted yet. Call fit before predicting.")]
    NotFitted,

    #[error("The base classifier violated its contract: {0}")]
    ContractViolation(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Feature matrix has {rows} rows, but {labels} labels were supplied.")]
    LengthMismatch { rows: usize, labels: usize },

    #[error("Model was trained on {expected} features, but {found} were supplied.")]
    FeatureMismatch { expected: usize, found: usize },

    #[error("Labels must take exactly two distinct values, but {0} were found.")]
    NotBinary(usize),

    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Applying the calibrator failed: {0}")]
    Model(#[from] ModelError),

    #[error("Regression failed: {0}")]
    Regression(#[from] RegressionError),

    #[error("Fold generation failed: {0}")]
    Folds(#[from] FoldError),
}

/// A trainable binary classifier.
///
/// These four operations are all the calibrated classifier relies on.
pub trait BinaryClassifier: Send + Sync {
    /// Trains on `features` (one row per sample) and their class `labels`.
    fn fit(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
    ) -> Result<(), ClassifierError>;

    /// Class probabilities, shape `[n_samples, 2]`, columns ordered as `classes()`.
    fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError>;

    /// An untrained copy with identical configuration.
    fn clone_untrained(&self) -> Box<dyn BinaryClassifier>;

    /// The `[negative, positive]` class labels seen during fitting, or `None`
    /// before the first fit.
    fn classes(&self) -> Option<[f64; 2]>;
}

/// Sorted distinct label values, required to number exactly two.
pub fn binary_classes(labels: ArrayView1<f64>) -> Result<[f64; 2], ClassifierError> {
    let mut distinct = labels.to_vec();
    distinct.sort_unstable_by(f64::total_cmp);
    distinct.dedup();
    match distinct.as_slice() {
        [negative, positive] => Ok([*negative, *positive]),
        [] => Err(ClassifierError::InsufficientData(
            "no labels were supplied".to_string(),
        )),
        [only] => Err(ClassifierError::InsufficientData(format!(
            "every label is {only}; two classes are required"
        ))),
        more => Err(ClassifierError::NotBinary(more.len())),
    }
}

/// 1.0 where the label equals the positive class, 0.0 elsewhere.
pub fn positive_indicator(labels: ArrayView1<f64>, classes: [f64; 2]) -> Array1<f64> {
    labels.mapv(|label| if label == classes[1] { 1.0 } else { 0.0 })
}

/// L2-penalized logistic regression on the raw features with an unpenalized
/// intercept.
#[derive(Clone, Debug)]
pub struct LogisticClassifier {
    /// Inverse regularization strength `C`.
    pub inverse_strength: f64,
    pub irls: IrlsOptions,
    fitted: Option<FittedLogistic>,
}

#[derive(Clone, Debug)]
struct FittedLogistic {
    coefficients: Array1<f64>,
    classes: [f64; 2],
}

impl LogisticClassifier {
    pub fn new(inverse_strength: f64) -> Self {
        Self {
            inverse_strength,
            irls: IrlsOptions::default(),
            fitted: None,
        }
    }

    /// Fitted coefficients, intercept first.
    pub fn coefficients(&self) -> Option<ArrayView1<'_, f64>> {
        self.fitted.as_ref().map(|f| f.coefficients.view())
    }

    /// `[1 | features]`.
    fn design(features: ArrayView2<f64>) -> Array2<f64> {
        let mut design = Array2::ones((features.nrows(), features.ncols() + 1));
        design.slice_mut(s![.., 1..]).assign(&features);
        design
    }
}

impl Default for LogisticClassifier {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl BinaryClassifier for LogisticClassifier {
    fn fit(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
    ) -> Result<(), ClassifierError> {
        if features.nrows() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                rows: features.nrows(),
                labels: labels.len(),
            });
        }
        let classes = binary_classes(labels)?;
        let targets = positive_indicator(labels, classes);
        let design = Self::design(features);
        let fit = fit_penalized_logistic(
            design.view(),
            targets.view(),
            self.inverse_strength,
            &self.irls,
        )?;
        if fit.status == regression::FitStatus::MaxIterationsReached {
            log::warn!(
                "Logistic classifier stopped after {} iterations without converging.",
                fit.iterations
            );
        }
        self.fitted = Some(FittedLogistic {
            coefficients: fit.coefficients,
            classes,
        });
        Ok(())
    }

    fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
        let fitted = self.fitted.as_ref().ok_or(ClassifierError::NotFitted)?;
        let expected = fitted.coefficients.len() - 1;
        if features.ncols() != expected {
            return Err(ClassifierError::FeatureMismatch {
                expected,
                found: features.ncols(),
            });
        }
        let positive = regression::logistic_probabilities(
            Self::design(features).view(),
            fitted.coefficients.view(),
        );
        Ok(two_column_probabilities(positive.view()))
    }

    fn clone_untrained(&self) -> Box<dyn BinaryClassifier> {
        Box::new(Self {
            inverse_strength: self.inverse_strength,
            irls: self.irls,
            fitted: None,
        })
    }

    fn classes(&self) -> Option<[f64; 2]> {
        self.fitted.as_ref().map(|f| f.classes)
    }
}

/// Stacks `[1 - p, p]` column-wise.
pub fn two_column_probabilities(positive: ArrayView1<f64>) -> Array2<f64> {
    let mut out = Array2::zeros((positive.len(), 2));
    out.column_mut(0).assign(&positive.mapv(|p| 1.0 - p));
    out.column_mut(1).assign(&positive);
    out
}
