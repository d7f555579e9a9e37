#![deny(dead_code)]
#![deny(unused_imports)]

//! Spline-based probability calibration for binary classifiers.
//!
//! Raw scores are expanded in a natural cubic spline basis and regressed onto
//! the labels, giving a smooth map from score to probability.
//! `calibrated::SplineCalibratedClassifier` wraps a base classifier and fits
//! that map on leakage-free out-of-fold scores; `estimate::fit_calibration`
//! fits it directly from labels and scores.

pub mod basis;
pub mod calibrated;
pub mod classifier;
pub mod data;
pub mod estimate;
pub mod folds;
pub mod metrics;
pub mod model;
pub mod regression;
