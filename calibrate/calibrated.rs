//! # Cross-Validated Spline Calibration of a Base Classifier
//!
//! The base classifier is trained on each fold's training rows and scores that
//! fold's held-out rows. The held-out scores are assembled into one vector
//! covering every sample, each produced by a model that never saw the sample.
//! A final copy trained on all rows serves predictions, and its raw scores are
//! mapped through a spline calibrator fitted on the out-of-fold vector.
//!
//! With `CvStrategy::Prefit` the supplied classifier is taken as already
//! trained and the data passed to `fit` is used only for calibration.

use crate::classifier::{
    BinaryClassifier, ClassifierError, binary_classes, positive_indicator, two_column_probabilities,
};
use crate::estimate::fit_calibration;
use crate::folds::{self, FoldError, FoldSplit};
use crate::model::{CalibrationConfig, SplineCalibrator};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

/// Default number of outer folds.
pub const DEFAULT_CV_FOLDS: usize = 5;

/// How raw scores for calibration are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvStrategy {
    /// Stratified k-fold with this many folds.
    KFold(usize),
    /// The base classifier is already trained; score the supplied data once.
    Prefit,
}

impl Default for CvStrategy {
    fn default() -> Self {
        CvStrategy::KFold(DEFAULT_CV_FOLDS)
    }
}

impl FromStr for CvStrategy {
    type Err = String;

    /// Accepts `"prefit"` or a fold count of at least 2.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("prefit") {
            return Ok(CvStrategy::Prefit);
        }
        match trimmed.parse::<usize>() {
            Ok(k) if k >= 2 => Ok(CvStrategy::KFold(k)),
            Ok(k) => Err(format!("cv needs at least 2 folds, got {k}")),
            Err(_) => Err(format!(
                "cv must be \"prefit\" or a fold count, got \"{trimmed}\""
            )),
        }
    }
}

impl fmt::Display for CvStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvStrategy::KFold(k) => write!(f, "{k}"),
            CvStrategy::Prefit => write!(f, "prefit"),
        }
    }
}

/// Which classifier serves predictions once fitted.
enum ScoringModel {
    /// The caller's prefit classifier.
    Base,
    /// A copy trained on the full data.
    Trained(Box<dyn BinaryClassifier>),
}

struct FittedState {
    scoring_model: ScoringModel,
    calibrator: SplineCalibrator,
    classes: [f64; 2],
}

enum FitState {
    Unfit,
    Fitted(FittedState),
}

/// A classifier whose probabilities are recalibrated with a natural cubic spline.
pub struct SplineCalibratedClassifier {
    base: Box<dyn BinaryClassifier>,
    cv: CvStrategy,
    config: CalibrationConfig,
    state: FitState,
}

impl SplineCalibratedClassifier {
    pub fn new(base: Box<dyn BinaryClassifier>, cv: CvStrategy, config: CalibrationConfig) -> Self {
        Self {
            base,
            cv,
            config,
            state: FitState::Unfit,
        }
    }

    pub fn cv(&self) -> CvStrategy {
        self.cv
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, FitState::Fitted(_))
    }

    /// `[negative, positive]` labels, available after fitting.
    pub fn classes(&self) -> Option<[f64; 2]> {
        match &self.state {
            FitState::Fitted(fitted) => Some(fitted.classes),
            FitState::Unfit => None,
        }
    }

    /// The fitted calibration function.
    pub fn calibrator(&self) -> Option<&SplineCalibrator> {
        match &self.state {
            FitState::Fitted(fitted) => Some(&fitted.calibrator),
            FitState::Unfit => None,
        }
    }

    /// Trains the classifier and its calibration.
    ///
    /// Any earlier fit is discarded first. Fold failures abort the whole fit,
    /// since a missing fold would leave samples without a leakage-free score.
    pub fn fit(
        &mut self,
        features: ArrayView2<f64>,
        labels: ArrayView1<f64>,
    ) -> Result<(), ClassifierError> {
        self.state = FitState::Unfit;

        if features.nrows() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                rows: features.nrows(),
                labels: labels.len(),
            });
        }
        let classes = binary_classes(labels)?;

        let (scores, scoring_model) = match self.cv {
            CvStrategy::Prefit => {
                match self.base.classes() {
                    None => {
                        return Err(ClassifierError::ContractViolation(
                            "cv = prefit requires a base classifier that has already been fitted"
                                .to_string(),
                        ));
                    }
                    Some(base_classes) if base_classes != classes => {
                        return Err(ClassifierError::ContractViolation(format!(
                            "prefit classifier knows classes {base_classes:?}, but the calibration labels have {classes:?}"
                        )));
                    }
                    Some(_) => {}
                }
                log::info!("Scoring {} samples with the prefit classifier", labels.len());
                let scores = positive_scores(self.base.as_ref(), features)?;
                (scores, ScoringModel::Base)
            }
            CvStrategy::KFold(n_folds) => {
                let mut rng = StdRng::seed_from_u64(self.config.random_state);
                let splits = match folds::stratified_k_fold(labels, n_folds, Some(&mut rng)) {
                    Ok(splits) => splits,
                    Err(FoldError::TooFewSamples {
                        n_samples,
                        n_splits,
                    }) => {
                        return Err(ClassifierError::InsufficientData(format!(
                            "{n_samples} samples cannot be split into {n_splits} folds"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                for split in &splits {
                    let train_labels = labels.select(Axis(0), &split.train_indices);
                    if binary_classes(train_labels.view()).is_err() {
                        return Err(ClassifierError::InsufficientData(format!(
                            "training set of fold {} holds a single class; use fewer folds or more data",
                            split.fold_index + 1
                        )));
                    }
                }

                let scores = cross_val_scores(self.base.as_ref(), features, labels, &splits)?;

                log::info!("Training full model");
                let mut full = self.base.clone_untrained();
                full.fit(features, labels)?;
                check_trained_classes(full.as_ref(), classes, "full-data classifier")?;
                (scores, ScoringModel::Trained(full))
            }
        };

        log::info!("Determining calibration function");
        let targets = positive_indicator(labels, classes);
        let calibrator = fit_calibration(targets.view(), scores.view(), &self.config)?;

        self.state = FitState::Fitted(FittedState {
            scoring_model,
            calibrator,
            classes,
        });
        Ok(())
    }

    /// Calibrated class probabilities `[1 - p, p]`, one row per sample.
    pub fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
        let FitState::Fitted(fitted) = &self.state else {
            return Err(ClassifierError::NotFitted);
        };
        let model: &dyn BinaryClassifier = match &fitted.scoring_model {
            ScoringModel::Base => self.base.as_ref(),
            ScoringModel::Trained(model) => model.as_ref(),
        };
        let raw = positive_scores(model, features)?;
        let calibrated = fitted.calibrator.calibrate(raw.view())?;
        Ok(two_column_probabilities(calibrated.view()))
    }

    /// Class labels: the positive class where the calibrated probability is at
    /// least one half, the negative class elsewhere.
    pub fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ClassifierError> {
        let probabilities = self.predict_probability(features)?;
        let classes = self.classes().ok_or(ClassifierError::NotFitted)?;
        Ok(probabilities
            .column(1)
            .mapv(|p| if p >= 0.5 { classes[1] } else { classes[0] }))
    }
}

/// Assembles leakage-free scores: for every split an untrained copy of `base`
/// is fitted on the training rows and scores the test rows. Folds run in
/// parallel; each writes only its own test positions.
///
/// `splits` must place every sample in exactly one test fold.
pub fn cross_val_scores(
    base: &dyn BinaryClassifier,
    features: ArrayView2<f64>,
    labels: ArrayView1<f64>,
    splits: &[FoldSplit],
) -> Result<Array1<f64>, ClassifierError> {
    let n_samples = labels.len();
    let mut coverage = vec![0usize; n_samples];
    for split in splits {
        for &idx in &split.test_indices {
            if idx >= n_samples {
                return Err(ClassifierError::InsufficientData(format!(
                    "fold {} refers to sample {idx}, but only {n_samples} exist",
                    split.fold_index + 1
                )));
            }
            coverage[idx] += 1;
        }
    }
    if let Some(idx) = coverage.iter().position(|&count| count != 1) {
        return Err(ClassifierError::InsufficientData(format!(
            "sample {idx} appears in {} test folds instead of exactly one",
            coverage[idx]
        )));
    }
    let classes = binary_classes(labels)?;

    let n_folds = splits.len();
    let fold_scores: Vec<(&[usize], Array1<f64>)> = splits
        .par_iter()
        .map(|split| {
            log::info!("Training fold {} of {}", split.fold_index + 1, n_folds);
            let x_train = features.select(Axis(0), &split.train_indices);
            let y_train = labels.select(Axis(0), &split.train_indices);
            let x_test = features.select(Axis(0), &split.test_indices);

            let mut model = base.clone_untrained();
            model.fit(x_train.view(), y_train.view())?;
            check_trained_classes(model.as_ref(), classes, "fold classifier")?;
            let scores = positive_scores(model.as_ref(), x_test.view())?;
            Ok((split.test_indices.as_slice(), scores))
        })
        .collect::<Result<_, ClassifierError>>()?;

    let mut scores = Array1::zeros(n_samples);
    for (test_indices, fold) in fold_scores {
        for (&idx, &score) in test_indices.iter().zip(fold.iter()) {
            scores[idx] = score;
        }
    }
    Ok(scores)
}

/// Positive-class column of `model`'s probabilities, after checking the
/// output has the promised shape and is finite.
fn positive_scores(
    model: &dyn BinaryClassifier,
    features: ArrayView2<f64>,
) -> Result<Array1<f64>, ClassifierError> {
    let probabilities = model.predict_probability(features)?;
    let expected = [features.nrows(), 2];
    if probabilities.shape() != expected {
        return Err(ClassifierError::ContractViolation(format!(
            "predict_probability returned shape {:?}, expected {:?}",
            probabilities.shape(),
            expected
        )));
    }
    if let Some(bad) = probabilities.iter().find(|p| !p.is_finite()) {
        return Err(ClassifierError::ContractViolation(format!(
            "predict_probability returned a non-finite value ({bad})"
        )));
    }
    Ok(probabilities.column(1).to_owned())
}

fn check_trained_classes(
    model: &dyn BinaryClassifier,
    expected: [f64; 2],
    role: &str,
) -> Result<(), ClassifierError> {
    match model.classes() {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(ClassifierError::ContractViolation(format!(
            "{role} reports classes {found:?} after fitting, expected {expected:?}"
        ))),
        None => Err(ClassifierError::ContractViolation(format!(
            "{role} reports no classes after fitting"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LogisticClassifier;
    use ndarray::array;

    /// Scores 0.99 for any sample id it trained on, and `0.01 + id / 10_000`
    /// for ids it never saw, so leakage and misplaced scores are both visible.
    #[derive(Clone, Default)]
    struct MemorizingClassifier {
        seen: Option<Vec<f64>>,
        classes: Option<[f64; 2]>,
    }

    impl BinaryClassifier for MemorizingClassifier {
        fn fit(
            &mut self,
            features: ArrayView2<f64>,
            labels: ArrayView1<f64>,
        ) -> Result<(), ClassifierError> {
            self.seen = Some(features.column(0).to_vec());
            self.classes = Some(binary_classes(labels)?);
            Ok(())
        }

        fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
            let seen = self.seen.as_ref().ok_or(ClassifierError::NotFitted)?;
            let p = features
                .column(0)
                .mapv(|id| if seen.contains(&id) { 0.99 } else { 0.01 + id / 10_000.0 });
            Ok(two_column_probabilities(p.view()))
        }

        fn clone_untrained(&self) -> Box<dyn BinaryClassifier> {
            Box::new(Self::default())
        }

        fn classes(&self) -> Option<[f64; 2]> {
            self.classes
        }
    }

    /// Returns a single probability column.
    #[derive(Clone, Default)]
    struct OneColumnClassifier {
        classes: Option<[f64; 2]>,
    }

    impl BinaryClassifier for OneColumnClassifier {
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
            self.classes = Some(binary_classes(labels)?);
            Ok(())
        }

        fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
            Ok(Array2::from_elem((features.nrows(), 1), 0.5))
        }

        fn clone_untrained(&self) -> Box<dyn BinaryClassifier> {
            Box::new(Self::default())
        }

        fn classes(&self) -> Option<[f64; 2]> {
            self.classes
        }
    }

    /// Trains normally but reports NaN for every probability.
    #[derive(Clone, Default)]
    struct NanClassifier {
        classes: Option<[f64; 2]>,
    }

    impl BinaryClassifier for NanClassifier {
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
            self.classes = Some(binary_classes(labels)?);
            Ok(())
        }

        fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
            self.classes.ok_or(ClassifierError::NotFitted)?;
            Ok(Array2::from_elem((features.nrows(), 2), f64::NAN))
        }

        fn clone_untrained(&self) -> Box<dyn BinaryClassifier> {
            Box::new(Self::default())
        }

        fn classes(&self) -> Option<[f64; 2]> {
            self.classes
        }
    }

    /// Refuses to train on any row set that leaves out sample id 0, so exactly
    /// one fold of a k-fold split fails.
    #[derive(Clone, Default)]
    struct FailingFoldClassifier {
        classes: Option<[f64; 2]>,
    }

    impl BinaryClassifier for FailingFoldClassifier {
        fn fit(
            &mut self,
            features: ArrayView2<f64>,
            labels: ArrayView1<f64>,
        ) -> Result<(), ClassifierError> {
            if !features.column(0).iter().any(|&id| id == 0.0) {
                return Err(ClassifierError::InsufficientData(
                    "training rows exclude sample 0".to_string(),
                ));
            }
            self.classes = Some(binary_classes(labels)?);
            Ok(())
        }

        fn predict_probability(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ClassifierError> {
            self.classes.ok_or(ClassifierError::NotFitted)?;
            Ok(two_column_probabilities(features.column(0).mapv(|id| id / 100.0).view()))
        }

        fn clone_untrained(&self) -> Box<dyn BinaryClassifier> {
            Box::new(Self::default())
        }

        fn classes(&self) -> Option<[f64; 2]> {
            self.classes
        }
    }

    fn quick_config() -> CalibrationConfig {
        CalibrationConfig {
            regularization_grid: Some(vec![0.01, 1.0, 100.0]),
            ..CalibrationConfig::default()
        }
    }

    fn id_features(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 1), |(i, _)| i as f64)
    }

    /// One noisy feature and labels that mostly follow its sign.
    fn noisy_threshold_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array1::linspace(-3.0, 3.0, n);
        let labels = Array1::from_iter(
            x.iter()
                .enumerate()
                .map(|(i, &v)| if v + 1.5 * (i as f64 * 1.7).sin() > 0.0 { 1.0 } else { 0.0 }),
        );
        (x.insert_axis(Axis(1)), labels)
    }

    #[test]
    fn cross_val_scores_never_come_from_a_model_that_saw_the_sample() {
        let n = 40;
        let features = id_features(n);
        let labels = Array1::from_iter((0..n).map(|i| (i % 2) as f64));
        let splits = folds::stratified_k_fold(labels.view(), 5, None).unwrap();

        let scores = cross_val_scores(
            &MemorizingClassifier::default(),
            features.view(),
            labels.view(),
            &splits,
        )
        .unwrap();

        for (i, &score) in scores.iter().enumerate() {
            assert_eq!(score, 0.01 + i as f64 / 10_000.0, "sample {i} was leaked or misplaced");
        }
    }

    #[test]
    fn overlapping_folds_are_rejected() {
        let labels = array![0.0, 1.0, 0.0, 1.0];
        let split = FoldSplit {
            fold_index: 0,
            train_indices: vec![2, 3],
            test_indices: vec![0, 1],
        };
        let result = cross_val_scores(
            &MemorizingClassifier::default(),
            id_features(4).view(),
            labels.view(),
            &[split.clone(), split],
        );
        assert!(matches!(result, Err(ClassifierError::InsufficientData(_))));
    }

    #[test]
    fn predict_before_fit_is_not_fitted() {
        let clf = SplineCalibratedClassifier::new(
            Box::new(LogisticClassifier::default()),
            CvStrategy::default(),
            quick_config(),
        );
        assert!(!clf.is_fitted());
        assert!(matches!(
            clf.predict_probability(array![[0.0]].view()),
            Err(ClassifierError::NotFitted)
        ));
        assert!(matches!(clf.predict(array![[0.0]].view()), Err(ClassifierError::NotFitted)));
    }

    #[test]
    fn predictions_are_valid_probabilities_and_repeatable() {
        let (features, labels) = noisy_threshold_data(60);
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(LogisticClassifier::default()),
            CvStrategy::KFold(3),
            quick_config(),
        );
        clf.fit(features.view(), labels.view()).unwrap();
        assert_eq!(clf.classes(), Some([0.0, 1.0]));

        let grid = Array1::linspace(-5.0, 5.0, 21).insert_axis(Axis(1));
        let first = clf.predict_probability(grid.view()).unwrap();
        let second = clf.predict_probability(grid.view()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shape(), &[21, 2]);
        for row in first.rows() {
            assert!((0.0..=1.0).contains(&row[1]));
            assert!((row[0] + row[1] - 1.0).abs() < 1e-12);
        }

        let predicted = clf.predict(grid.view()).unwrap();
        for (label, p) in predicted.iter().zip(first.column(1)) {
            assert_eq!(*label, if *p >= 0.5 { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn prefit_requires_a_trained_base() {
        let (features, labels) = noisy_threshold_data(30);
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(LogisticClassifier::default()),
            CvStrategy::Prefit,
            quick_config(),
        );
        assert!(matches!(
            clf.fit(features.view(), labels.view()),
            Err(ClassifierError::ContractViolation(_))
        ));
        assert!(!clf.is_fitted());
    }

    #[test]
    fn malformed_probability_output_is_a_contract_violation() {
        let (features, labels) = noisy_threshold_data(30);
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(OneColumnClassifier::default()),
            CvStrategy::KFold(3),
            quick_config(),
        );
        assert!(matches!(
            clf.fit(features.view(), labels.view()),
            Err(ClassifierError::ContractViolation(_))
        ));
    }

    #[test]
    fn prefit_base_with_other_classes_is_a_contract_violation() {
        let features = id_features(20);
        let labels = Array1::from_iter((0..20).map(|i| (i % 2) as f64));
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(MemorizingClassifier {
                seen: Some(vec![]),
                classes: Some([0.0, 2.0]),
            }),
            CvStrategy::Prefit,
            quick_config(),
        );
        match clf.fit(features.view(), labels.view()) {
            Err(ClassifierError::ContractViolation(message)) => {
                assert!(message.contains("[0.0, 2.0]"), "unexpected message: {message}");
            }
            other => panic!("expected a contract violation, got {other:?}"),
        }
        assert!(!clf.is_fitted());
    }

    #[test]
    fn nan_probabilities_are_a_contract_violation() {
        let (features, labels) = noisy_threshold_data(30);
        for cv in [CvStrategy::KFold(3), CvStrategy::Prefit] {
            let mut base = NanClassifier::default();
            base.fit(features.view(), labels.view()).unwrap();
            let mut clf = SplineCalibratedClassifier::new(Box::new(base), cv, quick_config());
            match clf.fit(features.view(), labels.view()) {
                Err(ClassifierError::ContractViolation(message)) => {
                    assert!(message.contains("non-finite"), "unexpected message: {message}");
                }
                other => panic!("expected a contract violation with cv = {cv}, got {other:?}"),
            }
            assert!(!clf.is_fitted());
        }
    }

    #[test]
    fn a_failing_fold_aborts_the_fit() {
        let features = id_features(20);
        let labels = Array1::from_iter((0..20).map(|i| (i % 2) as f64));
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(FailingFoldClassifier::default()),
            CvStrategy::KFold(4),
            quick_config(),
        );
        match clf.fit(features.view(), labels.view()) {
            Err(ClassifierError::InsufficientData(message)) => {
                assert_eq!(message, "training rows exclude sample 0");
            }
            other => panic!("expected the fold's error, got {other:?}"),
        }
        assert!(!clf.is_fitted());
        assert!(clf.calibrator().is_none());
        assert!(matches!(
            clf.predict_probability(features.view()),
            Err(ClassifierError::NotFitted)
        ));
    }

    #[test]
    fn a_fold_without_both_classes_is_insufficient() {
        let features = id_features(10);
        let mut labels = Array1::zeros(10);
        labels[4] = 1.0;
        let mut clf = SplineCalibratedClassifier::new(
            Box::new(MemorizingClassifier::default()),
            CvStrategy::KFold(2),
            quick_config(),
        );
        assert!(matches!(
            clf.fit(features.view(), labels.view()),
            Err(ClassifierError::InsufficientData(_))
        ));
    }

    #[test]
    fn cv_strategy_parses_prefit_and_counts() {
        assert_eq!("prefit".parse::<CvStrategy>(), Ok(CvStrategy::Prefit));
        assert_eq!(" 3 ".parse::<CvStrategy>(), Ok(CvStrategy::KFold(3)));
        assert!("1".parse::<CvStrategy>().is_err());
        assert!("five".parse::<CvStrategy>().is_err());
        assert_eq!(CvStrategy::default(), CvStrategy::KFold(5));
        assert_eq!(CvStrategy::KFold(7).to_string(), "7");
    }
}
