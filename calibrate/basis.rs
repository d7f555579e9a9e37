use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on the number of knots derived from training scores.
pub const DEFAULT_MAX_KNOTS: usize = 200;

/// Defines how the knot set of the calibration spline is chosen.
/// This is part of the public configuration and is saved alongside a fitted calibrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnotStrategy {
    /// Use the sorted unique training scores as knots, randomly thinning the
    /// interior knots when there are more than `max_knots` of them.
    /// The smallest and largest score are always kept.
    #[default]
    Sample,
    /// Use every sorted unique training score as a knot, ignoring `max_knots`.
    All,
    /// Use exactly these knots. They must be finite, strictly increasing and
    /// contain at least two values.
    Explicit(Vec<f64>),
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("A natural cubic spline needs at least 2 distinct knots, but only {found} were available.")]
    TooFewKnots { found: usize },

    #[error("Knots must be strictly increasing, but knot {index} ({value}) does not exceed its predecessor.")]
    KnotsNotIncreasing { index: usize, value: f64 },

    #[error("Score at position {index} is not finite ({value}).")]
    NonFiniteScore { index: usize, value: f64 },

    #[error("max_knots must be at least 2 so both boundary knots can be kept, but was {0}.")]
    InvalidMaxKnots(usize),
}

/// Creates the natural cubic spline design matrix for `scores` over `knots`.
///
/// With `K` knots `ξ_0 < ... < ξ_{K-1}` the matrix has shape `[scores.len(), K]`:
///
/// * column 0 is the intercept (all ones),
/// * column 1 is the raw score,
/// * column `j + 2`, for `j = 0..K-2`, is `d_j(x) - d_{K-2}(x)` where
///   `d_j(x) = (max(x - ξ_j, 0)^3 - max(x - ξ_{K-1}, 0)^3) / (ξ_{K-1} - ξ_j)`.
///
/// Every column is linear beyond the boundary knots, so the fitted curve has a
/// zero second derivative at both ends and extrapolates linearly rather than
/// diverging like an unrestricted cubic.
///
/// The result depends only on `(scores, knots)`.
pub fn natural_cubic_spline_basis(
    scores: ArrayView1<f64>,
    knots: ArrayView1<f64>,
) -> Result<Array2<f64>, BasisError> {
    internal::validate_knots(knots)?;
    for (index, &value) in scores.iter().enumerate() {
        if !value.is_finite() {
            return Err(BasisError::NonFiniteScore { index, value });
        }
    }

    let num_knots = knots.len();
    let mut basis_matrix = Array2::zeros((scores.len(), num_knots));

    for (row, &x) in scores.iter().enumerate() {
        basis_matrix[[row, 0]] = 1.0;
        basis_matrix[[row, 1]] = x;
        if num_knots > 2 {
            let d_last = internal::truncated_cubic_ratio(x, knots, num_knots - 2);
            for j in 0..num_knots - 2 {
                basis_matrix[[row, j + 2]] = internal::truncated_cubic_ratio(x, knots, j) - d_last;
            }
        }
    }

    Ok(basis_matrix)
}

/// Chooses the knot set for a calibration spline.
///
/// For `KnotStrategy::Sample` the candidates are the sorted unique values of
/// `scores`. When there are more than `max_knots` candidates, the global minimum
/// and maximum are kept and `max_knots - 2` interior knots are drawn uniformly at
/// random with `rng`, then the set is re-sorted. The same seed always yields the
/// same knots. `KnotStrategy::All` keeps every candidate.
pub fn select_knots(
    scores: ArrayView1<f64>,
    strategy: &KnotStrategy,
    max_knots: usize,
    rng: &mut StdRng,
) -> Result<Array1<f64>, BasisError> {
    match strategy {
        KnotStrategy::Explicit(knots) => {
            let knots = Array1::from_vec(knots.clone());
            internal::validate_knots(knots.view())?;
            Ok(knots)
        }
        KnotStrategy::All => {
            let unique = internal::sorted_unique(scores)?;
            if unique.len() < 2 {
                return Err(BasisError::TooFewKnots { found: unique.len() });
            }
            Ok(Array1::from_vec(unique))
        }
        KnotStrategy::Sample => {
            if max_knots < 2 {
                return Err(BasisError::InvalidMaxKnots(max_knots));
            }
            let unique = internal::sorted_unique(scores)?;
            let num_unique = unique.len();
            if num_unique < 2 {
                return Err(BasisError::TooFewKnots { found: num_unique });
            }
            if num_unique <= max_knots {
                return Ok(Array1::from_vec(unique));
            }

            let smallest = unique[0];
            let largest = unique[num_unique - 1];
            let mut interior = unique[1..num_unique - 1].to_vec();
            interior.shuffle(rng);
            interior.truncate(max_knots - 2);
            interior.push(smallest);
            interior.push(largest);
            interior.sort_unstable_by(f64::total_cmp);

            log::info!(
                "Reduced {} unique scores to {} knots, keeping the first and last.",
                num_unique,
                interior.len()
            );
            Ok(Array1::from_vec(interior))
        }
    }
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Evaluates `d_k(x)`, the scaled difference of truncated cubes anchored at
    /// knot `k` and the last knot.
    pub(super) fn truncated_cubic_ratio(x: f64, knots: ArrayView1<f64>, k: usize) -> f64 {
        let last = knots[knots.len() - 1];
        let numerator = (x - knots[k]).max(0.0).powi(3) - (x - last).max(0.0).powi(3);
        numerator / (last - knots[k])
    }

    pub(super) fn validate_knots(knots: ArrayView1<f64>) -> Result<(), BasisError> {
        if knots.len() < 2 {
            return Err(BasisError::TooFewKnots { found: knots.len() });
        }
        for (index, &value) in knots.iter().enumerate() {
            if !value.is_finite() {
                return Err(BasisError::NonFiniteScore { index, value });
            }
            if index > 0 && value <= knots[index - 1] {
                return Err(BasisError::KnotsNotIncreasing { index, value });
            }
        }
        Ok(())
    }

    /// Sorted distinct values of `data`. Non-finite values are rejected since
    /// they have no place in a knot set.
    pub(super) fn sorted_unique(data: ArrayView1<f64>) -> Result<Vec<f64>, BasisError> {
        let mut values = Vec::with_capacity(data.len());
        for (index, &value) in data.iter().enumerate() {
            if !value.is_finite() {
                return Err(BasisError::NonFiniteScore { index, value });
            }
            values.push(value);
        }
        values.sort_unstable_by(f64::total_cmp);
        values.dedup();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::SeedableRng;

    #[test]
    fn test_leading_columns_are_intercept_and_score() {
        let scores = array![-1.5, 0.0, 0.25, 0.5, 3.0];
        let knots = array![0.0, 0.2, 0.4, 0.8, 1.0];
        let basis = natural_cubic_spline_basis(scores.view(), knots.view()).unwrap();

        assert_eq!(basis.shape(), &[5, 5]);
        for row in 0..scores.len() {
            assert_eq!(basis[[row, 0]], 1.0);
            assert_eq!(basis[[row, 1]], scores[row]);
        }
    }

    #[test]
    fn test_two_knots_give_linear_basis() {
        let scores = array![0.1, 0.7];
        let knots = array![0.0, 1.0];
        let basis = natural_cubic_spline_basis(scores.view(), knots.view()).unwrap();
        assert_eq!(basis, array![[1.0, 0.1], [1.0, 0.7]]);
    }

    #[test]
    fn test_hand_computed_column() {
        // Knots 0, 1, 2: one derived column, d_0(x) - d_1(x).
        // At x = 1.5: d_0 = 1.5^3 / 2 = 1.6875, d_1 = 0.5^3 / 1 = 0.125.
        let knots = array![0.0, 1.0, 2.0];
        let basis = natural_cubic_spline_basis(array![1.5].view(), knots.view()).unwrap();
        assert_abs_diff_eq!(basis[[0, 2]], 1.6875 - 0.125, epsilon = 1e-12);

        // Below the first knot every truncated cube vanishes.
        let below = natural_cubic_spline_basis(array![-3.0].view(), knots.view()).unwrap();
        assert_eq!(below[[0, 2]], 0.0);
    }

    #[test]
    fn test_columns_are_linear_beyond_boundary_knots() {
        let knots = array![0.0, 0.3, 0.5, 0.9, 1.0];
        let scores = array![1.5, 2.0, 2.5, -1.0, -0.5, 0.0];
        let basis = natural_cubic_spline_basis(scores.view(), knots.view()).unwrap();

        for col in 2..knots.len() {
            // Equal steps to the right of the last knot produce equal increments.
            let step_a = basis[[1, col]] - basis[[0, col]];
            let step_b = basis[[2, col]] - basis[[1, col]];
            assert_abs_diff_eq!(step_a, step_b, epsilon = 1e-9);
            // To the left of the first knot the derived columns are flat at zero.
            assert_eq!(basis[[3, col]], 0.0);
            assert_eq!(basis[[4, col]], 0.0);
        }
    }

    #[test]
    fn test_basis_is_deterministic() {
        let knots = Array::linspace(0.0, 1.0, 12);
        let scores = Array::linspace(-0.2, 1.2, 50);
        let first = natural_cubic_spline_basis(scores.view(), knots.view()).unwrap();
        let second = natural_cubic_spline_basis(scores.view(), knots.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sample_strategy_keeps_all_unique_scores_under_cap() {
        let scores = array![0.3, 0.1, 0.3, 0.9, 0.1];
        let mut rng = StdRng::seed_from_u64(942);
        let knots = select_knots(scores.view(), &KnotStrategy::Sample, 200, &mut rng).unwrap();
        assert_eq!(knots, array![0.1, 0.3, 0.9]);
    }

    #[test]
    fn test_knot_reduction_keeps_extremes() {
        let scores = Array::linspace(-5.0, 5.0, 500);
        let mut rng = StdRng::seed_from_u64(942);
        let knots = select_knots(scores.view(), &KnotStrategy::Sample, 200, &mut rng).unwrap();

        assert_eq!(knots.len(), 200);
        assert_eq!(knots[0], -5.0);
        assert_eq!(knots[199], 5.0);
        assert!(knots.windows(2).into_iter().all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_all_strategy_keeps_every_unique_score() {
        let scores = Array::linspace(-5.0, 5.0, 500);
        let mut rng = StdRng::seed_from_u64(942);
        let knots = select_knots(scores.view(), &KnotStrategy::All, 200, &mut rng).unwrap();
        assert_eq!(knots.len(), 500);
        assert_eq!(knots, scores);

        let repeated = array![0.7, 0.2, 0.7, 0.2];
        let knots = select_knots(repeated.view(), &KnotStrategy::All, 2, &mut rng).unwrap();
        assert_eq!(knots, array![0.2, 0.7]);

        match select_knots(array![0.4, 0.4].view(), &KnotStrategy::All, 200, &mut rng)
            .unwrap_err()
        {
            BasisError::TooFewKnots { found } => assert_eq!(found, 1),
            other => panic!("Expected TooFewKnots, got {other:?}"),
        }
    }

    #[test]
    fn test_knot_reduction_is_reproducible_for_a_seed() {
        let scores = Array::linspace(0.0, 1.0, 300);
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let a = select_knots(scores.view(), &KnotStrategy::Sample, 20, &mut rng_a).unwrap();
        let b = select_knots(scores.view(), &KnotStrategy::Sample, 20, &mut rng_b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_conditions() {
        let mut rng = StdRng::seed_from_u64(0);

        match select_knots(array![0.4, 0.4].view(), &KnotStrategy::Sample, 200, &mut rng)
            .unwrap_err()
        {
            BasisError::TooFewKnots { found } => assert_eq!(found, 1),
            other => panic!("Expected TooFewKnots, got {other:?}"),
        }

        match select_knots(array![0.1, 0.2].view(), &KnotStrategy::Sample, 1, &mut rng).unwrap_err()
        {
            BasisError::InvalidMaxKnots(max) => assert_eq!(max, 1),
            other => panic!("Expected InvalidMaxKnots, got {other:?}"),
        }

        let explicit = KnotStrategy::Explicit(vec![0.0, 0.5, 0.5]);
        match select_knots(array![].view(), &explicit, 200, &mut rng).unwrap_err() {
            BasisError::KnotsNotIncreasing { index, .. } => assert_eq!(index, 2),
            other => panic!("Expected KnotsNotIncreasing, got {other:?}"),
        }

        match natural_cubic_spline_basis(array![f64::NAN].view(), array![0.0, 1.0].view())
            .unwrap_err()
        {
            BasisError::NonFiniteScore { index, .. } => assert_eq!(index, 0),
            other => panic!("Expected NonFiniteScore, got {other:?}"),
        }
    }
}
