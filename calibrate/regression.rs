//! # Regularized Regression with Cross-Validated Strength Selection
//!
//! Two regressors back the calibration fitter:
//!
//! 1.  **Penalized logistic regression**, fitted by penalized iteratively
//!     reweighted least squares (P-IRLS) with step halving. The objective is the
//!     binomial deviance plus `lambda * beta' P beta`, where `lambda = 1 / C` and
//!     `P` leaves the intercept (column 0) unpenalized.
//! 2.  **Ridge regression**, solved in closed form from the normal equations
//!     `(X'X + alpha P) beta = X'y`, again with an unpenalized intercept.
//!
//! Each has a cross-validated wrapper that scores every candidate strength on
//! held-out folds, keeps the first strength with the lowest mean loss and refits
//! on the full data. Within a fold the grid is walked from the strongest penalty
//! to the weakest, and each logistic fit starts from its neighbour's solution.

use crate::folds::{self, FoldError, FoldSplit};
use crate::metrics::{self, DEFAULT_EPS};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::SolveC;
use rayon::prelude::*;
use thiserror::Error;

/// Number of inner folds used when searching the regularization grid.
pub const DEFAULT_INNER_FOLDS: usize = 5;

/// A comprehensive error type for the regression solvers.
#[derive(Error, Debug)]
pub enum RegressionError {
    #[error(
        "A linear system solve failed even with {jitter:.1e} added to the diagonal. The penalized Hessian is likely singular. Error: {source}"
    )]
    LinearSystemSolveFailed {
        jitter: f64,
        #[source]
        source: ndarray_linalg::error::LinalgError,
    },

    #[error("The linear system solve produced non-finite coefficients.")]
    NonFiniteSolution,

    #[error("Design matrix has {rows} rows, but {targets} targets were supplied.")]
    DimensionMismatch { rows: usize, targets: usize },

    #[error("Regularization strengths must be positive and finite, but {0} was supplied.")]
    InvalidStrength(f64),

    #[error("The regularization grid is empty.")]
    EmptyGrid,

    #[error("None of the {0} candidate regularization strengths produced a usable fit.")]
    NoUsableFit(usize),

    #[error("Inner cross-validation could not be set up: {0}")]
    Folds(#[from] FoldError),
}

/// Convergence state of the P-IRLS loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// Penalized deviance settled within tolerance.
    Converged,
    /// Ran out of iterations. Typical for nearly separable data under a weak
    /// penalty, where the coefficients keep growing.
    MaxIterationsReached,
}

/// Controls for the P-IRLS loop.
#[derive(Clone, Copy, Debug)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-8,
        }
    }
}

/// Coefficients from a single fit at a fixed strength.
#[derive(Clone, Debug)]
pub struct PenalizedFit {
    pub coefficients: Array1<f64>,
    pub status: FitStatus,
    pub iterations: usize,
    /// Binomial deviance for logistic fits, residual sum of squares for ridge.
    pub deviance: f64,
}

/// Outcome of a cross-validated grid search followed by a full-data refit.
#[derive(Clone, Debug)]
pub struct CrossValidatedFit {
    pub coefficients: Array1<f64>,
    pub selected_strength: f64,
    /// Mean held-out loss for each grid point, in grid order. Grid points whose
    /// fits failed on some fold are `f64::INFINITY`.
    pub mean_losses: Vec<f64>,
    pub status: FitStatus,
}

/// `count` values spaced evenly in log10 space from `10^start` to `10^stop`.
pub fn logspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
    }
}

/// `X beta`.
pub fn linear_predictor(x: ArrayView2<f64>, coefficients: ArrayView1<f64>) -> Array1<f64> {
    x.dot(&coefficients)
}

/// Logistic mean `1 / (1 + exp(-X beta))`, with the linear predictor clamped
/// to keep `exp` finite.
pub fn logistic_probabilities(x: ArrayView2<f64>, coefficients: ArrayView1<f64>) -> Array1<f64> {
    linear_predictor(x, coefficients).mapv(sigmoid)
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

/// Fits a logistic regression at a fixed inverse strength `c`.
///
/// `y` holds 0/1 targets. Column 0 of `x` is treated as the intercept and is
/// not penalized.
pub fn fit_penalized_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    c: f64,
    options: &IrlsOptions,
) -> Result<PenalizedFit, RegressionError> {
    fit_penalized_logistic_from(x, y, c, options, None)
}

/// As `fit_penalized_logistic`, but P-IRLS starts from `start` instead of
/// zero. A start of the wrong length is ignored.
pub fn fit_penalized_logistic_from(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    c: f64,
    options: &IrlsOptions,
    start: Option<ArrayView1<f64>>,
) -> Result<PenalizedFit, RegressionError> {
    check_dimensions(x, y)?;
    check_strength(c)?;
    let lambda = 1.0 / c;
    let penalty = penalty_diagonal(x.ncols());

    let mut beta = match start {
        Some(start) if start.len() == x.ncols() && start.iter().all(|v| v.is_finite()) => {
            start.to_owned()
        }
        _ => Array1::<f64>::zeros(x.ncols()),
    };
    let mut eta = x.dot(&beta);
    let mut last_objective = penalized_logistic_objective(y, &eta, &beta, &penalty, lambda);
    let mut status = FitStatus::MaxIterationsReached;
    let mut last_iter = 0;

    for iter in 1..=options.max_iterations {
        last_iter = iter;
        let (weights, z) = logistic_working_vectors(y, &eta);

        let hessian = weighted_gram(x, &weights) + &Array2::from_diag(&(&penalty * lambda));
        let rhs = x.t().dot(&(&weights * &z));
        let proposal = solve_spd(&hessian, &rhs)?;

        // Step halving guards against overshooting when the quadratic
        // approximation is poor, as happens near separation.
        let mut step = proposal;
        let mut step_eta = x.dot(&step);
        let mut objective = penalized_logistic_objective(y, &step_eta, &step, &penalty, lambda);
        let mut halvings = 0;
        while objective > last_objective * (1.0 + 1e-12) && halvings < 30 {
            step = (&step + &beta) * 0.5;
            step_eta = x.dot(&step);
            objective = penalized_logistic_objective(y, &step_eta, &step, &penalty, lambda);
            halvings += 1;
        }

        let change = (last_objective - objective).abs() / (objective.abs() + 0.1);
        beta = step;
        eta = step_eta;
        last_objective = objective;

        log::trace!(
            "P-IRLS iter {iter}: penalized deviance {objective:.6e}, relative change {change:.3e}, {halvings} halvings"
        );

        if change < options.convergence_tolerance {
            status = FitStatus::Converged;
            break;
        }
    }

    let mu = eta.mapv(sigmoid);
    Ok(PenalizedFit {
        deviance: binomial_deviance(y, &mu),
        coefficients: beta,
        status,
        iterations: last_iter,
    })
}

/// Fits a ridge regression at strength `alpha`. Column 0 of `x` is the
/// unpenalized intercept.
pub fn fit_ridge(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    alpha: f64,
) -> Result<PenalizedFit, RegressionError> {
    check_dimensions(x, y)?;
    check_strength(alpha)?;
    let penalty = penalty_diagonal(x.ncols());

    let gram = x.t().dot(&x) + &Array2::from_diag(&(&penalty * alpha));
    let rhs = x.t().dot(&y);
    let coefficients = solve_spd(&gram, &rhs)?;

    let residuals = &y - &x.dot(&coefficients);
    Ok(PenalizedFit {
        deviance: residuals.dot(&residuals),
        coefficients,
        status: FitStatus::Converged,
        iterations: 1,
    })
}

/// Logistic regression whose inverse strength `C` is chosen by stratified
/// cross-validation on log-loss.
#[derive(Clone, Debug)]
pub struct LogisticRegressionCv {
    pub inverse_strengths: Vec<f64>,
    pub n_folds: usize,
    pub irls: IrlsOptions,
}

impl LogisticRegressionCv {
    /// The default search grid: 43 values of `C` from `1e-4` to `1e10`.
    pub fn default_grid() -> Vec<f64> {
        logspace(-4.0, 10.0, 43)
    }

    pub fn new(inverse_strengths: Vec<f64>, n_folds: usize) -> Self {
        Self {
            inverse_strengths,
            n_folds,
            irls: IrlsOptions::default(),
        }
    }

    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<CrossValidatedFit, RegressionError> {
        check_dimensions(x, y)?;
        let splits = folds::stratified_k_fold(y, self.n_folds, None)?;
        let irls = self.irls;
        search_grid(
            x,
            y,
            &self.inverse_strengths,
            &splits,
            |c| 1.0 / c,
            |xs, ys, c, start| fit_penalized_logistic_from(xs, ys, c, &irls, start),
            |xs, ys, beta| {
                metrics::log_loss(ys, logistic_probabilities(xs, beta).view(), DEFAULT_EPS)
            },
        )
    }
}

/// Ridge regression whose strength `alpha` is chosen by contiguous k-fold
/// cross-validation on truncated mean squared error.
#[derive(Clone, Debug)]
pub struct RidgeCv {
    pub strengths: Vec<f64>,
    pub n_folds: usize,
}

impl RidgeCv {
    /// The default search grid: 43 values of `alpha` from `1e-7` to `1e7`.
    pub fn default_grid() -> Vec<f64> {
        logspace(-7.0, 7.0, 43)
    }

    pub fn new(strengths: Vec<f64>, n_folds: usize) -> Self {
        Self { strengths, n_folds }
    }

    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<CrossValidatedFit, RegressionError> {
        check_dimensions(x, y)?;
        let splits = folds::k_fold(y.len(), self.n_folds)?;
        search_grid(
            x,
            y,
            &self.strengths,
            &splits,
            |alpha| alpha,
            |xs, ys, alpha, _| fit_ridge(xs, ys, alpha),
            |xs, ys, beta| {
                metrics::truncated_mean_squared_error(
                    ys,
                    linear_predictor(xs, beta).view(),
                    DEFAULT_EPS,
                )
            },
        )
    }
}

/// Scores every grid point on every fold (folds in parallel), picks the first
/// point with the lowest mean loss and refits it on all rows.
///
/// Each fold visits the grid in order of decreasing `penalty_of(strength)` and
/// hands the previous solution to `fit` as a starting point. A failed fit
/// scores infinity and the next strength starts cold.
fn search_grid<P, F, L>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    grid: &[f64],
    splits: &[FoldSplit],
    penalty_of: P,
    fit: F,
    loss: L,
) -> Result<CrossValidatedFit, RegressionError>
where
    P: Fn(f64) -> f64,
    F: Fn(
            ArrayView2<f64>,
            ArrayView1<f64>,
            f64,
            Option<ArrayView1<f64>>,
        ) -> Result<PenalizedFit, RegressionError>
        + Sync,
    L: Fn(ArrayView2<f64>, ArrayView1<f64>, ArrayView1<f64>) -> f64 + Sync,
{
    if grid.is_empty() {
        return Err(RegressionError::EmptyGrid);
    }
    for &strength in grid {
        check_strength(strength)?;
    }

    let mut path: Vec<usize> = (0..grid.len()).collect();
    path.sort_by(|&a, &b| penalty_of(grid[b]).total_cmp(&penalty_of(grid[a])));

    let fold_losses: Vec<Vec<f64>> = splits
        .par_iter()
        .map(|split| {
            let x_train = x.select(Axis(0), &split.train_indices);
            let y_train = y.select(Axis(0), &split.train_indices);
            let x_test = x.select(Axis(0), &split.test_indices);
            let y_test = y.select(Axis(0), &split.test_indices);

            let mut losses = vec![f64::INFINITY; grid.len()];
            let mut previous: Option<Array1<f64>> = None;
            for &grid_index in &path {
                let strength = grid[grid_index];
                match fit(
                    x_train.view(),
                    y_train.view(),
                    strength,
                    previous.as_ref().map(|beta| beta.view()),
                ) {
                    Ok(fitted) => {
                        losses[grid_index] =
                            loss(x_test.view(), y_test.view(), fitted.coefficients.view());
                        previous = Some(fitted.coefficients);
                    }
                    Err(e) => {
                        log::debug!(
                            "Strength {strength:.3e} failed on inner fold {}: {e}",
                            split.fold_index
                        );
                        previous = None;
                    }
                }
            }
            losses
        })
        .collect();

    let mean_losses: Vec<f64> = (0..grid.len())
        .map(|g| fold_losses.iter().map(|losses| losses[g]).sum::<f64>() / splits.len() as f64)
        .collect();

    let (best_index, best_loss) = mean_losses
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::INFINITY), |(best_i, best), (i, value)| {
            if value < best { (i, value) } else { (best_i, best) }
        });
    if !best_loss.is_finite() {
        return Err(RegressionError::NoUsableFit(grid.len()));
    }

    let selected_strength = grid[best_index];
    let refit = fit(x, y, selected_strength, None)?;
    if refit.status == FitStatus::MaxIterationsReached {
        log::warn!(
            "Full-data refit at strength {selected_strength:.3e} stopped after {} iterations without converging.",
            refit.iterations
        );
    }

    Ok(CrossValidatedFit {
        coefficients: refit.coefficients,
        selected_strength,
        mean_losses,
        status: refit.status,
    })
}

fn check_dimensions(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), RegressionError> {
    if x.nrows() != y.len() {
        return Err(RegressionError::DimensionMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    Ok(())
}

fn check_strength(strength: f64) -> Result<(), RegressionError> {
    if !(strength.is_finite() && strength > 0.0) {
        return Err(RegressionError::InvalidStrength(strength));
    }
    Ok(())
}

/// Diagonal of the penalty matrix: zero for the intercept, one elsewhere.
fn penalty_diagonal(num_coeffs: usize) -> Array1<f64> {
    let mut penalty = Array1::ones(num_coeffs);
    if num_coeffs > 0 {
        penalty[0] = 0.0;
    }
    penalty
}

/// `X' diag(w) X`.
fn weighted_gram(x: ArrayView2<f64>, weights: &Array1<f64>) -> Array2<f64> {
    let weighted = &x * &weights.view().insert_axis(Axis(1));
    weighted.t().dot(&x)
}

/// IRLS weights and working response for the logit link.
fn logistic_working_vectors(y: ArrayView1<f64>, eta: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mu = eta_clamped.mapv(|e| sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * &(1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));
    let z = &eta_clamped + &((&y - &mu) / &weights);
    (weights, z)
}

/// Binomial deviance, `-2` times the log-likelihood for 0/1 targets.
fn binomial_deviance(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    const EPS: f64 = 1e-8;
    let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
        let mui = mui.clamp(EPS, 1.0 - EPS);
        acc - (yi * mui.ln() + (1.0 - yi) * (1.0 - mui).ln())
    });
    2.0 * total
}

fn penalized_logistic_objective(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    beta: &Array1<f64>,
    penalty: &Array1<f64>,
    lambda: f64,
) -> f64 {
    let mu = eta.mapv(sigmoid);
    let penalty_term: f64 = Zip::from(beta)
        .and(penalty)
        .fold(0.0, |acc, &b, &p| acc + p * b * b);
    binomial_deviance(y, &mu) + lambda * penalty_term
}

/// Solves a symmetric positive definite system by Cholesky, adding a growing
/// multiple of the mean diagonal when the factorization fails.
fn solve_spd(matrix: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>, RegressionError> {
    match matrix.solvec(rhs) {
        Ok(solution) if solution.iter().all(|v| v.is_finite()) => return Ok(solution),
        Ok(_) => log::debug!("Cholesky solve returned non-finite values; retrying with jitter"),
        Err(e) => log::debug!("Cholesky solve failed ({e}); retrying with jitter"),
    }

    let n = matrix.nrows().max(1);
    let scale = (matrix.diag().iter().map(|v| v.abs()).sum::<f64>() / n as f64).max(1.0);
    let mut jitter = scale * 1e-10;
    let mut last_error = None;
    for _ in 0..5 {
        let mut jittered = matrix.clone();
        jittered.diag_mut().mapv_inplace(|v| v + jitter);
        match jittered.solvec(rhs) {
            Ok(solution) if solution.iter().all(|v| v.is_finite()) => return Ok(solution),
            Ok(_) => {}
            Err(e) => last_error = Some(e),
        }
        jitter *= 100.0;
    }

    match last_error {
        Some(source) => Err(RegressionError::LinearSystemSolveFailed {
            jitter: jitter / 100.0,
            source,
        }),
        None => Err(RegressionError::NonFiniteSolution),
    }
}
