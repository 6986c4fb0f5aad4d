//! Seasonal baseline: a penalized Poisson regression of daily counts on
//! day-of-year.
//!
//! The linear predictor has three parts:
//!
//! 1. a common cubic B-spline curve over day-of-year shared by every year,
//!    penalized by second-order differences;
//! 2. one deviation curve per calendar year on the same basis, penalized by
//!    second-order differences plus a ridge so each year shrinks toward the
//!    common curve;
//! 3. an unpenalized indicator for the evaluation year.
//!
//! The B-spline basis is a partition of unity, so the common curve carries the
//! intercept. Coefficients are estimated by penalized iteratively reweighted
//! least squares (log link). The two smoothing parameters are chosen on a
//! log-spaced grid by the Laplace approximate marginal likelihood. Intervals
//! are `exp(eta +/- z * se)` with `se` from the Bayesian posterior covariance
//! `(X'WX + S)^-1`.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::classify::EvaluationWindow;
use crate::error::{ModelError, ModelResult};
use crate::linalg::{Cholesky, Matrix};
use crate::models::{FittedPoint, PairKey};

const DAY_MIN: f64 = 1.0;
const DAY_MAX: f64 = 366.0;
const RIDGE: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Basis functions per curve.
    pub basis_size: usize,
    /// Normal quantile for the interval half-width on the link scale.
    pub confidence_z: f64,
    /// Pairs with fewer non-zero historical observations are not modeled.
    pub min_historical_observations: usize,
    /// log10 smoothing parameters tried for the common and deviation curves.
    pub log10_lambdas: Vec<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            basis_size: 10,
            confidence_z: 1.96,
            min_historical_observations: 10,
            log10_lambdas: vec![-1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// Daily counts for one pair. `None` marks a missing observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSeries {
    pub key: PairKey,
    pub points: Vec<(NaiveDate, Option<f64>)>,
}

impl PairSeries {
    pub fn new(key: PairKey, mut points: Vec<(NaiveDate, Option<f64>)>) -> Self {
        points.sort_by_key(|(date, _)| *date);
        Self { key, points }
    }

    /// Non-zero, finite observations before the cutoff.
    pub fn historical_support(&self, window: &EvaluationWindow) -> usize {
        self.points
            .iter()
            .filter(|(date, count)| {
                window.is_historical(*date)
                    && count.is_some_and(|count| count.is_finite() && count > 0.0)
            })
            .count()
    }

    pub fn has_evaluation_data(&self, window: &EvaluationWindow) -> bool {
        self.points.iter().any(|(date, _)| window.is_evaluation(*date))
    }
}

/// Anything that can produce a fitted seasonal curve for one pair.
pub trait SeasonalFit: Send + Sync {
    fn fit(&self, series: &PairSeries, window: &EvaluationWindow) -> ModelResult<Vec<FittedPoint>>;
}

#[derive(Debug, Clone, Default)]
pub struct PoissonSeasonalModel {
    config: BaselineConfig,
}

impl PoissonSeasonalModel {
    pub fn new(config: BaselineConfig) -> Self {
        Self { config }
    }
}

impl SeasonalFit for PoissonSeasonalModel {
    fn fit(&self, series: &PairSeries, window: &EvaluationWindow) -> ModelResult<Vec<FittedPoint>> {
        let config = &self.config;
        if config.basis_size < 4 {
            return Err(ModelError::FitFailure(format!(
                "basis size {} is below the cubic minimum of 4",
                config.basis_size
            )));
        }

        let design = Design::build(series, window, config.basis_size)?;
        let mut best: Option<PirlsFit> = None;
        let mut warm: Option<Vec<f64>> = None;
        let mut last_error = None;

        for &log_common in &config.log10_lambdas {
            for &log_deviation in &config.log10_lambdas {
                let lambdas = [10f64.powf(log_common), 10f64.powf(log_deviation)];
                match design.pirls(lambdas, warm.as_deref(), config) {
                    Ok(fit) => {
                        trace!(
                            pair = %series.key,
                            log_common,
                            log_deviation,
                            criterion = fit.criterion,
                            "smoothing candidate"
                        );
                        warm = Some(fit.beta.clone());
                        if best.as_ref().map_or(true, |b| fit.criterion > b.criterion) {
                            best = Some(fit);
                        }
                    }
                    Err(err) => last_error = Some(err),
                }
            }
        }

        let best = best.ok_or_else(|| {
            last_error.unwrap_or_else(|| ModelError::FitFailure("no smoothing candidates".into()))
        })?;
        debug!(
            pair = %series.key,
            lambda_common = best.lambdas[0],
            lambda_deviation = best.lambdas[1],
            iterations = best.iterations,
            "selected smoothing parameters"
        );

        design.predict(&best, config.confidence_z)
    }
}

/// Sparse model matrix row: (column, value).
type Row = Vec<(usize, f64)>;

struct Design {
    basis_size: usize,
    params: usize,
    rows: Vec<Row>,
    y: Vec<f64>,
    /// Rows to predict, one per date in range (observed or not).
    prediction_rows: Vec<(NaiveDate, Row)>,
    /// Common and deviation penalties, unscaled.
    penalties: [Matrix; 2],
    penalty_ranks: [usize; 2],
}

struct PirlsFit {
    beta: Vec<f64>,
    chol: Cholesky,
    lambdas: [f64; 2],
    criterion: f64,
    iterations: usize,
}

impl Design {
    fn build(series: &PairSeries, window: &EvaluationWindow, basis_size: usize) -> ModelResult<Self> {
        let in_range: Vec<(NaiveDate, Option<f64>)> = series
            .points
            .iter()
            .copied()
            .filter(|(date, _)| window.is_historical(*date) || window.is_evaluation(*date))
            .collect();

        let years: Vec<i32> = {
            let mut years: Vec<i32> = in_range.iter().map(|(date, _)| date.year()).collect();
            years.sort_unstable();
            years.dedup();
            years
        };
        if years.is_empty() {
            return Err(ModelError::InsufficientData { needed: 1, got: 0 });
        }

        // Columns: common curve, evaluation indicator, then one block per year.
        let indicator = basis_size;
        let year_offsets: BTreeMap<i32, usize> = years
            .iter()
            .enumerate()
            .map(|(i, year)| (*year, basis_size + 1 + i * basis_size))
            .collect();
        let params = basis_size + 1 + years.len() * basis_size;

        let basis = day_of_year_basis(basis_size);
        let row_for = |date: NaiveDate| -> Row {
            let day_basis = &basis[(date.ordinal() - 1) as usize];
            let mut row: Row = Vec::with_capacity(2 * day_basis.len() + 1);
            row.extend(day_basis.iter().copied());
            if window.is_evaluation(date) {
                row.push((indicator, 1.0));
            }
            let offset = year_offsets[&date.year()];
            row.extend(day_basis.iter().map(|(col, value)| (offset + col, *value)));
            row
        };

        let mut rows = Vec::new();
        let mut y = Vec::new();
        let mut prediction_rows = Vec::with_capacity(in_range.len());
        for (date, count) in &in_range {
            let row = row_for(*date);
            if let Some(count) = count.filter(|count| count.is_finite() && *count >= 0.0) {
                rows.push(row.clone());
                y.push(count);
            }
            prediction_rows.push((*date, row));
        }
        if rows.len() < basis_size {
            return Err(ModelError::InsufficientData {
                needed: basis_size,
                got: rows.len(),
            });
        }

        let difference = second_difference_penalty(basis_size);
        let mut common = Matrix::zeros(params);
        let mut deviation = Matrix::zeros(params);
        for i in 0..basis_size {
            for j in 0..basis_size {
                common.add(i, j, difference.get(i, j));
            }
        }
        for offset in year_offsets.values() {
            for i in 0..basis_size {
                for j in 0..basis_size {
                    deviation.add(offset + i, offset + j, difference.get(i, j));
                }
                deviation.add(offset + i, offset + i, 1.0);
            }
        }

        Ok(Self {
            basis_size,
            params,
            rows,
            y,
            prediction_rows,
            penalties: [common, deviation],
            penalty_ranks: [basis_size - 2, years.len() * basis_size],
        })
    }

    fn penalty(&self, lambdas: [f64; 2]) -> Matrix {
        Matrix::zeros(self.params)
            .plus_scaled(&self.penalties[0], lambdas[0])
            .plus_scaled(&self.penalties[1], lambdas[1])
    }

    fn linear_predictor(&self, beta: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|(col, value)| beta[*col] * value).sum())
            .collect()
    }

    /// Penalized Poisson deviance at `beta`.
    fn penalized_deviance(&self, beta: &[f64], penalty: &Matrix) -> f64 {
        let eta = self.linear_predictor(beta);
        let deviance: f64 = eta
            .iter()
            .zip(&self.y)
            .map(|(eta, y)| {
                let mu = eta.exp();
                let log_ratio = if *y > 0.0 { y * (y.ln() - eta) } else { 0.0 };
                2.0 * (log_ratio - (y - mu))
            })
            .sum();
        deviance + penalty.quadratic_form(beta)
    }

    /// `X'WX + S` and `X'W z` at the current linear predictor.
    fn normal_equations(&self, eta: &[f64], penalty: &Matrix) -> (Matrix, Vec<f64>) {
        let mut hessian = penalty.clone();
        let mut rhs = vec![0.0; self.params];
        for ((row, eta), y) in self.rows.iter().zip(eta).zip(&self.y) {
            let mu = eta.exp();
            // w = mu, z = eta + (y - mu) / mu, so w * z = mu * eta + y - mu.
            let working = mu * eta + y - mu;
            for &(i, xi) in row {
                rhs[i] += xi * working;
                for &(j, xj) in row {
                    hessian.add(i, j, mu * xi * xj);
                }
            }
        }
        for i in 0..self.params {
            hessian.add(i, i, RIDGE);
        }
        (hessian, rhs)
    }

    fn initial_beta(&self) -> Vec<f64> {
        let mean = self.y.iter().sum::<f64>() / self.y.len() as f64;
        let mut beta = vec![0.0; self.params];
        for value in beta.iter_mut().take(self.basis_size) {
            *value = (mean + 0.1).ln();
        }
        beta
    }

    fn pirls(
        &self,
        lambdas: [f64; 2],
        warm: Option<&[f64]>,
        config: &BaselineConfig,
    ) -> ModelResult<PirlsFit> {
        let penalty = self.penalty(lambdas);
        let mut beta = warm.map_or_else(|| self.initial_beta(), <[f64]>::to_vec);
        let mut previous = self.penalized_deviance(&beta, &penalty);
        if !previous.is_finite() {
            beta = self.initial_beta();
            previous = self.penalized_deviance(&beta, &penalty);
        }

        for iteration in 1..=config.max_iterations {
            let eta = self.linear_predictor(&beta);
            let (hessian, rhs) = self.normal_equations(&eta, &penalty);
            let chol = Cholesky::factor(&hessian).ok_or_else(|| {
                ModelError::FitFailure("penalized information matrix is not positive definite".into())
            })?;
            let mut candidate = chol.solve(&rhs);
            let mut current = self.penalized_deviance(&candidate, &penalty);

            let mut halvings = 0;
            while !(current.is_finite() && current <= previous * (1.0 + 1e-12) + 1e-12) {
                if halvings == 30 {
                    return Err(ModelError::FitFailure(
                        "step halving failed to reduce penalized deviance".into(),
                    ));
                }
                for (c, b) in candidate.iter_mut().zip(&beta) {
                    *c = 0.5 * (*c + b);
                }
                current = self.penalized_deviance(&candidate, &penalty);
                halvings += 1;
            }

            let change = (previous - current).abs();
            beta = candidate;
            previous = current;
            if change < config.tolerance * (current.abs() + 0.1) {
                return self.finish(beta, lambdas, &penalty, iteration);
            }
        }

        Err(ModelError::FitFailure(format!(
            "did not converge within {} iterations",
            config.max_iterations
        )))
    }

    /// Factor the converged system and score it by the Laplace approximate
    /// marginal likelihood (up to terms constant in the smoothing parameters).
    fn finish(
        &self,
        beta: Vec<f64>,
        lambdas: [f64; 2],
        penalty: &Matrix,
        iterations: usize,
    ) -> ModelResult<PirlsFit> {
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(ModelError::FitFailure("non-finite coefficients".into()));
        }
        let eta = self.linear_predictor(&beta);
        let (hessian, _) = self.normal_equations(&eta, penalty);
        let chol = Cholesky::factor(&hessian).ok_or_else(|| {
            ModelError::FitFailure("penalized information matrix is not positive definite".into())
        })?;

        let log_likelihood: f64 = eta.iter().zip(&self.y).map(|(eta, y)| y * eta - eta.exp()).sum();
        let log_penalty_det: f64 = self
            .penalty_ranks
            .iter()
            .zip(lambdas)
            .map(|(rank, lambda)| *rank as f64 * lambda.ln())
            .sum();
        let criterion = log_likelihood - 0.5 * penalty.quadratic_form(&beta) + 0.5 * log_penalty_det
            - 0.5 * chol.log_det();
        if !criterion.is_finite() {
            return Err(ModelError::FitFailure("non-finite marginal likelihood".into()));
        }

        Ok(PirlsFit {
            beta,
            chol,
            lambdas,
            criterion,
            iterations,
        })
    }

    fn predict(&self, fit: &PirlsFit, z: f64) -> ModelResult<Vec<FittedPoint>> {
        self.prediction_rows
            .iter()
            .map(|(date, row)| {
                let eta: f64 = row.iter().map(|(col, value)| fit.beta[*col] * value).sum();
                let half = fit.chol.forward_sparse(row);
                let se = half.iter().map(|v| v * v).sum::<f64>().sqrt();
                let point = FittedPoint {
                    date: *date,
                    fit: eta.exp(),
                    lower: (eta - z * se).exp(),
                    upper: (eta + z * se).exp(),
                };
                if point.fit.is_finite() && point.lower.is_finite() && point.upper.is_finite() {
                    Ok(point)
                } else {
                    Err(ModelError::FitFailure(format!("non-finite prediction on {date}")))
                }
            })
            .collect()
    }
}

/// Cubic B-spline basis with equally spaced knots over day-of-year, as the
/// non-zero (column, value) entries for each day 1..=366.
fn day_of_year_basis(size: usize) -> Vec<Vec<(usize, f64)>> {
    let spacing = (DAY_MAX - DAY_MIN) / (size - 3) as f64;
    let knots: Vec<f64> = (0..size + 4)
        .map(|i| DAY_MIN + (i as f64 - 3.0) * spacing)
        .collect();

    (1..=366)
        .map(|day| {
            // Nudge the right boundary into the last interval.
            let x = (day as f64).min(DAY_MAX - 1e-9 * spacing);
            bspline_values(x, &knots, size)
                .into_iter()
                .enumerate()
                .filter(|(_, value)| *value > 0.0)
                .collect()
        })
        .collect()
}

/// Cox-de Boor recursion for all `size` cubic basis functions at `x`.
fn bspline_values(x: f64, knots: &[f64], size: usize) -> Vec<f64> {
    let intervals = knots.len() - 1;
    let mut b: Vec<f64> = (0..intervals)
        .map(|i| {
            if knots[i] <= x && x < knots[i + 1] {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    for degree in 1..=3 {
        for i in 0..intervals - degree {
            let left_span = knots[i + degree] - knots[i];
            let right_span = knots[i + degree + 1] - knots[i + 1];
            let left = if left_span > 0.0 {
                (x - knots[i]) / left_span * b[i]
            } else {
                0.0
            };
            let right = if right_span > 0.0 {
                (knots[i + degree + 1] - x) / right_span * b[i + 1]
            } else {
                0.0
            };
            b[i] = left + right;
        }
    }

    b.truncate(size);
    b
}

/// `D'D` for the second-order difference matrix `D` on `size` coefficients.
fn second_difference_penalty(size: usize) -> Matrix {
    let mut penalty = Matrix::zeros(size);
    for row in 0..size.saturating_sub(2) {
        let d = [(row, 1.0), (row + 1, -2.0), (row + 2, 1.0)];
        for &(i, a) in &d {
            for &(j, b) in &d {
                penalty.add(i, j, a * b);
            }
        }
    }
    penalty
}
