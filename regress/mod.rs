//! # Per-Target Regression
//!
//! For one target gene, candidate regulators are ranked by their corrected
//! association score, a small model is selected by one of the interchangeable
//! strategies, and every selected regulator receives a signed standardized effect
//! and a share of explained variance.
//!
//! Statistical failures never leave this module as errors: constant responses,
//! empty candidate sets and solver non-convergence are folded into the returned
//! `PerTargetResult` status so that one bad target cannot abort a run.

pub mod attribution;
pub mod best_subset;
pub mod elastic_net;

use crate::linalg::{FaerCholesky, LinalgError};
use crate::types::{PerTargetResult, PriorMatrix, TargetStatus};
use attribution::VarianceAttribution;
use best_subset::{BestSubset, BestSubsetConfig};
use elastic_net::{ElasticNet, ElasticNetConfig};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Relative ridge added to Gram diagonals so that collinear subsets still factor.
pub(crate) const GRAM_RIDGE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error(
        "Solver did not converge within {max_iterations} iterations (last coefficient change {last_change:.3e})."
    )]
    Convergence {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
}

/// A standardized regression problem over a fixed candidate set.
pub struct TargetProblem<'a> {
    /// Samples by candidates, each column centred with unit population variance.
    pub design: ArrayView2<'a, f64>,
    /// Centred response with unit population variance.
    pub response: ArrayView1<'a, f64>,
    /// Prior weight per candidate column, at least 1.
    pub prior_weights: &'a [f64],
}

impl TargetProblem<'_> {
    pub fn n_samples(&self) -> usize {
        self.design.nrows()
    }

    pub fn n_candidates(&self) -> usize {
        self.design.ncols()
    }
}

/// A fitted model expressed over candidate columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetFit {
    pub selected: Vec<usize>,
    pub coefficients: Vec<f64>,
    pub fit_quality: f64,
}

/// The single capability every regression strategy provides.
pub trait TargetRegression: Send + Sync {
    fn fit_target(&self, problem: &TargetProblem<'_>) -> Result<TargetFit, RegressionError>;

    /// Upper bound on candidates passed to `fit_target`, or `None` for all eligible.
    fn candidate_limit(&self) -> Option<usize>;
}

/// Strategy selector, chosen once from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RegressionMethod {
    BestSubset(BestSubsetConfig),
    ElasticNet(ElasticNetConfig),
}

impl Default for RegressionMethod {
    fn default() -> Self {
        Self::BestSubset(BestSubsetConfig::default())
    }
}

impl RegressionMethod {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::BestSubset(_) => "bayesian best subset",
            Self::ElasticNet(_) => "elastic net",
        }
    }
}

impl TargetRegression for RegressionMethod {
    fn fit_target(&self, problem: &TargetProblem<'_>) -> Result<TargetFit, RegressionError> {
        match self {
            Self::BestSubset(config) => BestSubset::new(config.clone()).fit_target(problem),
            Self::ElasticNet(config) => ElasticNet::new(config.clone()).fit_target(problem),
        }
    }

    fn candidate_limit(&self) -> Option<usize> {
        match self {
            Self::BestSubset(config) => Some(config.candidates),
            Self::ElasticNet(config) => config.max_candidates,
        }
    }
}

/// Read-only inputs shared by every target of one bootstrap.
pub struct TargetContext<'a> {
    /// Regulators by samples.
    pub design: ArrayView2<'a, f64>,
    pub regulator_names: &'a [String],
    /// Regulators whose design row has zero variance in this bootstrap.
    pub constant_regulators: &'a [bool],
    pub prior: &'a PriorMatrix,
    /// Multiplier applied to prior-supported regulators inside the strategy.
    pub prior_weight: f64,
}

/// Centres and scales a vector to unit population variance.
///
/// Returns `None` when the vector is constant or numerically flat.
pub fn standardize(values: ArrayView1<'_, f64>) -> Option<Array1<f64>> {
    let n = values.len();
    let first = *values.first()?;
    if values.iter().all(|&v| v == first) {
        return None;
    }
    let mean = values.sum() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let std = variance.sqrt();
    if !std.is_finite() || std <= 1e-12 * mean.abs().max(1.0) {
        return None;
    }
    Some(values.mapv(|v| (v - mean) / std))
}

/// Ordinary least squares on standardized data. Returns coefficients and the residual sum of squares.
pub(crate) fn least_squares(
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<(Array1<f64>, f64), RegressionError> {
    let p = x.ncols();
    let tss = y.dot(&y);
    if p == 0 {
        return Ok((Array1::zeros(0), tss));
    }
    let mut gram: Array2<f64> = x.t().dot(&x);
    let ridge = GRAM_RIDGE * x.nrows().max(1) as f64;
    gram.diag_mut().mapv_inplace(|d| d + ridge);
    let xty = x.t().dot(&y);
    let beta = gram.cholesky()?.solve_vec(&xty)?;
    let residual = &y - &x.dot(&beta);
    Ok((beta, residual.dot(&residual)))
}

/// Orders eligible regulators by corrected score, then prior weight, then position.
pub fn rank_candidates(
    context: &TargetContext<'_>,
    target_name: &str,
    scores: ArrayView1<'_, f64>,
    limit: Option<usize>,
) -> Vec<usize> {
    let mut eligible: Vec<(usize, f64, f64)> = (0..context.regulator_names.len())
        .filter(|&r| context.regulator_names[r] != target_name)
        .filter(|&r| !context.constant_regulators[r])
        .map(|r| {
            let prior = context
                .prior
                .weight(&context.regulator_names[r], target_name)
                .abs();
            (r, scores[r], prior)
        })
        .collect();
    eligible.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
            .then(a.0.cmp(&b.0))
    });
    if let Some(limit) = limit {
        eligible.truncate(limit);
    }
    eligible.into_iter().map(|(r, _, _)| r).collect()
}

/// Fits one target and folds every statistical failure into the result status.
pub struct RegressionEngine {
    method: RegressionMethod,
    attribution: VarianceAttribution,
}

impl RegressionEngine {
    pub fn new(method: RegressionMethod, attribution: VarianceAttribution) -> Self {
        Self {
            method,
            attribution,
        }
    }

    pub fn fit_gene(
        &self,
        context: &TargetContext<'_>,
        target: usize,
        target_name: &str,
        response: ArrayView1<'_, f64>,
        scores: ArrayView1<'_, f64>,
    ) -> PerTargetResult {
        let Some(y) = standardize(response) else {
            log::warn!("Target {target_name} has a constant response; recording a degenerate result");
            return PerTargetResult::empty(target, TargetStatus::Degenerate);
        };

        let candidates = rank_candidates(context, target_name, scores, self.method.candidate_limit());
        if candidates.is_empty() {
            log::debug!("Target {target_name} has no eligible regulators");
            return PerTargetResult::empty(target, TargetStatus::NoCandidates);
        }

        let n = y.len();
        let mut x = Array2::<f64>::zeros((n, candidates.len()));
        for (mut column, &regulator) in x.axis_iter_mut(Axis(1)).zip(candidates.iter()) {
            match standardize(context.design.row(regulator)) {
                Some(z) => column.assign(&z),
                None => column.fill(0.0),
            }
        }
        let prior_weights: Vec<f64> = candidates
            .iter()
            .map(|&r| {
                if context.prior.weight(&context.regulator_names[r], target_name) != 0.0 {
                    context.prior_weight.max(1.0)
                } else {
                    1.0
                }
            })
            .collect();

        let problem = TargetProblem {
            design: x.view(),
            response: y.view(),
            prior_weights: &prior_weights,
        };

        let outcome = self.method.fit_target(&problem).and_then(|fit| {
            let selected_x = x.select(Axis(1), &fit.selected);
            let contributions = self.attribution.attribute(selected_x.view(), y.view(), &fit)?;
            Ok((fit, contributions))
        });

        match outcome {
            Ok((fit, contributions)) => {
                let mut result = PerTargetResult::empty(target, TargetStatus::Fitted);
                result.fit_quality = fit.fit_quality.clamp(0.0, 1.0);
                for ((&column, &beta), contribution) in fit
                    .selected
                    .iter()
                    .zip(fit.coefficients.iter())
                    .zip(contributions.into_iter())
                {
                    if beta == 0.0 {
                        continue;
                    }
                    result.predictors.push(candidates[column]);
                    result.coefficients.push(beta);
                    result.contributions.push(contribution);
                }
                result
            }
            Err(err) => {
                log::warn!("Regression for target {target_name} failed: {err}");
                PerTargetResult::empty(target, TargetStatus::NotConverged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabeledMatrix;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn standardize_rejects_constant_vectors() {
        assert!(standardize(array![2.0, 2.0, 2.0].view()).is_none());
        let z = standardize(array![1.0, 2.0, 3.0].view()).unwrap();
        assert_abs_diff_eq!(z.sum(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z.dot(&z) / 3.0, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn ranking_breaks_ties_by_prior_then_position() {
        let regulator_names = names("R", 4);
        let prior = LabeledMatrix::new(
            array![[0.0], [0.0], [1.0], [0.0]],
            regulator_names.clone(),
            vec!["T".to_string()],
        )
        .unwrap();
        let prior = PriorMatrix::new(prior);
        let design = Array2::<f64>::zeros((4, 3));
        let constant = vec![false, false, false, true];
        let context = TargetContext {
            design: design.view(),
            regulator_names: &regulator_names,
            constant_regulators: &constant,
            prior: &prior,
            prior_weight: 1.0,
        };
        let scores = array![0.5, 2.0, 0.5, 9.0];
        let order = rank_candidates(&context, "T", scores.view(), None);
        assert_eq!(order, vec![1, 2, 0]);
        let limited = rank_candidates(&context, "T", scores.view(), Some(2));
        assert_eq!(limited, vec![1, 2]);
    }

    #[test]
    fn self_regulation_is_excluded() {
        let regulator_names = vec!["G1".to_string()];
        let prior = PriorMatrix::empty();
        let design = array![[1.0, 2.0, 3.0, 4.0]];
        let constant = vec![false];
        let context = TargetContext {
            design: design.view(),
            regulator_names: &regulator_names,
            constant_regulators: &constant,
            prior: &prior,
            prior_weight: 1.0,
        };
        let engine = RegressionEngine::new(RegressionMethod::default(), VarianceAttribution::default());
        let result = engine.fit_gene(
            &context,
            0,
            "G1",
            array![1.0, 2.0, 3.0, 4.0].view(),
            array![1.0].view(),
        );
        assert_eq!(result.status, TargetStatus::NoCandidates);
        assert!(result.predictors.is_empty());
        assert_eq!(result.fit_quality, 0.0);
    }

    #[test]
    fn perfectly_correlated_regulator_explains_everything() {
        let regulator_names = vec!["G2".to_string()];
        let prior = PriorMatrix::empty();
        let design = array![[0.3, 1.1, -0.4, 2.2, 0.9, -1.3, 0.0, 1.7]];
        let response = design.row(0).mapv(|v| 3.0 * v + 1.0);
        let constant = vec![false];
        let context = TargetContext {
            design: design.view(),
            regulator_names: &regulator_names,
            constant_regulators: &constant,
            prior: &prior,
            prior_weight: 1.0,
        };
        for method in [
            RegressionMethod::BestSubset(BestSubsetConfig::default()),
            RegressionMethod::ElasticNet(ElasticNetConfig::default()),
        ] {
            let engine = RegressionEngine::new(method, VarianceAttribution::default());
            let result = engine.fit_gene(&context, 0, "G1", response.view(), array![1.0].view());
            assert_eq!(result.status, TargetStatus::Fitted);
            assert_eq!(result.predictors, vec![0]);
            assert!(result.coefficients[0] > 0.0);
            assert_abs_diff_eq!(result.fit_quality, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn constant_response_is_degenerate() {
        let regulator_names = vec!["G2".to_string()];
        let prior = PriorMatrix::empty();
        let design = array![[0.3, 1.1, -0.4, 2.2]];
        let constant = vec![false];
        let context = TargetContext {
            design: design.view(),
            regulator_names: &regulator_names,
            constant_regulators: &constant,
            prior: &prior,
            prior_weight: 1.0,
        };
        let engine = RegressionEngine::new(RegressionMethod::default(), VarianceAttribution::default());
        let result = engine.fit_gene(
            &context,
            3,
            "G1",
            array![5.0, 5.0, 5.0, 5.0].view(),
            array![1.0].view(),
        );
        assert_eq!(result, PerTargetResult::empty(3, TargetStatus::Degenerate));
    }

    #[test]
    fn solver_failure_is_recorded_as_not_converged() {
        let regulator_names = names("R", 2);
        let prior = PriorMatrix::empty();
        let design = array![
            [0.3, 1.1, -0.4, 2.2, 0.9, -1.3, 0.0, 1.7, -0.8, 0.5],
            [1.0, -0.2, 0.7, 0.1, -1.5, 0.4, 2.0, -0.6, 0.2, -0.9]
        ];
        let response = design.row(0).mapv(|v| 2.0 * v) + &design.row(1);
        let constant = vec![false, false];
        let context = TargetContext {
            design: design.view(),
            regulator_names: &regulator_names,
            constant_regulators: &constant,
            prior: &prior,
            prior_weight: 1.0,
        };
        let capped = RegressionMethod::ElasticNet(ElasticNetConfig {
            max_iterations: 1,
            tolerance: 0.0,
            ..ElasticNetConfig::default()
        });
        let engine = RegressionEngine::new(capped, VarianceAttribution::default());
        let result = engine.fit_gene(&context, 1, "G1", response.view(), array![0.9, 0.4].view());
        assert_eq!(result, PerTargetResult::empty(1, TargetStatus::NotConverged));
    }
}
