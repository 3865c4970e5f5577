//! # Bayesian Best-Subset Selection
//!
//! The top candidates for a target are searched over every subset up to a maximum
//! model size. Each subset is scored by a prior-weighted Bayesian information
//! criterion
//!
//! ```text
//! n ln(RSS / n) + |S| ln(n) - 2 sum_{j in S} ln(w_j)
//! ```
//!
//! where `w_j` is the prior weight of candidate `j` (1 without prior support). All
//! subset fits reuse one Gram matrix, so a subset costs one small Cholesky solve.
//! Above `exhaustive_limit` candidates the search falls back to greedy forward
//! selection with the same criterion.

use super::{GRAM_RIDGE, RegressionError, TargetFit, TargetProblem, TargetRegression};
use crate::linalg::FaerCholesky;
use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Floor on the per-sample residual variance so a perfect fit keeps a finite score.
const RSS_FLOOR: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BestSubsetConfig {
    /// Number of top-ranked candidates entering the search.
    pub candidates: usize,
    /// Largest model considered; `None` allows every candidate.
    pub max_model_size: Option<usize>,
    /// Candidate counts above this use greedy forward selection.
    pub exhaustive_limit: usize,
}

impl Default for BestSubsetConfig {
    fn default() -> Self {
        Self {
            candidates: 10,
            max_model_size: None,
            exhaustive_limit: 15,
        }
    }
}

pub struct BestSubset {
    config: BestSubsetConfig,
}

struct SubsetScorer<'a, 'b> {
    gram: Array2<f64>,
    xty: Array1<f64>,
    yty: f64,
    n: f64,
    log_prior: Vec<f64>,
    problem: &'a TargetProblem<'b>,
}

struct ScoredSubset {
    members: Vec<usize>,
    beta: Array1<f64>,
    rss: f64,
    score: f64,
}

impl<'a, 'b> SubsetScorer<'a, 'b> {
    fn new(problem: &'a TargetProblem<'b>) -> Self {
        let x = problem.design;
        let y = problem.response;
        let mut gram = x.t().dot(&x);
        let ridge = GRAM_RIDGE * x.nrows().max(1) as f64;
        gram.diag_mut().mapv_inplace(|d| d + ridge);
        Self {
            gram,
            xty: x.t().dot(&y),
            yty: y.dot(&y),
            n: x.nrows() as f64,
            log_prior: problem.prior_weights.iter().map(|w| w.max(1.0).ln()).collect(),
            problem,
        }
    }

    /// Scores a subset, or `None` when its Gram block cannot be factored.
    fn score(&self, members: &[usize]) -> Option<ScoredSubset> {
        let k = members.len();
        let (beta, rss) = if k == 0 {
            (Array1::zeros(0), self.yty)
        } else {
            let sub_gram = Array2::from_shape_fn((k, k), |(a, b)| self.gram[(members[a], members[b])]);
            let sub_xty = Array1::from_shape_fn(k, |a| self.xty[members[a]]);
            let beta = match sub_gram.cholesky().and_then(|f| f.solve_vec(&sub_xty)) {
                Ok(beta) => beta,
                Err(err) => {
                    log::trace!("Skipping subset {members:?}: {err}");
                    return None;
                }
            };
            let rss = (self.yty - beta.dot(&sub_xty)).max(0.0);
            (beta, rss)
        };
        let variance = (rss / self.n).max(RSS_FLOOR);
        let prior_bonus: f64 = members.iter().map(|&j| self.log_prior[j]).sum();
        let score = self.n * variance.ln() + k as f64 * self.n.ln() - 2.0 * prior_bonus;
        Some(ScoredSubset {
            members: members.to_vec(),
            beta,
            rss,
            score,
        })
    }

    fn exhaustive(&self, max_size: usize) -> Option<ScoredSubset> {
        let p = self.problem.n_candidates();
        let mut best: Option<ScoredSubset> = None;
        for size in 0..=max_size {
            for members in (0..p).combinations(size) {
                if let Some(candidate) = self.score(&members) {
                    if best.as_ref().is_none_or(|b| candidate.score < b.score) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }

    fn forward(&self, max_size: usize) -> Option<ScoredSubset> {
        let p = self.problem.n_candidates();
        let mut current = self.score(&[])?;
        while current.members.len() < max_size {
            let step = (0..p)
                .filter(|j| !current.members.contains(j))
                .filter_map(|j| {
                    let mut members = current.members.clone();
                    members.push(j);
                    members.sort_unstable();
                    self.score(&members)
                })
                .min_by(|a, b| a.score.total_cmp(&b.score));
            match step {
                Some(next) if next.score < current.score => current = next,
                _ => break,
            }
        }
        Some(current)
    }
}

impl BestSubset {
    pub fn new(config: BestSubsetConfig) -> Self {
        Self { config }
    }
}

impl TargetRegression for BestSubset {
    fn fit_target(&self, problem: &TargetProblem<'_>) -> Result<TargetFit, RegressionError> {
        let p = problem.n_candidates();
        let max_size = self.config.max_model_size.unwrap_or(p).min(p);
        let scorer = SubsetScorer::new(problem);
        let best = if p <= self.config.exhaustive_limit {
            scorer.exhaustive(max_size)
        } else {
            scorer.forward(max_size)
        };
        let Some(best) = best else {
            return Ok(TargetFit::default());
        };
        let fit_quality = if scorer.yty > 0.0 {
            1.0 - best.rss / scorer.yty
        } else {
            0.0
        };
        Ok(TargetFit {
            selected: best.members,
            coefficients: best.beta.to_vec(),
            fit_quality,
        })
    }

    fn candidate_limit(&self) -> Option<usize> {
        Some(self.config.candidates)
    }
}
