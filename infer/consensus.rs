//! # Consensus Aggregation
//!
//! Each bootstrap is turned into a rank matrix: within every target column the
//! strictly positive scores receive average ranks `1..=m` (ties share the mean of
//! their positions) divided by `m`, so the strongest regulator of a target scores 1
//! and unselected regulators score 0. The confidence of an edge is the mean rank
//! over bootstraps. The sign is a majority vote over the bootstraps in which the
//! edge had a non-zero coefficient; ties and edges that were never selected are
//! positive.

use crate::types::BootstrapMatrices;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Per-bootstrap score converted into ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBasis {
    /// Fraction of variance attributed to the regulator.
    #[default]
    Contribution,
    /// Absolute standardized coefficient.
    Coefficient,
}

/// How edge scores of related runs are merged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineRule {
    Max,
    /// Mean over the runs that contain both the regulator and the target.
    #[default]
    Mean,
    /// Sum of per-run column ranks of the confidence.
    RankSum,
}

/// One row of the materialized network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkEdge {
    pub regulator: String,
    pub target: String,
    pub confidence: f64,
    pub sign: i8,
    /// Mean standardized coefficient over bootstraps, zeros included.
    pub coefficient: f64,
    pub contribution: f64,
}

/// Final regulators by targets network.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsensusNetwork {
    pub regulators: Vec<String>,
    pub targets: Vec<String>,
    pub confidence: Array2<f64>,
    pub sign: Array2<i8>,
    pub mean_coefficient: Array2<f64>,
    pub mean_contribution: Array2<f64>,
    /// Mean fit quality per target.
    pub fit_quality: Array1<f64>,
}

/// Average-rank transform of each column, restricted to strictly positive entries.
pub fn rank_matrix(scores: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut ranks = Array2::<f64>::zeros(scores.dim());
    for (column, mut out) in scores.axis_iter(Axis(1)).zip(ranks.axis_iter_mut(Axis(1))) {
        let mut positive: Vec<(usize, f64)> = column
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, v)| *v > 0.0)
            .collect();
        let m = positive.len();
        if m == 0 {
            continue;
        }
        positive.sort_by(|a, b| a.1.total_cmp(&b.1));
        let mut start = 0;
        while start < m {
            let mut end = start + 1;
            while end < m && positive[end].1 == positive[start].1 {
                end += 1;
            }
            // Positions start+1..=end share their mean.
            let rank = (start + end + 1) as f64 / 2.0;
            for &(row, _) in &positive[start..end] {
                out[row] = rank / m as f64;
            }
            start = end;
        }
    }
    ranks
}

fn majority_sign(positive: usize, negative: usize) -> i8 {
    if negative > positive { -1 } else { 1 }
}

pub struct ConsensusAggregator {
    basis: RankBasis,
}

impl ConsensusAggregator {
    pub fn new(basis: RankBasis) -> Self {
        Self { basis }
    }

    /// Rank matrix of one bootstrap under the configured basis.
    pub fn bootstrap_ranks(&self, bootstrap: &BootstrapMatrices) -> Array2<f64> {
        match self.basis {
            RankBasis::Contribution => rank_matrix(bootstrap.contributions.view()),
            RankBasis::Coefficient => rank_matrix(bootstrap.coefficients.mapv(f64::abs).view()),
        }
    }

    pub fn aggregate(
        &self,
        regulators: Vec<String>,
        targets: Vec<String>,
        bootstraps: &[BootstrapMatrices],
    ) -> ConsensusNetwork {
        let shape = (regulators.len(), targets.len());
        let mut confidence = Array2::<f64>::zeros(shape);
        let mut mean_coefficient = Array2::<f64>::zeros(shape);
        let mut mean_contribution = Array2::<f64>::zeros(shape);
        let mut fit_quality = Array1::<f64>::zeros(targets.len());
        let mut positive = Array2::<usize>::zeros(shape);
        let mut negative = Array2::<usize>::zeros(shape);

        for bootstrap in bootstraps {
            confidence += &self.bootstrap_ranks(bootstrap);
            mean_coefficient += &bootstrap.coefficients;
            mean_contribution += &bootstrap.contributions;
            fit_quality += &bootstrap.fit_quality;
            Zip::from(&mut positive)
                .and(&mut negative)
                .and(&bootstrap.coefficients)
                .for_each(|p, n, &c| {
                    if c > 0.0 {
                        *p += 1;
                    } else if c < 0.0 {
                        *n += 1;
                    }
                });
        }

        if !bootstraps.is_empty() {
            let count = bootstraps.len() as f64;
            confidence /= count;
            mean_coefficient /= count;
            mean_contribution /= count;
            fit_quality /= count;
        }
        let sign = Zip::from(&positive)
            .and(&negative)
            .map_collect(|&p, &n| majority_sign(p, n));

        ConsensusNetwork {
            regulators,
            targets,
            confidence,
            sign,
            mean_coefficient,
            mean_contribution,
            fit_quality,
        }
    }
}

impl ConsensusNetwork {
    pub fn empty(regulators: Vec<String>, targets: Vec<String>) -> Self {
        let shape = (regulators.len(), targets.len());
        Self {
            confidence: Array2::zeros(shape),
            sign: Array2::from_elem(shape, 1),
            mean_coefficient: Array2::zeros(shape),
            mean_contribution: Array2::zeros(shape),
            fit_quality: Array1::zeros(targets.len()),
            regulators,
            targets,
        }
    }

    pub fn regulator_position(&self, name: &str) -> Option<usize> {
        self.regulators.iter().position(|r| r == name)
    }

    pub fn target_position(&self, name: &str) -> Option<usize> {
        self.targets.iter().position(|t| t == name)
    }

    pub fn confidence(&self, regulator: &str, target: &str) -> Option<f64> {
        let r = self.regulator_position(regulator)?;
        let t = self.target_position(target)?;
        Some(self.confidence[(r, t)])
    }

    /// Every edge between distinct genes, sorted by descending confidence, then by
    /// regulator name and target name.
    pub fn edges(&self) -> Vec<NetworkEdge> {
        let mut edges = Vec::with_capacity(self.regulators.len() * self.targets.len());
        for (r, regulator) in self.regulators.iter().enumerate() {
            for (t, target) in self.targets.iter().enumerate() {
                if regulator == target {
                    continue;
                }
                edges.push(NetworkEdge {
                    regulator: regulator.clone(),
                    target: target.clone(),
                    confidence: self.confidence[(r, t)],
                    sign: self.sign[(r, t)],
                    coefficient: self.mean_coefficient[(r, t)],
                    contribution: self.mean_contribution[(r, t)],
                });
            }
        }
        edges.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.regulator.cmp(&b.regulator))
                .then_with(|| a.target.cmp(&b.target))
        });
        edges
    }

    /// Edges into one target, in the same order as `edges`.
    pub fn edges_into(&self, target: &str) -> Vec<NetworkEdge> {
        self.edges().into_iter().filter(|e| e.target == target).collect()
    }

    /// Merges networks of related runs over the union of their genes.
    ///
    /// Names keep the order of first appearance. A pair absent from a run does not
    /// count towards that run's share of a `Mean`.
    pub fn combine(networks: &[ConsensusNetwork], rule: CombineRule) -> ConsensusNetwork {
        let mut regulators: Vec<String> = Vec::new();
        let mut targets: Vec<String> = Vec::new();
        let mut regulator_index: AHashMap<String, usize> = AHashMap::new();
        let mut target_index: AHashMap<String, usize> = AHashMap::new();
        for network in networks {
            for name in &network.regulators {
                if !regulator_index.contains_key(name) {
                    regulator_index.insert(name.clone(), regulators.len());
                    regulators.push(name.clone());
                }
            }
            for name in &network.targets {
                if !target_index.contains_key(name) {
                    target_index.insert(name.clone(), targets.len());
                    targets.push(name.clone());
                }
            }
        }

        let shape = (regulators.len(), targets.len());
        let mut score = Array2::<f64>::zeros(shape);
        let mut present = Array2::<usize>::zeros(shape);
        let mut coefficient = Array2::<f64>::zeros(shape);
        let mut contribution = Array2::<f64>::zeros(shape);
        let mut sign_votes = Array2::<i64>::zeros(shape);
        let mut fit_quality = Array1::<f64>::zeros(targets.len());
        let mut fit_runs = vec![0usize; targets.len()];

        for network in networks {
            let values = match rule {
                CombineRule::RankSum => rank_matrix(network.confidence.view()),
                CombineRule::Max | CombineRule::Mean => network.confidence.clone(),
            };
            let rows: Vec<usize> = network
                .regulators
                .iter()
                .map(|name| regulator_index[name])
                .collect();
            let cols: Vec<usize> = network.targets.iter().map(|name| target_index[name]).collect();
            for (t, &col) in cols.iter().enumerate() {
                fit_quality[col] += network.fit_quality[t];
                fit_runs[col] += 1;
                for (r, &row) in rows.iter().enumerate() {
                    let value = values[(r, t)];
                    let cell = &mut score[(row, col)];
                    *cell = match rule {
                        CombineRule::Max => cell.max(value),
                        CombineRule::Mean | CombineRule::RankSum => *cell + value,
                    };
                    present[(row, col)] += 1;
                    coefficient[(row, col)] += network.mean_coefficient[(r, t)];
                    contribution[(row, col)] += network.mean_contribution[(r, t)];
                    if network.confidence[(r, t)] > 0.0 {
                        sign_votes[(row, col)] += i64::from(network.sign[(r, t)]);
                    }
                }
            }
        }

        Zip::from(&mut score)
            .and(&mut coefficient)
            .and(&mut contribution)
            .and(&present)
            .for_each(|s, c, w, &n| {
                if n > 0 {
                    if rule == CombineRule::Mean {
                        *s /= n as f64;
                    }
                    *c /= n as f64;
                    *w /= n as f64;
                }
            });
        for (quality, &runs) in fit_quality.iter_mut().zip(fit_runs.iter()) {
            if runs > 0 {
                *quality /= runs as f64;
            }
        }
        let sign = sign_votes.mapv(|v| match v.cmp(&0) {
            Ordering::Less => -1,
            Ordering::Equal | Ordering::Greater => 1,
        });

        ConsensusNetwork {
            regulators,
            targets,
            confidence: score,
            sign,
            mean_coefficient: coefficient,
            mean_contribution: contribution,
            fit_quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetStatus;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn bootstrap(coefficients: Array2<f64>, contributions: Array2<f64>) -> BootstrapMatrices {
        let targets = coefficients.ncols();
        BootstrapMatrices {
            coefficients,
            contributions,
            fit_quality: Array1::from_elem(targets, 0.5),
            statuses: vec![TargetStatus::Fitted; targets],
        }
    }

    #[test]
    fn ranks_average_ties_and_ignore_zeros() {
        let scores = array![[0.2, 0.0], [0.5, 0.0], [0.2, 0.0], [0.0, 0.0]];
        let ranks = rank_matrix(scores.view());
        // Three positive entries: the tied pair shares ranks 1 and 2.
        assert_abs_diff_eq!(ranks[(0, 0)], 1.5 / 3.0);
        assert_abs_diff_eq!(ranks[(2, 0)], 1.5 / 3.0);
        assert_abs_diff_eq!(ranks[(1, 0)], 1.0);
        assert_eq!(ranks[(3, 0)], 0.0);
        assert!(ranks.column(1).iter().all(|&r| r == 0.0));
    }

    #[test]
    fn aggregating_a_bootstrap_with_itself_reproduces_its_ranks() {
        let single = bootstrap(
            array![[0.4, -1.2, 0.0], [0.0, 0.3, 0.7], [-0.9, 0.0, 0.7]],
            array![[0.1, 0.6, 0.0], [0.0, 0.05, 0.3], [0.4, 0.0, 0.3]],
        );
        for basis in [RankBasis::Contribution, RankBasis::Coefficient] {
            let aggregator = ConsensusAggregator::new(basis);
            let network = aggregator.aggregate(
                names("R", 3),
                names("T", 3),
                &[single.clone(), single.clone()],
            );
            assert_eq!(network.confidence, aggregator.bootstrap_ranks(&single));
        }
    }

    #[test]
    fn sign_follows_majority_and_defaults_to_positive() {
        let up = bootstrap(array![[1.0, 1.0, 0.0]], array![[0.5, 0.5, 0.0]]);
        let down = bootstrap(array![[-1.0, -1.0, 0.0]], array![[0.5, 0.5, 0.0]]);
        let network = ConsensusAggregator::new(RankBasis::Contribution).aggregate(
            names("R", 1),
            names("T", 3),
            &[down.clone(), down, up],
        );
        assert_eq!(network.sign, array![[-1, -1, 1]]);

        let tied = bootstrap(array![[-1.0, 0.0, 0.0]], array![[0.5, 0.0, 0.0]]);
        let other = bootstrap(array![[1.0, 0.0, 0.0]], array![[0.5, 0.0, 0.0]]);
        let network = ConsensusAggregator::new(RankBasis::Contribution).aggregate(
            names("R", 1),
            names("T", 3),
            &[tied, other],
        );
        assert_eq!(network.sign[(0, 0)], 1);
    }

    #[test]
    fn edges_skip_self_pairs_and_sort_deterministically() {
        let regulators = vec!["B".to_string(), "A".to_string()];
        let targets = vec!["A".to_string(), "C".to_string()];
        let mut network = ConsensusNetwork::empty(regulators, targets);
        network.confidence = array![[0.5, 0.5], [0.9, 0.5]];
        let edges = network.edges();
        let pairs: Vec<(&str, &str)> = edges
            .iter()
            .map(|e| (e.regulator.as_str(), e.target.as_str()))
            .collect();
        assert_eq!(pairs, vec![("A", "C"), ("B", "A"), ("B", "C")]);
    }

    #[test]
    fn combine_rules_merge_over_the_union_of_genes() {
        let mut first = ConsensusNetwork::empty(names("R", 2), names("T", 1));
        first.confidence = array![[0.2], [0.8]];
        let mut second = ConsensusNetwork::empty(vec!["R2".into(), "R3".into()], names("T", 2));
        second.confidence = array![[0.4, 1.0], [0.6, 0.0]];

        let max = ConsensusNetwork::combine(&[first.clone(), second.clone()], CombineRule::Max);
        assert_eq!(max.regulators, vec!["R1", "R2", "R3"]);
        assert_eq!(max.targets, vec!["T1", "T2"]);
        assert_abs_diff_eq!(max.confidence("R2", "T1").unwrap(), 0.8);

        let mean = ConsensusNetwork::combine(&[first.clone(), second.clone()], CombineRule::Mean);
        assert_abs_diff_eq!(mean.confidence("R2", "T1").unwrap(), 0.6);
        // Present only in the first run.
        assert_abs_diff_eq!(mean.confidence("R1", "T1").unwrap(), 0.2);
        assert_abs_diff_eq!(mean.confidence("R3", "T2").unwrap(), 0.0);

        let rank_sum = ConsensusNetwork::combine(&[first, second], CombineRule::RankSum);
        // R2 is the stronger regulator of T1 in the first run (1.0) and the weaker in the second (0.5).
        assert_abs_diff_eq!(rank_sum.confidence("R2", "T1").unwrap(), 1.5);
    }

    #[test]
    fn combining_one_network_is_identity_for_confidence() {
        let mut only = ConsensusNetwork::empty(names("R", 2), names("T", 2));
        only.confidence = array![[0.25, 1.0], [1.0, 0.5]];
        let combined = ConsensusNetwork::combine(std::slice::from_ref(&only), CombineRule::Mean);
        assert_eq!(combined.confidence, only.confidence);
        assert_eq!(combined.regulators, only.regulators);
    }
}
