//! # Regulator Activity
//!
//! The design matrix is either the expression of each regulator or its estimated
//! transcription-factor activity (TFA). TFA treats expression as the product of a
//! prior connectivity matrix and a hidden activity matrix, `E = P A`, and recovers
//! `A = pinv(P) E`. The pseudoinverse is formed through the normal equations
//! `(P^T P + eps I)^-1 P^T` with a small ridge, so regulators with identical prior
//! targets still factor.
//!
//! Regulators without any prior edge fall back to their own expression; regulators
//! with neither are dropped.

use crate::linalg::{FaerCholesky, LinalgError};
use crate::types::{ExpressionMatrix, LabeledMatrix, MatrixError, PriorMatrix};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ridge on the normal equations, relative to their mean diagonal.
const PINV_RIDGE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("None of the {0} regulators has a prior edge or an expression profile.")]
    NoRegulators(usize),
    #[error("Activity pseudoinverse failed: {0}")]
    Linalg(#[from] LinalgError),
    #[error("Activity matrix could not be labelled: {0}")]
    Matrix(#[from] MatrixError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityMethod {
    /// Regulator expression is used directly.
    Expression,
    #[default]
    Tfa,
}

impl ActivityMethod {
    /// Builds the regulators by samples design matrix.
    pub fn design(
        &self,
        prior: &PriorMatrix,
        expression: &ExpressionMatrix,
        regulators: &[String],
    ) -> Result<LabeledMatrix, ActivityError> {
        match self {
            Self::Expression => {
                let design = expression.select_rows(regulators)?;
                if design.nrows() == 0 {
                    return Err(ActivityError::NoRegulators(regulators.len()));
                }
                let dropped = regulators.len() - design.nrows();
                if dropped > 0 {
                    log::info!("{dropped} regulators have no expression profile and were dropped");
                }
                Ok(design)
            }
            Self::Tfa => compute_activity(prior, expression, regulators, false),
        }
    }
}

/// Transcription-factor activity of `regulators` over the samples of `expression`.
///
/// Unless `keep_self` is set, a regulator's prior edge onto its own gene is ignored.
pub fn compute_activity(
    prior: &PriorMatrix,
    expression: &ExpressionMatrix,
    regulators: &[String],
    keep_self: bool,
) -> Result<LabeledMatrix, ActivityError> {
    let genes = expression.row_names();
    let connectivity = Array2::from_shape_fn((regulators.len(), genes.len()), |(r, g)| {
        if !keep_self && regulators[r] == genes[g] {
            0.0
        } else {
            prior.weight(&regulators[r], &genes[g])
        }
    });

    let mut with_prior = Vec::new();
    let mut expression_only = Vec::new();
    let mut dropped = Vec::new();
    for (r, regulator) in regulators.iter().enumerate() {
        if connectivity.row(r).iter().any(|&w| w != 0.0) {
            with_prior.push(r);
        } else if let Some(g) = expression.row_position(regulator) {
            expression_only.push((r, g));
        } else {
            dropped.push(regulator.as_str());
        }
    }
    if !dropped.is_empty() {
        log::info!(
            "{} regulators are removed from activity (no expression or prior exists)",
            dropped.len()
        );
        log::debug!("Removed regulators: {}", dropped.join(" "));
    }

    let mut kept: Vec<usize> = with_prior
        .iter()
        .copied()
        .chain(expression_only.iter().map(|&(r, _)| r))
        .collect();
    kept.sort_unstable();
    if kept.is_empty() {
        return Err(ActivityError::NoRegulators(regulators.len()));
    }
    let position_of = |r: usize| kept.binary_search(&r).unwrap_or(0);

    let mut activity = Array2::<f64>::zeros((kept.len(), expression.ncols()));
    if !with_prior.is_empty() {
        let p = connectivity.select(Axis(0), &with_prior);
        let mut normal = p.dot(&p.t());
        let mean_diagonal = normal.diag().sum() / normal.nrows() as f64;
        let ridge = PINV_RIDGE * mean_diagonal.max(f64::MIN_POSITIVE);
        normal.diag_mut().mapv_inplace(|d| d + ridge);
        let projected = p.dot(&expression.values());
        let solved = normal.cholesky()?.solve_mat(&projected)?;
        for (row, &r) in with_prior.iter().enumerate() {
            activity.row_mut(position_of(r)).assign(&solved.row(row));
        }
    }
    for &(r, g) in &expression_only {
        activity.row_mut(position_of(r)).assign(&expression.row(g));
    }

    let names = kept.iter().map(|&r| regulators[r].clone()).collect();
    LabeledMatrix::new(activity, names, expression.col_names().to_vec()).map_err(ActivityError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn expression() -> ExpressionMatrix {
        LabeledMatrix::new(
            array![
                [1.0, 2.0, 3.0],
                [2.0, 4.0, 6.0],
                [0.5, 0.1, 0.9],
                [3.0, 1.0, 2.0]
            ],
            labels(&["G1", "G2", "TF2", "TF1"]),
            labels(&["S1", "S2", "S3"]),
        )
        .unwrap()
    }

    #[test]
    fn activity_recovers_hidden_signal_from_prior_targets() {
        // TF1 drives G1 with weight 1 and G2 with weight 2, so its activity is G1.
        let prior = PriorMatrix::new(
            LabeledMatrix::new(
                array![[1.0, 2.0]],
                labels(&["TF1"]),
                labels(&["G1", "G2"]),
            )
            .unwrap(),
        );
        let activity = compute_activity(&prior, &expression(), &labels(&["TF1", "TF2", "TF3"]), false)
            .unwrap();
        assert_eq!(activity.row_names(), &labels(&["TF1", "TF2"])[..]);
        for (value, expected) in activity.row(0).iter().zip([1.0, 2.0, 3.0]) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-6);
        }
        // TF2 has no prior edges and keeps its expression.
        assert_eq!(activity.row(1).to_vec(), vec![0.5, 0.1, 0.9]);
    }

    #[test]
    fn self_edges_are_ignored_unless_kept() {
        let prior = PriorMatrix::new(
            LabeledMatrix::new(array![[1.0]], labels(&["TF1"]), labels(&["TF1"])).unwrap(),
        );
        let ignored = compute_activity(&prior, &expression(), &labels(&["TF1"]), false).unwrap();
        assert_eq!(ignored.row(0).to_vec(), vec![3.0, 1.0, 2.0]);
        let kept = compute_activity(&prior, &expression(), &labels(&["TF1"]), true).unwrap();
        for (value, expected) in kept.row(0).iter().zip([3.0, 1.0, 2.0]) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn unknown_regulators_only_is_an_error() {
        let err = ActivityMethod::Tfa
            .design(&PriorMatrix::empty(), &expression(), &labels(&["X", "Y"]))
            .unwrap_err();
        assert!(matches!(err, ActivityError::NoRegulators(2)));
    }

    #[test]
    fn expression_method_selects_regulator_rows() {
        let design = ActivityMethod::Expression
            .design(&PriorMatrix::empty(), &expression(), &labels(&["TF1", "G1", "missing"]))
            .unwrap();
        assert_eq!(design.row_names(), &labels(&["TF1", "G1"])[..]);
        assert_eq!(design.row(0).to_vec(), vec![3.0, 1.0, 2.0]);
    }
}
