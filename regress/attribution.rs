//! Attribution of explained variance to the predictors of a selected model.
//!
//! The attribution is a policy, chosen in configuration, applied after either
//! regression strategy has picked its predictors. Both policies work on the
//! standardized design restricted to the selected columns.

use super::{RegressionError, TargetFit, least_squares};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceAttribution {
    /// Relative increase in residual error when a predictor is dropped and the
    /// remaining predictors are refit: `1 - RSS(full) / RSS(full without j)`.
    #[default]
    ErrorReduction,
    /// Pratt's measure `beta_j * r(x_j, y)` from the least-squares refit, floored at zero.
    /// The shares sum to the model R².
    Pratt,
}

impl VarianceAttribution {
    pub fn attribute(
        &self,
        selected: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        fit: &TargetFit,
    ) -> Result<Vec<f64>, RegressionError> {
        let p = selected.ncols();
        debug_assert_eq!(p, fit.selected.len());
        if p == 0 {
            return Ok(Vec::new());
        }
        match self {
            Self::ErrorReduction => error_reduction(selected, y),
            Self::Pratt => pratt(selected, y),
        }
    }
}

fn error_reduction(
    selected: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<Vec<f64>, RegressionError> {
    let p = selected.ncols();
    let (_, rss_full) = least_squares(selected, y)?;
    let mut shares = Vec::with_capacity(p);
    for dropped in 0..p {
        let kept: Vec<usize> = (0..p).filter(|&j| j != dropped).collect();
        let reduced = selected.select(Axis(1), &kept);
        let (_, rss_reduced) = least_squares(reduced.view(), y)?;
        let share = if rss_reduced > 0.0 {
            1.0 - rss_full / rss_reduced
        } else {
            0.0
        };
        shares.push(share.clamp(0.0, 1.0));
    }
    Ok(shares)
}

fn pratt(selected: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<Vec<f64>, RegressionError> {
    let n = y.len() as f64;
    let (beta, _) = least_squares(selected, y)?;
    let correlations: Array1<f64> = selected.t().dot(&y) / n;
    Ok(beta
        .iter()
        .zip(correlations.iter())
        .map(|(b, r)| (b * r).max(0.0))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::standardize;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn standardized_design(columns: &[Array1<f64>]) -> Array2<f64> {
        let n = columns[0].len();
        let mut x = Array2::zeros((n, columns.len()));
        for (j, column) in columns.iter().enumerate() {
            x.column_mut(j).assign(&standardize(column.view()).unwrap());
        }
        x
    }

    #[test]
    fn orthogonal_predictors_split_variance_like_pratt() {
        let a = array![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let b = array![1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0];
        let x = standardized_design(&[a.clone(), b.clone()]);
        let y = standardize((&a * 2.0 + &b).view()).unwrap();
        let fit = TargetFit {
            selected: vec![0, 1],
            coefficients: vec![0.0, 0.0],
            fit_quality: 1.0,
        };
        let shares = VarianceAttribution::Pratt.attribute(x.view(), y.view(), &fit).unwrap();
        assert_abs_diff_eq!(shares[0], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(shares[1], 0.2, epsilon = 1e-6);

        let reductions = VarianceAttribution::ErrorReduction
            .attribute(x.view(), y.view(), &fit)
            .unwrap();
        assert!(reductions[0] > 0.99 && reductions[1] > 0.99);
    }

    #[test]
    fn empty_selection_has_no_shares() {
        let x = Array2::<f64>::zeros((4, 0));
        let y = array![1.0, -1.0, 1.0, -1.0];
        let fit = TargetFit::default();
        let shares = VarianceAttribution::ErrorReduction
            .attribute(x.view(), y.view(), &fit)
            .unwrap();
        assert!(shares.is_empty());
    }
}
