//! Seeded holdout of prior edges.
//!
//! A fraction of the prior is kept back from fitting so the inferred network can be
//! scored against known interactions it never saw. The split is drawn from the run
//! seed, so repeated runs with the same seed hold out the same edges.

use crate::types::{LabeledMatrix, MatrixError, PriorMatrix};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const HOLDOUT_STREAM: u64 = 0xC0FF_EE00_D15C_A4D5;

/// Which part of the prior is partitioned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldoutAxis {
    /// Whole target columns.
    #[default]
    Targets,
    /// Whole regulator rows.
    Regulators,
    /// Individual non-zero edges, leaving both axes intact.
    Edges,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorHoldout {
    /// Fraction of the prior held out, strictly between 0 and 1.
    pub ratio: f64,
    pub axis: HoldoutAxis,
}

impl Default for PriorHoldout {
    fn default() -> Self {
        Self {
            ratio: 0.2,
            axis: HoldoutAxis::default(),
        }
    }
}

/// The prior used for fitting and the part kept back for evaluation.
#[derive(Clone, Debug)]
pub struct PriorSplit {
    pub fitting: PriorMatrix,
    pub held_out: PriorMatrix,
}

fn held_count(total: usize, ratio: f64) -> usize {
    ((total as f64 * ratio).round() as usize).min(total)
}

/// Splits the rows into (kept, held out), each in original order.
fn split_rows(
    matrix: &LabeledMatrix,
    ratio: f64,
    rng: &mut StdRng,
) -> Result<(LabeledMatrix, LabeledMatrix), MatrixError> {
    let mut order: Vec<usize> = (0..matrix.nrows()).collect();
    order.shuffle(rng);
    let (held, kept) = order.split_at_mut(held_count(matrix.nrows(), ratio));
    held.sort_unstable();
    kept.sort_unstable();
    let names = |positions: &[usize]| -> Vec<String> {
        positions.iter().map(|&i| matrix.row_names()[i].clone()).collect()
    };
    Ok((matrix.select_rows(&names(kept))?, matrix.select_rows(&names(held))?))
}

fn split_edges(
    matrix: &LabeledMatrix,
    ratio: f64,
    rng: &mut StdRng,
) -> Result<(LabeledMatrix, LabeledMatrix), MatrixError> {
    let values = matrix.values();
    let mut edges: Vec<(usize, usize)> = values
        .indexed_iter()
        .filter(|(_, w)| **w != 0.0)
        .map(|(position, _)| position)
        .collect();
    edges.shuffle(rng);
    let mut fitting = values.to_owned();
    let mut held_out = Array2::<f64>::zeros(values.dim());
    for &position in &edges[..held_count(edges.len(), ratio)] {
        held_out[position] = values[position];
        fitting[position] = 0.0;
    }
    let rows = matrix.row_names().to_vec();
    let cols = matrix.col_names().to_vec();
    Ok((
        LabeledMatrix::new(fitting, rows.clone(), cols.clone())?,
        LabeledMatrix::new(held_out, rows, cols)?,
    ))
}

impl PriorHoldout {
    pub fn split(&self, prior: &PriorMatrix, seed: u64) -> Result<PriorSplit, MatrixError> {
        let mut rng = StdRng::seed_from_u64(seed ^ HOLDOUT_STREAM);
        let matrix = prior.matrix();
        let (fitting, held_out) = match self.axis {
            HoldoutAxis::Regulators => split_rows(matrix, self.ratio, &mut rng)?,
            HoldoutAxis::Targets => {
                let (kept, held) = split_rows(&matrix.transposed(), self.ratio, &mut rng)?;
                (kept.transposed(), held.transposed())
            }
            HoldoutAxis::Edges => split_edges(matrix, self.ratio, &mut rng)?,
        };
        Ok(PriorSplit {
            fitting: PriorMatrix::new(fitting),
            held_out: PriorMatrix::new(held_out),
        })
    }
}
