//! # Association Scoring: Mutual Information with Background Correction
//!
//! Every regulator row and every target row is discretized into a fixed number of
//! bins. Mutual information between a regulator and a target is read from their
//! joint histogram. The raw statistic is then corrected CLR-style: each entry is
//! z-scored against its regulator's row and its target's column, and the two
//! positive parts are combined as `sqrt(max(z_row, 0)^2 + max(z_col, 0)^2)`.
//!
//! Rows are independent, so the raw matrix can be filled in regulator blocks by
//! different workers and assembled afterwards.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const DEFAULT_BINS: usize = 10;
/// Upper bound on bins per axis; the joint histogram holds `bins²` counters.
pub const MAX_BINS: usize = 256;

/// How a continuous vector is partitioned into bins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discretization {
    #[default]
    EqualWidth,
    EqualFrequency,
}

/// Bin codes for every row of a matrix, plus a flag for rows with zero variance.
#[derive(Clone, Debug)]
pub struct DiscretizedRows {
    codes: Array2<u16>,
    constant: Vec<bool>,
}

impl DiscretizedRows {
    pub fn nrows(&self) -> usize {
        self.codes.nrows()
    }

    pub fn is_constant(&self, row: usize) -> bool {
        self.constant[row]
    }

    pub fn constant_flags(&self) -> &[bool] {
        &self.constant
    }
}

/// Raw and background-corrected association, both regulators by targets.
#[derive(Clone, Debug)]
pub struct AssociationMatrix {
    pub raw: Array2<f64>,
    pub corrected: Array2<f64>,
}

#[derive(Clone, Copy, Debug)]
pub struct AssociationEngine {
    bins: usize,
    discretization: Discretization,
}

impl Default for AssociationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BINS, Discretization::EqualWidth)
    }
}

fn is_constant(values: ArrayView1<'_, f64>) -> bool {
    let mut iter = values.iter();
    match iter.next() {
        Some(&first) => iter.all(|&v| v == first),
        None => true,
    }
}

fn equal_width_codes(values: ArrayView1<'_, f64>, bins: usize) -> Vec<u16> {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = hi - lo;
    if !(span > 0.0) {
        return vec![0; values.len()];
    }
    let top = (bins - 1) as f64;
    values
        .iter()
        .map(|&v| (((v - lo) / span) * bins as f64).floor().clamp(0.0, top) as u16)
        .collect()
}

fn equal_frequency_codes(values: ArrayView1<'_, f64>, bins: usize) -> Vec<u16> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    let mut codes = vec![0u16; n];
    let mut position = 0;
    while position < n {
        // Tied values share the bin of their first sorted position.
        let bin = ((position * bins) / n).min(bins - 1) as u16;
        let value = values[order[position]];
        while position < n && values[order[position]] == value {
            codes[order[position]] = bin;
            position += 1;
        }
    }
    codes
}

impl AssociationEngine {
    pub fn new(bins: usize, discretization: Discretization) -> Self {
        Self {
            bins: bins.clamp(2, MAX_BINS),
            discretization,
        }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn discretize(&self, matrix: ArrayView2<'_, f64>) -> DiscretizedRows {
        let (rows, cols) = matrix.dim();
        let mut codes = Array2::<u16>::zeros((rows, cols));
        let mut constant = vec![false; rows];
        codes
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(constant.par_iter_mut())
            .zip(matrix.axis_iter(Axis(0)).into_par_iter())
            .for_each(|((mut out, flag), row)| {
                *flag = is_constant(row);
                let row_codes = if *flag {
                    vec![0; row.len()]
                } else {
                    match self.discretization {
                        Discretization::EqualWidth => equal_width_codes(row, self.bins),
                        Discretization::EqualFrequency => equal_frequency_codes(row, self.bins),
                    }
                };
                for (slot, code) in out.iter_mut().zip(row_codes) {
                    *slot = code;
                }
            });
        DiscretizedRows { codes, constant }
    }

    /// Mutual information in nats between two equally long code vectors.
    pub fn mutual_information(&self, x: ArrayView1<'_, u16>, y: ArrayView1<'_, u16>) -> f64 {
        JointCounts::new(self.bins).mutual_information(x, y)
    }

    /// Raw mutual information for a block of regulator rows against every target.
    pub fn mutual_information_block(
        &self,
        regulators: &DiscretizedRows,
        targets: &DiscretizedRows,
        block: Range<usize>,
    ) -> Array2<f64> {
        let n_targets = targets.nrows();
        let mut out = Array2::<f64>::zeros((block.len(), n_targets));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(block.clone().into_par_iter())
            .for_each(|(mut row_out, regulator)| {
                if regulators.constant[regulator] {
                    return;
                }
                let x = regulators.codes.row(regulator);
                let mut counts = JointCounts::new(self.bins);
                for (target, slot) in row_out.iter_mut().enumerate() {
                    if targets.constant[target] {
                        continue;
                    }
                    *slot = counts.mutual_information(x, targets.codes.row(target));
                }
            });
        out
    }

    /// Single-caller path: discretizes both matrices and scores every pair.
    pub fn compute(
        &self,
        design: ArrayView2<'_, f64>,
        response: ArrayView2<'_, f64>,
    ) -> AssociationMatrix {
        let regulators = self.discretize(design);
        let targets = self.discretize(response);
        let raw = self.mutual_information_block(&regulators, &targets, 0..regulators.nrows());
        let corrected = background_correct(
            raw.view(),
            regulators.constant_flags(),
            targets.constant_flags(),
        );
        AssociationMatrix { raw, corrected }
    }
}

/// Histogram scratch space, reused across the pairs of one regulator row.
struct JointCounts {
    bins: usize,
    joint: Vec<u32>,
    px: Vec<u32>,
    py: Vec<u32>,
}

impl JointCounts {
    fn new(bins: usize) -> Self {
        Self {
            bins,
            joint: vec![0; bins * bins],
            px: vec![0; bins],
            py: vec![0; bins],
        }
    }

    fn mutual_information(&mut self, x: ArrayView1<'_, u16>, y: ArrayView1<'_, u16>) -> f64 {
        let n = x.len();
        if n == 0 {
            return 0.0;
        }
        let bins = self.bins;
        self.joint.fill(0);
        self.px.fill(0);
        self.py.fill(0);
        for (&a, &b) in x.iter().zip(y.iter()) {
            let (a, b) = (a as usize, b as usize);
            self.joint[a * bins + b] += 1;
            self.px[a] += 1;
            self.py[b] += 1;
        }
        let total = n as f64;
        let mut mi = 0.0;
        for a in 0..bins {
            if self.px[a] == 0 {
                continue;
            }
            for b in 0..bins {
                let count = self.joint[a * bins + b];
                if count == 0 {
                    continue;
                }
                let pxy = count as f64 / total;
                let expected = (self.px[a] as f64 / total) * (self.py[b] as f64 / total);
                mi += pxy * (pxy / expected).ln();
            }
        }
        mi.max(0.0)
    }
}

fn mean_and_std(values: ArrayView1<'_, f64>) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.sum() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, variance.sqrt())
}

#[inline]
fn positive_z(value: f64, mean: f64, std: f64) -> f64 {
    if std > 0.0 {
        ((value - mean) / std).max(0.0)
    } else {
        0.0
    }
}

/// CLR-style correction of a raw regulators by targets statistic.
///
/// Entries whose regulator or target input row was constant are exactly zero.
pub fn background_correct(
    raw: ArrayView2<'_, f64>,
    constant_regulators: &[bool],
    constant_targets: &[bool],
) -> Array2<f64> {
    let row_stats: Vec<(f64, f64)> = raw.axis_iter(Axis(0)).map(mean_and_std).collect();
    let col_stats: Vec<(f64, f64)> = raw.axis_iter(Axis(1)).map(mean_and_std).collect();
    let mut corrected = Array2::<f64>::zeros(raw.dim());
    corrected
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut out)| {
            if constant_regulators.get(i).copied().unwrap_or(false) {
                return;
            }
            let (row_mean, row_std) = row_stats[i];
            for (j, slot) in out.iter_mut().enumerate() {
                if constant_targets.get(j).copied().unwrap_or(false) {
                    continue;
                }
                let value = raw[(i, j)];
                let (col_mean, col_std) = col_stats[j];
                let z_row = positive_z(value, row_mean, row_std);
                let z_col = positive_z(value, col_mean, col_std);
                *slot = (z_row * z_row + z_col * z_col).sqrt();
            }
        });
    corrected
}
