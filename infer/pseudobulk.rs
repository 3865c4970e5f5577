//! # Pseudobulk Single-Cell Mode
//!
//! Single cells are grouped once per run by k-means on library-size-normalized,
//! log-transformed expression. Cluster sums (pseudobulk profiles) stand in for
//! cells wherever a statistic needs denser counts: regulator activity is estimated
//! on pseudobulk and broadcast back to every cell of the cluster, and each bootstrap
//! re-sums its resampled cells before association scoring.

use crate::types::{LabeledMatrix, MatrixError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PseudobulkError {
    #[error("Cannot cluster {cells} cells into {clusters} clusters.")]
    InvalidClusterCount { cells: usize, clusters: usize },
    #[error("Cluster index covers {index} cells but the matrix has {cells}.")]
    IndexLength { index: usize, cells: usize },
    #[error("Pseudobulk profile for cluster {0} is missing.")]
    MissingCluster(usize),
    #[error("Pseudobulk matrix could not be labelled: {0}")]
    Matrix(#[from] MatrixError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudobulkConfig {
    pub clusters: usize,
    pub max_iterations: usize,
}

impl Default for PseudobulkConfig {
    fn default() -> Self {
        Self {
            clusters: 20,
            max_iterations: 100,
        }
    }
}

/// Cluster label of every cell, in cell order. Labels are dense: `0..cluster_count()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIndex(pub Vec<usize>);

impl ClusterIndex {
    pub fn cluster_count(&self) -> usize {
        self.0.iter().max().map_or(0, |&c| c + 1)
    }

    /// Cluster labels of the resampled cells.
    pub fn resampled(&self, indices: &[usize]) -> ClusterIndex {
        ClusterIndex(indices.iter().map(|&i| self.0[i]).collect())
    }
}

pub fn cluster_label(cluster: usize) -> String {
    format!("cluster{cluster}")
}

/// Library-size normalization to the median cell total followed by `ln(1 + x)`.
fn normalized_cells(counts: ArrayView2<'_, f64>) -> Array2<f64> {
    let totals: Vec<f64> = counts.axis_iter(Axis(1)).map(|c| c.sum()).collect();
    let mut sorted = totals.clone();
    sorted.sort_by(f64::total_cmp);
    let median = sorted.get(sorted.len() / 2).copied().unwrap_or(1.0).max(f64::MIN_POSITIVE);
    let mut cells = counts.t().to_owned();
    for (mut cell, &total) in cells.axis_iter_mut(Axis(0)).zip(totals.iter()) {
        let scale = if total > 0.0 { median / total } else { 0.0 };
        cell.mapv_inplace(|v| (v.max(0.0) * scale).ln_1p());
    }
    cells
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Seeded k-means over the cells (columns) of a genes by cells count matrix.
pub fn initial_clustering(
    counts: ArrayView2<'_, f64>,
    config: &PseudobulkConfig,
    seed: u64,
) -> Result<ClusterIndex, PseudobulkError> {
    let n_cells = counts.ncols();
    let k = config.clusters;
    if k == 0 || k > n_cells {
        return Err(PseudobulkError::InvalidClusterCount {
            cells: n_cells,
            clusters: k,
        });
    }
    let cells = normalized_cells(counts);
    let mut rng = StdRng::seed_from_u64(seed);
    let seeds = sample(&mut rng, n_cells, k).into_vec();
    let mut centroids = cells.select(Axis(0), &seeds);
    let mut labels = vec![0usize; n_cells];

    for iteration in 0..config.max_iterations {
        let assigned: Vec<usize> = cells
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|cell| {
                centroids
                    .axis_iter(Axis(0))
                    .map(|centroid| squared_distance(cell, centroid))
                    .enumerate()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map_or(0, |(c, _)| c)
            })
            .collect();
        let moved = iteration == 0 || assigned != labels;
        labels = assigned;
        if !moved {
            log::debug!("k-means converged after {iteration} iterations");
            break;
        }
        let mut sums = Array2::<f64>::zeros(centroids.dim());
        let mut sizes = vec![0usize; k];
        for (cell, &label) in cells.axis_iter(Axis(0)).zip(labels.iter()) {
            let mut row = sums.row_mut(label);
            row += &cell;
            sizes[label] += 1;
        }
        for (c, &size) in sizes.iter().enumerate() {
            // An emptied cluster keeps its previous centroid.
            if size > 0 {
                let mean = &sums.row(c) / size as f64;
                centroids.row_mut(c).assign(&mean);
            }
        }
    }

    // Relabel densely in order of first appearance.
    let mut dense = vec![usize::MAX; k];
    let mut next = 0;
    for label in labels.iter_mut() {
        if dense[*label] == usize::MAX {
            dense[*label] = next;
            next += 1;
        }
        *label = dense[*label];
    }
    log::info!("Clustered {n_cells} cells into {next} pseudobulk groups");
    Ok(ClusterIndex(labels))
}

/// Sums the cells of each cluster present in `index`.
///
/// Columns are the present clusters in ascending order, named by `cluster_label`.
/// With `pseudocount`, one is added to every summed entry.
pub fn make_clusters_from_singles(
    matrix: &LabeledMatrix,
    index: &ClusterIndex,
    pseudocount: bool,
) -> Result<LabeledMatrix, PseudobulkError> {
    if index.0.len() != matrix.ncols() {
        return Err(PseudobulkError::IndexLength {
            index: index.0.len(),
            cells: matrix.ncols(),
        });
    }
    let mut bulk = rebulk(matrix.values(), index);
    if pseudocount {
        bulk += 1.0;
    }
    let names = present_clusters(index).into_iter().map(cluster_label).collect();
    LabeledMatrix::new(bulk, matrix.row_names().to_vec(), names).map_err(PseudobulkError::from)
}

/// Copies each cluster's profile to every cell of that cluster.
pub fn make_singles_from_clusters(
    bulk: &LabeledMatrix,
    index: &ClusterIndex,
    cell_names: &[String],
) -> Result<LabeledMatrix, PseudobulkError> {
    if index.0.len() != cell_names.len() {
        return Err(PseudobulkError::IndexLength {
            index: index.0.len(),
            cells: cell_names.len(),
        });
    }
    let mut singles = Array2::<f64>::zeros((bulk.nrows(), cell_names.len()));
    for (cell, &cluster) in index.0.iter().enumerate() {
        let column = bulk
            .col_position(&cluster_label(cluster))
            .ok_or(PseudobulkError::MissingCluster(cluster))?;
        singles.column_mut(cell).assign(&bulk.values().column(column));
    }
    LabeledMatrix::new(singles, bulk.row_names().to_vec(), cell_names.to_vec())
        .map_err(PseudobulkError::from)
}

fn present_clusters(index: &ClusterIndex) -> Vec<usize> {
    index.0.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Sums the columns of `values` by cluster, one column per present cluster in
/// ascending order. Used on resampled cells before association scoring.
pub fn rebulk(values: ArrayView2<'_, f64>, index: &ClusterIndex) -> Array2<f64> {
    let present = present_clusters(index);
    let mut bulk = Array2::<f64>::zeros((values.nrows(), present.len()));
    for (cell, &cluster) in index.0.iter().enumerate() {
        if let Ok(column) = present.binary_search(&cluster) {
            let mut target = bulk.column_mut(column);
            target += &values.column(cell);
        }
    }
    bulk
}

/// Number of cells in each cluster.
pub fn cluster_sizes(index: &ClusterIndex) -> Array1<usize> {
    let mut sizes = Array1::<usize>::zeros(index.cluster_count());
    for &cluster in &index.0 {
        sizes[cluster] += 1;
    }
    sizes
}
