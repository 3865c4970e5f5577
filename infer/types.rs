// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is only for types shared between modules of the engine.

use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error("Matrix has {rows} rows but {labels} row labels were supplied.")]
    RowLabelMismatch { rows: usize, labels: usize },
    #[error("Matrix has {cols} columns but {labels} column labels were supplied.")]
    ColumnLabelMismatch { cols: usize, labels: usize },
    #[error("Duplicate label '{0}' on a matrix axis.")]
    DuplicateLabel(String),
    #[error("Non-finite value found at row '{row}', column '{column}'.")]
    NonFinite { row: String, column: String },
}

/// A dense `f64` matrix with named rows and columns.
///
/// Labels are unique per axis and index lookups are constant time, which is what
/// the prior and activity code relies on when aligning on gene names.
#[derive(Clone, Debug)]
pub struct LabeledMatrix {
    values: Array2<f64>,
    row_names: Vec<String>,
    col_names: Vec<String>,
    row_index: AHashMap<String, usize>,
    col_index: AHashMap<String, usize>,
}

fn build_index(names: &[String]) -> Result<AHashMap<String, usize>, MatrixError> {
    let mut index = AHashMap::with_capacity(names.len());
    for (position, name) in names.iter().enumerate() {
        if index.insert(name.clone(), position).is_some() {
            return Err(MatrixError::DuplicateLabel(name.clone()));
        }
    }
    Ok(index)
}

impl LabeledMatrix {
    pub fn new(
        values: Array2<f64>,
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Result<Self, MatrixError> {
        if values.nrows() != row_names.len() {
            return Err(MatrixError::RowLabelMismatch {
                rows: values.nrows(),
                labels: row_names.len(),
            });
        }
        if values.ncols() != col_names.len() {
            return Err(MatrixError::ColumnLabelMismatch {
                cols: values.ncols(),
                labels: col_names.len(),
            });
        }
        let row_index = build_index(&row_names)?;
        let col_index = build_index(&col_names)?;
        Ok(Self {
            values,
            row_names,
            col_names,
            row_index,
            col_index,
        })
    }

    /// Builds the matrix and rejects NaN or infinite entries.
    pub fn new_finite(
        values: Array2<f64>,
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Result<Self, MatrixError> {
        if let Some(((i, j), _)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(MatrixError::NonFinite {
                row: row_names.get(i).cloned().unwrap_or_default(),
                column: col_names.get(j).cloned().unwrap_or_default(),
            });
        }
        Self::new(values, row_names, col_names)
    }

    #[inline]
    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }

    #[inline]
    pub fn row_position(&self, name: &str) -> Option<usize> {
        self.row_index.get(name).copied()
    }

    #[inline]
    pub fn col_position(&self, name: &str) -> Option<usize> {
        self.col_index.get(name).copied()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Returns the value at `(row, col)` by label, or `None` when either label is absent.
    pub fn get(&self, row: &str, col: &str) -> Option<f64> {
        let i = self.row_position(row)?;
        let j = self.col_position(col)?;
        Some(self.values[(i, j)])
    }

    pub fn transposed(&self) -> Self {
        Self {
            values: self.values.t().to_owned(),
            row_names: self.col_names.clone(),
            col_names: self.row_names.clone(),
            row_index: self.col_index.clone(),
            col_index: self.row_index.clone(),
        }
    }

    /// Keeps the named rows, in the order given. Unknown names are skipped; a name
    /// requested twice is a `DuplicateLabel` error.
    pub fn select_rows(&self, names: &[String]) -> Result<Self, MatrixError> {
        let kept: Vec<(usize, String)> = names
            .iter()
            .filter_map(|name| self.row_position(name).map(|i| (i, name.clone())))
            .collect();
        let positions: Vec<usize> = kept.iter().map(|(i, _)| *i).collect();
        let values = self.values.select(Axis(0), &positions);
        let row_names: Vec<String> = kept.into_iter().map(|(_, name)| name).collect();
        let row_index = build_index(&row_names)?;
        Ok(Self {
            values,
            row_names,
            col_names: self.col_names.clone(),
            row_index,
            col_index: self.col_index.clone(),
        })
    }
}

/// Genes by samples expression data. Immutable once validated.
pub type ExpressionMatrix = LabeledMatrix;

/// Prior edge knowledge oriented regulators by targets.
///
/// Lookups for regulators or targets that are absent from the prior return zero.
#[derive(Clone, Debug)]
pub struct PriorMatrix {
    matrix: LabeledMatrix,
}

impl PriorMatrix {
    pub fn new(matrix: LabeledMatrix) -> Self {
        Self { matrix }
    }

    pub fn empty() -> Self {
        let matrix = LabeledMatrix {
            values: Array2::zeros((0, 0)),
            row_names: Vec::new(),
            col_names: Vec::new(),
            row_index: AHashMap::new(),
            col_index: AHashMap::new(),
        };
        Self { matrix }
    }

    #[inline]
    pub fn weight(&self, regulator: &str, target: &str) -> f64 {
        self.matrix.get(regulator, target).unwrap_or(0.0)
    }

    pub fn matrix(&self) -> &LabeledMatrix {
        &self.matrix
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0 || self.matrix.ncols() == 0
    }

    /// Number of non-zero edges.
    pub fn edge_count(&self) -> usize {
        self.matrix.values().iter().filter(|w| **w != 0.0).count()
    }
}

/// Design (regulators by samples) and response (targets by samples) matrices that share
/// an identically ordered sample axis.
#[derive(Clone, Debug)]
pub struct DesignResponse {
    pub design: Arc<LabeledMatrix>,
    pub response: Arc<LabeledMatrix>,
}

/// Why a target produced no regression model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetStatus {
    Fitted,
    /// No eligible regulator remained after excluding self-regulation and constant rows.
    NoCandidates,
    /// The response had zero variance in this bootstrap.
    Degenerate,
    /// The solver hit its iteration cap.
    NotConverged,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fitted => "fitted",
            Self::NoCandidates => "no candidates",
            Self::Degenerate => "degenerate",
            Self::NotConverged => "not converged",
        };
        f.write_str(label)
    }
}

/// Regression output for one target gene in one bootstrap.
#[derive(Clone, Debug, PartialEq)]
pub struct PerTargetResult {
    pub target: usize,
    pub status: TargetStatus,
    /// Regulator positions (rows of the design matrix) that received a non-zero effect.
    pub predictors: Vec<usize>,
    /// Signed standardized effect sizes, aligned with `predictors`.
    pub coefficients: Vec<f64>,
    /// Per-predictor confidence (fraction of variance attributed), aligned with `predictors`.
    pub contributions: Vec<f64>,
    /// Rescaled R² of the selected model.
    pub fit_quality: f64,
}

impl PerTargetResult {
    pub fn empty(target: usize, status: TargetStatus) -> Self {
        Self {
            target,
            status,
            predictors: Vec::new(),
            coefficients: Vec::new(),
            contributions: Vec::new(),
            fit_quality: 0.0,
        }
    }
}

/// Dense regulators by targets view of one completed bootstrap.
#[derive(Clone, Debug)]
pub struct BootstrapMatrices {
    pub coefficients: Array2<f64>,
    pub contributions: Array2<f64>,
    pub fit_quality: Array1<f64>,
    pub statuses: Vec<TargetStatus>,
}
