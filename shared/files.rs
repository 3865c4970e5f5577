//! Tab-separated input and output.
//!
//! Matrices are stored with a header row of column names and one row per record whose
//! first field is the row name. The header may omit the corner cell, as written by R.

use crate::consensus::ConsensusNetwork;
use crate::types::{ExpressionMatrix, LabeledMatrix, MatrixError, PriorMatrix};
use ahash::AHashSet;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use log::{debug, info};
use ndarray::Array2;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Failed to open or write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed table '{path}': {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("'{path}' line {line}: expected {expected} fields, found {found}.")]
    FieldCount {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("'{path}' line {line}: '{value}' is not a number.")]
    NotANumber {
        path: PathBuf,
        line: u64,
        value: String,
    },
    #[error("'{0}' has no header row.")]
    Empty(PathBuf),
    #[error("'{path}' is not a valid matrix: {source}")]
    Matrix { path: PathBuf, source: MatrixError },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FileError + '_ {
    move |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> FileError + '_ {
    move |source| FileError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn read_table(path: &Path) -> Result<LabeledMatrix, FileError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(file);
    let mut records = reader.records();
    let header: StringRecord = records
        .next()
        .ok_or_else(|| FileError::Empty(path.to_path_buf()))?
        .map_err(csv_error(path))?;

    let mut columns: Vec<String> = header.iter().map(|s| s.trim().to_string()).collect();
    let mut row_names = Vec::new();
    let mut values = Vec::new();
    let mut width = None;
    for record in records {
        let record = record.map_err(csv_error(path))?;
        let line = record.position().map_or(0, |p| p.line());
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        // A header without a corner cell is one field short of every data row.
        let expected = *width.get_or_insert_with(|| {
            if columns.len() + 1 == record.len() {
                columns.len()
            } else {
                columns.remove(0);
                columns.len()
            }
        });
        if record.len() != expected + 1 {
            return Err(FileError::FieldCount {
                path: path.to_path_buf(),
                line,
                expected: expected + 1,
                found: record.len(),
            });
        }
        let mut fields = record.iter();
        row_names.push(fields.next().unwrap_or_default().trim().to_string());
        for field in fields {
            let field = field.trim();
            let value = field.parse::<f64>().map_err(|_| FileError::NotANumber {
                path: path.to_path_buf(),
                line,
                value: field.to_string(),
            })?;
            values.push(value);
        }
    }
    if width.is_none() && !columns.is_empty() {
        columns.remove(0);
    }

    let shape = (row_names.len(), columns.len());
    let matrix = Array2::from_shape_vec(shape, values).map_err(|_| FileError::FieldCount {
        path: path.to_path_buf(),
        line: 0,
        expected: shape.0 * shape.1,
        found: 0,
    })?;
    LabeledMatrix::new_finite(matrix, row_names, columns).map_err(|source| FileError::Matrix {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a genes by samples expression table.
///
/// With `transpose`, the file is read as samples by genes.
pub fn read_expression(path: &Path, transpose: bool) -> Result<ExpressionMatrix, FileError> {
    let table = read_table(path)?;
    let expression = if transpose { table.transposed() } else { table };
    info!(
        "Loaded expression for {} genes over {} samples from {}",
        expression.nrows(),
        expression.ncols(),
        path.display()
    );
    Ok(expression)
}

/// Reads regulator names, one per line. Blank lines and repeats are skipped.
pub fn read_regulators(path: &Path) -> Result<Vec<String>, FileError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let mut seen = AHashSet::new();
    let mut regulators = Vec::new();
    for name in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if seen.insert(name) {
            regulators.push(name.to_string());
        } else {
            debug!("Regulator {name} is listed more than once");
        }
    }
    info!("Loaded {} regulators from {}", regulators.len(), path.display());
    Ok(regulators)
}

/// Reads a targets by regulators prior table.
pub fn read_prior(path: &Path) -> Result<PriorMatrix, FileError> {
    let table = read_table(path)?;
    let edges = table.values().iter().filter(|&&w| w != 0.0).count();
    info!(
        "Loaded prior with {edges} edges between {} regulators and {} targets",
        table.ncols(),
        table.nrows()
    );
    Ok(PriorMatrix::new(table.transposed()))
}

/// Writes every edge of the network, strongest first.
pub fn write_network(path: &Path, network: &ConsensusNetwork) -> Result<usize, FileError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file));
    let edges = network.edges();
    for edge in &edges {
        writer.serialize(edge).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(path))?;
    info!("Wrote {} edges to {}", edges.len(), path.display());
    Ok(edges.len())
}

/// Writes a prior as a targets by regulators table that `read_prior` reads back.
pub fn write_prior(path: &Path, prior: &PriorMatrix) -> Result<usize, FileError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file));
    let table = prior.matrix().transposed();
    let header = std::iter::once("").chain(table.col_names().iter().map(String::as_str));
    writer.write_record(header).map_err(csv_error(path))?;
    for (t, target) in table.row_names().iter().enumerate() {
        let weights = table.row(t).iter().map(|w| w.to_string()).collect::<Vec<_>>();
        let record = std::iter::once(target.as_str()).chain(weights.iter().map(String::as_str));
        writer.write_record(record).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(path))?;
    let edges = prior.edge_count();
    info!("Wrote prior with {edges} edges to {}", path.display());
    Ok(edges)
}
