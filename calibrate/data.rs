//! # Data Loading and Writing
//!
//! Reads tab-separated files with a fixed schema. Column names are not
//! configurable:
//!
//! - `label`: ground-truth class, required for fitting and evaluation.
//! - `score`: raw classifier score, always required.
//! - `sample_id`: optional identifier carried through to predictions. When
//!   absent, 1-based row numbers are used instead.
//!
//! Extra columns are ignored. Empty, non-numeric and non-finite values are
//! rejected with the offending column and row.

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use ndarray::{Array1, ArrayView1};
use std::path::Path;
use thiserror::Error;

/// Labels and scores for fitting or evaluating a calibrator.
#[derive(Debug)]
pub struct CalibrationData {
    pub labels: Array1<f64>,
    pub scores: Array1<f64>,
}

/// Scores to be calibrated.
#[derive(Debug)]
pub struct ScoreData {
    pub sample_ids: Vec<String>,
    pub scores: Array1<f64>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read or write the TSV file: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Missing value in column '{column}' at data row {row}.")]
    MissingValue { column: String, row: usize },
    #[error("Column '{column}' holds the non-numeric value '{value}' at data row {row}.")]
    NotNumeric {
        column: String,
        row: usize,
        value: String,
    },
    #[error("Column '{column}' holds a non-finite value at data row {row}.")]
    NonFiniteValue { column: String, row: usize },
    #[error("The input file contains no data rows.")]
    NoRows,
    #[error("{ids} sample ids, {scores} scores and {probabilities} probabilities cannot be written together.")]
    OutputLengthMismatch {
        ids: usize,
        scores: usize,
        probabilities: usize,
    },
}

/// Loads the `label` and `score` columns.
pub fn load_calibration_data(path: &Path) -> Result<CalibrationData, DataError> {
    let table = internal::read_table(path)?;
    let labels = table.numeric_column("label")?;
    let scores = table.numeric_column("score")?;
    Ok(CalibrationData { labels, scores })
}

/// Loads the `score` column and, if present, `sample_id`.
pub fn load_scores(path: &Path) -> Result<ScoreData, DataError> {
    let table = internal::read_table(path)?;
    let scores = table.numeric_column("score")?;
    let sample_ids = match table.column_index("sample_id") {
        Some(idx) => table
            .records
            .iter()
            .map(|record| record.get(idx).unwrap_or_default().trim().to_string())
            .collect(),
        None => (1..=table.records.len()).map(|i| i.to_string()).collect(),
    };
    Ok(ScoreData { sample_ids, scores })
}

/// Writes `sample_id`, `score` and `calibrated_probability` columns.
pub fn write_predictions(
    path: &Path,
    sample_ids: &[String],
    scores: ArrayView1<f64>,
    probabilities: ArrayView1<f64>,
) -> Result<(), DataError> {
    if sample_ids.len() != scores.len() || scores.len() != probabilities.len() {
        return Err(DataError::OutputLengthMismatch {
            ids: sample_ids.len(),
            scores: scores.len(),
            probabilities: probabilities.len(),
        });
    }

    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    writer.write_record(["sample_id", "score", "calibrated_probability"])?;
    for ((id, score), p) in sample_ids.iter().zip(scores.iter()).zip(probabilities.iter()) {
        writer.write_record([id.clone(), format!("{score}"), format!("{p:.12}")])?;
    }
    writer.flush()?;
    Ok(())
}

mod internal {
    use super::*;

    pub(super) struct Table {
        headers: Vec<String>,
        pub(super) records: Vec<StringRecord>,
    }

    pub(super) fn read_table(path: &Path) -> Result<Table, DataError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)?;
        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        if records.is_empty() {
            return Err(DataError::NoRows);
        }
        log::debug!("Read {} rows from {}", records.len(), path.display());
        Ok(Table { headers, records })
    }

    impl Table {
        pub(super) fn column_index(&self, name: &str) -> Option<usize> {
            self.headers.iter().position(|h| h == name)
        }

        pub(super) fn numeric_column(&self, name: &str) -> Result<Array1<f64>, DataError> {
            let idx = self
                .column_index(name)
                .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
            self.records
                .iter()
                .enumerate()
                .map(|(i, record)| {
                    let row = i + 1;
                    let raw = record.get(idx).unwrap_or_default().trim();
                    if raw.is_empty() {
                        return Err(DataError::MissingValue {
                            column: name.to_string(),
                            row,
                        });
                    }
                    let value: f64 = raw.parse().map_err(|_| DataError::NotNumeric {
                        column: name.to_string(),
                        row,
                        value: raw.to_string(),
                    })?;
                    if !value.is_finite() {
                        return Err(DataError::NonFiniteValue {
                            column: name.to_string(),
                            row,
                        });
                    }
                    Ok(value)
                })
                .collect()
        }
    }
}
