use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{path}: {reason}")]
pub struct FileFormatError {
    path: String,
    reason: String,
}

impl FileFormatError {
    fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Reads a scoring matrix file: the alphabet size, then the n x n integer
/// scores in row order, all whitespace separated.
pub fn read_score_matrix(path: &Path) -> Result<Vec<Vec<i64>>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read scoring matrix {}", path.display()))?;
    let mut tokens = text.split_whitespace();

    let n: usize = tokens
        .next()
        .ok_or_else(|| FileFormatError::new(path, "missing alphabet size"))?
        .parse()
        .map_err(|_| FileFormatError::new(path, "alphabet size is not an integer"))?;
    if n == 0 {
        return Err(FileFormatError::new(path, "alphabet size must be greater than 0").into());
    }

    let mut matrix = Vec::with_capacity(n);
    for row_idx in 0..n {
        let mut row = Vec::with_capacity(n);
        for col_idx in 0..n {
            let value: i64 = tokens
                .next()
                .ok_or_else(|| {
                    FileFormatError::new(
                        path,
                        format!("matrix ends at row {row_idx}, column {col_idx}"),
                    )
                })?
                .parse()
                .map_err(|_| {
                    FileFormatError::new(
                        path,
                        format!("row {row_idx}, column {col_idx} is not an integer score"),
                    )
                })?;
            row.push(value);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

/// Reads a background-frequency file: the alphabet size, then the n
/// probabilities. Values outside [0, 1] are rejected here; normalization is
/// validated at model construction.
pub fn read_frequencies(path: &Path) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read frequencies {}", path.display()))?;
    let mut tokens = text.split_whitespace();

    let n: usize = tokens
        .next()
        .ok_or_else(|| FileFormatError::new(path, "missing alphabet size"))?
        .parse()
        .map_err(|_| FileFormatError::new(path, "alphabet size is not an integer"))?;
    if n == 0 {
        return Err(FileFormatError::new(path, "alphabet size must be greater than 0").into());
    }

    let mut freqs = Vec::with_capacity(n);
    for idx in 0..n {
        let value: f64 = tokens
            .next()
            .ok_or_else(|| FileFormatError::new(path, format!("missing probability {idx}")))?
            .parse()
            .map_err(|_| FileFormatError::new(path, format!("probability {idx} is not a number")))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(
                FileFormatError::new(path, format!("probability {idx} is outside [0, 1]")).into(),
            );
        }
        freqs.push(value);
    }
    Ok(freqs)
}
