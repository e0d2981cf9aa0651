use crate::error::{Result, StatsError};

/// Tolerance for the "background frequencies sum to 1" check.
const FREQ_SUM_TOLERANCE: f64 = 1e-12;

/// A substitution scoring scheme over a fixed alphabet together with the
/// background letter frequencies of the two sequences being compared.
///
/// The model is immutable once constructed; one instance drives exactly one
/// estimation run. Construction validates everything the estimators assume:
/// square matrix, normalized frequency vectors, at least one positive score,
/// and a strictly negative expected score under the background distributions
/// (the logarithmic-regime requirement).
#[derive(Clone, Debug)]
pub struct ScoringModel {
    /// Alphabet size
    pub alphabet_size: usize,
    /// Substitution scores, `matrix[i][j]` for a letter pair (i, j)
    pub matrix: Vec<Vec<i64>>,
    /// Background letter frequencies of sequence 1
    pub freqs1: Vec<f64>,
    /// Background letter frequencies of sequence 2
    pub freqs2: Vec<f64>,
    /// Cumulative distribution over `freqs1`, for categorical sampling
    pub freqs1_cdf: Vec<f64>,
    /// Cumulative distribution over `freqs2`, for categorical sampling
    pub freqs2_cdf: Vec<f64>,
    /// True when the matrix is symmetric and the two frequency vectors match
    pub symmetric: bool,
}

impl ScoringModel {
    pub fn new(matrix: Vec<Vec<i64>>, freqs1: Vec<f64>, freqs2: Vec<f64>) -> Result<Self> {
        let n = matrix.len();
        if n == 0 {
            return Err(StatsError::invalid("scoring matrix is empty"));
        }
        if matrix.iter().any(|row| row.len() != n) {
            return Err(StatsError::invalid("scoring matrix is not square"));
        }
        if freqs1.len() != n || freqs2.len() != n {
            return Err(StatsError::invalid(format!(
                "frequency vector length does not match alphabet size {n}"
            )));
        }

        for freqs in [&freqs1, &freqs2] {
            if freqs.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
                return Err(StatsError::invalid(
                    "background frequencies must lie in [0, 1]",
                ));
            }
            let sum: f64 = freqs.iter().sum();
            if (sum - 1.0).abs() > FREQ_SUM_TOLERANCE {
                return Err(StatsError::invalid(format!(
                    "background frequencies sum to {sum}, expected 1"
                )));
            }
        }

        if !matrix.iter().flatten().any(|&s| s > 0) {
            return Err(StatsError::invalid(
                "at least one element of the scoring matrix must be positive",
            ));
        }

        let symmetric = freqs1 == freqs2
            && (0..n).all(|i| (0..i).all(|j| matrix[i][j] == matrix[j][i]));

        let model = Self {
            alphabet_size: n,
            freqs1_cdf: cumulative(&freqs1),
            freqs2_cdf: cumulative(&freqs2),
            matrix,
            freqs1,
            freqs2,
            symmetric,
        };

        if model.expected_score() >= 0.0 {
            return Err(StatsError::invalid(
                "expected score under the background frequencies must be negative",
            ));
        }

        Ok(model)
    }

    /// DNA match/mismatch model with the given background frequencies.
    pub fn dna(match_score: i64, mismatch_score: i64, freqs: [f64; 4]) -> Result<Self> {
        let matrix = (0..4)
            .map(|i| {
                (0..4)
                    .map(|j| if i == j { match_score } else { mismatch_score })
                    .collect()
            })
            .collect();
        Self::new(matrix, freqs.to_vec(), freqs.to_vec())
    }

    /// Mean score of a random letter pair under the background distributions.
    pub fn expected_score(&self) -> f64 {
        let mut sum = 0.0;
        for (i, row) in self.matrix.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                sum += self.freqs1[i] * self.freqs2[j] * s as f64;
            }
        }
        sum
    }

    /// The maximal matrix entry together with the letter pair that attains it.
    pub fn max_score(&self) -> (i64, usize, usize) {
        let mut best = (self.matrix[0][0], 0, 0);
        for (i, row) in self.matrix.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                if s > best.0 {
                    best = (s, i, j);
                }
            }
        }
        best
    }

    pub fn score(&self, a: usize, b: usize) -> i64 {
        self.matrix[a][b]
    }
}

/// Affine gap penalties, kept per sequence side. A gap of length `g` costs
/// `opening + extension * g`, so the first gapped position costs
/// `open_total = opening + extension`.
#[derive(Clone, Copy, Debug)]
pub struct GapCosts {
    /// Opening + extension for a gap in sequence 1
    pub open1: i64,
    /// Opening + extension for a gap in sequence 2
    pub open2: i64,
    /// Extension penalty for a gap in sequence 1
    pub extend1: i64,
    /// Extension penalty for a gap in sequence 2
    pub extend2: i64,
}

impl GapCosts {
    pub fn new(opening: i64, extension: i64) -> Self {
        Self::per_side(opening, extension, opening, extension)
    }

    pub fn per_side(opening1: i64, extension1: i64, opening2: i64, extension2: i64) -> Self {
        Self {
            open1: opening1 + extension1,
            open2: opening2 + extension2,
            extend1: extension1,
            extend2: extension2,
        }
    }

    /// Pooled open-total used to drive the shared importance-sampling kernel.
    pub fn open_pooled(&self) -> i64 {
        self.open1.min(self.open2)
    }

    /// Pooled extension penalty used by the kernel.
    pub fn extend_pooled(&self) -> i64 {
        self.extend1.min(self.extend2)
    }
}

fn cumulative(probs: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    probs
        .iter()
        .map(|p| {
            acc += p;
            acc
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    #[test]
    fn test_dna_model() -> anyhow::Result<()> {
        let model = ScoringModel::dna(2, -3, [0.25; 4])?;
        check!(model.alphabet_size == 4);
        check!(model.symmetric);
        check!((model.expected_score() - (0.25 * 2.0 - 0.75 * 3.0)).abs() < 1e-12);
        check!(model.max_score().0 == 2);
        check!((model.freqs1_cdf[3] - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_rejects_non_negative_drift() {
        let result = ScoringModel::dna(2, 0, [0.25; 4]);
        check!(matches!(result, Err(StatsError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_all_negative_matrix() {
        let matrix = vec![vec![-1; 4]; 4];
        let result = ScoringModel::new(matrix, vec![0.25; 4], vec![0.25; 4]);
        check!(matches!(result, Err(StatsError::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_bad_frequencies() {
        let matrix = vec![vec![2, -3], vec![-3, 2]];
        let result = ScoringModel::new(matrix, vec![0.6, 0.5], vec![0.5, 0.5]);
        check!(matches!(result, Err(StatsError::InvalidInput(_))));
    }

    #[test]
    fn test_gap_costs_pooling() {
        let costs = GapCosts::per_side(5, 2, 4, 1);
        check!(costs.open1 == 7);
        check!(costs.open2 == 5);
        check!(costs.open_pooled() == 5);
        check!(costs.extend_pooled() == 1);
    }
}
