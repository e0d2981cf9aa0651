//! The exponential-tilt kernel that drives the gapped random walk.

use rand::Rng;

use crate::error::{Result, StatsError};
use crate::model::{GapCosts, ScoringModel};
use crate::regression::find_roots;

/// Empirical inflation applied to the ungapped tilt before gapped
/// simulation. The gapped decay rate sits above the ungapped one, and this
/// margin keeps the sampled walks inside the interesting tail.
const GAPPED_TILT_MARGIN: f64 = 1.07;

/// States of the affine-gap walk: aligned pair, gap in sequence 2 (Delete),
/// gap in sequence 1 (Insert).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkState {
    Match,
    Delete,
    Insert,
}

/// The importance-sampling kernel: the tilt that gives the one-step score
/// increment zero mean under the tilted measure, the tilted letter-pair
/// distribution, and the per-state transition tables of the three-state
/// Markov walk.
#[derive(Clone, Debug)]
pub struct ImportanceSamplingKernel {
    /// Root of `sum_ij p_i p'_j exp(lambda * s_ij) = 1`
    pub ungapped_lambda: f64,
    /// Operating tilt: `ungapped_lambda * 1.07`
    pub lambda: f64,
    /// Normalizer of the tilted pair distribution at the operating tilt
    pub normalizer: f64,
    /// ln(normalizer), the per-substitution log likelihood-ratio offset
    pub ln_normalizer: f64,
    /// Mean score of a tilted letter pair (positive drift of the walk)
    pub mean_tilted_step: f64,
    /// Cumulative tilted pair distribution, row-major over letter pairs
    pair_cdf: Vec<f64>,
    /// Substitution score of each letter pair, aligned with `pair_cdf`
    pair_scores: Vec<i64>,
    alphabet_size: usize,

    pub mu: f64,
    pub nu: f64,
    pub eta: f64,
    pub mu_si: f64,
    pub mu_is: f64,
    pub mu_ds: f64,
    pub mu_sd: f64,
    pub mu_id: f64,

    /// Cumulative branch tables, one per current state
    for_match: [(f64, WalkState); 3],
    for_delete: [(f64, WalkState); 3],
    for_insert: [(f64, WalkState); 2],

    pub insertions_after_deletions: bool,
}

impl ImportanceSamplingKernel {
    pub fn new(
        model: &ScoringModel,
        gap_costs: &GapCosts,
        insertions_after_deletions: bool,
    ) -> Result<Self> {
        if gap_costs.extend_pooled() < 1 || gap_costs.open_pooled() < 1 {
            return Err(StatsError::invalid(
                "gap opening and extension penalties must be positive",
            ));
        }

        let ungapped_lambda = solve_tilt(model)?;
        let lambda = ungapped_lambda * GAPPED_TILT_MARGIN;

        let n = model.alphabet_size;
        let mut pair_cdf = Vec::with_capacity(n * n);
        let mut pair_scores = Vec::with_capacity(n * n);
        let mut normalizer = 0.0;
        for i in 0..n {
            for j in 0..n {
                let mass = model.freqs1[i] * model.freqs2[j] * (lambda * model.score(i, j) as f64).exp();
                normalizer += mass;
                pair_cdf.push(normalizer);
                pair_scores.push(model.score(i, j));
            }
        }
        for mass in pair_cdf.iter_mut() {
            *mass /= normalizer;
        }

        let mut mean_tilted_step = 0.0;
        let mut prev = 0.0;
        for (idx, &cum) in pair_cdf.iter().enumerate() {
            let (i, j) = (idx / n, idx % n);
            mean_tilted_step += (cum - prev) * model.score(i, j) as f64;
            prev = cum;
        }

        let mu = (-lambda.abs() * gap_costs.open_pooled() as f64).exp();
        let nu = (-lambda.abs() * gap_costs.extend_pooled() as f64).exp();

        let t = 1.0 + mu - nu;
        let eta = (1.0 - nu) * (1.0 - nu) / (t * t);
        let mu_si = 1.0 - nu;
        let mu_is = mu * (1.0 - nu) / (t * t);
        let mu_ds = mu / t;
        let mu_sd = (1.0 - nu) * (1.0 - nu) / t;
        let mu_id = mu * (1.0 - nu) / t;

        let for_match = [
            (eta, WalkState::Match),
            (eta + mu_ds, WalkState::Delete),
            (eta + mu_ds + mu_is, WalkState::Insert),
        ];
        // without insertions after deletions, the I branch mass of the
        // delete state is folded back into the aligned branch
        let for_delete = if insertions_after_deletions {
            [
                (nu, WalkState::Delete),
                (nu + mu_sd, WalkState::Match),
                (nu + mu_sd + mu_id, WalkState::Insert),
            ]
        } else {
            [
                (nu, WalkState::Delete),
                (nu + mu_sd + mu_id, WalkState::Match),
                (nu + mu_sd + mu_id, WalkState::Match),
            ]
        };
        let for_insert = [(nu, WalkState::Insert), (nu + mu_si, WalkState::Match)];

        Ok(Self {
            ungapped_lambda,
            lambda,
            normalizer,
            ln_normalizer: normalizer.ln(),
            mean_tilted_step,
            pair_cdf,
            pair_scores,
            alphabet_size: n,
            mu,
            nu,
            eta,
            mu_si,
            mu_is,
            mu_ds,
            mu_sd,
            mu_id,
            for_match,
            for_delete,
            for_insert,
            insertions_after_deletions,
        })
    }

    /// Draws a letter pair from the tilted joint distribution.
    pub fn sample_pair<R: Rng>(&self, rng: &mut R) -> (usize, usize) {
        let idx = sample_cdf(&self.pair_cdf, rng.gen::<f64>());
        (idx / self.alphabet_size, idx % self.alphabet_size)
    }

    /// Draws the substitution score of a tilted letter pair.
    pub fn sample_pair_score<R: Rng>(&self, rng: &mut R) -> i64 {
        self.pair_scores[sample_cdf(&self.pair_cdf, rng.gen::<f64>())]
    }

    /// Draws the successor state of the walk.
    pub fn sample_transition<R: Rng>(&self, from: WalkState, rng: &mut R) -> WalkState {
        let u = rng.gen::<f64>();
        let table: &[(f64, WalkState)] = match from {
            WalkState::Match => &self.for_match,
            WalkState::Delete => &self.for_delete,
            WalkState::Insert => &self.for_insert,
        };
        for &(cum, state) in table {
            if u < cum {
                return state;
            }
        }
        // u landed in the last branch's rounding slack
        table[table.len() - 1].1
    }
}

/// Binary search for the first cdf entry at or above `value`.
fn sample_cdf(cdf: &[f64], value: f64) -> usize {
    let mut lo = 0usize;
    let mut hi = cdf.len();
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if cdf[mid - 1] >= value {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi - 1
}

/// Solves `sum_ij p_i p'_j exp(x * s_ij) = 1` for its positive root.
///
/// The trial lower bracket starts at a small epsilon and is halved until the
/// equation goes non-positive; collapsing below the numerical floor means
/// the scoring scheme sits outside the logarithmic regime. The upper bracket
/// comes from the maximal matrix entry and its probability mass. The largest
/// root of the partition search wins.
fn solve_tilt(model: &ScoringModel) -> Result<f64> {
    let threshold = f64::MIN_POSITIVE * 10.0;
    let equation = |x: f64| -> f64 {
        let mut res = 0.0;
        for (i, row) in model.matrix.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                let p = model.freqs1[i] * model.freqs2[j];
                if p <= threshold {
                    continue;
                }
                res += p * (x * s as f64).exp();
            }
        }
        res - 1.0
    };

    let mut a = 1e-5;
    while equation(a) > 0.0 {
        a /= 2.0;
        if a < threshold * 100.0 {
            return Err(StatsError::invalid(
                "the input parameters correspond to the non-logarithmic regime",
            ));
        }
    }

    let eps = a / 10.0;
    let (max_score, max_i, max_j) = model.max_score();
    let max_pair_mass = model.freqs1[max_i] * model.freqs2[max_j];
    let b = ((1.0 + 10.0 * eps).ln() - max_pair_mass.ln()) / max_score as f64;

    let roots = find_roots(equation, a, b, 2, eps)?;
    match roots.last() {
        Some(&root) if root > 0.0 => Ok(root),
        _ => Err(StatsError::invalid(
            "unable to find the ungapped lambda for this scoring scheme",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn dna_kernel() -> ImportanceSamplingKernel {
        let model = ScoringModel::dna(2, -3, [0.25; 4]).unwrap();
        let costs = GapCosts::new(5, 2);
        ImportanceSamplingKernel::new(&model, &costs, false).unwrap()
    }

    #[test]
    fn test_tilt_solves_equation() {
        let model = ScoringModel::dna(2, -3, [0.25; 4]).unwrap();
        let kernel = dna_kernel();
        let lambda0 = kernel.ungapped_lambda;

        let mut sum = 0.0;
        for i in 0..4 {
            for j in 0..4 {
                sum += 0.25 * 0.25 * (lambda0 * model.score(i, j) as f64).exp();
            }
        }
        check!((sum - 1.0).abs() < 1e-4);
        check!((kernel.lambda - lambda0 * 1.07).abs() < 1e-12);
    }

    #[test]
    fn test_transition_rows_sum_to_one() {
        let k = dna_kernel();
        check!((k.eta + k.mu_ds + k.mu_is - 1.0).abs() < 1e-12);
        check!((k.nu + k.mu_sd + k.mu_id - 1.0).abs() < 1e-12);
        check!((k.nu + k.mu_si - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tilted_drift_is_positive() {
        // under the tilt, the aligned-pair increment has non-negative mean
        let k = dna_kernel();
        check!(k.mean_tilted_step > 0.0);
        check!(k.normalizer > 1.0);
    }

    #[test]
    fn test_pair_sampling_matches_distribution() {
        let k = dna_kernel();
        let mut rng = Pcg64::seed_from_u64(7);
        let mut match_count = 0usize;
        let draws = 20_000;
        for _ in 0..draws {
            let (a, b) = k.sample_pair(&mut rng);
            if a == b {
                match_count += 1;
            }
        }
        // tilted match probability: 4 * 0.0625 * e^(2 lambda) / z
        let expected =
            4.0 * 0.0625 * (2.0 * k.lambda).exp() / k.normalizer;
        let observed = match_count as f64 / draws as f64;
        check!((observed - expected).abs() < 0.02);
    }

    #[test]
    fn test_no_insert_after_delete() {
        let k = dna_kernel();
        let mut rng = Pcg64::seed_from_u64(11);
        for _ in 0..5_000 {
            let next = k.sample_transition(WalkState::Delete, &mut rng);
            check!(next != WalkState::Insert);
        }
    }
}
