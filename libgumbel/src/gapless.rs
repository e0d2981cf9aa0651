//! Ungapped Gumbel statistics from the score distribution alone.
//!
//! Lambda comes from the unique positive root of `E[exp(lambda * S)] = 1`,
//! the relative entropy H from the tilted mean score, and K from the
//! classical renewal series over repeated convolutions of the score
//! distribution. The alignment-growth statistics `a` and `alpha` follow
//! from the renewal theorem applied to the tilted walk.

use std::time::{Duration, Instant};

use crate::error::{Result, StatsError};
use crate::model::ScoringModel;
use crate::params::ParameterSet;

const LAMBDA_ACCURACY: f64 = 1.0e-5;
const LAMBDA_INITIAL: f64 = 0.5;
const LAMBDA_ITER_MAX: usize = 37;
const LAMBDA_NEWTON_AFTER: usize = 20;
const K_SUM_LIMIT: f64 = 1.0e-4;
const K_ITER_MAX: usize = 100;

/// Error attached to every closed-form gapless estimate.
const GAPLESS_CALCULATION_ERROR: f64 = 1.0e-6;

/// The ungapped parameters, used standalone when gaps are disabled or as
/// the seed of the gapped simulation.
#[derive(Clone, Copy, Debug)]
pub struct GaplessParams {
    pub lambda: f64,
    pub k: f64,
    /// Relative entropy of the tilted pair distribution (mean tilted score
    /// scaled by lambda)
    pub h: f64,
    pub c: f64,
    /// Mean sequence letters consumed per unit of score
    pub a: f64,
    /// Growth rate of the alignment-length variance per unit of score
    pub alpha: f64,
}

/// Estimates the ungapped parameters within the given time ceiling.
///
/// Non-convergence inside the ceiling surfaces as a recoverable
/// "increase the time budget" condition rather than a degraded result.
pub fn estimate(model: &ScoringModel, time_budget: Duration) -> Result<GaplessParams> {
    let deadline = Instant::now() + time_budget;
    let profile = ScoreProfile::from_model(model)?;

    let lambda = profile.solve_lambda()?;
    let h = profile.entropy(lambda);
    if h <= 0.0 {
        return Err(StatsError::transient(format!(
            "relative entropy came out non-positive ({h})"
        )));
    }
    let k = profile.renewal_k(lambda, h, deadline)?;

    // renewal theorem for the tilted walk: score grows by H/lambda per
    // aligned pair, so length per unit score is lambda/H and the length
    // variance grows with the tilted score variance
    let mean_step = h / lambda;
    let var_step = profile.tilted_second_moment(lambda) - mean_step * mean_step;
    let a = 1.0 / mean_step;
    let alpha = var_step / (mean_step * mean_step * mean_step);

    Ok(GaplessParams {
        lambda,
        k,
        h,
        c: k / h,
        a,
        alpha,
    })
}

/// The standalone gapless mode: a full [`ParameterSet`] with the gap fields
/// zeroed and two-point bootstrap arrays carrying the calculation error.
pub fn standalone_parameter_set(
    model: &ScoringModel,
    time_budget: Duration,
) -> Result<ParameterSet> {
    let started = Instant::now();
    let gapless = estimate(model, time_budget)?;
    let err = GAPLESS_CALCULATION_ERROR;

    let mut set = ParameterSet {
        lambda: gapless.lambda,
        lambda_error: err,
        k: gapless.k,
        k_error: err,
        c: gapless.c,
        c_error: err,
        sigma: gapless.alpha,
        sigma_error: err,
        alpha_i: gapless.alpha,
        alpha_i_error: err,
        alpha_j: gapless.alpha,
        alpha_j_error: err,
        a_i: gapless.a,
        a_i_error: err,
        a_j: gapless.a,
        a_j_error: err,
        gapless_a: gapless.a,
        gapless_a_error: err,
        gapless_alpha: gapless.alpha,
        gapless_alpha_error: err,
        g: 0,
        g1: 0,
        g2: 0,
        ..Default::default()
    };

    set.lambda_sbs = vec![set.lambda, set.lambda + err];
    set.k_sbs = vec![set.k, set.k + err];
    set.c_sbs = vec![set.c, set.c + err];
    set.sigma_sbs = vec![set.sigma, set.sigma + err];
    set.alpha_i_sbs = vec![set.alpha_i, set.alpha_i + err];
    set.alpha_j_sbs = vec![set.alpha_j, set.alpha_j + err];
    set.a_i_sbs = vec![set.a_i, set.a_i + err];
    set.a_j_sbs = vec![set.a_j, set.a_j + err];

    set.recompute_averages();
    set.calc_time = started.elapsed().as_secs_f64();
    Ok(set)
}

/// The distribution of the score of one random letter pair, trimmed to its
/// observed support.
struct ScoreProfile {
    /// `probs[i]` is the probability of score `low + i`
    probs: Vec<f64>,
    low: i64,
    high: i64,
    mean: f64,
}

impl ScoreProfile {
    fn from_model(model: &ScoringModel) -> Result<Self> {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for row in &model.matrix {
            for &s in row {
                min = min.min(s);
                max = max.max(s);
            }
        }

        let range = (max - min) as usize;
        let mut probs = vec![0.0; range + 1];
        for (i, row) in model.matrix.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                probs[(s - min) as usize] += model.freqs1[i] * model.freqs2[j];
            }
        }

        // trim to the observed support
        let first = probs.iter().position(|&p| p > 0.0).unwrap_or(0);
        let last = probs.iter().rposition(|&p| p > 0.0).unwrap_or(range);
        let low = min + first as i64;
        let high = min + last as i64;
        let probs: Vec<f64> = probs[first..=last].to_vec();

        if low >= 0 || high <= 0 {
            return Err(StatsError::invalid(format!(
                "score support [{low}, {high}] must straddle zero"
            )));
        }

        let total: f64 = probs.iter().sum();
        let mean = probs
            .iter()
            .enumerate()
            .map(|(i, &p)| (low + i as i64) as f64 * p / total)
            .sum();

        Ok(Self {
            probs: probs.iter().map(|p| p / total).collect(),
            low,
            high,
            mean,
        })
    }

    fn prob(&self, score: i64) -> f64 {
        if score < self.low || score > self.high {
            0.0
        } else {
            self.probs[(score - self.low) as usize]
        }
    }

    /// Greatest common divisor of the support, for lattice reduction.
    fn span_gcd(&self) -> i64 {
        let mut d = -self.low;
        for (i, &p) in self.probs.iter().enumerate().skip(1) {
            if d <= 1 {
                break;
            }
            if p != 0.0 {
                d = gcd(d, i as i64);
            }
        }
        d.max(1)
    }

    /// Solves `E[exp(lambda * S)] = 1` for the positive root by a guarded
    /// Newton iteration on `x = exp(-d * lambda)`, falling back to bisection
    /// whenever a Newton step leaves the bracket or stalls.
    fn solve_lambda(&self) -> Result<f64> {
        if self.mean >= 0.0 {
            return Err(StatsError::invalid(
                "expected score must be negative for lambda to exist",
            ));
        }

        let d = self.span_gcd();
        let low = self.low;
        let high = self.high;

        let x0 = (-LAMBDA_INITIAL).exp();
        let mut x = if x0 > 0.0 && x0 < 1.0 { x0 } else { 0.5 };
        let mut a = 0.0;
        let mut b = 1.0;
        let mut f = 4.0;
        let mut newton = false;

        for iter in 0..LAMBDA_ITER_MAX {
            let f_old = f;
            let was_newton = newton;
            newton = false;

            // Horner evaluation of the characteristic polynomial and its
            // derivative over the d-reduced lattice
            let mut g = 0.0;
            f = self.prob(low);
            let mut s = low + d;
            while s < 0 {
                g = x * g + f;
                f = f * x + self.prob(s);
                s += d;
            }
            g = x * g + f;
            f = f * x + self.prob(0) - 1.0;
            s = d;
            while s <= high {
                g = x * g + f;
                f = f * x + self.prob(s);
                s += d;
            }

            if f > 0.0 {
                a = x;
            } else if f < 0.0 {
                b = x;
            } else {
                break;
            }
            if b - a < 2.0 * a * (1.0 - b) * LAMBDA_ACCURACY {
                x = 0.5 * (a + b);
                break;
            }

            if iter >= LAMBDA_NEWTON_AFTER || (was_newton && f.abs() > 0.9 * f_old.abs()) || g >= 0.0
            {
                x = 0.5 * (a + b);
            } else {
                let step = -f / g;
                let y = x + step;
                if y <= a || y >= b {
                    x = 0.5 * (a + b);
                } else {
                    newton = true;
                    x = y;
                    if step.abs() < LAMBDA_ACCURACY * x * (1.0 - x) {
                        break;
                    }
                }
            }
        }

        let lambda = -x.ln() / d as f64;
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(StatsError::transient(format!(
                "lambda iteration did not converge (x = {x})"
            )));
        }
        Ok(lambda)
    }

    /// Relative entropy `H = lambda * E[S exp(lambda S)]`.
    fn entropy(&self, lambda: f64) -> f64 {
        let etonlam = (-lambda).exp();
        let mut sum = self.low as f64 * self.prob(self.low);
        for s in (self.low + 1)..=self.high {
            sum = s as f64 * self.prob(s) + etonlam * sum;
        }

        let scale = etonlam.powi(self.high as i32);
        if scale > 0.0 {
            lambda * sum / scale
        } else {
            lambda * (lambda * self.high as f64 + sum.ln()).exp()
        }
    }

    /// `E[S^2 exp(lambda S)]`, the tilted second moment.
    fn tilted_second_moment(&self, lambda: f64) -> f64 {
        (self.low..=self.high)
            .map(|s| (s * s) as f64 * self.prob(s) * (lambda * s as f64).exp())
            .sum()
    }

    /// K by the renewal series
    /// `K = exp(-2 sum_j E[min(1, exp(lambda S_j))] / j) / (A (1 - e^-lambda))`
    /// over repeated convolutions of the one-step distribution, on the
    /// d-reduced lattice. The series is cut when a term drops below the sum
    /// limit; running past the iteration cap or the deadline is surfaced as
    /// a recoverable budget condition.
    fn renewal_k(&self, lambda: f64, h: f64, deadline: Instant) -> Result<f64> {
        let d = self.span_gcd();
        let low = self.low / d;
        let high = self.high / d;
        let lambda_d = lambda * d as f64;
        let range = (high - low) as usize;

        // one-step distribution at lattice spacing d
        let step_probs: Vec<f64> = (0..=range).map(|i| self.prob((low + i as i64) * d)).collect();

        let mut first_term = h / lambda_d;
        let exp_minus_lambda = (-lambda_d).exp();

        if low == -1 && high == 1 {
            let p_low = self.prob(-d);
            let p_high = self.prob(d);
            let diff = p_low - p_high;
            return Ok(diff * diff / p_low);
        }

        if low == -1 || high == 1 {
            if high != 1 {
                let mean_d = self.mean / d as f64;
                first_term = mean_d * mean_d / first_term;
            }
            return Ok(first_term * (1.0 - exp_minus_lambda));
        }

        let mut outer_sum = 0.0;
        // walk_probs[i] is P(S_j = (j*low + i) * d) for the current j
        let mut walk_probs = vec![1.0];
        let mut term = 1.0;

        let mut j = 0usize;
        while j < K_ITER_MAX && term > K_SUM_LIMIT {
            if Instant::now() >= deadline {
                return Err(StatsError::unavailable(
                    "the K series did not converge in time; please increase the maximum allowed calculation time",
                ));
            }

            walk_probs = convolve(&walk_probs, &step_probs);
            j += 1;
            let j_low = j as i64 * low;

            // E[min(1, exp(lambda S_j))]: tilt the negative part, count the rest
            let neg_len = (-j_low) as usize;
            let mut tilted = walk_probs[0];
            for &p in &walk_probs[1..neg_len] {
                tilted = p + tilted * exp_minus_lambda;
            }
            tilted *= exp_minus_lambda;

            let above: f64 = walk_probs[neg_len..].iter().sum();
            term = tilted + above;
            outer_sum += term / j as f64;
        }

        let k = -(-2.0 * outer_sum).exp() / (first_term * (-lambda_d).exp_m1());
        if !k.is_finite() || k <= 0.0 {
            return Err(StatsError::transient(format!(
                "renewal series produced a non-positive K ({k})"
            )));
        }
        Ok(k)
    }
}

fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &pa) in a.iter().enumerate() {
        if pa == 0.0 {
            continue;
        }
        for (j, &pb) in b.iter().enumerate() {
            out[i + j] += pa * pb;
        }
    }
    out
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    b = b.abs();
    if b > a {
        std::mem::swap(&mut a, &mut b);
    }
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    fn dna_model() -> ScoringModel {
        ScoringModel::dna(2, -3, [0.25; 4]).unwrap()
    }

    #[test]
    fn test_lambda_solves_characteristic_equation() -> anyhow::Result<()> {
        let model = dna_model();
        let params = estimate(&model, Duration::from_secs(5))?;

        let mut expectation = 0.0;
        for i in 0..4 {
            for j in 0..4 {
                expectation +=
                    0.0625 * (params.lambda * model.score(i, j) as f64).exp();
            }
        }
        check!((expectation - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_parameters_are_sane() -> anyhow::Result<()> {
        let params = estimate(&dna_model(), Duration::from_secs(5))?;
        check!(params.lambda > 0.0);
        check!(params.h > 0.0);
        check!(params.k > 0.0 && params.k < 1.0);
        check!(params.c > 0.0);
        check!(params.a > 0.0);
        check!(params.alpha > 0.0);
        // length per unit score is the reciprocal of the tilted mean step
        check!((params.a - params.lambda / params.h).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_standalone_set_is_complete() -> anyhow::Result<()> {
        let set = standalone_parameter_set(&dna_model(), Duration::from_secs(5))?;
        set.validate()?;
        check!(set.g == 0);
        check!(set.a == set.gapless_a);
        check!(set.sigma == set.gapless_alpha);
        check!(set.lambda_sbs.len() == 2);
        Ok(())
    }

    #[test]
    fn test_gcd_reduction() {
        // +2/-2 support has lattice spacing 2
        let model =
            ScoringModel::new(
                vec![
                    vec![2, -2, -2, -2],
                    vec![-2, 2, -2, -2],
                    vec![-2, -2, 2, -2],
                    vec![-2, -2, -2, 2],
                ],
                vec![0.25; 4],
                vec![0.25; 4],
            )
            .unwrap();
        let profile = ScoreProfile::from_model(&model).unwrap();
        check!(profile.span_gcd() == 2);
        let lambda = profile.solve_lambda().unwrap();
        // 0.25 e^(2 lambda) + 0.75 e^(-2 lambda) = 1 solves to lambda = ln(3) / 2
        let expectation = 0.25 * (2.0 * lambda).exp() + 0.75 * (-2.0 * lambda).exp();
        check!((expectation - 1.0).abs() < 1e-4);
        check!((lambda - 3.0f64.ln() / 2.0).abs() < 1e-3);
    }
}
