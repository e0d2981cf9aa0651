//! Root finding and least-squares fitting shared by the estimators.

use crate::error::{Result, StatsError};

/// Finds every root of `f` inside `[a, b]` by scanning a uniform partition
/// for sign changes and bisecting each bracketing subinterval down to `eps`.
///
/// Returns the roots in ascending order; an empty vector means no sign
/// change was observed anywhere in the partition.
pub fn find_roots<F: Fn(f64) -> f64>(
    f: F,
    a: f64,
    b: f64,
    partitions: usize,
    eps: f64,
) -> Result<Vec<f64>> {
    if !(a < b) || partitions == 0 || !(eps > 0.0) {
        return Err(StatsError::invalid(format!(
            "bad root search interval [{a}, {b}] with {partitions} partitions"
        )));
    }

    let step = (b - a) / partitions as f64;
    let mut roots = Vec::new();

    let mut left = a;
    let mut f_left = f(left);
    for k in 1..=partitions {
        let right = if k == partitions { b } else { a + k as f64 * step };
        let f_right = f(right);

        if f_left == 0.0 {
            roots.push(left);
        } else if f_left * f_right < 0.0 {
            roots.push(bisect(&f, left, right, f_left, eps));
        }

        left = right;
        f_left = f_right;
    }
    if f_left == 0.0 {
        roots.push(left);
    }

    roots.dedup_by(|x, y| (*x - *y).abs() <= eps);
    Ok(roots)
}

fn bisect<F: Fn(f64) -> f64>(f: &F, mut lo: f64, mut hi: f64, f_lo: f64, eps: f64) -> f64 {
    let mut sign_lo = f_lo.signum();
    while hi - lo > eps {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if f_mid == 0.0 {
            return mid;
        }
        if f_mid.signum() == sign_lo {
            lo = mid;
            sign_lo = f_mid.signum();
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Ordinary least-squares fit of `y = slope * x + intercept`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Result<(f64, f64)> {
    weighted_linear_fit(xs, ys, None)
}

/// Weighted least-squares fit of `y = slope * x + intercept`. Weights of
/// `None` fall back to the ordinary fit.
pub fn weighted_linear_fit(xs: &[f64], ys: &[f64], ws: Option<&[f64]>) -> Result<(f64, f64)> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return Err(StatsError::invalid(format!(
            "regression needs at least two matched points, got {} and {}",
            xs.len(),
            ys.len()
        )));
    }

    let mut sw = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, (&x, &y)) in xs.iter().zip(ys).enumerate() {
        let w = ws.map_or(1.0, |ws| ws[i]);
        sw += w;
        sx += w * x;
        sy += w * y;
        sxx += w * x * x;
        sxy += w * x * y;
    }

    let det = sw * sxx - sx * sx;
    if det.abs() < f64::MIN_POSITIVE * 16.0 {
        return Err(StatsError::transient(
            "degenerate regression: all abscissae coincide",
        ));
    }

    let slope = (sw * sxy - sx * sy) / det;
    let intercept = (sy - slope * sx) / sw;
    Ok((slope, intercept))
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    #[test]
    fn test_find_roots_quadratic() -> anyhow::Result<()> {
        // (x - 1)(x - 3) has roots at 1 and 3
        let roots = find_roots(|x| (x - 1.0) * (x - 3.0), 0.0, 4.0, 16, 1e-10)?;
        check!(roots.len() == 2);
        check!((roots[0] - 1.0).abs() < 1e-8);
        check!((roots[1] - 3.0).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_find_roots_none() -> anyhow::Result<()> {
        let roots = find_roots(|x| x * x + 1.0, -2.0, 2.0, 8, 1e-10)?;
        check!(roots.is_empty());
        Ok(())
    }

    #[test]
    fn test_linear_fit_exact() -> anyhow::Result<()> {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys: Vec<f64> = xs.iter().map(|x| -0.5 * x + 2.0).collect();
        let (slope, intercept) = linear_fit(&xs, &ys)?;
        check!((slope + 0.5).abs() < 1e-12);
        check!((intercept - 2.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_degenerate_fit_is_transient() {
        let result = linear_fit(&[2.0, 2.0], &[1.0, 3.0]);
        check!(matches!(result, Err(StatsError::TransientFailure(_))));
    }
}
