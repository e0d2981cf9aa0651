#[cfg(test)]
#[ctor::ctor]
fn init_backtrace() {
    color_backtrace::install();
}

/// Formats a float with 20 significant digits, enough to survive a
/// write/parse round trip without changing the underlying bits.
pub fn format_sig20(x: f64) -> String {
    format!("{x:.19e}")
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Relative error of an estimate given the spread of its bootstrap array.
pub fn relative_error(estimate: f64, spread: f64) -> f64 {
    if estimate == 0.0 {
        f64::INFINITY
    } else {
        (spread / estimate).abs()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_sig20_round_trip() {
        for &x in &[0.0, 1.0, -1.5, 0.3176512345, 1.0e-300, std::f64::consts::PI] {
            let s = format_sig20(x);
            let back: f64 = s.parse().unwrap();
            assert_eq!(x.to_bits(), back.to_bits());
        }
    }

    #[test]
    fn test_sample_std() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&v) - 2.5).abs() < 1e-12);
        let sd = sample_std(&v);
        assert!((sd - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }
}
