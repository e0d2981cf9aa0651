//! The aggregated estimation result and its persisted text record.

use std::io::{BufRead, Write};

use crate::error::{Result, StatsError};
use crate::util::format_sig20;

/// Everything one estimation run produces: the Gumbel parameters with their
/// error estimates, the bootstrap resample arrays behind those errors, the
/// gap-cost summaries, and the calculation time.
///
/// The averaged fields `a`, `alpha` (and their errors) are always the mean
/// of the I/J pair. They are recomputed from the pair wherever the set is
/// consumed, so a stale stored average can never propagate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterSet {
    pub lambda: f64,
    pub lambda_error: f64,
    pub k: f64,
    pub k_error: f64,
    pub c: f64,
    pub c_error: f64,

    pub a: f64,
    pub a_error: f64,
    pub a_j: f64,
    pub a_j_error: f64,
    pub a_i: f64,
    pub a_i_error: f64,

    pub sigma: f64,
    pub sigma_error: f64,

    pub alpha: f64,
    pub alpha_error: f64,
    pub alpha_j: f64,
    pub alpha_j_error: f64,
    pub alpha_i: f64,
    pub alpha_i_error: f64,

    pub gapless_a: f64,
    pub gapless_a_error: f64,
    pub gapless_alpha: f64,
    pub gapless_alpha_error: f64,

    /// Pooled gap open-total, `min(g1, g2)`
    pub g: i64,
    /// Open-total for a gap in sequence 1
    pub g1: i64,
    /// Open-total for a gap in sequence 2
    pub g2: i64,

    /// Wall-clock seconds spent producing this set
    pub calc_time: f64,

    pub lambda_sbs: Vec<f64>,
    pub k_sbs: Vec<f64>,
    pub c_sbs: Vec<f64>,
    pub a_j_sbs: Vec<f64>,
    pub a_i_sbs: Vec<f64>,
    pub sigma_sbs: Vec<f64>,
    pub alpha_j_sbs: Vec<f64>,
    pub alpha_i_sbs: Vec<f64>,
}

const RECORD_HEADER: &str = "Lambda\tLambda error\tK\tK error\tC\tC error\ta\ta error\ta_1\ta_1 error\ta_2\ta_2 error\tsigma\tsigma error\talpha\talpha error\talpha_1\talpha_1 error\talpha_2\talpha_2 error\tGapless a\tGapless a error\tGapless alpha\tGapless alpha error\tG\tCalculation time\tArrays for error calculation";

impl ParameterSet {
    /// Derives `a`, `alpha` and their errors from the I/J pair. Both the
    /// estimation path and the P-value path call this before use.
    pub fn recompute_averages(&mut self) {
        self.a = (self.a_i + self.a_j) * 0.5;
        self.a_error = (self.a_i_error + self.a_j_error) * 0.5;
        self.alpha = (self.alpha_i + self.alpha_j) * 0.5;
        self.alpha_error = (self.alpha_i_error + self.alpha_j_error) * 0.5;
    }

    fn bootstrap_arrays(&self) -> [&Vec<f64>; 8] {
        [
            &self.lambda_sbs,
            &self.k_sbs,
            &self.c_sbs,
            &self.a_j_sbs,
            &self.a_i_sbs,
            &self.sigma_sbs,
            &self.alpha_j_sbs,
            &self.alpha_i_sbs,
        ]
    }

    fn bootstrap_arrays_mut(&mut self) -> [&mut Vec<f64>; 8] {
        [
            &mut self.lambda_sbs,
            &mut self.k_sbs,
            &mut self.c_sbs,
            &mut self.a_j_sbs,
            &mut self.a_i_sbs,
            &mut self.sigma_sbs,
            &mut self.alpha_j_sbs,
            &mut self.alpha_i_sbs,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let arrays = self.bootstrap_arrays();
        let len = arrays[0].len();
        if len == 0 {
            return Err(StatsError::invalid("empty bootstrap array"));
        }
        if arrays.iter().any(|a| a.len() != len) {
            return Err(StatsError::invalid(
                "bootstrap arrays have mismatched lengths",
            ));
        }
        Ok(())
    }

    /// Writes the fixed-order tab-separated record: a header line, then one
    /// line carrying every scalar (20 significant digits) followed by the
    /// eight length-prefixed bootstrap groups.
    pub fn write_record<W: Write>(&self, out: &mut W) -> Result<()> {
        self.validate()?;

        writeln!(out, "{RECORD_HEADER}")?;

        let scalars = [
            self.lambda,
            self.lambda_error,
            self.k,
            self.k_error,
            self.c,
            self.c_error,
            (self.a_i + self.a_j) * 0.5,
            (self.a_i_error + self.a_j_error) * 0.5,
            self.a_j,
            self.a_j_error,
            self.a_i,
            self.a_i_error,
            self.sigma,
            self.sigma_error,
            (self.alpha_i + self.alpha_j) * 0.5,
            (self.alpha_i_error + self.alpha_j_error) * 0.5,
            self.alpha_j,
            self.alpha_j_error,
            self.alpha_i,
            self.alpha_i_error,
            self.gapless_a,
            self.gapless_a_error,
            self.gapless_alpha,
            self.gapless_alpha_error,
        ];
        for v in scalars {
            write!(out, "{}\t", format_sig20(v))?;
        }
        write!(out, "{}\t{}", self.g, format_sig20(self.calc_time))?;

        for array in self.bootstrap_arrays() {
            write!(out, "\t{}", array.len())?;
            for v in array.iter() {
                write!(out, "\t{}", format_sig20(*v))?;
            }
        }
        writeln!(out)?;
        Ok(())
    }

    /// Reads a record written by [`write_record`](Self::write_record). The
    /// averaged fields are recomputed from the I/J pair rather than trusted
    /// from the file; a bootstrap-group length of zero or less is a corrupt
    /// file.
    pub fn read_record<R: BufRead>(input: &mut R) -> Result<Self> {
        let mut header = String::new();
        input.read_line(&mut header)?;
        if header.trim().is_empty() {
            return Err(StatsError::invalid("parameter record is empty"));
        }

        let mut body = String::new();
        input.read_to_string(&mut body)?;
        let mut tokens = body.split_whitespace();

        let mut next_f64 = |name: &str| -> Result<f64> {
            tokens
                .next()
                .ok_or_else(|| StatsError::invalid(format!("parameter record ends before {name}")))?
                .parse::<f64>()
                .map_err(|_| StatsError::invalid(format!("parameter record field {name} is not a number")))
        };

        let mut set = ParameterSet::default();
        set.lambda = next_f64("lambda")?;
        set.lambda_error = next_f64("lambda error")?;
        set.k = next_f64("K")?;
        set.k_error = next_f64("K error")?;
        set.c = next_f64("C")?;
        set.c_error = next_f64("C error")?;
        set.a = next_f64("a")?;
        set.a_error = next_f64("a error")?;
        set.a_j = next_f64("a_1")?;
        set.a_j_error = next_f64("a_1 error")?;
        set.a_i = next_f64("a_2")?;
        set.a_i_error = next_f64("a_2 error")?;
        set.sigma = next_f64("sigma")?;
        set.sigma_error = next_f64("sigma error")?;
        set.alpha = next_f64("alpha")?;
        set.alpha_error = next_f64("alpha error")?;
        set.alpha_j = next_f64("alpha_1")?;
        set.alpha_j_error = next_f64("alpha_1 error")?;
        set.alpha_i = next_f64("alpha_2")?;
        set.alpha_i_error = next_f64("alpha_2 error")?;
        set.gapless_a = next_f64("gapless a")?;
        set.gapless_a_error = next_f64("gapless a error")?;
        set.gapless_alpha = next_f64("gapless alpha")?;
        set.gapless_alpha_error = next_f64("gapless alpha error")?;
        let g = next_f64("G")?;
        set.calc_time = next_f64("calculation time")?;

        set.g = g as i64;
        set.g1 = set.g;
        set.g2 = set.g;

        for array in set.bootstrap_arrays_mut() {
            let len = tokens
                .next()
                .ok_or_else(|| StatsError::invalid("parameter record ends before a bootstrap group"))?
                .parse::<i64>()
                .map_err(|_| StatsError::invalid("bootstrap group length is not an integer"))?;
            if len <= 0 {
                return Err(StatsError::invalid(format!(
                    "corrupt parameter record: bootstrap group length {len}"
                )));
            }
            array.try_reserve(len as usize)?;
            for _ in 0..len {
                let v = tokens
                    .next()
                    .ok_or_else(|| {
                        StatsError::invalid("parameter record ends inside a bootstrap group")
                    })?
                    .parse::<f64>()
                    .map_err(|_| StatsError::invalid("bootstrap value is not a number"))?;
                array.push(v);
            }
        }

        if tokens.next().is_some() {
            return Err(StatsError::invalid(
                "parameter record has trailing fields",
            ));
        }

        set.recompute_averages();
        Ok(set)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    fn sample_set() -> ParameterSet {
        let mut set = ParameterSet {
            lambda: 0.578,
            lambda_error: 0.004,
            k: 0.023,
            k_error: 0.001,
            c: 0.82,
            c_error: 0.05,
            a_j: 0.71,
            a_j_error: 0.02,
            a_i: 0.73,
            a_i_error: 0.03,
            sigma: 0.41,
            sigma_error: 0.02,
            alpha_j: 0.39,
            alpha_j_error: 0.015,
            alpha_i: 0.44,
            alpha_i_error: 0.018,
            gapless_a: 0.695,
            gapless_a_error: 1e-6,
            gapless_alpha: 0.83,
            gapless_alpha_error: 1e-6,
            g: 7,
            g1: 7,
            g2: 7,
            calc_time: 1.25,
            lambda_sbs: vec![0.57, 0.58, 0.59],
            k_sbs: vec![0.022, 0.023, 0.024],
            c_sbs: vec![0.8, 0.82, 0.84],
            a_j_sbs: vec![0.70, 0.71, 0.72],
            a_i_sbs: vec![0.72, 0.73, 0.74],
            sigma_sbs: vec![0.40, 0.41, 0.42],
            alpha_j_sbs: vec![0.38, 0.39, 0.40],
            alpha_i_sbs: vec![0.43, 0.44, 0.45],
            ..Default::default()
        };
        set.recompute_averages();
        set
    }

    #[test]
    fn test_record_round_trip() -> anyhow::Result<()> {
        let set = sample_set();
        let mut buffer = Vec::new();
        set.write_record(&mut buffer)?;

        let back = ParameterSet::read_record(&mut buffer.as_slice())?;
        check!(back == set);
        Ok(())
    }

    #[test]
    fn test_read_recomputes_averages() -> anyhow::Result<()> {
        let mut set = sample_set();
        // poison the stored averages; write_record derives them from the
        // I/J pair, so the read side must come back consistent
        set.a = 123.0;
        set.alpha = -55.0;
        let mut buffer = Vec::new();
        set.write_record(&mut buffer)?;

        let back = ParameterSet::read_record(&mut buffer.as_slice())?;
        check!(back.a == (set.a_i + set.a_j) * 0.5);
        check!(back.alpha == (set.alpha_i + set.alpha_j) * 0.5);
        Ok(())
    }

    #[test]
    fn test_zero_length_bootstrap_group_is_corrupt() -> anyhow::Result<()> {
        let set = sample_set();
        let mut buffer = Vec::new();
        set.write_record(&mut buffer)?;

        let text = String::from_utf8(buffer)?;
        // the first group length token follows the calc-time field
        let corrupted = text.replacen("\t3\t", "\t0\t", 1);
        let result = ParameterSet::read_record(&mut corrupted.as_bytes());
        check!(matches!(result, Err(StatsError::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn test_empty_bootstrap_array_fails_validation() {
        let mut set = sample_set();
        set.sigma_sbs.clear();
        check!(matches!(set.validate(), Err(StatsError::InvalidInput(_))));
    }
}
