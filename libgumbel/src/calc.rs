//! Orchestration of the two operating modes: Gumbel parameter estimation
//! and P-value computation over a persisted parameter set.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Result, StatsError};
use crate::gapless;
use crate::ledger::RandomizationLedger;
use crate::model::{GapCosts, ScoringModel};
use crate::params::ParameterSet;
use crate::pvalues::{PValueEngine, PvalueReport};
use crate::sampling::ImportanceSamplingKernel;
use crate::simulation::{GappedSimulator, SimulationBudget};

/// Portion of the total budget the gapless phase may consume when a gapped
/// estimation follows it.
const GAPLESS_TIME_PORTION: f64 = 0.5;

/// Error attached to the gapless seed values on the final parameter set.
const GAPLESS_SEED_ERROR: f64 = 1.0e-6;

#[derive(Clone, Copy, Debug)]
pub struct EstimationOptions {
    /// Estimate gapped parameters (false: ungapped closed form only)
    pub gapped: bool,
    /// Allow an insertion state directly after a deletion state
    pub insertions_after_deletions: bool,
    /// Wall-clock ceiling for the whole estimation
    pub max_time: Duration,
    /// Memory ceiling in MB for the simulation bookkeeping
    pub max_mem_mb: f64,
    /// Target relative error for lambda
    pub eps_lambda: f64,
    /// Target relative error for K
    pub eps_k: f64,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            gapped: true,
            insertions_after_deletions: false,
            max_time: Duration::from_secs(1),
            max_mem_mb: 500.0,
            eps_lambda: 0.01,
            eps_k: 0.05,
        }
    }
}

/// The facade over the estimation pipeline. Stateless; every call owns its
/// inputs for the duration of the call and shares nothing afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct GumbelCalc {
    _private: (),
}

impl GumbelCalc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the estimation mode: the gapless closed form, then (when gaps
    /// are enabled) the gapped simulation seeded from it. A gapless failure
    /// stops the run; no gapped estimation is attempted on top of it.
    pub fn estimate_parameters(
        &self,
        model: &ScoringModel,
        gap_costs: &GapCosts,
        options: &EstimationOptions,
        ledger: &mut RandomizationLedger,
    ) -> Result<ParameterSet> {
        let started = Instant::now();

        if !options.gapped {
            return gapless::standalone_parameter_set(model, options.max_time);
        }

        let gapless_budget = options.max_time.mul_f64(GAPLESS_TIME_PORTION);
        let seed = gapless::estimate(model, gapless_budget)?;

        // the gapped phase gets whatever the gapless phase left, floored at
        // its reserved half of the total
        let elapsed = started.elapsed();
        let remaining = options
            .max_time
            .saturating_sub(elapsed)
            .max(options.max_time.mul_f64(1.0 - GAPLESS_TIME_PORTION));

        let kernel =
            ImportanceSamplingKernel::new(model, gap_costs, options.insertions_after_deletions)?;
        let budget = SimulationBudget {
            max_time: remaining,
            max_mem_mb: options.max_mem_mb,
            eps_lambda: options.eps_lambda,
            eps_k: options.eps_k,
        };

        let mut set = GappedSimulator::new(&kernel, *gap_costs, budget, ledger).run()?;

        set.gapless_a = seed.a;
        set.gapless_a_error = GAPLESS_SEED_ERROR;
        set.gapless_alpha = seed.alpha;
        set.gapless_alpha_error = GAPLESS_SEED_ERROR;
        set.recompute_averages();
        set.calc_time = started.elapsed().as_secs_f64();
        Ok(set)
    }

    /// Runs the P-value mode over an estimated or reloaded parameter set.
    pub fn compute_p_values(
        &self,
        params: &ParameterSet,
        score_from: i64,
        score_to: i64,
        seqlen1: i64,
        seqlen2: i64,
    ) -> Result<PvalueReport> {
        PValueEngine::new().calculate_p_values(params, score_from, score_to, seqlen1, seqlen2)
    }

    pub fn write_parameter_file<P: AsRef<Path>>(&self, path: P, set: &ParameterSet) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            StatsError::invalid(format!(
                "cannot create parameter file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        set.write_record(&mut BufWriter::new(file))
    }

    pub fn read_parameter_file<P: AsRef<Path>>(&self, path: P) -> Result<ParameterSet> {
        let file = File::open(path.as_ref()).map_err(|e| {
            StatsError::invalid(format!(
                "cannot open parameter file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        ParameterSet::read_record(&mut BufReader::new(file))
    }

    pub fn write_pvalue_file<P: AsRef<Path>>(&self, path: P, report: &PvalueReport) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            StatsError::invalid(format!(
                "cannot create P-value file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        report.write_record(&mut BufWriter::new(file))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    fn dna_inputs() -> (ScoringModel, GapCosts) {
        (
            ScoringModel::dna(2, -3, [0.25; 4]).unwrap(),
            GapCosts::new(5, 2),
        )
    }

    fn scenario_options() -> EstimationOptions {
        EstimationOptions {
            gapped: true,
            insertions_after_deletions: false,
            max_time: Duration::from_secs(5),
            max_mem_mb: 500.0,
            eps_lambda: 0.01,
            eps_k: 0.05,
        }
    }

    #[test]
    fn test_gapped_scenario() -> anyhow::Result<()> {
        let (model, costs) = dna_inputs();
        let calc = GumbelCalc::new();
        let mut ledger = RandomizationLedger::default();
        let started = Instant::now();
        let set = calc.estimate_parameters(&model, &costs, &scenario_options(), &mut ledger)?;
        let elapsed = started.elapsed();

        check!(set.lambda > 0.0);
        check!(set.k > 0.0);
        check!(set.lambda_error / set.lambda <= 0.01);
        check!(set.k_error / set.k <= 0.05);
        set.validate()?;
        check!(set.lambda_sbs.len() >= 2);
        check!(set.g == 7);
        check!(set.gapless_a > 0.0);
        check!(set.calc_time > 0.0);
        // ceiling respected up to one realization's worth of slack
        check!(elapsed < Duration::from_secs(6));
        Ok(())
    }

    #[test]
    fn test_gapless_scenario() -> anyhow::Result<()> {
        let (model, costs) = dna_inputs();
        let calc = GumbelCalc::new();
        let mut ledger = RandomizationLedger::default();
        let options = EstimationOptions {
            gapped: false,
            ..scenario_options()
        };
        let set = calc.estimate_parameters(&model, &costs, &options, &mut ledger)?;
        check!(set.g == 0);
        check!(set.lambda > 0.0);
        check!(set.a_i == set.gapless_a);
        set.validate()?;
        Ok(())
    }

    #[test]
    fn test_estimate_then_pvalues_end_to_end() -> anyhow::Result<()> {
        let (model, costs) = dna_inputs();
        let calc = GumbelCalc::new();
        let mut ledger = RandomizationLedger::default();
        let options = EstimationOptions {
            eps_lambda: 0.1,
            eps_k: 0.1,
            ..scenario_options()
        };
        let set = calc.estimate_parameters(&model, &costs, &options, &mut ledger)?;

        let report = calc.compute_p_values(&set, 20, 30, 1000, 2000)?;
        check!(report.p_values.len() == 11);
        for pair in report.p_values.windows(2) {
            check!(pair[1] < pair[0]);
        }
        for &p in &report.p_values {
            check!(p > 0.0 && p < 1.0);
        }
        Ok(())
    }

    #[test]
    fn test_gapless_failure_stops_combined_mode() {
        let (model, costs) = dna_inputs();
        let calc = GumbelCalc::new();
        let mut ledger = RandomizationLedger::default();
        let options = EstimationOptions {
            max_time: Duration::ZERO,
            ..scenario_options()
        };
        // the gapless phase cannot finish inside a zero budget; the gapped
        // phase must not run on top of that failure
        let result = calc.estimate_parameters(&model, &costs, &options, &mut ledger);
        check!(matches!(
            result,
            Err(crate::error::StatsError::ResultUnavailable(_))
        ));
    }

    #[test]
    fn test_parameter_file_round_trip() -> anyhow::Result<()> {
        let (model, costs) = dna_inputs();
        let calc = GumbelCalc::new();
        let mut ledger = RandomizationLedger::default();
        let options = EstimationOptions {
            eps_lambda: 0.2,
            eps_k: 0.2,
            ..scenario_options()
        };
        let set = calc.estimate_parameters(&model, &costs, &options, &mut ledger)?;

        let path = std::env::temp_dir().join("libgumbel-params-roundtrip.txt");
        calc.write_parameter_file(&path, &set)?;
        let back = calc.read_parameter_file(&path)?;
        check!(back == set);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
