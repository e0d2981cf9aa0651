use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatsError};

/// Default seed used when no ledger file and no explicit seed are supplied.
/// Runs with the default ledger are fully deterministic.
pub const DEFAULT_SEED: i64 = 182_345_345;

const DEFAULT_FIRST_STAGE: [u64; 3] = [39, 119, 279];
const DEFAULT_PRELIMINARY: [u64; 2] = [319, 999];
const DEFAULT_KILLING: [u64; 2] = [39, 999];
const DEFAULT_TOTAL: u64 = 14_112;

/// A reproducible description of the random stream consumed by one
/// estimation run: the seed plus the realization-count schedule of every
/// simulation stage.
///
/// The simulator drives its stage boundaries from these counts rather than
/// from wall-clock checks, so two runs sharing a ledger draw exactly the
/// same variates in the same order and produce bit-identical estimates.
/// The ledger is created (or loaded) once per run and only ever moves
/// forward: the cumulative counters grow as realizations complete.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RandomizationLedger {
    /// Seed for the process-wide pseudo-random stream
    pub seed: i64,
    /// Cumulative realization counts of the calibration checkpoints
    pub first_stage_preliminary: Vec<u64>,
    /// Cumulative realization counts at which accuracy is re-evaluated
    /// during the main simulation stage
    pub preliminary: Vec<u64>,
    /// Cumulative realization counts of the killing-stage checkpoints
    pub killing: Vec<u64>,
    /// Total realizations allowed (and, after a run, consumed) by the
    /// main ladder-point stage
    pub total_realizations_alp: u64,
    /// Total realizations allowed/consumed by the killing stage
    pub total_realizations_killing: u64,
}

impl Default for RandomizationLedger {
    fn default() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }
}

impl RandomizationLedger {
    /// A fresh ledger with the default stage schedule and the given seed.
    pub fn with_seed(seed: i64) -> Self {
        Self {
            seed,
            first_stage_preliminary: DEFAULT_FIRST_STAGE.to_vec(),
            preliminary: DEFAULT_PRELIMINARY.to_vec(),
            killing: DEFAULT_KILLING.to_vec(),
            total_realizations_alp: DEFAULT_TOTAL,
            total_realizations_killing: DEFAULT_TOTAL,
        }
    }

    /// Loads a persisted ledger and validates it against the seed the caller
    /// asked for. A disagreement means the file belongs to a different run.
    pub fn load<P: AsRef<Path>>(path: P, requested_seed: Option<i64>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            StatsError::invalid(format!(
                "cannot open ledger file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let ledger: RandomizationLedger = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StatsError::invalid(format!("malformed ledger file: {e}")))?;

        if let Some(seed) = requested_seed {
            if seed != ledger.seed {
                return Err(StatsError::invalid(format!(
                    "requested seed {seed} does not match ledger seed {}",
                    ledger.seed
                )));
            }
        }
        ledger.validate()?;
        Ok(ledger)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            StatsError::invalid(format!(
                "cannot create ledger file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| StatsError::invalid(format!("cannot write ledger file: {e}")))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, counts) in [
            ("first_stage_preliminary", &self.first_stage_preliminary),
            ("preliminary", &self.preliminary),
            ("killing", &self.killing),
        ] {
            if counts.windows(2).any(|w| w[1] <= w[0]) {
                return Err(StatsError::invalid(format!(
                    "ledger stage {name} counts are not strictly increasing"
                )));
            }
        }
        if self.first_stage_preliminary.is_empty() || self.preliminary.is_empty() {
            return Err(StatsError::invalid(
                "ledger calibration and preliminary stages need at least one checkpoint",
            ));
        }
        if self.total_realizations_alp < *self.preliminary.last().unwrap() {
            return Err(StatsError::invalid(
                "ledger total realization count is below the last preliminary checkpoint",
            ));
        }
        // an empty killing stage (with a zero total) records a run that
        // converged before that stage started
        if let Some(&last) = self.killing.last() {
            if self.total_realizations_killing < last {
                return Err(StatsError::invalid(
                    "ledger killing total is below the last killing checkpoint",
                ));
            }
        }
        Ok(())
    }

    /// Records the realization totals actually consumed by a finished run
    /// and trims the checkpoint lists past them, so that persisting this
    /// ledger lets a later run replay the schedule exactly.
    pub fn record_consumed(&mut self, alp_realizations: u64, killing_realizations: u64) {
        self.total_realizations_alp = alp_realizations;
        self.total_realizations_killing = killing_realizations;
        self.preliminary.retain(|&c| c <= alp_realizations);
        if self.preliminary.is_empty() {
            self.preliminary.push(alp_realizations.max(1));
        }
        self.killing.retain(|&c| c <= killing_realizations);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert2::check;

    #[test]
    fn test_default_ledger_is_fixed() {
        let a = RandomizationLedger::default();
        let b = RandomizationLedger::default();
        check!(a == b);
        check!(a.seed == DEFAULT_SEED);
        a.validate().unwrap();
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let dir = std::env::temp_dir();
        let path = dir.join("libgumbel-ledger-roundtrip.json");
        let mut ledger = RandomizationLedger::with_seed(77);
        ledger.record_consumed(1234, 999);
        ledger.save(&path)?;
        let loaded = RandomizationLedger::load(&path, Some(77))?;
        check!(loaded == ledger);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_seed_mismatch_is_invalid_input() -> anyhow::Result<()> {
        let dir = std::env::temp_dir();
        let path = dir.join("libgumbel-ledger-mismatch.json");
        RandomizationLedger::with_seed(1).save(&path)?;
        let result = RandomizationLedger::load(&path, Some(2));
        check!(matches!(result, Err(StatsError::InvalidInput(_))));
        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_non_monotonic_counts_rejected() {
        let mut ledger = RandomizationLedger::default();
        ledger.preliminary = vec![500, 100];
        check!(matches!(
            ledger.validate(),
            Err(StatsError::InvalidInput(_))
        ));
    }
}
