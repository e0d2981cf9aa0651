pub mod calc;
pub mod error;
pub mod gapless;
pub mod ledger;
pub mod model;
pub mod params;
pub mod pvalues;
pub mod regression;
pub mod sampling;
pub mod simulation;
pub mod util;

pub use calc::{EstimationOptions, GumbelCalc};
pub use error::{Result, StatsError};
pub use ledger::RandomizationLedger;
pub use model::{GapCosts, ScoringModel};
pub use params::ParameterSet;
pub use pvalues::{PValueEngine, PvalueReport};
pub use sampling::ImportanceSamplingKernel;
pub use simulation::{GappedSimulator, SimulationBudget};
