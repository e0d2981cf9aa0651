use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Subcommand)]
pub enum SubCommands {
    #[command(about = "Estimate the Gumbel parameters of a scoring scheme")]
    Params(ParamsArgs),
    #[command(about = "Compute P-values from an estimated parameter set")]
    Pvalues(PvaluesArgs),
}

#[derive(Parser)]
#[command(name = "gumbel")]
#[command(
    about = "Estimate the Gumbel (extreme value) statistics of gapped local alignment scores and compute P-values from them"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: SubCommands,
}

#[derive(Args, Debug, Clone)]
pub struct ScoringArgs {
    /// Scoring matrix file: the alphabet size followed by the n x n scores
    #[arg(long = "scoremat", value_name = "MATRIX")]
    pub scoremat_path: PathBuf,

    /// Background frequencies of the first sequence
    #[arg(long = "freqs1", value_name = "FREQS")]
    pub freqs1_path: PathBuf,

    /// Background frequencies of the second sequence (defaults to freqs1)
    #[arg(long = "freqs2", value_name = "FREQS")]
    pub freqs2_path: Option<PathBuf>,

    /// Gap opening penalty
    #[arg(long = "gapopen", default_value_t = 5)]
    pub gap_open: i64,

    /// Gap extension penalty
    #[arg(long = "gapextend", default_value_t = 2)]
    pub gap_extend: i64,

    /// Gap opening penalty for a gap in the second sequence
    #[arg(long = "gapopen2", value_name = "N")]
    pub gap_open2: Option<i64>,

    /// Gap extension penalty for a gap in the second sequence
    #[arg(long = "gapextend2", value_name = "N")]
    pub gap_extend2: Option<i64>,
}

#[derive(Args, Debug, Clone)]
pub struct BudgetArgs {
    /// Target relative accuracy for lambda
    #[arg(long = "lambda-accuracy", default_value_t = 0.01, value_name = "F")]
    pub eps_lambda: f64,

    /// Target relative accuracy for K
    #[arg(long = "k-accuracy", default_value_t = 0.05, value_name = "F")]
    pub eps_k: f64,

    /// Maximum allowed calculation time in seconds
    #[arg(long = "max-time", default_value_t = 1.0, value_name = "SECONDS")]
    pub max_time: f64,

    /// Maximum allowed memory usage in MB
    #[arg(long = "max-mem", default_value_t = 500.0, value_name = "MB")]
    pub max_mem: f64,
}

#[derive(Args, Debug, Clone)]
pub struct RandomArgs {
    /// Randomization seed (defaults to the fixed built-in seed)
    #[arg(long = "rand", value_name = "SEED")]
    pub seed: Option<i64>,

    /// A randomization ledger from a previous run, replayed exactly
    #[arg(long = "randfile", value_name = "PATH")]
    pub ledger_in: Option<PathBuf>,

    /// Where to write the randomization ledger of this run
    #[arg(long = "randout", value_name = "PATH")]
    pub ledger_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ParamsArgs {
    /// Arguments describing the scoring scheme
    #[command(flatten)]
    pub scoring: ScoringArgs,

    /// Arguments bounding the calculation
    #[command(flatten)]
    pub budget: BudgetArgs,

    /// Arguments controlling the random stream
    #[command(flatten)]
    pub random: RandomArgs,

    /// Estimate gapped parameters; false estimates the gapless ones only
    #[arg(
        long = "gapped",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_name = "BOOL"
    )]
    pub gapped: bool,

    /// Permit an insertion directly after a deletion in the alignment walk
    #[arg(long = "insertions-after-deletions", action)]
    pub insertions_after_deletions: bool,

    /// Where to write the estimated parameter set
    #[arg(long = "gumbelparout", value_name = "PATH")]
    pub params_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PvaluesArgs {
    /// A parameter set produced by the params subcommand
    #[arg(long = "gumbelparin", value_name = "PATH")]
    pub params_in: PathBuf,

    /// Lower end of the score range
    #[arg(long = "score1", value_name = "N")]
    pub score_from: i64,

    /// Upper end of the score range (inclusive)
    #[arg(long = "score2", value_name = "N")]
    pub score_to: i64,

    /// Length of the first sequence
    #[arg(long = "seqlen1", value_name = "N")]
    pub seqlen1: i64,

    /// Length of the second sequence
    #[arg(long = "seqlen2", value_name = "N")]
    pub seqlen2: i64,

    /// Where to write the P-value table
    #[arg(long = "pvalout", value_name = "PATH", default_value = "pval.out")]
    pub pvalues_out: PathBuf,
}
