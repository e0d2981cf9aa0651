mod args;
mod io;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use args::{Cli, ParamsArgs, PvaluesArgs, SubCommands};
use libgumbel::{
    EstimationOptions, GapCosts, GumbelCalc, RandomizationLedger, ScoringModel,
};

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        SubCommands::Params(args) => estimate_params(&args),
        SubCommands::Pvalues(args) => compute_pvalues(&args),
    }
}

fn estimate_params(args: &ParamsArgs) -> anyhow::Result<()> {
    let matrix = io::read_score_matrix(&args.scoring.scoremat_path)?;
    let freqs1 = io::read_frequencies(&args.scoring.freqs1_path)?;
    let freqs2 = match &args.scoring.freqs2_path {
        Some(path) => io::read_frequencies(path)?,
        None => freqs1.clone(),
    };
    let model = ScoringModel::new(matrix, freqs1, freqs2)
        .context("the scoring inputs do not describe a usable model")?;

    let gap_costs = GapCosts::per_side(
        args.scoring.gap_open,
        args.scoring.gap_extend,
        args.scoring.gap_open2.unwrap_or(args.scoring.gap_open),
        args.scoring.gap_extend2.unwrap_or(args.scoring.gap_extend),
    );

    let mut ledger = match &args.random.ledger_in {
        Some(path) => RandomizationLedger::load(path, args.random.seed)
            .context("failed to replay the randomization ledger")?,
        None => match args.random.seed {
            Some(seed) => RandomizationLedger::with_seed(seed),
            None => RandomizationLedger::default(),
        },
    };

    let options = EstimationOptions {
        gapped: args.gapped,
        insertions_after_deletions: args.insertions_after_deletions,
        max_time: Duration::from_secs_f64(args.budget.max_time),
        max_mem_mb: args.budget.max_mem,
        eps_lambda: args.budget.eps_lambda,
        eps_k: args.budget.eps_k,
    };

    let calc = GumbelCalc::new();
    let set = calc
        .estimate_parameters(&model, &gap_costs, &options, &mut ledger)
        .context("parameter estimation failed")?;

    println!(
        "lambda = {} +/- {}\nK      = {} +/- {}",
        set.lambda, set.lambda_error, set.k, set.k_error
    );

    if let Some(path) = &args.params_out {
        calc.write_parameter_file(path, &set)?;
    }
    if let Some(path) = &args.random.ledger_out {
        ledger.save(path)?;
    }
    Ok(())
}

fn compute_pvalues(args: &PvaluesArgs) -> anyhow::Result<()> {
    let calc = GumbelCalc::new();
    let params = calc
        .read_parameter_file(&args.params_in)
        .context("failed to read the parameter set")?;

    let report = calc
        .compute_p_values(
            &params,
            args.score_from,
            args.score_to,
            args.seqlen1,
            args.seqlen2,
        )
        .context("P-value computation failed")?;

    println!("Score\tP-value\tP-value error");
    for (offset, (p, e)) in report
        .p_values
        .iter()
        .zip(&report.p_value_errors)
        .enumerate()
    {
        println!("{}\t{p}\t{e}", report.score_from + offset as i64);
    }

    calc.write_pvalue_file(&args.pvalues_out, &report)?;
    Ok(())
}
