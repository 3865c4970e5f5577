#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use regulon::activity::ActivityMethod;
use regulon::config::RunConfig;
use regulon::holdout::HoldoutAxis;
use regulon::progress::{InferenceProgressObserver, InferenceStage};
use regulon::regression::RegressionMethod;
use regulon::regression::best_subset::BestSubsetConfig;
use regulon::regression::elastic_net::ElasticNetConfig;
use regulon::shared::files::{
    read_expression, read_prior, read_regulators, write_network, write_prior,
};
use regulon::types::PriorMatrix;
use regulon::workflow::{InferenceEngine, InferenceInput};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodCli {
    BestSubset,
    ElasticNet,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ActivityCli {
    Expression,
    Tfa,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum HoldoutAxisCli {
    Targets,
    Regulators,
    Edges,
}

#[derive(Args)]
pub struct InferArgs {
    /// Expression table (genes by samples, tab separated, gene names in the first column)
    #[arg(long, value_name = "PATH")]
    pub expression: PathBuf,

    /// Read the expression table as samples by genes
    #[arg(long)]
    pub transpose: bool,

    /// Regulator names, one per line
    #[arg(long, value_name = "PATH")]
    pub regulators: PathBuf,

    /// Prior edges (targets by regulators, tab separated); omitted means no prior
    #[arg(long, value_name = "PATH")]
    pub prior: Option<PathBuf>,

    /// Where the ranked edge list is written
    #[arg(long, short, value_name = "PATH", default_value = "network.tsv")]
    pub output: PathBuf,

    /// TOML run configuration; command line flags take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of bootstraps
    #[arg(long, value_name = "N")]
    pub bootstraps: Option<usize>,

    /// Random seed for resampling and clustering
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of cooperating workers (defaults to the CPU count)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Bins per gene when discretizing for mutual information
    #[arg(long, value_name = "N")]
    pub bins: Option<usize>,

    /// Regression strategy
    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,

    /// Largest number of regulators kept per target
    #[arg(long, value_name = "N")]
    pub max_predictors: Option<usize>,

    /// How the regulator design matrix is built
    #[arg(long, value_enum)]
    pub activity: Option<ActivityCli>,

    /// Treat samples as single cells and pseudobulk them into this many clusters
    #[arg(long, value_name = "K")]
    pub pseudobulk_clusters: Option<usize>,

    /// Hold this fraction of the prior out of fitting
    #[arg(long, value_name = "RATIO")]
    pub holdout_ratio: Option<f64>,

    /// Which part of the prior the holdout removes
    #[arg(long, value_enum)]
    pub holdout_axis: Option<HoldoutAxisCli>,

    /// Where held-out prior edges are written (targets by regulators)
    #[arg(long, value_name = "PATH", default_value = "held_out_prior.tsv")]
    pub holdout_output: PathBuf,

    /// Also write the effective configuration to this path
    #[arg(long, value_name = "PATH")]
    pub save_config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "regulon",
    about = "Bootstrap inference of gene regulatory networks",
    long_about = "Infers a ranked regulator-target network from expression data by \
                 resampling, mutual-information screening and sparse regression."
)]
struct Cli {
    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer a regulatory network
    #[command(about = "Infer a regulatory network (outputs: network.tsv)")]
    Infer(InferArgs),

    /// Write the default run configuration
    #[command(about = "Write the default run configuration as TOML")]
    Config {
        #[arg(value_name = "PATH", default_value = "regulon.toml")]
        output: PathBuf,
    },

    /// Display version information
    Version,
}

fn main() {
    let Cli { verbose, command } = Cli::parse();
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let result = match command {
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Config { output }) => RunConfig::default()
            .save(&output)
            .map(|()| println!("Default configuration written to {}", output.display()))
            .map_err(Box::<dyn Error>::from),
        Some(Commands::Version) => {
            println!("regulon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Box::<dyn Error>::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn apply_overrides(config: &mut RunConfig, args: &InferArgs) {
    if let Some(bootstraps) = args.bootstraps {
        config.bootstraps = bootstraps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(bins) = args.bins {
        config.bins = bins;
    }
    match (args.method, &config.regression) {
        (Some(MethodCli::BestSubset), RegressionMethod::ElasticNet(_)) => {
            config.regression = RegressionMethod::BestSubset(BestSubsetConfig::default());
        }
        (Some(MethodCli::ElasticNet), RegressionMethod::BestSubset(_)) => {
            config.regression = RegressionMethod::ElasticNet(ElasticNetConfig::default());
        }
        _ => {}
    }
    if let Some(limit) = args.max_predictors {
        match &mut config.regression {
            RegressionMethod::BestSubset(settings) => settings.max_model_size = Some(limit),
            RegressionMethod::ElasticNet(settings) => settings.max_candidates = Some(limit),
        }
    }
    if let Some(activity) = args.activity {
        config.activity = match activity {
            ActivityCli::Expression => ActivityMethod::Expression,
            ActivityCli::Tfa => ActivityMethod::Tfa,
        };
    }
    if let Some(clusters) = args.pseudobulk_clusters {
        let mut pseudobulk = config.pseudobulk.take().unwrap_or_default();
        pseudobulk.clusters = clusters;
        config.pseudobulk = Some(pseudobulk);
    }
    if args.holdout_ratio.is_some() || args.holdout_axis.is_some() {
        let mut holdout = config.prior_holdout.take().unwrap_or_default();
        if let Some(ratio) = args.holdout_ratio {
            holdout.ratio = ratio;
        }
        if let Some(axis) = args.holdout_axis {
            holdout.axis = match axis {
                HoldoutAxisCli::Targets => HoldoutAxis::Targets,
                HoldoutAxisCli::Regulators => HoldoutAxis::Regulators,
                HoldoutAxisCli::Edges => HoldoutAxis::Edges,
            };
        }
        config.prior_holdout = Some(holdout);
    }
}

fn infer(args: InferArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
        log::info!("Effective configuration written to {}", path.display());
    }

    let expression = read_expression(&args.expression, args.transpose)?;
    let regulators = read_regulators(&args.regulators)?;
    let prior = match &args.prior {
        Some(path) => read_prior(path)?,
        None => {
            if config.activity == ActivityMethod::Tfa {
                log::warn!("No prior given; activity falls back to regulator expression");
            }
            PriorMatrix::empty()
        }
    };

    let bootstraps = config.bootstraps;
    let seed = config.seed;
    let engine = InferenceEngine::new(InferenceInput::new(expression, regulators, prior), config)?;
    let mut progress = ConsoleProgress::default();
    let outcome = engine.run_with_progress(bootstraps, seed, &mut progress)?;

    let written = write_network(&args.output, &outcome.network)?;
    println!("{}", outcome.diagnostics);
    if !outcome.diagnostics.degenerate_targets.is_empty() {
        log::warn!(
            "Targets without variance in some bootstrap: {}",
            itemize(&outcome.diagnostics.degenerate_targets)
        );
    }
    if !outcome.diagnostics.non_converged_targets.is_empty() {
        log::warn!(
            "Targets whose solver did not converge: {}",
            itemize(&outcome.diagnostics.non_converged_targets)
        );
    }
    println!("{written} edges written to {}", args.output.display());
    if let Some(held_out) = &outcome.held_out_prior {
        let edges = write_prior(&args.holdout_output, held_out)?;
        println!("{edges} held-out prior edges written to {}", args.holdout_output.display());
    }
    Ok(())
}

fn itemize<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    const SHOWN: usize = 10;
    let names: Vec<&String> = names.into_iter().collect();
    let mut text = names
        .iter()
        .take(SHOWN)
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > SHOWN {
        text.push_str(&format!(" and {} more", names.len() - SHOWN));
    }
    text
}

/// One bar over every bootstrap stage, drawn only on a terminal.
#[derive(Default)]
struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl InferenceProgressObserver for ConsoleProgress {
    fn on_run_start(&mut self, bootstraps: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let stages = [InferenceStage::Association, InferenceStage::Regression].len();
        let bar = ProgressBar::with_draw_target(Some((bootstraps * stages) as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        self.bar = Some(bar);
    }

    fn on_stage_start(&mut self, bootstrap: usize, stage: InferenceStage, total_units: usize) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("bootstrap {}: {stage} ({total_units} units)", bootstrap + 1));
        }
    }

    fn on_stage_finish(&mut self, bootstrap: usize, stage: InferenceStage) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            log::debug!("Bootstrap {} finished {stage}", bootstrap + 1);
        }
    }

    fn on_run_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("done");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regulon::holdout::PriorHoldout;

    fn parse(flags: &[&str]) -> InferArgs {
        let argv = ["regulon", "infer", "--expression", "e.tsv", "--regulators", "r.txt"];
        let cli = Cli::try_parse_from(argv.iter().chain(flags)).unwrap();
        match cli.command {
            Some(Commands::Infer(args)) => args,
            _ => panic!("expected the infer subcommand"),
        }
    }

    fn overridden(flags: &[&str]) -> RunConfig {
        let mut config = RunConfig::default();
        apply_overrides(&mut config, &parse(flags));
        config
    }

    #[test]
    fn no_flags_keep_the_configuration() {
        assert_eq!(overridden(&[]), RunConfig::default());
    }

    #[test]
    fn method_flag_switches_strategy_and_max_predictors_follows_it() {
        let config = overridden(&["--method", "elastic-net", "--max-predictors", "4"]);
        assert_eq!(
            config.regression,
            RegressionMethod::ElasticNet(ElasticNetConfig {
                max_candidates: Some(4),
                ..ElasticNetConfig::default()
            })
        );

        let mut config = RunConfig {
            regression: RegressionMethod::ElasticNet(ElasticNetConfig::default()),
            ..RunConfig::default()
        };
        apply_overrides(&mut config, &parse(&["--method", "best-subset", "--max-predictors", "3"]));
        let RegressionMethod::BestSubset(settings) = &config.regression else {
            panic!("method was not switched");
        };
        assert_eq!(settings.max_model_size, Some(3));
    }

    #[test]
    fn matching_method_keeps_tuned_settings() {
        let tuned = ElasticNetConfig {
            l1_ratio: 0.9,
            ..ElasticNetConfig::default()
        };
        let mut config = RunConfig {
            regression: RegressionMethod::ElasticNet(tuned.clone()),
            ..RunConfig::default()
        };
        apply_overrides(&mut config, &parse(&["--method", "elastic-net"]));
        assert_eq!(config.regression, RegressionMethod::ElasticNet(tuned));
    }

    #[test]
    fn scalar_flags_override_the_file() {
        let config = overridden(&[
            "--workers", "3", "--bins", "16", "--bootstraps", "9", "--seed", "7", "--activity",
            "expression", "--pseudobulk-clusters", "20",
        ]);
        assert_eq!(config.workers, 3);
        assert_eq!(config.bins, 16);
        assert_eq!(config.bootstraps, 9);
        assert_eq!(config.seed, 7);
        assert_eq!(config.activity, ActivityMethod::Expression);
        assert_eq!(config.pseudobulk.map(|p| p.clusters), Some(20));
    }

    #[test]
    fn holdout_flags_fill_in_defaults() {
        let config = overridden(&["--holdout-axis", "edges"]);
        assert_eq!(
            config.prior_holdout,
            Some(PriorHoldout {
                ratio: PriorHoldout::default().ratio,
                axis: HoldoutAxis::Edges,
            })
        );
        let config = overridden(&["--holdout-ratio", "0.5"]);
        assert_eq!(config.prior_holdout.map(|h| (h.ratio, h.axis)), Some((0.5, HoldoutAxis::Targets)));
        assert!(overridden(&["--bins", "100000"]).validate().is_err());
    }
}
