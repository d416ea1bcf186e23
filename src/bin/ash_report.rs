use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use log::info;

use ash_efa::factor::{FactorAnalysisBuilder, Rotation, ScoreMethod};
use ash_efa::normalize::NormalizerBuilder;
use ash_efa::report::{self, ColumnSelection, ReportConfig};
use ash_efa::SampleTable;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RotationArg {
    Varimax,
    None,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScoresArg {
    Regression,
    Bartlett,
}

#[derive(Parser, Debug)]
#[clap(
    name = "ash_report",
    version,
    about = "Normalizing transforms and exploratory factor analysis of ash composition data."
)]
struct Args {
    /// CSV with a sample id column, concentration columns and the response as the last column.
    #[clap(long)]
    input: PathBuf,

    #[clap(long, default_value_t = 2)]
    min_factors: usize,

    #[clap(long, default_value_t = 5)]
    max_factors: usize,

    /// Factor count of the final model.
    #[clap(long, default_value_t = 4)]
    factors: usize,

    /// Concentration columns to normalize.
    #[clap(long, value_delimiter = ',', conflicts_with = "skew_threshold")]
    transform: Vec<String>,

    /// Normalize every column whose absolute skewness exceeds this value.
    #[clap(long)]
    skew_threshold: Option<f64>,

    /// Score candidate transforms in-sample instead of leave-one-out.
    #[clap(long)]
    no_loo: bool,

    #[clap(long)]
    no_order_norm: bool,

    /// Smallest shifted value for the log candidate on columns with values at or below zero.
    #[clap(long, default_value_t = ash_efa::normalize::DEFAULT_LOG_OFFSET)]
    log_offset: f64,

    #[clap(long, value_enum, default_value_t = RotationArg::Varimax)]
    rotation: RotationArg,

    #[clap(long, value_enum, default_value_t = ScoresArg::Regression)]
    scores: ScoresArg,

    #[clap(long, default_value_t = 0.05)]
    alpha: f64,

    /// Write the p-value and cumulative variance series as CSV.
    #[clap(long)]
    series_out: Option<PathBuf>,

    /// Write the table with the appended score column as CSV.
    #[clap(long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.min_factors == 0 || args.min_factors > args.max_factors {
        bail!(
            "Invalid factor range {}..={}",
            args.min_factors,
            args.max_factors
        );
    }
    if !(args.alpha > 0.0 && args.alpha < 1.0) {
        bail!("alpha must lie in (0, 1), got {}", args.alpha);
    }

    let mut table = SampleTable::from_path(&args.input)
        .with_context(|| format!("Failed to load {}", args.input.display()))?;
    info!(
        "Loaded {} samples with {} concentration columns",
        table.n_samples(),
        table.variables().len()
    );

    let columns = match (args.skew_threshold, args.transform.is_empty()) {
        (Some(threshold), _) => ColumnSelection::Skewed(threshold),
        (None, false) => ColumnSelection::Named(args.transform.clone()),
        (None, true) => ColumnSelection::None,
    };

    let config = ReportConfig {
        columns,
        normalizer: NormalizerBuilder::new()
            .loo(!args.no_loo)
            .allow_order_norm(!args.no_order_norm)
            .log_offset(args.log_offset)
            .build(),
        analysis: FactorAnalysisBuilder::new(args.factors)
            .rotation(match args.rotation {
                RotationArg::Varimax => Rotation::Varimax,
                RotationArg::None => Rotation::None,
            })
            .scores(match args.scores {
                ScoresArg::Regression => ScoreMethod::Regression,
                ScoresArg::Bartlett => ScoreMethod::Bartlett,
            })
            .build(),
        factor_range: args.min_factors..=args.max_factors,
        chosen_factors: args.factors,
        alpha: args.alpha,
    };

    let report = report::run(&mut table, &config)?;
    println!("{}", report);

    if let Some(path) = &args.series_out {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for point in report.sweep.series() {
            wtr.serialize(point)?;
        }
        wtr.flush()?;
        info!("Wrote series to {}", path.display());
    }

    if let Some(path) = &args.output {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        table.write_csv(BufWriter::new(file))?;
        info!("Wrote augmented table to {}", path.display());
    }

    Ok(())
}
