use balance_recon::config::ReconConfig;
use balance_recon::metadata::ClassificationTable;
use balance_recon::output::{write_aggregates_csv, write_report_json};
use balance_recon::rca::{ReconciliationEngine, RunInputs, RunPlan};
use balance_recon::source::{load_reference_csv, FileSeriesSource, SeriesSource, DATE_COLUMN};
use balance_recon::time::{monthly_means, year_over_year};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "balance-recon")]
#[command(about = "Normalized aggregation and reconciliation of market-balance series")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate raw series and reconcile them against reference totals
    Run {
        /// Classification table (.json or .csv)
        #[arg(long)]
        classification: PathBuf,

        /// Raw series, wide CSV or Parquet
        #[arg(long)]
        raw: PathBuf,

        /// Run plan (.json): aggregate keys, derived totals, hierarchy rules
        #[arg(long)]
        plan: PathBuf,

        /// Reference values, long CSV
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Config file (.json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Preset when no config file is given: default, structural, coarse
        #[arg(long, default_value = "default")]
        preset: String,

        /// Overrides config and environment
        #[arg(long)]
        tolerance: Option<f64>,

        /// Overrides config and environment
        #[arg(long)]
        subset_search_bound: Option<usize>,

        /// Name of the date column in the raw file
        #[arg(long, default_value = DATE_COLUMN)]
        date_column: String,

        /// Directory for aggregate CSVs (daily, monthly, year-over-year) and report.json
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run {
            classification,
            raw,
            plan,
            reference,
            config,
            preset,
            tolerance,
            subset_search_bound,
            date_column,
            output_dir,
        } => {
            let mut config = match config {
                Some(path) => ReconConfig::load_json(&path)?,
                None => ReconConfig::preset(&preset)?,
            }
            .with_env_overrides()?;
            if let Some(tolerance) = tolerance {
                config.tolerance = tolerance;
            }
            if let Some(bound) = subset_search_bound {
                config.subset_search_bound = bound;
            }

            let classification = ClassificationTable::load(&classification)
                .with_context(|| format!("loading classification {}", classification.display()))?;
            let raw = FileSeriesSource::new(&raw).with_date_column(&date_column).load()?;
            let plan = RunPlan::load_json(&plan).with_context(|| format!("loading plan {}", plan.display()))?;
            let reference = match reference {
                Some(path) => Some(
                    load_reference_csv(&path).with_context(|| format!("loading reference {}", path.display()))?,
                ),
                None => None,
            };

            let engine = ReconciliationEngine::new(config);
            let result = engine.run(&RunInputs {
                classification: &classification,
                raw: &raw,
                reference: reference.as_ref(),
                plan: &plan,
            })?;

            println!("{}", result.report);

            if let Some(dir) = output_dir {
                std::fs::create_dir_all(&dir)?;
                write_aggregates_csv(&result.aggregates, dir.join("aggregates.csv"))?;
                let monthly = monthly_means(&result.aggregates);
                let yoy = year_over_year(&monthly, 12);
                write_aggregates_csv(&monthly, dir.join("aggregates_monthly.csv"))?;
                write_aggregates_csv(&yoy.absolute, dir.join("aggregates_yoy_abs.csv"))?;
                write_aggregates_csv(&yoy.percent, dir.join("aggregates_yoy_pct.csv"))?;
                write_report_json(&result.report, dir.join("report.json"))?;
                info!("📁 Outputs written to {}", dir.display());
            }
        }
    }

    Ok(())
}
