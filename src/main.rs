//! FinSage CLI - incremental loads, staging transforms and warehouse checks.
//!
//! Commands:
//! - `load` - fetch entities from a CSV directory and merge them into the raw layer
//! - `transform` - rebuild staging tables from the raw layer
//! - `test` - run warehouse invariant checks
//! - `run` - load everything available, transform, then check, as one graph
//!
//! Exit code 0 on success, 1 when a unit failed / a check failed / a batch was
//! rejected in full, 2 on a fatal configuration error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finsage_ingest::{
    CheckReport, CsvConnector, LoadJob, LoadReport, Pipeline, PipelineConfig, PipelineError,
    StageOutcome, TransformReport, UnitStatus,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "finsage.toml";

#[derive(Parser)]
#[command(
    name = "finsage",
    version = finsage_ingest::VERSION,
    about = "FinSage financial data ingestion pipeline"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./finsage.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Warehouse file; overrides config and FINSAGE_WAREHOUSE.
    #[arg(long, global = true)]
    warehouse: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Incrementally load one or more entities from `<input>/<entity>.csv`.
    Load {
        /// Entities to load (stock_prices, fundamentals, news, sec_filings).
        #[arg(required = true)]
        entities: Vec<String>,

        /// Directory holding the CSV extracts.
        #[arg(long)]
        input: PathBuf,

        /// Source name recorded as provenance and used for the cursor.
        #[arg(long, default_value = "csv")]
        source: String,
    },
    /// Rebuild staging tables. Defaults to every entity.
    Transform {
        /// Only these entities.
        #[arg(long)]
        select: Vec<String>,
    },
    /// Run warehouse invariant checks.
    Test,
    /// Load every entity with a CSV extract, then transform and test.
    Run {
        /// Directory holding the CSV extracts.
        #[arg(long)]
        input: PathBuf,

        /// Source name recorded as provenance and used for the cursor.
        #[arg(long, default_value = "csv")]
        source: String,
    },
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();

    let cli = Cli::parse();

    match execute(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            let fatal = e
                .downcast_ref::<PipelineError>()
                .map(PipelineError::is_fatal)
                .unwrap_or(false);
            ExitCode::from(if fatal { 2 } else { 1 })
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => PipelineConfig::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("loading config {}", DEFAULT_CONFIG))?,
        None => PipelineConfig::default(),
    };

    let mut config = config.with_env_overrides();
    if let Some(path) = &cli.warehouse {
        config.warehouse.path = path.clone();
    }
    Ok(config)
}

/// Ok(true) when everything succeeded
fn execute(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;
    let pipeline = Pipeline::new(config).context("starting pipeline")?;

    match cli.command {
        Commands::Load {
            entities,
            input,
            source,
        } => {
            println!("📥 Loading {} from {}", entities.join(", "), input.display());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let connector = Arc::new(CsvConnector::new(&input, &source));
            let jobs = entities
                .iter()
                .map(|e| LoadJob::new(e.clone(), connector.clone()))
                .collect();
            let statuses = pipeline.load_many(jobs)?;

            let mut ok = true;
            for (unit, status) in &statuses {
                match status {
                    UnitStatus::Succeeded(report) => {
                        print_load(report);
                        ok &= !report.result.all_rejected();
                    }
                    other => {
                        print_not_succeeded(unit, other);
                        ok = false;
                    }
                }
            }
            Ok(ok)
        }

        Commands::Transform { select } => {
            println!("🔧 Rebuilding staging tables");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let select = if select.is_empty() { None } else { Some(select.as_slice()) };
            let statuses = pipeline.transform(select)?;
            Ok(print_transforms(&statuses))
        }

        Commands::Test => {
            println!("🧪 Checking warehouse invariants");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let report = pipeline.test()?;
            print_checks(&report);
            Ok(report.passed())
        }

        Commands::Run { input, source } => {
            println!("🚰 Full run from {}", input.display());
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            let connector = Arc::new(CsvConnector::new(&input, &source));
            let mut jobs = Vec::new();
            for entity in pipeline.registry().names() {
                if connector.file_for(&entity).is_file() {
                    jobs.push(LoadJob::new(entity, connector.clone()));
                } else {
                    println!("  ⏭️  {}: no extract in {}", entity, input.display());
                }
            }

            let statuses = pipeline.run(jobs)?;
            let mut ok = true;
            for (unit, status) in &statuses {
                match status {
                    UnitStatus::Succeeded(StageOutcome::Loaded(report)) => {
                        print_load(report);
                        ok &= !report.result.all_rejected();
                    }
                    UnitStatus::Succeeded(StageOutcome::Transformed(report)) => {
                        print_transform(report)
                    }
                    UnitStatus::Succeeded(StageOutcome::Checked(report)) => {
                        print_checks(report);
                        ok &= report.passed();
                    }
                    other => {
                        print_not_succeeded(unit, other);
                        ok = false;
                    }
                }
            }
            Ok(ok)
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

fn print_load(report: &LoadReport) {
    let r = &report.result;
    println!("\n📦 {} ← {}", report.entity, report.source);
    println!(
        "   window: {} → {}",
        report.window.from.format("%Y-%m-%d %H:%M:%S"),
        report.window.to.format("%Y-%m-%d %H:%M:%S")
    );
    println!("   fetched: {}", report.fetched);
    println!(
        "   ✓ inserted: {}  updated: {}  unchanged: {}",
        r.inserted, r.updated, r.unchanged
    );
    if r.rejected > 0 {
        println!("   ⚠️  rejected: {}", r.rejected);
        for message in &r.rejections {
            println!("      - {}", message);
        }
    }
    if report.quality.total_records > 0 {
        println!(
            "   quality: avg {:.1}, min {:.1}, {} perfect",
            report.quality.average_score, report.quality.min_score, report.quality.perfect_count
        );
    }
    println!(
        "   cursor: {}",
        if report.cursor_advanced { "advanced" } else { "unchanged" }
    );
    if r.all_rejected() {
        println!("   ❌ every record was rejected");
    }
}

fn print_transform(report: &TransformReport) {
    println!(
        "✓ {}: {} staging rows, {} invalid dropped",
        report.entity, report.rows, report.invalid
    );
}

fn print_transforms(statuses: &BTreeMap<String, UnitStatus<TransformReport>>) -> bool {
    let mut ok = true;
    for (unit, status) in statuses {
        match status {
            UnitStatus::Succeeded(report) => print_transform(report),
            other => {
                print_not_succeeded(unit, other);
                ok = false;
            }
        }
    }
    ok
}

fn print_checks(report: &CheckReport) {
    for result in &report.results {
        if result.passed() {
            println!("✓ {}", result.name);
        } else {
            println!("❌ {} ({} rows): {}", result.name, result.failures, result.detail);
        }
    }
    if report.passed() {
        println!("\n✅ All checks passed");
    } else {
        println!("\n❌ {} check(s) failed", report.failed().len());
    }
}

fn print_not_succeeded<T>(unit: &str, status: &UnitStatus<T>) {
    match status {
        UnitStatus::Failed(reason) => println!("❌ {}: failed: {}", unit, reason),
        UnitStatus::Skipped { blocked_by } => {
            println!("⏭️  {}: skipped (blocked by {})", unit, blocked_by)
        }
        UnitStatus::Cancelled => println!("⏹️  {}: cancelled", unit),
        UnitStatus::Succeeded(_) => {}
    }
}
