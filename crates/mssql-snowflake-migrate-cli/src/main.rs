//! mssql-snowflake-migrate CLI - resumable MSSQL to Snowflake migration.

use clap::{Parser, Subcommand};
use mssql_snowflake_migrate::{
    Config, DispatchReport, ExportReport, MigrateError, MigrationPlan, MigrationResult,
    Orchestrator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "mssql-snowflake-migrate")]
#[command(about = "Resumable MSSQL to Snowflake migration through CSV staging")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export every pending table, then load every staged artifact
    Run {
        /// Override number of parallel loads
        #[arg(long)]
        workers: Option<usize>,

        /// Dry run: show what would be exported and loaded
        #[arg(long)]
        dry_run: bool,
    },

    /// Export pending tables to the staging directory only
    Export,

    /// Load staged artifacts only
    Load {
        /// Override number of parallel loads
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Test source and destination connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run { workers, dry_run } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            let orchestrator = Orchestrator::new(config).await?;

            if dry_run {
                let plan = orchestrator.plan().await?;
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    print_plan(&plan);
                }
                return Ok(());
            }

            let result = orchestrator.run().await?;
            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }

            if !result.is_complete() {
                return Err(MigrateError::Incomplete(format!(
                    "{} tables left for the next run",
                    result.failed_tables.len()
                )));
            }
        }

        Commands::Export => {
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.export().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_export(&report);
            }

            if !report.failed.is_empty() {
                return Err(MigrateError::Incomplete(format!(
                    "{} tables failed to export",
                    report.failed.len()
                )));
            }
        }

        Commands::Load { workers } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            let orchestrator = Orchestrator::new(config).await?;
            let report = orchestrator.load().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_load(&report);
            }

            let failed = report.failed().count();
            if failed > 0 {
                return Err(MigrateError::Incomplete(format!(
                    "{} artifacts failed to load",
                    failed
                )));
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MSSQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (Snowflake): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn print_result(result: &MigrationResult) {
    let status_msg = if result.is_complete() {
        "Migration completed!"
    } else {
        "Migration finished with tables left over."
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Exported: {} ({} skipped, {} failed)",
        result.tables_exported, result.tables_skipped, result.tables_failed_export
    );
    println!(
        "  Loaded: {} ({} failed)",
        result.artifacts_loaded, result.artifacts_failed
    );
    println!("  Rows: {}", result.rows_loaded);
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
}

fn print_plan(plan: &MigrationPlan) {
    println!("\nDry run:");
    println!("  Tables to export: {}", plan.tables_to_export.len());
    for table in &plan.tables_to_export {
        println!("    {} ({} columns)", table.name, table.columns);
        println!("      {}", table.ddl);
    }
    if !plan.excluded.is_empty() {
        println!("  Excluded: {:?}", plan.excluded);
    }
    if !plan.already_exported.is_empty() {
        println!("  Already exported: {:?}", plan.already_exported);
    }
    println!("  Artifacts pending load: {}", plan.pending_artifacts.len());
    for artifact in &plan.pending_artifacts {
        println!("    {}", artifact.display());
    }
    println!("  Workers: {}", plan.workers);
}

fn print_export(report: &ExportReport) {
    println!("\nExport finished:");
    println!("  Exported: {}", report.exported.len());
    println!("  Rows: {}", report.rows_exported);
    println!(
        "  Skipped: {} excluded, {} already exported",
        report.skipped_excluded, report.skipped_tracked
    );
    for failure in &report.failed {
        println!("  Failed: {} - {}", failure.table, failure.error);
    }
}

fn print_load(report: &DispatchReport) {
    println!("\nLoad finished:");
    println!("  Loaded: {}", report.succeeded().count());
    println!("  Rows: {}", report.rows_loaded());
    for outcome in report.failed() {
        println!(
            "  Failed: {} after {} attempts - {}",
            outcome.table,
            outcome.attempts_used,
            outcome.last_error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}', expected text or json", other)),
    }

    Ok(())
}
