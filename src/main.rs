use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod db;
mod export;
mod generate;
mod models;
mod pipeline;
mod report;
mod store;

use pipeline::FullTimePolicy;

#[derive(Parser)]
#[command(name = "student-features")]
#[command(about = "Derive per-student grade features from raw enrollment documents", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[arg(
        long,
        env = "STUDENT_FEATURES_MAX_CONNECTIONS",
        global = true,
        default_value_t = 5
    )]
    max_connections: u32,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Write a synthetic raw student dataset
    Generate {
        #[arg(long, default_value_t = 10_000)]
        students: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "data/raw/students_raw.json")]
        out: PathBuf,
    },
    /// Load raw student documents from a JSON file
    Ingest {
        #[arg(long, default_value = "data/raw/students_raw.json")]
        json: PathBuf,
    },
    /// Recompute student features and upsert them into the feature table
    Etl {
        /// Delete feature records whose student is no longer in the source
        #[arg(long)]
        prune: bool,
        /// Fail when a student's documents disagree on fullTime
        #[arg(long)]
        strict_full_time: bool,
    },
    /// Export the feature table to CSV
    Export {
        #[arg(long, default_value = "data/derived/students_features.csv")]
        out: PathBuf,
    },
    /// Generate a markdown summary of the feature table
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("student_features={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .init();
}

async fn connect(cli: &Cli) -> anyhow::Result<PgPool> {
    let database_url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::InitDb => {
            let pool = connect(&cli).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Generate {
            students,
            seed,
            out,
        } => {
            let config = generate::GeneratorConfig {
                students: *students,
                seed: *seed,
            };
            let dataset = generate::generate_students(&config, chrono::Utc::now())?;
            generate::write_dataset(out, &dataset)?;
            println!("Generated {} students", dataset.len());
            println!("Saved to {}", out.display());
        }
        Commands::Ingest { json } => {
            let pool = connect(&cli).await?;
            let summary = db::ingest_json(&pool, json).await?;
            println!(
                "Inserted: {}, Modified: {}, Unchanged: {}",
                summary.inserted, summary.modified, summary.unchanged
            );
            println!("Ingestion complete.");
        }
        Commands::Etl {
            prune,
            strict_full_time,
        } => {
            let policy = if *strict_full_time {
                FullTimePolicy::Reject
            } else {
                FullTimePolicy::FirstSeen
            };
            let pool = connect(&cli).await?;

            let records = db::fetch_raw_students(&pool).await?;
            let features = pipeline::compute_features(&records, policy)?;
            info!(
                students = records.len(),
                features = features.len(),
                "computed student features"
            );

            let mut target = db::PgFeatureStore::new(&pool);
            let source_ids = prune.then(|| pipeline::source_student_ids(&records));
            let summary = store::persist(&mut target, &features, source_ids.as_deref()).await?;

            println!(
                "Inserted: {}, Replaced: {}",
                summary.inserted, summary.replaced
            );
            match summary.pruned {
                Some(pruned) => println!("Pruned {pruned} orphaned feature records."),
                None => println!(
                    "Reconciliation skipped; features of students removed from the source are kept."
                ),
            }
            println!("ETL completed: students_features updated.");
        }
        Commands::Export { out } => {
            let pool = connect(&cli).await?;
            let features = db::fetch_features(&pool).await?;
            export::export_csv(out, &features)?;
            println!("Exported {} rows to {}.", features.len(), out.display());
        }
        Commands::Report { out } => {
            let pool = connect(&cli).await?;
            let features = db::fetch_features(&pool).await?;
            let report = report::build_report(&features);
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
