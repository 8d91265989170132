use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod diagnostics;
mod error;
mod export;
mod input;
mod models;
mod output;
mod prepare;
mod report;
mod scale_stats;
mod snapshot;
mod standardize;
mod stats;
mod table;
mod typology;
mod validation;

use config::SnapshotConfig;

#[derive(Parser)]
#[command(name = "trait-snapshot")]
#[command(about = "Frozen psychometric snapshots of trait survey rounds", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export raw_answers.csv and scale_map.csv for one round from Postgres
    Export {
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value = "trait_v1")]
        survey_slug: String,
        /// Only answers at or before this instant
        #[arg(long)]
        snapshot_cutoff_at: Option<String>,
        #[arg(long, default_value_t = 1)]
        round_no: u32,
    },
    /// Build a snapshot from exported CSV files
    Snapshot(SnapshotConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trait_snapshot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            out_dir,
            survey_slug,
            snapshot_cutoff_at,
            round_no,
        } => {
            let cutoff = snapshot_cutoff_at
                .as_deref()
                .map(|value| {
                    input::parse_timestamp(value).with_context(|| {
                        format!("could not parse --snapshot-cutoff-at {value:?}")
                    })
                })
                .transpose()?;

            let database_url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set to the survey Postgres instance")?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;

            let rows = db::export_round(&pool, &survey_slug, cutoff, round_no).await?;
            export::write_export(&out_dir, &rows)
                .with_context(|| format!("failed to write export to {}", out_dir.display()))?;

            println!("raw_answers.csv: {}", out_dir.join("raw_answers.csv").display());
            println!("scale_map.csv: {}", out_dir.join("scale_map.csv").display());
            println!(
                "Exported {} answers and {} scale_map rows.",
                rows.raw_answers.len(),
                rows.scale_map.len()
            );
        }
        Commands::Snapshot(config) => {
            let outcome = snapshot::run(&config).context("snapshot failed")?;

            for path in &outcome.written {
                println!("Written: {}", path.display());
            }
            println!(
                "Summary: students(core)={}, scales={}, student_scale_rows={}, supplementary_items={}, warnings={}",
                outcome.total_n,
                outcome.scale_count,
                outcome.student_score_rows,
                outcome.supplementary_items,
                outcome.warning_count
            );
            println!(
                "{}",
                serde_json::json!({
                    "status": "ok",
                    "output_dir": outcome.out_dir.display().to_string(),
                })
            );
        }
    }

    Ok(())
}
