use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use metrics_retention::config::Settings;
use metrics_retention::db::Database;
use metrics_retention::models::CleanupStatus;
use metrics_retention::routes::metrics::Metrics;
use metrics_retention::tasks::cleanup::DuplicateCleanupJob;
use metrics_retention::telemetry;

#[derive(Parser)]
#[command(name = "cleanup-duplicates")]
#[command(about = "Remove consecutive duplicate post metrics snapshots")]
struct Cli {
    /// Count duplicates without deleting anything
    #[arg(long)]
    dry_run: bool,
    /// Rows scanned per batch (defaults to CLEANUP_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;
    telemetry::init_tracing(settings.log_format);

    let batch_size = cli.batch_size.unwrap_or(settings.cleanup_batch_size);
    if batch_size <= 0 {
        bail!("--batch-size must be positive, got {}", batch_size);
    }

    let db = Database::new(&settings.database_url, 2)
        .await
        .context("Failed to connect to database")?;
    let job = DuplicateCleanupJob::new(Arc::new(db), Arc::new(Metrics::new()));

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current batch");
            ctrl_c_token.cancel();
        }
    });

    let report = job.run(cli.dry_run, batch_size, token).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let CleanupStatus::Failed { error } = &report.status {
        bail!("Cleanup failed after {} batches: {}", report.batches, error);
    }
    Ok(())
}
