//! `buffer-monitor` — the operator CLI for the Persistent Message Buffer (§6.3). Reads and
//! mutates the same Store file the bridge process uses; commands that run with the bridge
//! already up only ever touch the reader pool, except `cleanup` and `reset`.

use anyhow::Context;
use bridge_core::Status;
use bridge_store::{open_shared, Store};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "buffer-monitor")]
#[command(about = "Operator CLI for the MQTT/OPC-UA bridge's message buffer", long_about = None)]
struct Cli {
    /// Path to the bridge's Store file.
    #[arg(long, env = "BRIDGE_DB_PATH", default_value = "buffer.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Subcommand, Debug)]
enum CommandKind {
    /// Print the last metric snapshot plus live counts per status.
    Stats,

    /// Refresh `stats` on an interval until interrupted.
    Monitor {
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// List the oldest N pending rows.
    Pending {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// List the newest N failed-archive rows.
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Remove `completed` rows older than `--days` days.
    Cleanup {
        #[arg(long)]
        days: i64,
    },

    /// Transition all `processing` rows back to `pending` for manual recovery.
    Reset,

    /// Write a metric history dump as JSON to `--output`.
    Export {
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let store = match open_shared(&cli.db_path).await {
        Ok(pools) => Store::new(pools),
        Err(err) => {
            eprintln!("buffer-monitor: store unavailable: {err:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        CommandKind::Stats => cmd_stats(&store).await,
        CommandKind::Monitor { interval } => cmd_monitor(&store, interval).await,
        CommandKind::Pending { limit } => cmd_pending(&store, limit).await,
        CommandKind::Failed { limit } => cmd_failed(&store, limit).await,
        CommandKind::Cleanup { days } => cmd_cleanup(&store, days).await,
        CommandKind::Reset => cmd_reset(&store).await,
        CommandKind::Export { output } => cmd_export(&store, &output).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("buffer-monitor: {err:#}");
            match err.downcast_ref::<sqlx::Error>() {
                Some(_) => ExitCode::from(2),
                None => ExitCode::from(3),
            }
        }
    }
}

async fn cmd_stats(store: &Store) -> anyhow::Result<()> {
    let metrics = store.latest_metrics().await.context("read latest metrics")?;
    println!("metrics:");
    for point in &metrics {
        println!("  {:<22} {:>12.2}  ({})", point.metric_name, point.metric_value, point.timestamp);
    }

    println!("live counts:");
    for status in [Status::Pending, Status::Processing, Status::Completed, Status::Failed, Status::Expired] {
        let count = store.count_status(status).await.context("count by status")?;
        println!("  {status:<12} {count}");
    }

    Ok(())
}

async fn cmd_monitor(store: &Store, interval_secs: u64) -> anyhow::Result<()> {
    let interval = Duration::from_secs(interval_secs.max(1));
    loop {
        println!("--- {} ---", chrono::Utc::now());
        cmd_stats(store).await?;
        tokio::time::sleep(interval).await;
    }
}

async fn cmd_pending(store: &Store, limit: i64) -> anyhow::Result<()> {
    let rows = store.query_pending(limit).await.context("query pending")?;
    for row in &rows {
        println!(
            "#{:<8} {:<10} {:<30} priority={:<8} retry={}/{} created={}",
            row.id, row.priority, row.topic_or_node, row.priority, row.retry_count, row.max_retries, row.created_at
        );
    }
    println!("{} pending row(s)", rows.len());
    Ok(())
}

async fn cmd_failed(store: &Store, limit: i64) -> anyhow::Result<()> {
    let rows = store.query_failed(limit).await.context("query failed archive")?;
    for row in &rows {
        println!(
            "#{:<8} (was #{}) {:<30} retry={} failed_at={} error={}",
            row.id, row.original_id, row.topic_or_node, row.retry_count, row.failed_at, row.error_message
        );
    }
    println!("{} archived row(s)", rows.len());
    Ok(())
}

async fn cmd_cleanup(store: &Store, days: i64) -> anyhow::Result<()> {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
    let removed = store.cleanup(cutoff).await.context("cleanup completed rows")?;
    println!("removed {removed} completed row(s) older than {days} day(s)");
    Ok(())
}

async fn cmd_reset(store: &Store) -> anyhow::Result<()> {
    let reset = store.reset_processing().await.context("reset processing rows")?;
    println!("reset {reset} processing row(s) to pending");
    Ok(())
}

async fn cmd_export(store: &Store, output: &std::path::Path) -> anyhow::Result<()> {
    let history = store.metrics_history().await.context("read metric history")?;
    let json = serde_json::to_vec_pretty(&history).context("encode metric history")?;
    tokio::fs::write(output, json).await.with_context(|| format!("write {}", output.display()))?;
    println!("wrote {} metric point(s) to {}", history.len(), output.display());
    Ok(())
}
