//! Operator surface: indexing status readout, manual requeue, soft delete.
//!
//! `trx status` shows counts by `extraction_status` for transcript jobs and
//! chunks, plus every failed chunk with its attempt count and last error.
//! `trx requeue` moves failed work back to `pending`.

use anyhow::{bail, Result};

use transcript_retrieval_core::models::now_ms;
use transcript_retrieval_core::status::ExtractionStatus;
use transcript_retrieval_core::store::{RequeueCounts, StatusCounts, StatusReport, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn status_report(store: &dyn Store, transcript_id: Option<&str>) -> Result<StatusReport> {
    store.status_report(transcript_id).await
}

pub async fn requeue_failed(store: &dyn Store, transcript_id: Option<&str>) -> Result<RequeueCounts> {
    let counts = store.requeue_failed(transcript_id, now_ms()).await?;
    tracing::info!(
        transcript_id = transcript_id.unwrap_or("*"),
        transcripts = counts.transcripts,
        chunks = counts.chunks,
        "requeued failed work"
    );
    Ok(counts)
}

/// Mark a transcript deleted; it is excluded from retrieval from then on.
pub async fn soft_delete_transcript(store: &dyn Store, id: &str) -> Result<bool> {
    let deleted = store.soft_delete_transcript(id, now_ms()).await?;
    if deleted {
        tracing::info!(transcript_id = id, "transcript soft-deleted");
    }
    Ok(deleted)
}

pub async fn run_status(config: &Config, transcript_id: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let report = status_report(&store, transcript_id).await?;

    println!("Transcript Retrieval — Indexing Status");
    println!("======================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    if let Some(id) = transcript_id {
        println!("  Transcript:  {}", id);
    }
    println!();
    println!("  {:<12} {:>12} {:>10}", "STATUS", "TRANSCRIPTS", "CHUNKS");
    println!("  {}", "-".repeat(36));
    for status in ExtractionStatus::ALL {
        println!(
            "  {:<12} {:>12} {:>10}",
            status.as_str(),
            report.transcripts.get(status),
            report.chunks.get(status)
        );
    }
    println!("  {}", "-".repeat(36));
    println!(
        "  {:<12} {:>12} {:>10}",
        "total",
        report.transcripts.total(),
        report.chunks.total()
    );
    println!("  Retrievable: {}", coverage(&report.chunks));

    if !report.failed.is_empty() {
        println!();
        println!("  Failed chunks:");
        println!(
            "  {:<36} {:>5} {:>8}   {:<16}  {}",
            "TRANSCRIPT", "INDEX", "ATTEMPTS", "UPDATED", "LAST ERROR"
        );
        println!("  {}", "-".repeat(96));
        for f in &report.failed {
            println!(
                "  {:<36} {:>5} {:>8}   {:<16}  {}",
                f.transcript_id,
                f.chunk_index,
                f.attempts,
                format_ts_iso(f.updated_at),
                f.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

pub async fn run_requeue(config: &Config, transcript_id: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let counts = requeue_failed(&store, transcript_id).await?;

    println!("requeue");
    println!("  transcripts: {}", counts.transcripts);
    println!("  chunks: {}", counts.chunks);
    println!("ok");

    pool.close().await;
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let deleted = soft_delete_transcript(&store, id).await?;
    pool.close().await;

    if !deleted {
        bail!("transcript not found or already deleted: {}", id);
    }
    println!("deleted {}", id);
    Ok(())
}

/// `completed / total` as a percentage string.
fn coverage(chunks: &StatusCounts) -> String {
    let total = chunks.total();
    let pct = if total > 0 {
        (chunks.completed * 100) / total
    } else {
        0
    };
    format!("{} / {} ({}%)", chunks.completed, total, pct)
}

fn format_ts_iso(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}
