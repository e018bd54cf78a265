//! Stale-claim recovery.
//!
//! A claim that never resolves (a worker crashed, or hung past every
//! timeout) stays `processing` forever. The watchdog releases such claims
//! back to `pending` so ordinary processing picks them up again. It never
//! marks anything failed or completed, and it only touches status fields.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use transcript_retrieval_core::models::now_ms;
use transcript_retrieval_core::store::{ReclaimedClaim, Store};

use crate::config::{Config, WatchdogConfig};
use crate::db;
use crate::sqlite_store::SqliteStore;

pub struct Watchdog {
    store: Arc<dyn Store>,
    stale_after: Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(store: Arc<dyn Store>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            store,
            stale_after,
            interval,
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &WatchdogConfig) -> Self {
        Self::new(store, config.stale_after(), config.interval())
    }

    /// Reclaim every claim whose last update is strictly older than
    /// `now - stale_after`.
    pub async fn run_once(&self, now: i64) -> Result<Vec<ReclaimedClaim>> {
        let stale_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(stale_ms);
        let reclaimed = self.store.reclaim_stale(cutoff, now).await?;
        for claim in &reclaimed {
            tracing::warn!(
                kind = ?claim.kind,
                id = %claim.id,
                transcript_id = %claim.transcript_id,
                previous_status = %claim.previous_status,
                stuck_ms = claim.stuck_ms,
                "reclaimed stale claim"
            );
        }
        Ok(reclaimed)
    }

    /// Tick every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            stale_after_secs = self.stale_after.as_secs(),
            interval_secs = self.interval.as_secs(),
            "watchdog started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(now_ms()).await {
                        tracing::error!(error = %format!("{:#}", e), "watchdog pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("watchdog stopped");
        Ok(())
    }
}

/// CLI entry point: one reclaim pass, or run until `shutdown` fires.
pub async fn run_watchdog(
    config: &Config,
    once: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let watchdog = Watchdog::from_config(store, &config.watchdog);

    if once {
        let reclaimed = watchdog.run_once(now_ms()).await?;
        println!("watchdog");
        println!("  reclaimed: {}", reclaimed.len());
        for claim in &reclaimed {
            println!(
                "  {:?} {} (transcript {}) stuck {} ms",
                claim.kind, claim.id, claim.transcript_id, claim.stuck_ms
            );
        }
        println!("ok");
    } else {
        watchdog.run(shutdown).await?;
    }

    pool.close().await;
    Ok(())
}
