//! ReaperLoop - 放置された claim の回収
//!
//! producer が claim 後、結果を書く前に落ちると行は Producing のまま残る。
//! `claim_timeout` より古い claim を Error（即時再試行可）に戻して、
//! 別の producer が拾えるようにする。
//!
//! # フロー
//! 1. cutoff = now - claim_timeout
//! 2. `OutboxStore::reclaim_stale(cutoff, now)`
//! 3. interval だけ待って繰り返す

use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ReaperConfig;
use crate::domain::{HeraldError, OutboxId};
use crate::ports::{Clock, OutboxStore};

pub struct ReaperLoop {
    store: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn OutboxStore>, clock: Arc<dyn Clock>, config: ReaperConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<Vec<OutboxId>, HeraldError> {
        let timeout = TimeDelta::from_std(self.config.claim_timeout)
            .map_err(|e| HeraldError::Config(format!("claim_timeout: {e}")))?;
        let now = self.clock.now();
        let released = self.store.reclaim_stale(now - timeout, now).await?;
        for id in &released {
            warn!(outbox_id = %id, "Released stale claim");
        }
        Ok(released)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), HeraldError> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            claim_timeout_ms = self.config.claim_timeout.as_millis() as u64,
            "Reaper loop started"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            match self.run_once().await {
                Ok(released) if !released.is_empty() => {
                    info!(released = released.len(), "Reaper cycle finished");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Reaper loop stopping");
                    break Err(e);
                }
                Err(e) => warn!(error = %e, "Reaper cycle failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        };

        info!("Reaper loop stopped");
        result
    }
}
