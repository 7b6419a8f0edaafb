//! Periodic sweep for time-triggered transitions.
//!
//! One loop covers three scans: funded escrows whose scheduled release
//! time elapsed, pending escrows whose funding window expired, and
//! active disputes past their evidence deadline. Every action funnels
//! through the same conditional-update transition paths as manual
//! requests, so running multiple sweep instances concurrently is safe:
//! a second application of the same item loses the CAS and is skipped.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::SweepConfig;
use crate::db::DbPool;
use crate::error::{CoreError, CoreResult};
use crate::models::{Dispute, Escrow};
use crate::services::dispute::DisputeService;
use crate::services::escrow::EscrowService;

/// Counters from one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub released: usize,
    pub expired_cancelled: usize,
    pub disputes_escalated: usize,
    /// Items that failed and will be retried next cycle.
    pub errors: usize,
}

pub struct ReleaseMonitor {
    pool: DbPool,
    config: SweepConfig,
    escrow: Arc<EscrowService>,
    dispute: Arc<DisputeService>,
}

impl ReleaseMonitor {
    pub fn new(
        pool: DbPool,
        config: SweepConfig,
        escrow: Arc<EscrowService>,
        dispute: Arc<DisputeService>,
    ) -> Self {
        info!(
            poll_interval_secs = config.poll_interval.as_secs(),
            batch_limit = config.batch_limit,
            "ReleaseMonitor initialized"
        );
        Self {
            pool,
            config,
            escrow,
            dispute,
        }
    }

    /// Run the sweep loop until `shutdown` flips to `true`. Spawn this
    /// on the runtime once at startup.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut poll_timer = interval(self.config.poll_interval);

        info!("Starting release monitor loop");

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    match self.run_once().await {
                        Ok(stats) if stats != SweepStats::default() => {
                            info!(
                                released = stats.released,
                                expired_cancelled = stats.expired_cancelled,
                                disputes_escalated = stats.disputes_escalated,
                                errors = stats.errors,
                                "Sweep cycle applied transitions"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Release monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full sweep cycle. Per-item failures are counted and logged,
    /// never fatal; the item is retried next cycle.
    pub async fn run_once(&self) -> CoreResult<SweepStats> {
        let mut stats = SweepStats::default();

        self.sweep_due_releases(&mut stats).await?;
        self.sweep_expired_pending(&mut stats).await?;
        self.sweep_dispute_deadlines(&mut stats).await?;

        Ok(stats)
    }

    async fn sweep_due_releases(&self, stats: &mut SweepStats) -> CoreResult<()> {
        let pool = self.pool.clone();
        let limit = self.config.batch_limit;
        let now = chrono::Utc::now().naive_utc();
        let due = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::find_due_for_release(&mut conn, now, limit)
        })
        .await
        .context("Task join error")??;

        for escrow in due {
            match self.escrow.release_scheduled(&escrow.id).await {
                Ok(_) => stats.released += 1,
                // Another instance (or a manual caller) won the
                // transition between the scan and this call.
                Err(e) if e.is_rejection() => {
                    warn!(escrow_id = %escrow.id, error = %e, "Scheduled release skipped");
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(escrow_id = %escrow.id, error = %e, "Scheduled release failed");
                }
            }
        }

        Ok(())
    }

    async fn sweep_expired_pending(&self, stats: &mut SweepStats) -> CoreResult<()> {
        let pool = self.pool.clone();
        let limit = self.config.batch_limit;
        let now = chrono::Utc::now().naive_utc();
        let expired = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::find_expired_pending(&mut conn, now, limit)
        })
        .await
        .context("Task join error")??;

        for escrow in expired {
            match self.escrow.cancel_expired(&escrow.id).await {
                Ok(_) => stats.expired_cancelled += 1,
                Err(e) if e.is_rejection() => {
                    warn!(escrow_id = %escrow.id, error = %e, "Expiry cancellation skipped");
                }
                Err(e) => {
                    stats.errors += 1;
                    error!(escrow_id = %escrow.id, error = %e, "Expiry cancellation failed");
                }
            }
        }

        Ok(())
    }

    async fn sweep_dispute_deadlines(&self, stats: &mut SweepStats) -> CoreResult<()> {
        // Without an evidence window there are no deadlines to expire.
        if self.config.evidence_window.is_none() {
            return Ok(());
        }

        let pool = self.pool.clone();
        let limit = self.config.batch_limit;
        let now = chrono::Utc::now().naive_utc();
        let overdue = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Dispute::find_deadline_passed(&mut conn, now, limit)
        })
        .await
        .context("Task join error")??;

        for dispute in overdue {
            match self.dispute.escalate_expired(&dispute.id).await {
                Ok(_) => stats.disputes_escalated += 1,
                Err(e @ CoreError::Storage(_)) => {
                    stats.errors += 1;
                    error!(dispute_id = %dispute.id, error = %e, "Dispute escalation failed");
                }
                Err(e) => {
                    warn!(dispute_id = %dispute.id, error = %e, "Dispute escalation skipped");
                }
            }
        }

        Ok(())
    }
}
