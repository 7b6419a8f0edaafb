//! Serialized writer for the hash-chained transaction log.
//!
//! The chain head lives behind a mutex so concurrent writers append in
//! a strict order; without it two writers could seal against the same
//! `prev_hash` and fork the chain.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::error;

use crate::db::DbPool;
use crate::error::CoreResult;
use crate::models::{TransactionLogBuilder, TransactionLogEntry};

/// Outcome of a full chain verification.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub entries_checked: usize,
    pub broken_links: Vec<String>,
    pub checked_at: String,
}

#[derive(Clone)]
pub struct TransactionLogService {
    pool: DbPool,
    last_hash: Arc<Mutex<Option<String>>>,
}

impl TransactionLogService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            last_hash: Arc::new(Mutex::new(None)),
        }
    }

    /// Load the current chain head. Call once at startup; appends made
    /// before this see an empty chain.
    pub async fn initialize(&self) -> CoreResult<()> {
        let pool = self.pool.clone();
        let head = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            TransactionLogEntry::last_hash(&mut conn)
        })
        .await
        .context("Task join error")??;

        *self.last_hash.lock().await = head;
        Ok(())
    }

    /// Append one entry, chained to the current head.
    pub async fn record(&self, builder: TransactionLogBuilder) -> CoreResult<TransactionLogEntry> {
        let mut head = self.last_hash.lock().await;
        let prev = head.clone();
        let pool = self.pool.clone();

        let entry = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            builder.build(&mut conn, prev)
        })
        .await
        .context("Task join error")??;

        *head = Some(entry.record_hash.clone());
        Ok(entry)
    }

    /// Fire-and-forget append for paths where logging must not block
    /// the caller. Failures are logged, never propagated.
    pub fn record_async(&self, builder: TransactionLogBuilder) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.record(builder).await {
                error!(error = %e, "Failed to record transaction log entry");
            }
        });
    }

    /// Ordered history for one entity.
    pub async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> CoreResult<Vec<TransactionLogEntry>> {
        let pool = self.pool.clone();
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();

        let entries = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            TransactionLogEntry::find_by_entity(&mut conn, &entity_type, &entity_id)
        })
        .await
        .context("Task join error")??;

        Ok(entries)
    }

    pub async fn recent(&self, limit: i64) -> CoreResult<Vec<TransactionLogEntry>> {
        let pool = self.pool.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            TransactionLogEntry::recent(&mut conn, limit)
        })
        .await
        .context("Task join error")??;

        Ok(entries)
    }

    /// Re-walk the whole chain and report any broken entries.
    pub async fn verify_integrity(&self) -> CoreResult<IntegrityReport> {
        let pool = self.pool.clone();
        let (entries_checked, broken_links) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            TransactionLogEntry::verify_chain(&mut conn)
        })
        .await
        .context("Task join error")??;

        Ok(IntegrityReport {
            is_valid: broken_links.is_empty(),
            entries_checked,
            broken_links,
            checked_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}
