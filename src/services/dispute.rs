//! Dispute subsystem: filing, evidence, escalation, resolution.
//!
//! Filing freezes the escrow in DISPUTED; resolution drives the escrow
//! state machine (release for merchant favor, refund for customer favor,
//! or a split settlement) and only then closes the dispute. The escrow
//! CAS out of DISPUTED is the exactly-once guard for concurrent
//! resolvers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use diesel::Connection;
use tracing::{info, warn};

use crate::crypto::FieldCodec;
use crate::db::DbPool;
use crate::error::{CoreError, CoreResult};
use crate::models::transaction_log::event_types;
use crate::models::{
    ActorType, Dispute, DisputeEvidence, DisputeStatus, Escrow, EscrowStatus, LogAction,
    Milestone, NewDispute, NewDisputeEvidence, TransactionLogBuilder,
};
use crate::services::escrow::EscrowService;
use crate::services::notifier::{CoreEvent, Notifier};
use crate::services::transaction_log::TransactionLogService;
use crate::services::{decrypt_field, encrypt_field, RequestContext};

#[derive(Debug, Clone)]
pub struct FileDisputeInput {
    pub escrow_id: String,
    pub filed_by: String,
    /// Short machine-friendly reason, e.g. `goods_not_received`.
    pub reason: String,
    /// Free-text description, encrypted before persistence.
    pub description: Option<String>,
    /// File references submitted with the filing.
    pub evidence: Vec<String>,
}

/// Arbiter verdict on a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// Seller keeps the funds; the escrow is released.
    Merchant,
    /// Buyer gets the funds back; the escrow is refunded.
    Customer,
    /// Both sides get a share; the escrow completes without a full
    /// release or refund.
    Split {
        buyer_amount: i64,
        seller_amount: i64,
    },
}

impl DisputeOutcome {
    fn resolution_str(&self) -> &'static str {
        match self {
            DisputeOutcome::Merchant => "merchant",
            DisputeOutcome::Customer => "customer",
            DisputeOutcome::Split { .. } => "split",
        }
    }

    fn resolved_status(&self) -> DisputeStatus {
        match self {
            DisputeOutcome::Merchant => DisputeStatus::ResolvedForMerchant,
            DisputeOutcome::Customer => DisputeStatus::ResolvedForCustomer,
            // Splits close directly.
            DisputeOutcome::Split { .. } => DisputeStatus::Closed,
        }
    }
}

pub struct DisputeService {
    pool: DbPool,
    codec: Arc<FieldCodec>,
    log: TransactionLogService,
    notifier: Arc<dyn Notifier>,
    escrow: Arc<EscrowService>,
    /// Window granted to both sides for supporting material; `None`
    /// disables deadlines and automatic escalation.
    evidence_window: Option<Duration>,
}

impl DisputeService {
    pub fn new(
        pool: DbPool,
        codec: Arc<FieldCodec>,
        log: TransactionLogService,
        notifier: Arc<dyn Notifier>,
        escrow: Arc<EscrowService>,
        evidence_window: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            codec,
            log,
            notifier,
            escrow,
            evidence_window,
        }
    }

    /// Contest a FUNDED escrow. Only the buyer or seller may file; the
    /// escrow moves to DISPUTED and open milestones freeze.
    pub async fn file(&self, input: FileDisputeInput, ctx: &RequestContext) -> CoreResult<Dispute> {
        if input.reason.trim().is_empty() {
            return Err(CoreError::validation("a dispute reason is required"));
        }

        let escrow = self.load_escrow(&input.escrow_id).await?;
        let role = escrow
            .party_role(&input.filed_by)
            .ok_or_else(|| CoreError::not_counterparty(&input.filed_by, "file a dispute"))?;

        if escrow.current_status()? != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                &escrow.id,
                &escrow.status,
                "file a dispute",
            ));
        }

        let description_enc = match &input.description {
            Some(description) => {
                Some(encrypt_field(&self.codec, "dispute description", description)?)
            }
            None => None,
        };

        let evidence_deadline = self.evidence_window.map(|window| {
            chrono::Utc::now().naive_utc()
                + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(72))
        });

        let new_dispute = NewDispute {
            escrow_id: escrow.id.clone(),
            filed_by: input.filed_by.clone(),
            filer_role: role.as_str().to_string(),
            reason: input.reason.clone(),
            description_enc,
            evidence_deadline,
            ..NewDispute::default()
        };

        let evidence_rows: Vec<NewDisputeEvidence> = input
            .evidence
            .iter()
            .map(|file| {
                NewDisputeEvidence::new(&new_dispute.id, &input.filed_by, role.as_str(), file, None)
            })
            .collect();

        let pool = self.pool.clone();
        let escrow_id = escrow.id.clone();
        let dispute = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            conn.transaction::<_, anyhow::Error, _>(|conn| {
                // The CAS on the escrow row arbitrates concurrent filings.
                if Escrow::mark_disputed(conn, &escrow_id)? == 0 {
                    return Ok(None);
                }
                let dispute = Dispute::create(conn, &new_dispute)?;
                for row in &evidence_rows {
                    DisputeEvidence::create(conn, row)?;
                }
                Milestone::mark_open_disputed(conn, &escrow_id)?;
                Ok(Some(dispute))
            })
        })
        .await
        .context("Task join error")??;

        let dispute = match dispute {
            Some(dispute) => dispute,
            None => {
                let current = self.load_escrow(&input.escrow_id).await?;
                return Err(CoreError::invalid_state(
                    "escrow",
                    &input.escrow_id,
                    &current.status,
                    "file a dispute",
                ));
            }
        };

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_DISPUTED, LogAction::Dispute)
                    .actor(&input.filed_by, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data("dispute_id", serde_json::json!(dispute.id))
                    .data("reason", serde_json::json!(input.reason)),
            ))
            .await?;
        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::DISPUTE_CREATED, LogAction::Create)
                    .actor(&input.filed_by, ActorType::User)
                    .entity("dispute", &dispute.id)
                    .data("escrow_id", serde_json::json!(escrow.id))
                    .data("filer_role", serde_json::json!(role.as_str()))
                    .data("evidence_files", serde_json::json!(input.evidence.len())),
            ))
            .await?;

        self.notifier.notify(CoreEvent::DisputeFiled {
            escrow_id: escrow.id.clone(),
            dispute_id: dispute.id.clone(),
        });

        info!(
            escrow_id = %escrow.id,
            dispute_id = %dispute.id,
            filed_by = %input.filed_by,
            reason = %input.reason,
            "Dispute filed"
        );

        Ok(dispute)
    }

    /// Add supporting material while the dispute is active and the
    /// evidence window is open. Either party may submit.
    pub async fn submit_evidence(
        &self,
        dispute_id: &str,
        uploader_id: &str,
        file_name: &str,
        description: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<DisputeEvidence> {
        let dispute = self.load_dispute(dispute_id).await?;
        let escrow = self.load_escrow(&dispute.escrow_id).await?;

        let role = escrow
            .party_role(uploader_id)
            .ok_or_else(|| CoreError::not_counterparty(uploader_id, "submit dispute evidence"))?;

        if !dispute.current_status()?.is_active() {
            return Err(CoreError::invalid_state(
                "dispute",
                &dispute.id,
                &dispute.status,
                "submit evidence",
            ));
        }
        if let Some(deadline) = dispute.evidence_deadline {
            if chrono::Utc::now().naive_utc() > deadline {
                return Err(CoreError::validation(
                    "the evidence window for this dispute has closed",
                ));
            }
        }

        let row = NewDisputeEvidence::new(
            &dispute.id,
            uploader_id,
            role.as_str(),
            file_name,
            description,
        );

        let pool = self.pool.clone();
        let evidence = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            DisputeEvidence::create(&mut conn, &row)
        })
        .await
        .context("Task join error")??;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::DISPUTE_EVIDENCE_ADDED, LogAction::Submit)
                    .actor(uploader_id, ActorType::User)
                    .entity("dispute", &dispute.id)
                    .data("file_name", serde_json::json!(evidence.file_name)),
            ))
            .await?;

        info!(
            dispute_id = %dispute.id,
            uploader = %uploader_id,
            "Dispute evidence submitted"
        );

        Ok(evidence)
    }

    /// Take a dispute into administrative review.
    pub async fn begin_review(
        &self,
        dispute_id: &str,
        reviewer_id: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Dispute> {
        let dispute = self.load_dispute(dispute_id).await?;

        let pool = self.pool.clone();
        let id = dispute.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Dispute::transition(&mut conn, &id, DisputeStatus::Open, DisputeStatus::UnderReview)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_dispute(dispute_id).await?;
            return Err(CoreError::invalid_state(
                "dispute",
                dispute_id,
                &current.status,
                "begin review",
            ));
        }

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::DISPUTE_REVIEW_STARTED, LogAction::Review)
                    .actor(reviewer_id, ActorType::Arbiter)
                    .entity("dispute", &dispute.id)
                    .data("status", serde_json::json!("under_review")),
            ))
            .await?;

        self.load_dispute(dispute_id).await
    }

    /// Resolve a dispute. Terminal and exactly-once: the outcome drives
    /// the escrow state machine first, then the dispute closes with
    /// `resolved_at` stamped.
    pub async fn resolve(
        &self,
        dispute_id: &str,
        resolver_id: &str,
        outcome: DisputeOutcome,
        notes: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Dispute> {
        let dispute = self.load_dispute(dispute_id).await?;
        let escrow = self.load_escrow(&dispute.escrow_id).await?;

        // Arbitration is third-party work; the contestants cannot
        // resolve their own dispute.
        if escrow.party_role(resolver_id).is_some() {
            return Err(CoreError::not_counterparty(resolver_id, "resolve this dispute"));
        }

        let status = dispute.current_status()?;
        if !status.is_active() {
            return Err(CoreError::invalid_state(
                "dispute",
                dispute_id,
                &dispute.status,
                "resolve",
            ));
        }

        if let DisputeOutcome::Split {
            buyer_amount,
            seller_amount,
        } = outcome
        {
            if buyer_amount < 0 || seller_amount < 0 {
                return Err(CoreError::validation("split amounts must be non-negative"));
            }
            // Arbiter-supplied values; the sum itself can overflow.
            if buyer_amount.checked_add(seller_amount) != Some(escrow.amount) {
                return Err(CoreError::validation(format!(
                    "split amounts ({} + {}) must equal the escrow amount ({})",
                    buyer_amount, seller_amount, escrow.amount
                )));
            }
        }

        // Settle the escrow first. Its CAS out of DISPUTED makes a
        // concurrent second resolution fail here with InvalidEscrowState
        // before any dispute row is touched.
        match outcome {
            DisputeOutcome::Merchant => {
                self.escrow
                    .resolve_release(&escrow.id, resolver_id, ctx)
                    .await?;
            }
            DisputeOutcome::Customer => {
                self.escrow
                    .resolve_refund(
                        &escrow.id,
                        resolver_id,
                        Some(format!("dispute {} resolved for customer", dispute.id)),
                        ctx,
                    )
                    .await?;
            }
            DisputeOutcome::Split {
                buyer_amount,
                seller_amount,
            } => {
                self.escrow
                    .resolve_split(&escrow.id, resolver_id, buyer_amount, seller_amount, ctx)
                    .await?;
            }
        }

        let resolution = outcome.resolution_str();
        let resolved_status = outcome.resolved_status();
        let split = match outcome {
            DisputeOutcome::Split {
                buyer_amount,
                seller_amount,
            } => Some((buyer_amount, seller_amount)),
            _ => None,
        };

        let pool = self.pool.clone();
        let id = dispute.id.clone();
        let resolver = resolver_id.to_string();
        let tx_notes = notes.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            conn.transaction::<_, anyhow::Error, _>(|conn| {
                // Open disputes hop through under_review so the recorded
                // history follows the state graph.
                Dispute::transition(conn, &id, DisputeStatus::Open, DisputeStatus::UnderReview)?;

                let current = Dispute::find_optional(conn, &id)?
                    .ok_or_else(|| anyhow::anyhow!("dispute vanished during resolution"))?;
                let from = DisputeStatus::from_str(&current.status)
                    .ok_or_else(|| anyhow::anyhow!("dispute has unknown status"))?;

                Dispute::record_resolution(
                    conn,
                    &id,
                    from,
                    resolved_status,
                    resolution,
                    &resolver,
                    tx_notes.as_deref(),
                    split,
                )?;

                if resolved_status == DisputeStatus::Closed {
                    Dispute::stamp_resolved_at(conn, &id)?;
                } else {
                    Dispute::close(conn, &id, resolved_status)?;
                }
                Ok(())
            })
        })
        .await
        .context("Task join error")??;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::DISPUTE_RESOLVED, LogAction::Resolve)
                    .actor(resolver_id, ActorType::Arbiter)
                    .entity("dispute", &dispute.id)
                    .data("escrow_id", serde_json::json!(escrow.id))
                    .data("resolution", serde_json::json!(resolution))
                    .data("notes", serde_json::json!(notes))
                    .data(
                        "split",
                        serde_json::json!(split.map(|(b, s)| serde_json::json!({
                            "buyer_amount": b,
                            "seller_amount": s,
                        }))),
                    ),
            ))
            .await?;

        self.notifier.notify(CoreEvent::DisputeResolved {
            escrow_id: escrow.id.clone(),
            dispute_id: dispute.id.clone(),
            resolution: resolution.to_string(),
        });

        info!(
            dispute_id = %dispute.id,
            escrow_id = %escrow.id,
            resolution = %resolution,
            resolver = %resolver_id,
            "Dispute resolved"
        );

        self.load_dispute(dispute_id).await
    }

    /// Sweep-triggered escalation of a dispute whose evidence deadline
    /// passed without resolution.
    pub(crate) async fn escalate_expired(&self, dispute_id: &str) -> CoreResult<Dispute> {
        let dispute = self.load_dispute(dispute_id).await?;

        let pool = self.pool.clone();
        let id = dispute.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Dispute::mark_escalated(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            // Resolved or escalated between the scan and this call.
            let current = self.load_dispute(dispute_id).await?;
            warn!(
                dispute_id = %dispute_id,
                status = %current.status,
                "Skipping escalation, dispute already moved on"
            );
            return Ok(current);
        }

        self.log
            .record(
                TransactionLogBuilder::new(event_types::DISPUTE_ESCALATED, LogAction::Escalate)
                    .system_actor()
                    .entity("dispute", &dispute.id)
                    .data("escrow_id", serde_json::json!(dispute.escrow_id))
                    .data("reason", serde_json::json!("evidence deadline passed")),
            )
            .await?;

        info!(dispute_id = %dispute.id, "Dispute escalated after evidence deadline");

        self.load_dispute(dispute_id).await
    }

    /// The dispute currently blocking an escrow, if any.
    pub async fn dispute_for_escrow(&self, escrow_id: &str) -> CoreResult<Option<Dispute>> {
        let pool = self.pool.clone();
        let id = escrow_id.to_string();
        let dispute = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Dispute::latest_for_escrow(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        Ok(dispute)
    }

    /// Evidence rows with decrypted descriptions where present.
    pub async fn evidence_for_dispute(
        &self,
        dispute_id: &str,
    ) -> CoreResult<Vec<DisputeEvidence>> {
        let pool = self.pool.clone();
        let id = dispute_id.to_string();
        let evidence = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            DisputeEvidence::for_dispute(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        Ok(evidence)
    }

    /// The filed description, decrypted. Surfaces an unreadable envelope
    /// as a typed [`CoreError::DecryptionFailure`] for this field alone;
    /// the rest of the dispute row stays usable.
    pub fn decrypt_description(&self, dispute: &Dispute) -> CoreResult<Option<String>> {
        dispute
            .description_enc
            .as_deref()
            .map(|enc| decrypt_field(&self.codec, "dispute description", enc))
            .transpose()
    }

    async fn load_escrow(&self, escrow_id: &str) -> CoreResult<Escrow> {
        let pool = self.pool.clone();
        let id = escrow_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::find_optional(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("escrow {} not found", escrow_id)))
    }

    async fn load_dispute(&self, dispute_id: &str) -> CoreResult<Dispute> {
        let pool = self.pool.clone();
        let id = dispute_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Dispute::find_optional(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("dispute {} not found", dispute_id)))
    }
}
