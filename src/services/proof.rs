//! Delivery-proof workflow: submission by the obligated party, review
//! by the counterparty.
//!
//! Review is one-shot. Acceptance on a milestone proof completes that
//! milestone (in sequence order); acceptance of the final open
//! milestone, or of any proof on a milestone-less escrow, authorizes
//! release. The caller still triggers the release itself.

use std::sync::Arc;

use anyhow::Context;
use diesel::Connection;
use tracing::info;

use crate::crypto::FieldCodec;
use crate::db::DbPool;
use crate::error::{CoreError, CoreResult};
use crate::models::transaction_log::event_types;
use crate::models::{
    ActorType, DeliveryProof, Escrow, EscrowStatus, LogAction, Milestone, MilestoneStatus,
    NewDeliveryProof, PartyRole, ProofKind, ProofStatus, TransactionLogBuilder,
};
use crate::services::notifier::{CoreEvent, Notifier};
use crate::services::transaction_log::TransactionLogService;
use crate::services::{encrypt_field, RequestContext};

#[derive(Debug, Clone)]
pub struct SubmitProofInput {
    pub escrow_id: String,
    pub submitted_by: String,
    pub kind: ProofKind,
    pub description: Option<String>,
    pub files: Vec<String>,
    /// Restricts the proof to one milestone; omit for whole-escrow
    /// delivery.
    pub milestone_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Reject,
}

impl ReviewDecision {
    fn verdict(&self) -> ProofStatus {
        match self {
            ReviewDecision::Accept => ProofStatus::Accepted,
            ReviewDecision::Reject => ProofStatus::Rejected,
        }
    }
}

/// Result of a review, including whether the escrow is now clear for
/// release.
#[derive(Debug, Clone)]
pub struct ProofReview {
    pub proof: DeliveryProof,
    pub release_authorized: bool,
}

enum ReviewTxOutcome {
    AlreadyReviewed,
    OutOfOrder,
    Done {
        milestone_completed: bool,
        all_milestones_complete: bool,
    },
}

pub struct ProofService {
    pool: DbPool,
    codec: Arc<FieldCodec>,
    log: TransactionLogService,
    notifier: Arc<dyn Notifier>,
}

impl ProofService {
    pub fn new(
        pool: DbPool,
        codec: Arc<FieldCodec>,
        log: TransactionLogService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            codec,
            log,
            notifier,
        }
    }

    /// Submit evidence of delivery. Only the seller of a funded escrow
    /// may submit; rejected proofs may be followed by new submissions.
    pub async fn submit(
        &self,
        input: SubmitProofInput,
        ctx: &RequestContext,
    ) -> CoreResult<DeliveryProof> {
        let escrow = self.load_escrow(&input.escrow_id).await?;

        let status = escrow.current_status()?;
        if status != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                &escrow.id,
                &escrow.status,
                "submit delivery proof",
            ));
        }

        match escrow.party_role(&input.submitted_by) {
            Some(PartyRole::Seller) => {}
            _ => {
                return Err(CoreError::not_counterparty(
                    &input.submitted_by,
                    "submit delivery proof for this escrow",
                ));
            }
        }

        if let Some(milestone_id) = &input.milestone_id {
            let milestone = self.load_milestone(milestone_id).await?;
            if milestone.escrow_id != escrow.id {
                return Err(CoreError::validation(format!(
                    "milestone {} does not belong to escrow {}",
                    milestone_id, escrow.id
                )));
            }
            if milestone.current_status()? != MilestoneStatus::Pending {
                return Err(CoreError::invalid_state(
                    "milestone",
                    milestone_id,
                    &milestone.status,
                    "attach a delivery proof",
                ));
            }
        }

        let description_enc = match &input.description {
            Some(description) => Some(encrypt_field(&self.codec, "proof description", description)?),
            None => None,
        };

        let new_proof = NewDeliveryProof {
            escrow_id: escrow.id.clone(),
            milestone_id: input.milestone_id.clone(),
            submitted_by: input.submitted_by.clone(),
            kind: input.kind.as_str().to_string(),
            description_enc,
            files: serde_json::to_string(&input.files).unwrap_or_else(|_| "[]".to_string()),
            metadata: input.metadata.as_ref().map(|m| m.to_string()),
            ..NewDeliveryProof::default()
        };

        let pool = self.pool.clone();
        let proof = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            DeliveryProof::create(&mut conn, &new_proof)
        })
        .await
        .context("Task join error")??;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::PROOF_SUBMITTED, LogAction::Submit)
                    .actor(&input.submitted_by, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data("proof_id", serde_json::json!(proof.id))
                    .data("kind", serde_json::json!(proof.kind))
                    .data("milestone_id", serde_json::json!(proof.milestone_id)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::ProofSubmitted {
            escrow_id: escrow.id.clone(),
            proof_id: proof.id.clone(),
        });

        info!(
            escrow_id = %escrow.id,
            proof_id = %proof.id,
            submitted_by = %input.submitted_by,
            "Delivery proof submitted"
        );

        Ok(proof)
    }

    /// Review a pending proof. Only the counterparty of the submitter
    /// may review, exactly once; rejections must state a reason.
    pub async fn review(
        &self,
        proof_id: &str,
        reviewer_id: &str,
        decision: ReviewDecision,
        rejection_reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<ProofReview> {
        let proof = self.load_proof(proof_id).await?;
        let escrow = self.load_escrow(&proof.escrow_id).await?;

        if proof.current_status()? != ProofStatus::Pending {
            return Err(CoreError::invalid_state(
                "delivery proof",
                &proof.id,
                &proof.status,
                "review",
            ));
        }

        // The submitter's counterparty is the only valid reviewer.
        let submitter_role = escrow.party_role(&proof.submitted_by).ok_or_else(|| {
            CoreError::validation(format!(
                "proof {} submitter is not a party to escrow {}",
                proof.id, escrow.id
            ))
        })?;
        if reviewer_id != escrow.counterparty_of(submitter_role) {
            return Err(CoreError::not_counterparty(
                reviewer_id,
                "review this delivery proof",
            ));
        }

        let reason = match decision {
            ReviewDecision::Reject => {
                let reason = rejection_reason.as_deref().map(str::trim).unwrap_or("");
                if reason.is_empty() {
                    return Err(CoreError::validation(
                        "a rejection reason is required when rejecting a proof",
                    ));
                }
                Some(reason.to_string())
            }
            ReviewDecision::Accept => None,
        };

        // Milestone bookkeeping needs the sequence number for the
        // order check inside the transaction.
        let milestone = match (&proof.milestone_id, decision) {
            (Some(milestone_id), ReviewDecision::Accept) => {
                Some(self.load_milestone(milestone_id).await?)
            }
            _ => None,
        };

        let pool = self.pool.clone();
        let tx_proof_id = proof.id.clone();
        let tx_escrow_id = escrow.id.clone();
        let tx_reviewer = reviewer_id.to_string();
        let tx_reason = reason.clone();
        let tx_milestone = milestone.as_ref().map(|m| (m.id.clone(), m.sequence_no));
        let verdict = decision.verdict();
        let accepted = decision == ReviewDecision::Accept;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            conn.transaction::<_, anyhow::Error, _>(|conn| {
                if let Some((_, sequence_no)) = &tx_milestone {
                    let open = Milestone::open_predecessors(conn, &tx_escrow_id, *sequence_no)?;
                    if open > 0 {
                        return Ok(ReviewTxOutcome::OutOfOrder);
                    }
                }

                let rows = DeliveryProof::mark_reviewed(
                    conn,
                    &tx_proof_id,
                    verdict,
                    &tx_reviewer,
                    tx_reason.as_deref(),
                )?;
                if rows == 0 {
                    return Ok(ReviewTxOutcome::AlreadyReviewed);
                }

                let mut milestone_completed = false;
                if let Some((milestone_id, _)) = &tx_milestone {
                    milestone_completed = Milestone::mark_completed(conn, milestone_id)? == 1;
                }

                let all_milestones_complete = Milestone::all_completed(conn, &tx_escrow_id)?;

                Ok(ReviewTxOutcome::Done {
                    milestone_completed,
                    all_milestones_complete,
                })
            })
        })
        .await
        .context("Task join error")??;

        let (milestone_completed, release_authorized) = match outcome {
            ReviewTxOutcome::AlreadyReviewed => {
                let current = self.load_proof(proof_id).await?;
                return Err(CoreError::invalid_state(
                    "delivery proof",
                    proof_id,
                    &current.status,
                    "review",
                ));
            }
            ReviewTxOutcome::OutOfOrder => {
                return Err(CoreError::validation(
                    "earlier milestones must be completed before this one",
                ));
            }
            ReviewTxOutcome::Done {
                milestone_completed,
                all_milestones_complete,
            } => (milestone_completed, accepted && all_milestones_complete),
        };

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::PROOF_REVIEWED, LogAction::Review)
                    .actor(reviewer_id, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data("proof_id", serde_json::json!(proof.id))
                    .data("decision", serde_json::json!(verdict.as_str()))
                    .data("rejection_reason", serde_json::json!(reason))
                    .data("release_authorized", serde_json::json!(release_authorized)),
            ))
            .await?;

        if milestone_completed {
            let milestone_id = milestone.as_ref().map(|m| m.id.clone()).unwrap_or_default();
            self.log
                .record(
                    TransactionLogBuilder::new(event_types::MILESTONE_UPDATED, LogAction::Update)
                        .actor(reviewer_id, ActorType::User)
                        .entity("escrow", &escrow.id)
                        .data("milestone_id", serde_json::json!(milestone_id))
                        .data("status", serde_json::json!("completed")),
                )
                .await?;

            self.notifier.notify(CoreEvent::MilestoneCompleted {
                escrow_id: escrow.id.clone(),
                milestone_id,
            });
        }

        self.notifier.notify(CoreEvent::ProofReviewed {
            escrow_id: escrow.id.clone(),
            proof_id: proof.id.clone(),
            accepted,
        });

        info!(
            escrow_id = %escrow.id,
            proof_id = %proof.id,
            decision = %verdict.as_str(),
            release_authorized = release_authorized,
            "Delivery proof reviewed"
        );

        let proof = self.load_proof(proof_id).await?;
        Ok(ProofReview {
            proof,
            release_authorized,
        })
    }

    /// All proofs of an escrow with their descriptions decrypted for
    /// display. Unreadable fields degrade to the sentinel.
    pub async fn proofs_for_escrow(
        &self,
        escrow_id: &str,
    ) -> CoreResult<Vec<(DeliveryProof, Option<String>)>> {
        let pool = self.pool.clone();
        let id = escrow_id.to_string();
        let proofs = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            DeliveryProof::for_escrow(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        Ok(proofs
            .into_iter()
            .map(|proof| {
                let description = proof
                    .description_enc
                    .as_deref()
                    .map(|enc| self.codec.decrypt_or_sentinel(enc));
                (proof, description)
            })
            .collect())
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

    async fn load_proof(&self, proof_id: &str) -> CoreResult<DeliveryProof> {
        let pool = self.pool.clone();
        let id = proof_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            DeliveryProof::find_optional(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("delivery proof {} not found", proof_id)))
    }

    async fn load_milestone(&self, milestone_id: &str) -> CoreResult<Milestone> {
        let pool = self.pool.clone();
        let id = milestone_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Milestone::find_by_id(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("milestone {} not found", milestone_id)))
    }
}
