//! Escrow state machine orchestration.
//!
//! Owns every status transition. Each transition is a conditional UPDATE
//! keyed on the expected current status; settlement side effects (gateway
//! calls, audit entries, notifications) run only for the caller that won
//! the update, so a sweep/manual race applies them exactly once.

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDateTime;
use diesel::Connection;
use tracing::{error, info, warn};

use crate::crypto::FieldCodec;
use crate::db::DbPool;
use crate::error::{CoreError, CoreResult};
use crate::models::transaction_log::event_types;
use crate::models::{
    ActorType, DeliveryProof, Dispute, Escrow, EscrowStatus, LogAction, Milestone,
    MilestoneStatus, NewEscrow, NewMilestone, PartyRole, TransactionLogBuilder,
};
use crate::services::notifier::{CoreEvent, Notifier};
use crate::services::payment_gateway::PaymentGateway;
use crate::services::risk::{AssessmentInput, RiskEngine};
use crate::services::transaction_log::TransactionLogService;
use crate::services::{encrypt_field, RequestContext};

/// One milestone requested at escrow creation.
#[derive(Debug, Clone)]
pub struct MilestoneSpec {
    /// Release order; must be unique within the escrow.
    pub sequence_no: i32,
    /// Minor units.
    pub amount: i64,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateEscrowInput {
    pub buyer_id: String,
    pub seller_id: String,
    /// Minor units; must be positive.
    pub amount: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Free-form terms document, encrypted before persistence.
    pub terms: Option<serde_json::Value>,
    pub milestones: Vec<MilestoneSpec>,
    /// Funding must arrive before this time or the sweep cancels the
    /// escrow.
    pub expires_at: Option<NaiveDateTime>,
    /// Payment intent handed in by the embedder, forwarded to risk
    /// assessment.
    pub payment_id: Option<String>,
}

/// An escrow with its owned entities and decrypted display fields.
#[derive(Debug, Clone)]
pub struct EscrowDetail {
    pub escrow: Escrow,
    /// Decrypted terms, or the decryption-failure sentinel.
    pub terms: Option<String>,
    pub milestones: Vec<Milestone>,
    pub proofs: Vec<DeliveryProof>,
    pub dispute: Option<Dispute>,
}

pub struct EscrowService {
    pool: DbPool,
    codec: Arc<FieldCodec>,
    log: TransactionLogService,
    risk: Arc<RiskEngine>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
}

impl EscrowService {
    pub fn new(
        pool: DbPool,
        codec: Arc<FieldCodec>,
        log: TransactionLogService,
        risk: Arc<RiskEngine>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            codec,
            log,
            risk,
            gateway,
            notifier,
        }
    }

    /// Create an escrow in PENDING, gated by a risk assessment of the
    /// buyer. A blocked assessment fails the whole attempt.
    pub async fn create(
        &self,
        input: CreateEscrowInput,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        validate_create_input(&input)?;

        let assessment = self
            .risk
            .assess(AssessmentInput {
                user_id: input.buyer_id.clone(),
                payment_id: input.payment_id.clone(),
                amount: Some(input.amount),
                ip: ctx.ip.clone(),
                device_info: ctx.device_info.clone(),
                declared_region: ctx.declared_region.clone(),
            })
            .await?;

        if assessment.blocked {
            warn!(
                buyer_id = %input.buyer_id,
                assessment_id = %assessment.id,
                score = assessment.score(),
                "Escrow creation blocked by risk gate"
            );
            return Err(CoreError::RiskBlocked {
                score: assessment.score(),
                level: assessment.level,
                assessment_id: assessment.id,
            });
        }

        let terms_enc = match &input.terms {
            Some(terms) => Some(encrypt_field(&self.codec, "escrow terms", &terms.to_string())?),
            None => None,
        };

        let new_escrow = NewEscrow {
            buyer_id: input.buyer_id.clone(),
            seller_id: input.seller_id.clone(),
            amount: input.amount,
            title: input.title.clone(),
            description: input.description.clone(),
            terms_enc,
            payment_ref: input.payment_id.clone(),
            expires_at: input.expires_at,
            ..NewEscrow::default()
        };

        let new_milestones: Vec<NewMilestone> = input
            .milestones
            .iter()
            .map(|m| NewMilestone::new(&new_escrow.id, m.sequence_no, m.amount, &m.description))
            .collect();

        let pool = self.pool.clone();
        let escrow = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let escrow = Escrow::create(conn, &new_escrow)?;
                if !new_milestones.is_empty() {
                    Milestone::insert_all(conn, &new_milestones)?;
                }
                Ok(escrow)
            })
        })
        .await
        .context("Task join error")??;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_CREATED, LogAction::Create)
                    .actor(&input.buyer_id, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data("amount", serde_json::json!(escrow.amount))
                    .data("seller_id", serde_json::json!(escrow.seller_id))
                    .data("milestones", serde_json::json!(input.milestones.len()))
                    .data("risk_assessment_id", serde_json::json!(assessment.id)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: escrow.id.clone(),
            status: EscrowStatus::Pending,
        });

        info!(
            escrow_id = %escrow.id,
            buyer_id = %escrow.buyer_id,
            seller_id = %escrow.seller_id,
            amount = escrow.amount,
            "Escrow created"
        );

        Ok(escrow)
    }

    /// Record that the buyer's payment landed. PENDING only.
    pub async fn fund(
        &self,
        escrow_id: &str,
        payment_ref: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let payment = payment_ref.to_string();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::mark_funded(&mut conn, &id, Some(&payment))
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(escrow_id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &current.status,
                "fund",
            ));
        }

        let funded = self.load_escrow(escrow_id).await?;

        if let Err(e) = self.gateway.record_funding(&funded, payment_ref) {
            error!(escrow_id = %funded.id, error = %e, "Gateway funding record failed");
        }

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_FUNDED, LogAction::Fund)
                    .actor(&funded.buyer_id, ActorType::User)
                    .entity("escrow", &funded.id)
                    .data("amount", serde_json::json!(funded.amount))
                    .data("payment_ref", serde_json::json!(payment_ref)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: funded.id.clone(),
            status: EscrowStatus::Funded,
        });

        info!(escrow_id = %funded.id, payment_ref = %payment_ref, "Escrow funded");

        Ok(funded)
    }

    /// Release held funds to the seller. Buyer-initiated; requires every
    /// milestone completed. Idempotent when the escrow is already
    /// RELEASED so a manual call racing the sweep never errors.
    pub async fn release(
        &self,
        escrow_id: &str,
        actor_id: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        let status = escrow.current_status()?;

        if status == EscrowStatus::Released {
            return Ok(escrow);
        }
        if status != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &escrow.status,
                "release",
            ));
        }
        if escrow.party_role(actor_id) != Some(PartyRole::Buyer) {
            return Err(CoreError::not_counterparty(actor_id, "release this escrow"));
        }

        self.apply_release(escrow, EscrowStatus::Funded, actor_id, ActorType::User, ctx)
            .await
    }

    /// Sweep-triggered release of a FUNDED escrow whose scheduled time
    /// has elapsed. Same guards as [`release`](Self::release), system
    /// actor.
    pub(crate) async fn release_scheduled(&self, escrow_id: &str) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        let status = escrow.current_status()?;

        if status == EscrowStatus::Released {
            return Ok(escrow);
        }
        if status != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &escrow.status,
                "release",
            ));
        }

        self.apply_release(
            escrow,
            EscrowStatus::Funded,
            "system",
            ActorType::System,
            &RequestContext::default(),
        )
        .await
    }

    /// Return held funds to the buyer. Seller-initiated, FUNDED only;
    /// disputed refunds go through dispute resolution.
    pub async fn refund(
        &self,
        escrow_id: &str,
        actor_id: &str,
        reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        if escrow.current_status()? != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &escrow.status,
                "refund",
            ));
        }
        if escrow.party_role(actor_id) != Some(PartyRole::Seller) {
            return Err(CoreError::not_counterparty(actor_id, "refund this escrow"));
        }

        self.apply_refund(
            escrow,
            EscrowStatus::Funded,
            actor_id,
            ActorType::User,
            reason,
            ctx,
        )
        .await
    }

    /// Cancel before funding completes. Either party may back out of a
    /// PENDING escrow.
    pub async fn cancel(
        &self,
        escrow_id: &str,
        actor_id: &str,
        reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        if escrow.party_role(actor_id).is_none() {
            return Err(CoreError::not_counterparty(actor_id, "cancel this escrow"));
        }

        self.apply_cancel(escrow, actor_id, ActorType::User, reason, ctx)
            .await
    }

    /// Sweep-triggered cancellation of a PENDING escrow whose funding
    /// window expired.
    pub(crate) async fn cancel_expired(&self, escrow_id: &str) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        self.apply_cancel(
            escrow,
            "system",
            ActorType::System,
            Some("funding window expired".to_string()),
            &RequestContext::default(),
        )
        .await
    }

    /// Set (or clear, with `None`) the scheduled-release timestamp.
    /// Status is untouched; the sweep performs the actual release.
    pub async fn schedule_release(
        &self,
        escrow_id: &str,
        actor_id: &str,
        at: Option<NaiveDateTime>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        // Scheduling hands funds to the seller unattended, so only the
        // buyer may set it.
        if escrow.party_role(actor_id) != Some(PartyRole::Buyer) {
            return Err(CoreError::not_counterparty(
                actor_id,
                "schedule release for this escrow",
            ));
        }

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::set_scheduled_release(&mut conn, &id, at)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(escrow_id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &current.status,
                "schedule release",
            ));
        }

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::RELEASE_SCHEDULED, LogAction::Schedule)
                    .actor(actor_id, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data(
                        "scheduled_release_at",
                        serde_json::json!(at.map(|t| t.to_string())),
                    ),
            ))
            .await?;

        self.load_escrow(escrow_id).await
    }

    /// Replace the terms document. Allowed only pre-funding.
    pub async fn update_terms(
        &self,
        escrow_id: &str,
        actor_id: &str,
        terms: &serde_json::Value,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        if escrow.party_role(actor_id).is_none() {
            return Err(CoreError::not_counterparty(
                actor_id,
                "update terms of this escrow",
            ));
        }

        let terms_enc = encrypt_field(&self.codec, "escrow terms", &terms.to_string())?;

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::set_terms(&mut conn, &id, &terms_enc)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(escrow_id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &current.status,
                "update terms",
            ));
        }

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_TERMS_UPDATED, LogAction::Update)
                    .actor(actor_id, ActorType::User)
                    .entity("escrow", &escrow.id),
            ))
            .await?;

        self.load_escrow(escrow_id).await
    }

    /// Buyer-side milestone acceptance outside the proof workflow.
    /// Enforces sequence order; completing the last milestone authorizes
    /// release but does not perform it.
    pub async fn complete_milestone(
        &self,
        escrow_id: &str,
        milestone_id: &str,
        actor_id: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Milestone> {
        let escrow = self.load_escrow(escrow_id).await?;

        if escrow.current_status()? != EscrowStatus::Funded {
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &escrow.status,
                "complete a milestone",
            ));
        }
        if escrow.party_role(actor_id) != Some(PartyRole::Buyer) {
            return Err(CoreError::not_counterparty(actor_id, "complete this milestone"));
        }

        let pool = self.pool.clone();
        let m_id = milestone_id.to_string();
        let e_id = escrow.id.clone();
        let milestone = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            conn.transaction::<_, anyhow::Error, _>(|conn| {
                let milestone = Milestone::find_by_id(conn, &m_id)?
                    .filter(|m| m.escrow_id == e_id)
                    .ok_or_else(|| anyhow::anyhow!("milestone not found"))?;

                if milestone.current_status()? != MilestoneStatus::Pending {
                    anyhow::bail!("milestone is {}", milestone.status);
                }
                if Milestone::open_predecessors(conn, &e_id, milestone.sequence_no)? > 0 {
                    anyhow::bail!("out of order");
                }
                if Milestone::mark_completed(conn, &m_id)? == 0 {
                    anyhow::bail!("milestone is no longer pending");
                }

                Milestone::find_by_id(conn, &m_id)?
                    .ok_or_else(|| anyhow::anyhow!("milestone vanished after completion"))
            })
        })
        .await
        .context("Task join error")?
        .map_err(|e| CoreError::validation(format!("cannot complete milestone: {}", e)))?;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::MILESTONE_UPDATED, LogAction::Update)
                    .actor(actor_id, ActorType::User)
                    .entity("escrow", &escrow.id)
                    .data("milestone_id", serde_json::json!(milestone.id))
                    .data("status", serde_json::json!("completed")),
            ))
            .await?;

        self.notifier.notify(CoreEvent::MilestoneCompleted {
            escrow_id: escrow.id.clone(),
            milestone_id: milestone.id.clone(),
        });

        info!(
            escrow_id = %escrow.id,
            milestone_id = %milestone.id,
            "Milestone completed"
        );

        Ok(milestone)
    }

    /// Full escrow view with decrypted terms and owned entities.
    pub async fn get_escrow(&self, escrow_id: &str) -> CoreResult<EscrowDetail> {
        let escrow = self.load_escrow(escrow_id).await?;

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let (milestones, proofs, dispute) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            let milestones = Milestone::for_escrow(&mut conn, &id)?;
            let proofs = DeliveryProof::for_escrow(&mut conn, &id)?;
            let dispute = Dispute::latest_for_escrow(&mut conn, &id)?;
            Ok::<_, anyhow::Error>((milestones, proofs, dispute))
        })
        .await
        .context("Task join error")??;

        let terms = escrow
            .terms_enc
            .as_deref()
            .map(|enc| self.codec.decrypt_or_sentinel(enc));

        Ok(EscrowDetail {
            escrow,
            terms,
            milestones,
            proofs,
            dispute,
        })
    }

    pub async fn escrows_for_party(&self, user_id: &str) -> CoreResult<Vec<Escrow>> {
        let pool = self.pool.clone();
        let id = user_id.to_string();
        let escrows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::find_by_party(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        Ok(escrows)
    }

    // --- dispute-resolution settlements -------------------------------
    //
    // Called by the dispute subsystem once an arbiter decides. The CAS
    // from DISPUTED is the exactly-once guard for concurrent resolvers.

    pub(crate) async fn resolve_release(
        &self,
        escrow_id: &str,
        resolver_id: &str,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        self.apply_release(
            escrow,
            EscrowStatus::Disputed,
            resolver_id,
            ActorType::Arbiter,
            ctx,
        )
        .await
    }

    pub(crate) async fn resolve_refund(
        &self,
        escrow_id: &str,
        resolver_id: &str,
        reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;
        self.apply_refund(
            escrow,
            EscrowStatus::Disputed,
            resolver_id,
            ActorType::Arbiter,
            reason,
            ctx,
        )
        .await
    }

    /// Split settlement: the seller is paid `seller_amount`, the buyer
    /// refunded `buyer_amount`, and the escrow lands in COMPLETED.
    pub(crate) async fn resolve_split(
        &self,
        escrow_id: &str,
        resolver_id: &str,
        buyer_amount: i64,
        seller_amount: i64,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let escrow = self.load_escrow(escrow_id).await?;

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::mark_completed(&mut conn, &id)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(escrow_id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                escrow_id,
                &current.status,
                "settle split",
            ));
        }

        let settled = self.load_escrow(escrow_id).await?;
        self.record_settlement(&settled, Some(seller_amount), Some(buyer_amount))
            .await;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_COMPLETED, LogAction::Complete)
                    .actor(resolver_id, ActorType::Arbiter)
                    .entity("escrow", &settled.id)
                    .data("buyer_amount", serde_json::json!(buyer_amount))
                    .data("seller_amount", serde_json::json!(seller_amount)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: settled.id.clone(),
            status: EscrowStatus::Completed,
        });

        info!(
            escrow_id = %settled.id,
            buyer_amount = buyer_amount,
            seller_amount = seller_amount,
            "Disputed escrow settled with a split"
        );

        self.load_escrow(escrow_id).await
    }

    // --- shared transition bodies -------------------------------------

    async fn apply_release(
        &self,
        escrow: Escrow,
        from: EscrowStatus,
        actor_id: &str,
        actor_type: ActorType,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        // Milestones gate the regular path; an arbiter releasing out of
        // a dispute overrides frozen milestones.
        if from == EscrowStatus::Funded {
            let pool = self.pool.clone();
            let id = escrow.id.clone();
            let all_complete = tokio::task::spawn_blocking(move || {
                let mut conn = pool.get().context("Failed to get DB connection")?;
                Milestone::all_completed(&mut conn, &id)
            })
            .await
            .context("Task join error")??;

            if !all_complete {
                return Err(CoreError::invalid_state(
                    "escrow",
                    &escrow.id,
                    "funded with open milestones",
                    "release",
                ));
            }
        }

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::mark_released(&mut conn, &id, from)
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(&escrow.id).await?;
            if current.current_status()? == EscrowStatus::Released {
                // Lost the race to a concurrent release; the winner has
                // already applied the side effects.
                return Ok(current);
            }
            return Err(CoreError::invalid_state(
                "escrow",
                &escrow.id,
                &current.status,
                "release",
            ));
        }

        let released = self.load_escrow(&escrow.id).await?;
        self.record_settlement(&released, Some(released.amount), None)
            .await;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::FUNDS_RELEASED, LogAction::Release)
                    .actor(actor_id, actor_type)
                    .entity("escrow", &released.id)
                    .data("amount", serde_json::json!(released.amount))
                    .data("from_status", serde_json::json!(from.as_str())),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: released.id.clone(),
            status: EscrowStatus::Released,
        });

        info!(
            escrow_id = %released.id,
            amount = released.amount,
            actor = %actor_id,
            "Escrow funds released"
        );

        self.load_escrow(&escrow.id).await
    }

    async fn apply_refund(
        &self,
        escrow: Escrow,
        from: EscrowStatus,
        actor_id: &str,
        actor_type: ActorType,
        reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let tx_reason = reason.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::mark_refunded(&mut conn, &id, from, tx_reason.as_deref())
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(&escrow.id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                &escrow.id,
                &current.status,
                "refund",
            ));
        }

        let refunded = self.load_escrow(&escrow.id).await?;
        self.record_settlement(&refunded, None, Some(refunded.amount))
            .await;

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_REFUNDED, LogAction::Refund)
                    .actor(actor_id, actor_type)
                    .entity("escrow", &refunded.id)
                    .data("amount", serde_json::json!(refunded.amount))
                    .data("reason", serde_json::json!(reason)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: refunded.id.clone(),
            status: EscrowStatus::Refunded,
        });

        info!(escrow_id = %refunded.id, actor = %actor_id, "Escrow refunded");

        self.load_escrow(&escrow.id).await
    }

    async fn apply_cancel(
        &self,
        escrow: Escrow,
        actor_id: &str,
        actor_type: ActorType,
        reason: Option<String>,
        ctx: &RequestContext,
    ) -> CoreResult<Escrow> {
        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let tx_reason = reason.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::mark_cancelled(&mut conn, &id, tx_reason.as_deref())
        })
        .await
        .context("Task join error")??;

        if rows == 0 {
            let current = self.load_escrow(&escrow.id).await?;
            return Err(CoreError::invalid_state(
                "escrow",
                &escrow.id,
                &current.status,
                "cancel",
            ));
        }

        self.log
            .record(ctx.apply(
                TransactionLogBuilder::new(event_types::ESCROW_CANCELLED, LogAction::Cancel)
                    .actor(actor_id, actor_type)
                    .entity("escrow", &escrow.id)
                    .data("reason", serde_json::json!(reason)),
            ))
            .await?;

        self.notifier.notify(CoreEvent::EscrowStatusChanged {
            escrow_id: escrow.id.clone(),
            status: EscrowStatus::Cancelled,
        });

        info!(escrow_id = %escrow.id, actor = %actor_id, "Escrow cancelled");

        self.load_escrow(&escrow.id).await
    }

    /// Ask the gateway to move money after a transition committed.
    /// Failures are logged; the transition stands and reconciliation
    /// happens out-of-band.
    async fn record_settlement(
        &self,
        escrow: &Escrow,
        release_amount: Option<i64>,
        refund_amount: Option<i64>,
    ) {
        let mut refs = Vec::new();

        if let Some(amount) = release_amount {
            match self.gateway.record_release(escrow, amount) {
                Ok(Some(settlement_ref)) => refs.push(settlement_ref),
                Ok(None) => {}
                Err(e) => error!(escrow_id = %escrow.id, error = %e, "Gateway release failed"),
            }
        }
        if let Some(amount) = refund_amount {
            match self.gateway.record_refund(escrow, amount) {
                Ok(Some(settlement_ref)) => refs.push(settlement_ref),
                Ok(None) => {}
                Err(e) => error!(escrow_id = %escrow.id, error = %e, "Gateway refund failed"),
            }
        }

        if refs.is_empty() {
            return;
        }

        let pool = self.pool.clone();
        let id = escrow.id.clone();
        let joined = refs.join(";");
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            Escrow::set_settlement_ref(&mut conn, &id, &joined)
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(escrow_id = %escrow.id, error = %e, "Failed to store settlement ref"),
            Err(e) => error!(escrow_id = %escrow.id, error = %e, "Settlement ref task failed"),
        }
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
}

fn validate_create_input(input: &CreateEscrowInput) -> CoreResult<()> {
    if input.buyer_id.is_empty() || input.seller_id.is_empty() {
        return Err(CoreError::validation("buyer_id and seller_id are required"));
    }
    if input.buyer_id == input.seller_id {
        return Err(CoreError::validation(
            "buyer and seller must be different parties",
        ));
    }
    if input.amount <= 0 {
        return Err(CoreError::validation("escrow amount must be positive"));
    }

    let mut milestone_sum: i64 = 0;
    let mut seen = std::collections::HashSet::new();
    for milestone in &input.milestones {
        if milestone.amount <= 0 {
            return Err(CoreError::validation("milestone amounts must be positive"));
        }
        if !seen.insert(milestone.sequence_no) {
            return Err(CoreError::validation(format!(
                "duplicate milestone sequence number {}",
                milestone.sequence_no
            )));
        }
        milestone_sum = milestone_sum
            .checked_add(milestone.amount)
            .ok_or_else(|| CoreError::validation("milestone amounts overflow"))?;
    }
    if milestone_sum > input.amount {
        return Err(CoreError::validation(format!(
            "milestone amounts ({}) exceed escrow amount ({})",
            milestone_sum, input.amount
        )));
    }

    Ok(())
}
