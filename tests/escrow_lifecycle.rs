//! End-to-end lifecycle flows: create, fund, milestone delivery with
//! proof review, release idempotence, disputes, and the sweep.

mod common;

use common::{core, core_with, ctx, TestCore};

use std::sync::Arc;
use std::time::Duration;

use escrow_core::error::CoreError;
use escrow_core::models::transaction_log::event_types;
use escrow_core::models::{DisputeStatus, Escrow, EscrowStatus, ProofKind};
use escrow_core::services::{
    CreateEscrowInput, DisputeOutcome, FileDisputeInput, GatewayCall, MilestoneSpec,
    ReviewDecision, StaticReputation, SubmitProofInput,
};

fn create_input(amount: i64, milestones: Vec<MilestoneSpec>) -> CreateEscrowInput {
    CreateEscrowInput {
        buyer_id: "buyer-1".into(),
        seller_id: "seller-1".into(),
        amount,
        title: Some("Custom build".into()),
        terms: Some(serde_json::json!({"delivery": "30 days", "warranty": true})),
        milestones,
        ..CreateEscrowInput::default()
    }
}

async fn funded_escrow(core: &TestCore, amount: i64, milestones: Vec<MilestoneSpec>) -> Escrow {
    let escrow = core
        .escrow
        .create(create_input(amount, milestones), &ctx())
        .await
        .expect("create failed");
    core.escrow
        .fund(&escrow.id, "pay-1", &ctx())
        .await
        .expect("fund failed")
}

async fn submit_and_accept(core: &TestCore, escrow_id: &str, milestone_id: Option<String>) {
    let proof = core
        .proof
        .submit(
            SubmitProofInput {
                escrow_id: escrow_id.to_string(),
                submitted_by: "seller-1".into(),
                kind: ProofKind::Image,
                description: Some("photos of the delivered unit".into()),
                files: vec!["proof.jpg".into()],
                milestone_id,
                metadata: None,
            },
            &ctx(),
        )
        .await
        .expect("proof submission failed");

    core.proof
        .review(&proof.id, "buyer-1", ReviewDecision::Accept, None, &ctx())
        .await
        .expect("proof review failed");
}

#[tokio::test]
async fn full_lifecycle_without_milestones() {
    let core = core().await;

    let escrow = core
        .escrow
        .create(create_input(10_000, vec![]), &ctx())
        .await
        .unwrap();
    assert_eq!(escrow.status, "pending");
    assert!(escrow.terms_enc.is_some());
    // Terms are stored encrypted, not as recognizable plaintext.
    assert!(!escrow.terms_enc.as_deref().unwrap().contains("30 days"));

    let funded = core.escrow.fund(&escrow.id, "pay-42", &ctx()).await.unwrap();
    assert_eq!(funded.status, "funded");
    assert_eq!(funded.payment_ref.as_deref(), Some("pay-42"));

    submit_and_accept(&core, &escrow.id, None).await;

    let released = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();
    assert_eq!(released.status, "released");
    assert!(released.completed_at.is_some());

    // The gateway saw funding once and release once, for the full amount.
    let calls = core.gateway.calls();
    assert!(calls.contains(&GatewayCall::Funding {
        escrow_id: escrow.id.clone(),
        payment_ref: "pay-42".into(),
    }));
    assert!(calls.contains(&GatewayCall::Release {
        escrow_id: escrow.id.clone(),
        amount: 10_000,
    }));

    // Decrypted view round-trips the terms document.
    let detail = core.escrow.get_escrow(&escrow.id).await.unwrap();
    let terms: serde_json::Value = serde_json::from_str(detail.terms.as_deref().unwrap()).unwrap();
    assert_eq!(terms["delivery"], "30 days");
}

#[tokio::test]
async fn release_is_idempotent_under_retry() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;
    submit_and_accept(&core, &escrow.id, None).await;

    let first = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();
    assert_eq!(first.status, "released");

    // Simulates the sweep re-delivering the release after a manual call.
    let second = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();
    assert_eq!(second.status, "released");
    assert_eq!(first.completed_at, second.completed_at);

    // Exactly one audit entry and one gateway payout.
    let history = core.log.history("escrow", &escrow.id).await.unwrap();
    let releases = history
        .iter()
        .filter(|e| e.event_type == event_types::FUNDS_RELEASED)
        .count();
    assert_eq!(releases, 1);

    let payouts = core
        .gateway
        .calls()
        .iter()
        .filter(|c| matches!(c, GatewayCall::Release { .. }))
        .count();
    assert_eq!(payouts, 1);
}

#[tokio::test]
async fn milestones_gate_release() {
    let core = core().await;
    let escrow = funded_escrow(
        &core,
        10_000,
        vec![
            MilestoneSpec {
                sequence_no: 1,
                amount: 6_000,
                description: "frame".into(),
            },
            MilestoneSpec {
                sequence_no: 2,
                amount: 4_000,
                description: "finish".into(),
            },
        ],
    )
    .await;

    // Open milestones block the release outright.
    let err = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidEscrowState { .. }));

    let detail = core.escrow.get_escrow(&escrow.id).await.unwrap();
    let milestone_ids: Vec<String> = detail.milestones.iter().map(|m| m.id.clone()).collect();
    assert_eq!(milestone_ids.len(), 2);

    // Second milestone cannot be accepted before the first.
    let err = core
        .escrow
        .complete_milestone(&escrow.id, &milestone_ids[1], "buyer-1", &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailure(_)));

    submit_and_accept(&core, &escrow.id, Some(milestone_ids[0].clone())).await;

    // One milestone down is still not enough.
    let err = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidEscrowState { .. }));

    submit_and_accept(&core, &escrow.id, Some(milestone_ids[1].clone())).await;

    let released = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();
    assert_eq!(released.status, "released");
    assert!(released.completed_at.is_some());

    let detail = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert!(detail.milestones.iter().all(|m| m.status == "completed"));
}

#[tokio::test]
async fn proof_must_come_from_the_obligated_party() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;

    // The buyer is not the delivering party.
    let err = core
        .proof
        .submit(
            SubmitProofInput {
                escrow_id: escrow.id.clone(),
                submitted_by: "buyer-1".into(),
                kind: ProofKind::Text,
                description: None,
                files: vec![],
                milestone_id: None,
                metadata: None,
            },
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotCounterparty { .. }));
}

#[tokio::test]
async fn rejected_proof_keeps_escrow_funded_and_allows_resubmission() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;

    let proof = core
        .proof
        .submit(
            SubmitProofInput {
                escrow_id: escrow.id.clone(),
                submitted_by: "seller-1".into(),
                kind: ProofKind::Link,
                description: None,
                files: vec!["https://tracking.example/1".into()],
                milestone_id: None,
                metadata: None,
            },
            &ctx(),
        )
        .await
        .unwrap();

    let review = core
        .proof
        .review(
            &proof.id,
            "buyer-1",
            ReviewDecision::Reject,
            Some("tracking number is for another country".into()),
            &ctx(),
        )
        .await
        .unwrap();
    assert!(!review.release_authorized);
    assert_eq!(review.proof.status, "rejected");
    assert_eq!(
        review.proof.rejection_reason.as_deref(),
        Some("tracking number is for another country")
    );

    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.status, "funded");

    // The seller can try again with better evidence.
    submit_and_accept(&core, &escrow.id, None).await;
    let released = core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();
    assert_eq!(released.status, "released");
}

#[tokio::test]
async fn dispute_resolution_for_customer_refunds() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;

    let dispute = core
        .dispute
        .file(
            FileDisputeInput {
                escrow_id: escrow.id.clone(),
                filed_by: "buyer-1".into(),
                reason: "goods_not_received".into(),
                description: Some("nothing arrived after six weeks".into()),
                evidence: vec!["empty_mailbox.jpg".into()],
            },
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(dispute.status, "open");
    assert!(dispute.evidence_deadline.is_some());

    let disputed = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(disputed.escrow.status, "disputed");

    let resolved = core
        .dispute
        .resolve(
            &dispute.id,
            "arbiter-1",
            DisputeOutcome::Customer,
            Some("no delivery evidence from the seller".into()),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, "closed");
    assert_eq!(resolved.resolution.as_deref(), Some("customer"));
    assert!(resolved.resolved_at.is_some());

    let refunded = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(refunded.escrow.status, "refunded");
    assert!(refunded.escrow.completed_at.is_some());

    assert!(core.gateway.calls().contains(&GatewayCall::Refund {
        escrow_id: escrow.id.clone(),
        amount: 10_000,
    }));
}

#[tokio::test]
async fn dispute_resolution_for_merchant_releases() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;

    let dispute = core
        .dispute
        .file(
            FileDisputeInput {
                escrow_id: escrow.id.clone(),
                filed_by: "buyer-1".into(),
                reason: "quality".into(),
                description: None,
                evidence: vec![],
            },
            &ctx(),
        )
        .await
        .unwrap();

    core.dispute
        .resolve(&dispute.id, "arbiter-1", DisputeOutcome::Merchant, None, &ctx())
        .await
        .unwrap();

    let released = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(released.escrow.status, "released");
}

#[tokio::test]
async fn dispute_split_settlement_completes_escrow() {
    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;

    let dispute = core
        .dispute
        .file(
            FileDisputeInput {
                escrow_id: escrow.id.clone(),
                filed_by: "seller-1".into(),
                reason: "partial_delivery".into(),
                description: None,
                evidence: vec![],
            },
            &ctx(),
        )
        .await
        .unwrap();

    // Shares must cover the full amount.
    let err = core
        .dispute
        .resolve(
            &dispute.id,
            "arbiter-1",
            DisputeOutcome::Split {
                buyer_amount: 1_000,
                seller_amount: 1_000,
            },
            None,
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailure(_)));

    // Absurd shares whose sum overflows i64 are refused the same way.
    let err = core
        .dispute
        .resolve(
            &dispute.id,
            "arbiter-1",
            DisputeOutcome::Split {
                buyer_amount: i64::MAX,
                seller_amount: 1,
            },
            None,
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailure(_)));

    let resolved = core
        .dispute
        .resolve(
            &dispute.id,
            "arbiter-1",
            DisputeOutcome::Split {
                buyer_amount: 3_000,
                seller_amount: 7_000,
            },
            Some("half the order shipped".into()),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, DisputeStatus::Closed.as_str());
    assert_eq!(resolved.resolution.as_deref(), Some("split"));
    assert_eq!(resolved.split_buyer_amount, Some(3_000));
    assert_eq!(resolved.split_seller_amount, Some(7_000));
    assert!(resolved.resolved_at.is_some());

    let completed = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(completed.escrow.status, "completed");
    assert!(completed.escrow.completed_at.is_some());

    let calls = core.gateway.calls();
    assert!(calls.contains(&GatewayCall::Release {
        escrow_id: escrow.id.clone(),
        amount: 7_000,
    }));
    assert!(calls.contains(&GatewayCall::Refund {
        escrow_id: escrow.id.clone(),
        amount: 3_000,
    }));
}

#[tokio::test]
async fn sweep_releases_scheduled_escrows() {
    let core = core().await;
    let escrow = funded_escrow(&core, 5_000, vec![]).await;

    let past = chrono::Utc::now().naive_utc() - chrono::Duration::minutes(1);
    core.escrow
        .schedule_release(&escrow.id, "buyer-1", Some(past), &ctx())
        .await
        .unwrap();

    let stats = core.monitor.run_once().await.unwrap();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.errors, 0);

    let released = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(released.escrow.status, "released");

    // A second cycle finds nothing to do.
    let stats = core.monitor.run_once().await.unwrap();
    assert_eq!(stats.released, 0);

    let history = core.log.history("escrow", &escrow.id).await.unwrap();
    let releases = history
        .iter()
        .filter(|e| e.event_type == event_types::FUNDS_RELEASED)
        .count();
    assert_eq!(releases, 1);
}

#[tokio::test]
async fn sweep_cancels_expired_pending_escrows() {
    let core = core().await;

    let mut input = create_input(5_000, vec![]);
    input.expires_at = Some(chrono::Utc::now().naive_utc() - chrono::Duration::minutes(1));
    let escrow = core.escrow.create(input, &ctx()).await.unwrap();

    let stats = core.monitor.run_once().await.unwrap();
    assert_eq!(stats.expired_cancelled, 1);

    let cancelled = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(cancelled.escrow.status, "cancelled");
    assert!(cancelled.escrow.cancelled_at.is_some());
    assert_eq!(
        cancelled.escrow.closing_reason.as_deref(),
        Some("funding window expired")
    );
}

#[tokio::test]
async fn sweep_escalates_disputes_past_evidence_deadline() {
    // Zero-length evidence window: the deadline lapses immediately.
    let core = core_with(
        Arc::new(StaticReputation::clean("US")),
        Some(Duration::from_secs(0)),
    )
    .await;
    let escrow = funded_escrow(&core, 5_000, vec![]).await;

    let dispute = core
        .dispute
        .file(
            FileDisputeInput {
                escrow_id: escrow.id.clone(),
                filed_by: "buyer-1".into(),
                reason: "not_as_described".into(),
                description: None,
                evidence: vec![],
            },
            &ctx(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = core.monitor.run_once().await.unwrap();
    assert_eq!(stats.disputes_escalated, 1);

    let escalated = core.dispute.dispute_for_escrow(&escrow.id).await.unwrap().unwrap();
    assert_eq!(escalated.id, dispute.id);
    assert_eq!(escalated.status, "escalated");

    // The escrow stays frozen; escalated disputes can still be resolved.
    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.status, "disputed");

    core.dispute
        .resolve(&dispute.id, "arbiter-1", DisputeOutcome::Customer, None, &ctx())
        .await
        .unwrap();
    let refunded = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(refunded.escrow.status, "refunded");
}

#[tokio::test]
async fn audit_chain_covers_the_lifecycle_and_detects_tampering() {
    use diesel::prelude::*;
    use escrow_core::schema::transaction_log::dsl::*;

    let core = core().await;
    let escrow = funded_escrow(&core, 10_000, vec![]).await;
    submit_and_accept(&core, &escrow.id, None).await;
    core.escrow.release(&escrow.id, "buyer-1", &ctx()).await.unwrap();

    let report = core.log.verify_integrity().await.unwrap();
    assert!(report.is_valid);
    assert!(report.entries_checked >= 5);

    let history = core.log.history("escrow", &escrow.id).await.unwrap();
    let observed: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(observed[0], event_types::ESCROW_CREATED);
    assert!(observed.contains(&event_types::ESCROW_FUNDED));
    assert!(observed.contains(&event_types::PROOF_SUBMITTED));
    assert!(observed.contains(&event_types::PROOF_REVIEWED));
    assert_eq!(*observed.last().unwrap(), event_types::FUNDS_RELEASED);

    // Rewrite one historical payload behind the service's back.
    let target = history[0].id.clone();
    let mut conn = core.pool.get().unwrap();
    diesel::update(transaction_log.filter(id.eq(&target)))
        .set(event_data.eq(Some("{\"amount\":999999}")))
        .execute(&mut conn)
        .unwrap();
    drop(conn);

    let report = core.log.verify_integrity().await.unwrap();
    assert!(!report.is_valid);
    assert!(report.broken_links.contains(&target));
}
