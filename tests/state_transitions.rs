//! Negative-path coverage: every illegal transition or unauthorized
//! actor is refused with the right error variant, and nothing moves.

mod common;

use common::{core, ctx, TestCore};

use escrow_core::error::CoreError;
use escrow_core::models::{Escrow, ProofKind};
use escrow_core::services::{
    CreateEscrowInput, DisputeOutcome, FileDisputeInput, ReviewDecision, SubmitProofInput,
};

async fn pending_escrow(core: &TestCore) -> Escrow {
    core.escrow
        .create(
            CreateEscrowInput {
                buyer_id: "buyer-1".into(),
                seller_id: "seller-1".into(),
                amount: 10_000,
                ..CreateEscrowInput::default()
            },
            &ctx(),
        )
        .await
        .expect("create failed")
}

async fn funded_escrow(core: &TestCore) -> Escrow {
    let escrow = pending_escrow(core).await;
    core.escrow
        .fund(&escrow.id, "pay-1", &ctx())
        .await
        .expect("fund failed")
}

fn assert_invalid_state(err: CoreError) {
    assert!(
        matches!(err, CoreError::InvalidEscrowState { .. }),
        "expected InvalidEscrowState, got: {}",
        err
    );
}

#[tokio::test]
async fn funding_is_exactly_once() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

    assert_invalid_state(core.escrow.fund(&escrow.id, "pay-2", &ctx()).await.unwrap_err());

    // The original payment reference survives the failed second attempt.
    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.payment_ref.as_deref(), Some("pay-1"));
}

#[tokio::test]
async fn pending_escrow_cannot_release_or_refund_or_dispute() {
    let core = core().await;
    let escrow = pending_escrow(&core).await;

    assert_invalid_state(
        core.escrow
            .release(&escrow.id, "buyer-1", &ctx())
            .await
            .unwrap_err(),
    );
    assert_invalid_state(
        core.escrow
            .refund(&escrow.id, "seller-1", None, &ctx())
            .await
            .unwrap_err(),
    );
    assert_invalid_state(
        core.dispute
            .file(
                FileDisputeInput {
                    escrow_id: escrow.id.clone(),
                    filed_by: "buyer-1".into(),
                    reason: "too_early".into(),
                    description: None,
                    evidence: vec![],
                },
                &ctx(),
            )
            .await
            .unwrap_err(),
    );
    assert_invalid_state(
        core.proof
            .submit(
                SubmitProofInput {
                    escrow_id: escrow.id.clone(),
                    submitted_by: "seller-1".into(),
                    kind: ProofKind::Text,
                    description: None,
                    files: vec![],
                    milestone_id: None,
                    metadata: None,
                },
                &ctx(),
            )
            .await
            .unwrap_err(),
    );

    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.status, "pending");
}

#[tokio::test]
async fn cancellation_only_before_funding() {
    let core = core().await;

    let pending = pending_escrow(&core).await;
    let cancelled = core
        .escrow
        .cancel(&pending.id, "seller-1", Some("changed my mind".into()), &ctx())
        .await
        .unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert!(cancelled.cancelled_at.is_some());

    let funded = funded_escrow(&core).await;
    assert_invalid_state(
        core.escrow
            .cancel(&funded.id, "buyer-1", None, &ctx())
            .await
            .unwrap_err(),
    );
}

#[tokio::test]
async fn strangers_and_wrong_parties_are_refused() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

    // Only the buyer releases; only the seller refunds.
    assert!(matches!(
        core.escrow
            .release(&escrow.id, "seller-1", &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));
    assert!(matches!(
        core.escrow
            .refund(&escrow.id, "buyer-1", None, &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));
    assert!(matches!(
        core.escrow
            .schedule_release(&escrow.id, "seller-1", None, &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));
    assert!(matches!(
        core.dispute
            .file(
                FileDisputeInput {
                    escrow_id: escrow.id.clone(),
                    filed_by: "stranger".into(),
                    reason: "unrelated".into(),
                    description: None,
                    evidence: vec![],
                },
                &ctx(),
            )
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));

    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.status, "funded");
}

#[tokio::test]
async fn seller_initiated_refund_works() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

    let refunded = core
        .escrow
        .refund(&escrow.id, "seller-1", Some("cannot fulfil the order".into()), &ctx())
        .await
        .unwrap();
    assert_eq!(refunded.status, "refunded");
    assert!(refunded.completed_at.is_some());
    assert_eq!(
        refunded.closing_reason.as_deref(),
        Some("cannot fulfil the order")
    );
}

#[tokio::test]
async fn proof_review_is_counterparty_only_and_one_shot() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

    let proof = core
        .proof
        .submit(
            SubmitProofInput {
                escrow_id: escrow.id.clone(),
                submitted_by: "seller-1".into(),
                kind: ProofKind::Document,
                description: None,
                files: vec!["invoice.pdf".into()],
                milestone_id: None,
                metadata: None,
            },
            &ctx(),
        )
        .await
        .unwrap();

    // Neither the submitter nor a stranger may review.
    assert!(matches!(
        core.proof
            .review(&proof.id, "seller-1", ReviewDecision::Accept, None, &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));
    assert!(matches!(
        core.proof
            .review(&proof.id, "stranger", ReviewDecision::Accept, None, &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));

    // Rejection requires a reason.
    assert!(matches!(
        core.proof
            .review(&proof.id, "buyer-1", ReviewDecision::Reject, None, &ctx())
            .await
            .unwrap_err(),
        CoreError::ValidationFailure(_)
    ));

    core.proof
        .review(&proof.id, "buyer-1", ReviewDecision::Accept, None, &ctx())
        .await
        .unwrap();

    // The verdict is final.
    assert_invalid_state(
        core.proof
            .review(
                &proof.id,
                "buyer-1",
                ReviewDecision::Reject,
                Some("second thoughts".into()),
                &ctx(),
            )
            .await
            .unwrap_err(),
    );
}

#[tokio::test]
async fn disputes_cannot_be_resolved_by_a_party_or_twice() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

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

    // Contestants cannot arbitrate their own dispute.
    assert!(matches!(
        core.dispute
            .resolve(&dispute.id, "buyer-1", DisputeOutcome::Customer, None, &ctx())
            .await
            .unwrap_err(),
        CoreError::NotCounterparty { .. }
    ));

    // A second dispute cannot stack on a disputed escrow.
    assert_invalid_state(
        core.dispute
            .file(
                FileDisputeInput {
                    escrow_id: escrow.id.clone(),
                    filed_by: "seller-1".into(),
                    reason: "counter".into(),
                    description: None,
                    evidence: vec![],
                },
                &ctx(),
            )
            .await
            .unwrap_err(),
    );

    core.dispute
        .resolve(&dispute.id, "arbiter-1", DisputeOutcome::Merchant, None, &ctx())
        .await
        .unwrap();

    // Resolution is terminal.
    assert_invalid_state(
        core.dispute
            .resolve(&dispute.id, "arbiter-1", DisputeOutcome::Customer, None, &ctx())
            .await
            .unwrap_err(),
    );

    let current = core.escrow.get_escrow(&escrow.id).await.unwrap();
    assert_eq!(current.escrow.status, "released");
}

#[tokio::test]
async fn evidence_is_refused_after_resolution() {
    let core = core().await;
    let escrow = funded_escrow(&core).await;

    let dispute = core
        .dispute
        .file(
            FileDisputeInput {
                escrow_id: escrow.id.clone(),
                filed_by: "buyer-1".into(),
                reason: "quality".into(),
                description: None,
                evidence: vec!["before.jpg".into()],
            },
            &ctx(),
        )
        .await
        .unwrap();

    // While active, both sides may add material.
    core.dispute
        .submit_evidence(&dispute.id, "seller-1", "shipping_label.png", None, &ctx())
        .await
        .unwrap();

    core.dispute
        .resolve(&dispute.id, "arbiter-1", DisputeOutcome::Customer, None, &ctx())
        .await
        .unwrap();

    assert_invalid_state(
        core.dispute
            .submit_evidence(&dispute.id, "buyer-1", "late.jpg", None, &ctx())
            .await
            .unwrap_err(),
    );

    let evidence = core.dispute.evidence_for_dispute(&dispute.id).await.unwrap();
    assert_eq!(evidence.len(), 2);
}

#[tokio::test]
async fn terms_are_frozen_once_funded() {
    let core = core().await;
    let escrow = pending_escrow(&core).await;

    core.escrow
        .update_terms(&escrow.id, "buyer-1", &serde_json::json!({"revised": true}), &ctx())
        .await
        .unwrap();

    core.escrow.fund(&escrow.id, "pay-1", &ctx()).await.unwrap();

    assert_invalid_state(
        core.escrow
            .update_terms(&escrow.id, "buyer-1", &serde_json::json!({"late": true}), &ctx())
            .await
            .unwrap_err(),
    );

    let detail = core.escrow.get_escrow(&escrow.id).await.unwrap();
    let terms: serde_json::Value = serde_json::from_str(detail.terms.as_deref().unwrap()).unwrap();
    assert_eq!(terms["revised"], true);
}
