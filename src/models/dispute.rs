//! Disputes and their evidence rows.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{dispute_evidence, disputes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    ResolvedForMerchant,
    ResolvedForCustomer,
    Escalated,
    Closed,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::ResolvedForMerchant => "resolved_for_merchant",
            DisputeStatus::ResolvedForCustomer => "resolved_for_customer",
            DisputeStatus::Escalated => "escalated",
            DisputeStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(DisputeStatus::Open),
            "under_review" => Some(DisputeStatus::UnderReview),
            "resolved_for_merchant" => Some(DisputeStatus::ResolvedForMerchant),
            "resolved_for_customer" => Some(DisputeStatus::ResolvedForCustomer),
            "escalated" => Some(DisputeStatus::Escalated),
            "closed" => Some(DisputeStatus::Closed),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [DisputeStatus] {
        match self {
            DisputeStatus::Open => &[DisputeStatus::UnderReview, DisputeStatus::Escalated],
            // A split settlement closes directly without a favored-party
            // state.
            DisputeStatus::UnderReview => &[
                DisputeStatus::ResolvedForMerchant,
                DisputeStatus::ResolvedForCustomer,
                DisputeStatus::Escalated,
                DisputeStatus::Closed,
            ],
            DisputeStatus::ResolvedForMerchant | DisputeStatus::ResolvedForCustomer => {
                &[DisputeStatus::Closed]
            }
            DisputeStatus::Escalated => &[
                DisputeStatus::ResolvedForMerchant,
                DisputeStatus::ResolvedForCustomer,
                DisputeStatus::Closed,
            ],
            DisputeStatus::Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: DisputeStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisputeStatus::Closed)
    }

    /// True while the dispute still blocks settlement of its escrow.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DisputeStatus::Open | DisputeStatus::UnderReview | DisputeStatus::Escalated
        )
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = disputes)]
pub struct Dispute {
    pub id: String,
    pub escrow_id: String,
    pub filed_by: String,
    /// `buyer` or `seller`.
    pub filer_role: String,
    pub reason: String,
    /// Encrypted description envelope.
    pub description_enc: Option<String>,
    pub status: String,
    /// `merchant`, `customer`, or `split` once resolved.
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub split_buyer_amount: Option<i64>,
    pub split_seller_amount: Option<i64>,
    pub evidence_deadline: Option<NaiveDateTime>,
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = disputes)]
pub struct NewDispute {
    pub id: String,
    pub escrow_id: String,
    pub filed_by: String,
    pub filer_role: String,
    pub reason: String,
    pub description_enc: Option<String>,
    pub status: String,
    pub evidence_deadline: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewDispute {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            escrow_id: String::new(),
            filed_by: String::new(),
            filer_role: String::new(),
            reason: String::new(),
            description_enc: None,
            status: DisputeStatus::Open.as_str().to_string(),
            evidence_deadline: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Dispute {
    pub fn create(conn: &mut SqliteConnection, new_dispute: &NewDispute) -> Result<Dispute> {
        diesel::insert_into(disputes::table)
            .values(new_dispute)
            .execute(conn)
            .context("Failed to insert dispute")?;

        disputes::table
            .filter(disputes::id.eq(&new_dispute.id))
            .first(conn)
            .context("Failed to retrieve created dispute")
    }

    pub fn find_optional(conn: &mut SqliteConnection, dispute_id: &str) -> Result<Option<Dispute>> {
        disputes::table
            .filter(disputes::id.eq(dispute_id))
            .first(conn)
            .optional()
            .context("Failed to query dispute")
    }

    /// Latest dispute of an escrow, resolved or not.
    pub fn latest_for_escrow(
        conn: &mut SqliteConnection,
        escrow_id: &str,
    ) -> Result<Option<Dispute>> {
        disputes::table
            .filter(disputes::escrow_id.eq(escrow_id))
            .order(disputes::created_at.desc())
            .first(conn)
            .optional()
            .context("Failed to query dispute for escrow")
    }

    /// The dispute currently blocking an escrow, if any. At most one
    /// dispute is active per escrow.
    pub fn active_for_escrow(
        conn: &mut SqliteConnection,
        escrow_id: &str,
    ) -> Result<Option<Dispute>> {
        disputes::table
            .filter(disputes::escrow_id.eq(escrow_id))
            .filter(disputes::status.eq_any([
                DisputeStatus::Open.as_str(),
                DisputeStatus::UnderReview.as_str(),
                DisputeStatus::Escalated.as_str(),
            ]))
            .first(conn)
            .optional()
            .context("Failed to query active dispute")
    }

    pub fn current_status(&self) -> Result<DisputeStatus> {
        DisputeStatus::from_str(&self.status).with_context(|| {
            format!("Dispute {} has unknown status '{}'", self.id, self.status)
        })
    }

    /// Conditional status transition; returns the affected-row count.
    pub fn transition(
        conn: &mut SqliteConnection,
        dispute_id: &str,
        from: DisputeStatus,
        to: DisputeStatus,
    ) -> Result<usize> {
        diesel::update(
            disputes::table
                .filter(disputes::id.eq(dispute_id))
                .filter(disputes::status.eq(from.as_str())),
        )
        .set((
            disputes::status.eq(to.as_str()),
            disputes::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to transition dispute")
    }

    /// Record the resolution outcome fields alongside a status change.
    #[allow(clippy::too_many_arguments)]
    pub fn record_resolution(
        conn: &mut SqliteConnection,
        dispute_id: &str,
        from: DisputeStatus,
        to: DisputeStatus,
        resolution: &str,
        resolved_by: &str,
        notes: Option<&str>,
        split: Option<(i64, i64)>,
    ) -> Result<usize> {
        let (split_buyer, split_seller) = match split {
            Some((b, s)) => (Some(b), Some(s)),
            None => (None, None),
        };
        diesel::update(
            disputes::table
                .filter(disputes::id.eq(dispute_id))
                .filter(disputes::status.eq(from.as_str())),
        )
        .set((
            disputes::status.eq(to.as_str()),
            disputes::resolution.eq(Some(resolution)),
            disputes::resolved_by.eq(Some(resolved_by)),
            disputes::resolution_notes.eq(notes),
            disputes::split_buyer_amount.eq(split_buyer),
            disputes::split_seller_amount.eq(split_seller),
            disputes::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to record dispute resolution")
    }

    /// Final hop to `closed`; stamps `resolved_at`.
    pub fn close(
        conn: &mut SqliteConnection,
        dispute_id: &str,
        from: DisputeStatus,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            disputes::table
                .filter(disputes::id.eq(dispute_id))
                .filter(disputes::status.eq(from.as_str())),
        )
        .set((
            disputes::status.eq(DisputeStatus::Closed.as_str()),
            disputes::resolved_at.eq(Some(now)),
            disputes::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to close dispute")
    }

    /// Stamp `resolved_at` for disputes that closed without passing
    /// through a resolved-for-party state (split settlements).
    pub fn stamp_resolved_at(conn: &mut SqliteConnection, dispute_id: &str) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            disputes::table
                .filter(disputes::id.eq(dispute_id))
                .filter(disputes::resolved_at.is_null()),
        )
        .set((
            disputes::resolved_at.eq(Some(now)),
            disputes::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to stamp dispute resolution time")
    }

    pub fn mark_escalated(conn: &mut SqliteConnection, dispute_id: &str) -> Result<usize> {
        diesel::update(
            disputes::table
                .filter(disputes::id.eq(dispute_id))
                .filter(disputes::status.eq_any([
                    DisputeStatus::Open.as_str(),
                    DisputeStatus::UnderReview.as_str(),
                ])),
        )
        .set((
            disputes::status.eq(DisputeStatus::Escalated.as_str()),
            disputes::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to escalate dispute")
    }

    /// Disputes whose evidence window has lapsed without resolution.
    pub fn find_deadline_passed(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Dispute>> {
        disputes::table
            .filter(disputes::status.eq_any([
                DisputeStatus::Open.as_str(),
                DisputeStatus::UnderReview.as_str(),
            ]))
            .filter(disputes::evidence_deadline.is_not_null())
            .filter(disputes::evidence_deadline.lt(now))
            .order(disputes::evidence_deadline.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to query disputes past deadline")
    }
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = dispute_evidence)]
pub struct DisputeEvidence {
    pub id: String,
    pub dispute_id: String,
    pub uploader_id: String,
    pub uploader_role: String,
    pub file_name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dispute_evidence)]
pub struct NewDisputeEvidence {
    pub id: String,
    pub dispute_id: String,
    pub uploader_id: String,
    pub uploader_role: String,
    pub file_name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

impl NewDisputeEvidence {
    pub fn new(
        dispute_id: &str,
        uploader_id: &str,
        uploader_role: &str,
        file_name: &str,
        description: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dispute_id: dispute_id.to_string(),
            uploader_id: uploader_id.to_string(),
            uploader_role: uploader_role.to_string(),
            file_name: file_name.to_string(),
            description,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl DisputeEvidence {
    pub fn create(
        conn: &mut SqliteConnection,
        new_evidence: &NewDisputeEvidence,
    ) -> Result<DisputeEvidence> {
        diesel::insert_into(dispute_evidence::table)
            .values(new_evidence)
            .execute(conn)
            .context("Failed to insert dispute evidence")?;

        dispute_evidence::table
            .filter(dispute_evidence::id.eq(&new_evidence.id))
            .first(conn)
            .context("Failed to retrieve created dispute evidence")
    }

    pub fn for_dispute(
        conn: &mut SqliteConnection,
        dispute_id: &str,
    ) -> Result<Vec<DisputeEvidence>> {
        dispute_evidence::table
            .filter(dispute_evidence::dispute_id.eq(dispute_id))
            .order(dispute_evidence::created_at.asc())
            .load(conn)
            .context("Failed to query dispute evidence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            DisputeStatus::Open,
            DisputeStatus::UnderReview,
            DisputeStatus::ResolvedForMerchant,
            DisputeStatus::ResolvedForCustomer,
            DisputeStatus::Escalated,
            DisputeStatus::Closed,
        ] {
            assert_eq!(DisputeStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(DisputeStatus::from_str("settled"), None);
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(DisputeStatus::Closed.is_terminal());
        assert!(DisputeStatus::Closed.valid_transitions().is_empty());
        for status in [
            DisputeStatus::Open,
            DisputeStatus::UnderReview,
            DisputeStatus::ResolvedForMerchant,
            DisputeStatus::ResolvedForCustomer,
            DisputeStatus::Escalated,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_active_statuses() {
        assert!(DisputeStatus::Open.is_active());
        assert!(DisputeStatus::UnderReview.is_active());
        assert!(DisputeStatus::Escalated.is_active());
        assert!(!DisputeStatus::ResolvedForMerchant.is_active());
        assert!(!DisputeStatus::Closed.is_active());
    }

    #[test]
    fn test_resolution_paths() {
        assert!(DisputeStatus::Open.can_transition_to(DisputeStatus::UnderReview));
        assert!(DisputeStatus::UnderReview.can_transition_to(DisputeStatus::ResolvedForMerchant));
        assert!(DisputeStatus::UnderReview.can_transition_to(DisputeStatus::ResolvedForCustomer));
        assert!(DisputeStatus::UnderReview.can_transition_to(DisputeStatus::Escalated));
        assert!(DisputeStatus::ResolvedForMerchant.can_transition_to(DisputeStatus::Closed));
        assert!(DisputeStatus::Escalated.can_transition_to(DisputeStatus::ResolvedForCustomer));
        assert!(!DisputeStatus::Open.can_transition_to(DisputeStatus::ResolvedForMerchant));
        assert!(!DisputeStatus::Closed.can_transition_to(DisputeStatus::Open));
    }
}
