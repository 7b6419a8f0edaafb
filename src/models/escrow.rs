//! Escrow row type, status machine, and compare-and-swap transitions.
//!
//! Every status change goes through a conditional UPDATE filtered on the
//! expected current status. The affected-row count is the arbitration:
//! under concurrent attempts exactly one UPDATE matches and the losers
//! observe zero rows, so no double spend is possible at this layer.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::escrows;

/// Lifecycle states of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Released,
    Refunded,
    Disputed,
    Completed,
    Cancelled,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Funded => "funded",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Completed => "completed",
            EscrowStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EscrowStatus::Pending),
            "funded" => Some(EscrowStatus::Funded),
            "released" => Some(EscrowStatus::Released),
            "refunded" => Some(EscrowStatus::Refunded),
            "disputed" => Some(EscrowStatus::Disputed),
            "completed" => Some(EscrowStatus::Completed),
            "cancelled" => Some(EscrowStatus::Cancelled),
            _ => None,
        }
    }

    /// States reachable from this one. Everything not listed is an
    /// invalid transition.
    pub fn valid_transitions(&self) -> &'static [EscrowStatus] {
        match self {
            EscrowStatus::Pending => &[EscrowStatus::Funded, EscrowStatus::Cancelled],
            EscrowStatus::Funded => &[
                EscrowStatus::Released,
                EscrowStatus::Refunded,
                EscrowStatus::Disputed,
            ],
            EscrowStatus::Disputed => &[
                EscrowStatus::Released,
                EscrowStatus::Refunded,
                EscrowStatus::Completed,
            ],
            EscrowStatus::Released
            | EscrowStatus::Refunded
            | EscrowStatus::Completed
            | EscrowStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}

impl std::fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of an escrow an actor stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyRole {
    Buyer,
    Seller,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyRole::Buyer => "buyer",
            PartyRole::Seller => "seller",
        }
    }
}

/// One escrow agreement.
///
/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = escrows)]
pub struct Escrow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    /// Minor units (cents).
    pub amount: i64,
    pub status: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Encrypted terms envelope; never exposed raw.
    pub terms_enc: Option<String>,
    pub payment_ref: Option<String>,
    pub settlement_ref: Option<String>,
    pub closing_reason: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
    pub scheduled_release_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = escrows)]
pub struct NewEscrow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub amount: i64,
    pub status: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub terms_enc: Option<String>,
    pub payment_ref: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Default for NewEscrow {
    fn default() -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            buyer_id: String::new(),
            seller_id: String::new(),
            amount: 0,
            status: EscrowStatus::Pending.as_str().to_string(),
            title: None,
            description: None,
            terms_enc: None,
            payment_ref: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Escrow {
    pub fn create(conn: &mut SqliteConnection, new_escrow: &NewEscrow) -> Result<Escrow> {
        diesel::insert_into(escrows::table)
            .values(new_escrow)
            .execute(conn)
            .context("Failed to insert escrow")?;

        escrows::table
            .filter(escrows::id.eq(&new_escrow.id))
            .first(conn)
            .context("Failed to retrieve created escrow")
    }

    pub fn find_by_id(conn: &mut SqliteConnection, escrow_id: &str) -> Result<Escrow> {
        escrows::table
            .filter(escrows::id.eq(escrow_id))
            .first(conn)
            .context(format!("Escrow with ID {} not found", escrow_id))
    }

    pub fn find_optional(
        conn: &mut SqliteConnection,
        escrow_id: &str,
    ) -> Result<Option<Escrow>> {
        escrows::table
            .filter(escrows::id.eq(escrow_id))
            .first(conn)
            .optional()
            .context("Failed to query escrow")
    }

    /// Parse the stored status. A string outside the enum means the row
    /// was corrupted outside this crate.
    pub fn current_status(&self) -> Result<EscrowStatus> {
        EscrowStatus::from_str(&self.status)
            .with_context(|| format!("Escrow {} has unknown status '{}'", self.id, self.status))
    }

    /// The role `actor_id` plays on this escrow, if any.
    pub fn party_role(&self, actor_id: &str) -> Option<PartyRole> {
        if actor_id == self.buyer_id {
            Some(PartyRole::Buyer)
        } else if actor_id == self.seller_id {
            Some(PartyRole::Seller)
        } else {
            None
        }
    }

    /// Counterparty of the given party.
    pub fn counterparty_of(&self, role: PartyRole) -> &str {
        match role {
            PartyRole::Buyer => &self.seller_id,
            PartyRole::Seller => &self.buyer_id,
        }
    }

    // --- conditional status transitions -------------------------------
    //
    // Each returns the number of rows updated: 1 when this caller won
    // the transition, 0 when the row was no longer in the expected
    // status.

    pub fn mark_funded(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        payment_ref: Option<&str>,
    ) -> Result<usize> {
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(EscrowStatus::Pending.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Funded.as_str()),
            escrows::payment_ref.eq(payment_ref),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow funded")
    }

    pub fn mark_released(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        from: EscrowStatus,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(from.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Released.as_str()),
            escrows::completed_at.eq(Some(now)),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow released")
    }

    pub fn mark_refunded(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        from: EscrowStatus,
        reason: Option<&str>,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(from.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Refunded.as_str()),
            escrows::closing_reason.eq(reason),
            escrows::completed_at.eq(Some(now)),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow refunded")
    }

    pub fn mark_cancelled(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        reason: Option<&str>,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(EscrowStatus::Pending.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Cancelled.as_str()),
            escrows::closing_reason.eq(reason),
            escrows::cancelled_at.eq(Some(now)),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow cancelled")
    }

    pub fn mark_disputed(conn: &mut SqliteConnection, escrow_id: &str) -> Result<usize> {
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(EscrowStatus::Funded.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Disputed.as_str()),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow disputed")
    }

    /// Split settlement of a disputed escrow.
    pub fn mark_completed(conn: &mut SqliteConnection, escrow_id: &str) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(EscrowStatus::Disputed.as_str())),
        )
        .set((
            escrows::status.eq(EscrowStatus::Completed.as_str()),
            escrows::completed_at.eq(Some(now)),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark escrow completed")
    }

    /// Set or clear the scheduled-release timestamp. Status is untouched;
    /// the filter rejects rows that have left the schedulable states.
    pub fn set_scheduled_release(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        at: Option<NaiveDateTime>,
    ) -> Result<usize> {
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq_any([
                    EscrowStatus::Pending.as_str(),
                    EscrowStatus::Funded.as_str(),
                ])),
        )
        .set((
            escrows::scheduled_release_at.eq(at),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to set scheduled release")
    }

    pub fn set_settlement_ref(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        settlement_ref: &str,
    ) -> Result<usize> {
        diesel::update(escrows::table.filter(escrows::id.eq(escrow_id)))
            .set((
                escrows::settlement_ref.eq(Some(settlement_ref)),
                escrows::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .context("Failed to record settlement reference")
    }

    /// Replace the encrypted terms. Only allowed before funding.
    pub fn set_terms(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        terms_enc: &str,
    ) -> Result<usize> {
        diesel::update(
            escrows::table
                .filter(escrows::id.eq(escrow_id))
                .filter(escrows::status.eq(EscrowStatus::Pending.as_str())),
        )
        .set((
            escrows::terms_enc.eq(Some(terms_enc)),
            escrows::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to update escrow terms")
    }

    // --- sweep queries ------------------------------------------------

    /// Funded escrows whose scheduled release time has passed.
    pub fn find_due_for_release(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(escrows::status.eq(EscrowStatus::Funded.as_str()))
            .filter(escrows::scheduled_release_at.is_not_null())
            .filter(escrows::scheduled_release_at.le(now))
            .order(escrows::scheduled_release_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to query escrows due for release")
    }

    /// Unfunded escrows whose funding window has expired.
    pub fn find_expired_pending(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(escrows::status.eq(EscrowStatus::Pending.as_str()))
            .filter(escrows::expires_at.is_not_null())
            .filter(escrows::expires_at.lt(now))
            .order(escrows::expires_at.asc())
            .limit(limit)
            .load(conn)
            .context("Failed to query expired pending escrows")
    }

    pub fn find_by_party(conn: &mut SqliteConnection, user_id: &str) -> Result<Vec<Escrow>> {
        escrows::table
            .filter(
                escrows::buyer_id
                    .eq(user_id)
                    .or(escrows::seller_id.eq(user_id)),
            )
            .order(escrows::created_at.desc())
            .load(conn)
            .context("Failed to query escrows by party")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [EscrowStatus; 7] = [
        EscrowStatus::Pending,
        EscrowStatus::Funded,
        EscrowStatus::Released,
        EscrowStatus::Refunded,
        EscrowStatus::Disputed,
        EscrowStatus::Completed,
        EscrowStatus::Cancelled,
    ];

    #[test]
    fn test_status_round_trip() {
        for status in ALL_STATUSES {
            assert_eq!(EscrowStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(EscrowStatus::from_str("nonsense"), None);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in [
            EscrowStatus::Released,
            EscrowStatus::Refunded,
            EscrowStatus::Completed,
            EscrowStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_pending_transitions() {
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Funded));
        assert!(EscrowStatus::Pending.can_transition_to(EscrowStatus::Cancelled));
        assert!(!EscrowStatus::Pending.can_transition_to(EscrowStatus::Released));
        assert!(!EscrowStatus::Pending.can_transition_to(EscrowStatus::Refunded));
        assert!(!EscrowStatus::Pending.can_transition_to(EscrowStatus::Disputed));
    }

    #[test]
    fn test_funded_transitions() {
        assert!(EscrowStatus::Funded.can_transition_to(EscrowStatus::Released));
        assert!(EscrowStatus::Funded.can_transition_to(EscrowStatus::Refunded));
        assert!(EscrowStatus::Funded.can_transition_to(EscrowStatus::Disputed));
        // Cancellation is only possible before funding completes.
        assert!(!EscrowStatus::Funded.can_transition_to(EscrowStatus::Cancelled));
        assert!(!EscrowStatus::Funded.can_transition_to(EscrowStatus::Completed));
    }

    #[test]
    fn test_disputed_transitions() {
        assert!(EscrowStatus::Disputed.can_transition_to(EscrowStatus::Released));
        assert!(EscrowStatus::Disputed.can_transition_to(EscrowStatus::Refunded));
        assert!(EscrowStatus::Disputed.can_transition_to(EscrowStatus::Completed));
        assert!(!EscrowStatus::Disputed.can_transition_to(EscrowStatus::Cancelled));
        assert!(!EscrowStatus::Disputed.can_transition_to(EscrowStatus::Funded));
    }

    #[test]
    fn test_no_transition_into_pending() {
        for status in ALL_STATUSES {
            assert!(!status.can_transition_to(EscrowStatus::Pending));
        }
    }

    #[test]
    fn test_every_status_reachable_from_pending() {
        // Breadth-first walk over the transition graph.
        let mut reached = vec![EscrowStatus::Pending];
        let mut frontier = vec![EscrowStatus::Pending];
        while let Some(status) = frontier.pop() {
            for &next in status.valid_transitions() {
                if !reached.contains(&next) {
                    reached.push(next);
                    frontier.push(next);
                }
            }
        }
        for status in ALL_STATUSES {
            assert!(reached.contains(&status), "{} unreachable", status);
        }
    }

    #[test]
    fn test_random_walks_always_terminate() {
        // Deterministic LCG so failures reproduce.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next_rand = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for _ in 0..1_000 {
            let mut status = EscrowStatus::Pending;
            let mut steps = 0;
            loop {
                let options = status.valid_transitions();
                if options.is_empty() {
                    assert!(status.is_terminal());
                    break;
                }
                status = options[next_rand() % options.len()];
                steps += 1;
                // Longest path: pending -> funded -> disputed -> resolved.
                assert!(steps <= 3, "walk exceeded the longest legal path");
            }
        }
    }

    #[test]
    fn test_party_role() {
        let escrow = Escrow {
            id: "esc-1".into(),
            buyer_id: "buyer-1".into(),
            seller_id: "seller-1".into(),
            amount: 10_000,
            status: "pending".into(),
            title: None,
            description: None,
            terms_enc: None,
            payment_ref: None,
            settlement_ref: None,
            closing_reason: None,
            expires_at: None,
            scheduled_release_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: chrono::Utc::now().naive_utc(),
            updated_at: chrono::Utc::now().naive_utc(),
        };

        assert_eq!(escrow.party_role("buyer-1"), Some(PartyRole::Buyer));
        assert_eq!(escrow.party_role("seller-1"), Some(PartyRole::Seller));
        assert_eq!(escrow.party_role("stranger"), None);
        assert_eq!(escrow.counterparty_of(PartyRole::Buyer), "seller-1");
        assert_eq!(escrow.counterparty_of(PartyRole::Seller), "buyer-1");
    }

    #[test]
    fn test_new_escrow_defaults() {
        let new_escrow = NewEscrow::default();
        assert_eq!(new_escrow.status, "pending");
        assert!(!new_escrow.id.is_empty());
        assert!(new_escrow.terms_enc.is_none());
    }
}
