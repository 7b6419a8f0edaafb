//! Delivery proofs: evidence the obligated party submits for review.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::delivery_proofs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProofStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofStatus::Pending => "pending",
            ProofStatus::Accepted => "accepted",
            ProofStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProofStatus::Pending),
            "accepted" => Some(ProofStatus::Accepted),
            "rejected" => Some(ProofStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    Image,
    Document,
    Video,
    Link,
    Text,
}

impl ProofKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Image => "image",
            ProofKind::Document => "document",
            ProofKind::Video => "video",
            ProofKind::Link => "link",
            ProofKind::Text => "text",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "image" => Some(ProofKind::Image),
            "document" => Some(ProofKind::Document),
            "video" => Some(ProofKind::Video),
            "link" => Some(ProofKind::Link),
            "text" => Some(ProofKind::Text),
            _ => None,
        }
    }
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = delivery_proofs)]
pub struct DeliveryProof {
    pub id: String,
    pub escrow_id: String,
    /// Present when the proof covers one milestone rather than the
    /// whole escrow.
    pub milestone_id: Option<String>,
    pub submitted_by: String,
    pub kind: String,
    /// Encrypted description envelope.
    pub description_enc: Option<String>,
    /// JSON array of file references.
    pub files: String,
    pub metadata: Option<String>,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = delivery_proofs)]
pub struct NewDeliveryProof {
    pub id: String,
    pub escrow_id: String,
    pub milestone_id: Option<String>,
    pub submitted_by: String,
    pub kind: String,
    pub description_enc: Option<String>,
    pub files: String,
    pub metadata: Option<String>,
    pub status: String,
    pub created_at: NaiveDateTime,
}

impl Default for NewDeliveryProof {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            escrow_id: String::new(),
            milestone_id: None,
            submitted_by: String::new(),
            kind: ProofKind::Document.as_str().to_string(),
            description_enc: None,
            files: "[]".to_string(),
            metadata: None,
            status: ProofStatus::Pending.as_str().to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl DeliveryProof {
    pub fn create(conn: &mut SqliteConnection, new_proof: &NewDeliveryProof) -> Result<DeliveryProof> {
        diesel::insert_into(delivery_proofs::table)
            .values(new_proof)
            .execute(conn)
            .context("Failed to insert delivery proof")?;

        delivery_proofs::table
            .filter(delivery_proofs::id.eq(&new_proof.id))
            .first(conn)
            .context("Failed to retrieve created delivery proof")
    }

    pub fn find_optional(
        conn: &mut SqliteConnection,
        proof_id: &str,
    ) -> Result<Option<DeliveryProof>> {
        delivery_proofs::table
            .filter(delivery_proofs::id.eq(proof_id))
            .first(conn)
            .optional()
            .context("Failed to query delivery proof")
    }

    pub fn for_escrow(conn: &mut SqliteConnection, escrow_id: &str) -> Result<Vec<DeliveryProof>> {
        delivery_proofs::table
            .filter(delivery_proofs::escrow_id.eq(escrow_id))
            .order(delivery_proofs::created_at.asc())
            .load(conn)
            .context("Failed to query delivery proofs")
    }

    pub fn current_status(&self) -> Result<ProofStatus> {
        ProofStatus::from_str(&self.status).with_context(|| {
            format!("Proof {} has unknown status '{}'", self.id, self.status)
        })
    }

    pub fn file_list(&self) -> Vec<String> {
        serde_json::from_str(&self.files).unwrap_or_default()
    }

    /// One-shot review: only succeeds while the proof is still pending.
    /// Returns the affected-row count.
    pub fn mark_reviewed(
        conn: &mut SqliteConnection,
        proof_id: &str,
        verdict: ProofStatus,
        reviewer_id: &str,
        rejection_reason: Option<&str>,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            delivery_proofs::table
                .filter(delivery_proofs::id.eq(proof_id))
                .filter(delivery_proofs::status.eq(ProofStatus::Pending.as_str())),
        )
        .set((
            delivery_proofs::status.eq(verdict.as_str()),
            delivery_proofs::reviewed_by.eq(Some(reviewer_id)),
            delivery_proofs::rejection_reason.eq(rejection_reason),
            delivery_proofs::reviewed_at.eq(Some(now)),
        ))
        .execute(conn)
        .context("Failed to record proof review")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ProofStatus::Pending,
            ProofStatus::Accepted,
            ProofStatus::Rejected,
        ] {
            assert_eq!(ProofStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ProofStatus::from_str("approved"), None);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ProofKind::Image,
            ProofKind::Document,
            ProofKind::Video,
            ProofKind::Link,
            ProofKind::Text,
        ] {
            assert_eq!(ProofKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ProofKind::from_str("audio"), None);
    }

    #[test]
    fn test_file_list_parses_json_array() {
        let proof = DeliveryProof {
            files: r#"["a.png","b.pdf"]"#.to_string(),
            ..sample_proof()
        };
        assert_eq!(proof.file_list(), vec!["a.png", "b.pdf"]);

        let empty = DeliveryProof {
            files: "not json".to_string(),
            ..sample_proof()
        };
        assert!(empty.file_list().is_empty());
    }

    fn sample_proof() -> DeliveryProof {
        DeliveryProof {
            id: "proof-1".into(),
            escrow_id: "esc-1".into(),
            milestone_id: None,
            submitted_by: "seller-1".into(),
            kind: "document".into(),
            description_enc: None,
            files: "[]".into(),
            metadata: None,
            status: "pending".into(),
            reviewed_by: None,
            rejection_reason: None,
            reviewed_at: None,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}
