//! Milestones split an escrow amount into sequenced partial deliveries.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::escrow_milestones;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Completed,
    Disputed,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Disputed => "disputed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MilestoneStatus::Pending),
            "completed" => Some(MilestoneStatus::Completed),
            "disputed" => Some(MilestoneStatus::Disputed),
            _ => None,
        }
    }
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = escrow_milestones)]
pub struct Milestone {
    pub id: String,
    pub escrow_id: String,
    /// Defines release order; unique per escrow.
    pub sequence_no: i32,
    /// Minor units (cents).
    pub amount: i64,
    pub description: String,
    pub status: String,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = escrow_milestones)]
pub struct NewMilestone {
    pub id: String,
    pub escrow_id: String,
    pub sequence_no: i32,
    pub amount: i64,
    pub description: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewMilestone {
    pub fn new(escrow_id: &str, sequence_no: i32, amount: i64, description: &str) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            escrow_id: escrow_id.to_string(),
            sequence_no,
            amount,
            description: description.to_string(),
            status: MilestoneStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Milestone {
    pub fn insert_all(conn: &mut SqliteConnection, milestones: &[NewMilestone]) -> Result<usize> {
        diesel::insert_into(escrow_milestones::table)
            .values(milestones)
            .execute(conn)
            .context("Failed to insert milestones")
    }

    pub fn find_by_id(conn: &mut SqliteConnection, milestone_id: &str) -> Result<Option<Milestone>> {
        escrow_milestones::table
            .filter(escrow_milestones::id.eq(milestone_id))
            .first(conn)
            .optional()
            .context("Failed to query milestone")
    }

    /// All milestones of an escrow in release order.
    pub fn for_escrow(conn: &mut SqliteConnection, escrow_id: &str) -> Result<Vec<Milestone>> {
        escrow_milestones::table
            .filter(escrow_milestones::escrow_id.eq(escrow_id))
            .order(escrow_milestones::sequence_no.asc())
            .load(conn)
            .context("Failed to query milestones")
    }

    pub fn current_status(&self) -> Result<MilestoneStatus> {
        MilestoneStatus::from_str(&self.status).with_context(|| {
            format!("Milestone {} has unknown status '{}'", self.id, self.status)
        })
    }

    /// True when the escrow has no milestone left in a non-completed
    /// status. An escrow without milestones counts as complete.
    pub fn all_completed(conn: &mut SqliteConnection, escrow_id: &str) -> Result<bool> {
        let open: i64 = escrow_milestones::table
            .filter(escrow_milestones::escrow_id.eq(escrow_id))
            .filter(escrow_milestones::status.ne(MilestoneStatus::Completed.as_str()))
            .count()
            .get_result(conn)
            .context("Failed to count open milestones")?;
        Ok(open == 0)
    }

    /// Count of earlier-sequence milestones not yet completed. Non-zero
    /// means completing this one would break release order.
    pub fn open_predecessors(
        conn: &mut SqliteConnection,
        escrow_id: &str,
        sequence_no: i32,
    ) -> Result<i64> {
        escrow_milestones::table
            .filter(escrow_milestones::escrow_id.eq(escrow_id))
            .filter(escrow_milestones::sequence_no.lt(sequence_no))
            .filter(escrow_milestones::status.ne(MilestoneStatus::Completed.as_str()))
            .count()
            .get_result(conn)
            .context("Failed to count preceding milestones")
    }

    /// Conditional completion: only succeeds while the milestone is
    /// still pending. Returns the affected-row count.
    pub fn mark_completed(conn: &mut SqliteConnection, milestone_id: &str) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            escrow_milestones::table
                .filter(escrow_milestones::id.eq(milestone_id))
                .filter(escrow_milestones::status.eq(MilestoneStatus::Pending.as_str())),
        )
        .set((
            escrow_milestones::status.eq(MilestoneStatus::Completed.as_str()),
            escrow_milestones::completed_at.eq(Some(now)),
            escrow_milestones::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark milestone completed")
    }

    /// Freeze the remaining open milestones of an escrow when a dispute
    /// is filed.
    pub fn mark_open_disputed(conn: &mut SqliteConnection, escrow_id: &str) -> Result<usize> {
        diesel::update(
            escrow_milestones::table
                .filter(escrow_milestones::escrow_id.eq(escrow_id))
                .filter(escrow_milestones::status.eq(MilestoneStatus::Pending.as_str())),
        )
        .set((
            escrow_milestones::status.eq(MilestoneStatus::Disputed.as_str()),
            escrow_milestones::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .context("Failed to mark milestones disputed")
    }
}
