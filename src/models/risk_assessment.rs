//! Persisted risk assessments produced by the risk engine.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::risk_assessments;

/// Score buckets, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Individual signals that contributed to a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskFlag {
    LargeTransaction,
    RapidSuccessionPayments,
    NewDevice,
    IpMismatch,
    OddHourActivity,
    ProxyDetected,
    HighConfidenceProxy,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::LargeTransaction => "LARGE_TRANSACTION",
            RiskFlag::RapidSuccessionPayments => "RAPID_SUCCESSION_PAYMENTS",
            RiskFlag::NewDevice => "NEW_DEVICE",
            RiskFlag::IpMismatch => "IP_MISMATCH",
            RiskFlag::OddHourActivity => "ODD_HOUR_ACTIVITY",
            RiskFlag::ProxyDetected => "PROXY_DETECTED",
            RiskFlag::HighConfidenceProxy => "HIGH_CONFIDENCE_PROXY",
        }
    }
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = risk_assessments)]
pub struct RiskAssessment {
    pub id: String,
    pub user_id: String,
    pub payment_id: Option<String>,
    /// Assessed amount in minor units, kept for history-based sizing.
    pub amount: Option<i64>,
    /// Fixed-point score: hundredths on a 0..=10000 scale.
    pub score_hundredths: i64,
    pub level: String,
    /// JSON array of flag strings.
    pub flags: String,
    pub details: Option<String>,
    pub device_info: Option<String>,
    /// SHA-256 of the canonical device fingerprint, for novelty matching.
    pub device_hash: Option<String>,
    /// SHA-256 of the source IP; raw addresses are never stored.
    pub ip_hash: Option<String>,
    pub region: Option<String>,
    pub requires_3ds: bool,
    pub requires_mfa: bool,
    pub blocked: bool,
    pub review_required: bool,
    pub reviewed_by: Option<String>,
    /// The reviewer's verdict. `None` until reviewed; a denial means the
    /// caller must refund or cancel the associated transaction itself.
    pub review_approved: Option<bool>,
    pub review_notes: Option<String>,
    pub reviewed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = risk_assessments)]
pub struct NewRiskAssessment {
    pub id: String,
    pub user_id: String,
    pub payment_id: Option<String>,
    pub amount: Option<i64>,
    pub score_hundredths: i64,
    pub level: String,
    pub flags: String,
    pub details: Option<String>,
    pub device_info: Option<String>,
    pub device_hash: Option<String>,
    pub ip_hash: Option<String>,
    pub region: Option<String>,
    pub requires_3ds: bool,
    pub requires_mfa: bool,
    pub blocked: bool,
    pub review_required: bool,
    pub created_at: NaiveDateTime,
}

impl Default for NewRiskAssessment {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            payment_id: None,
            amount: None,
            score_hundredths: 0,
            level: RiskLevel::Low.as_str().to_string(),
            flags: "[]".to_string(),
            details: None,
            device_info: None,
            device_hash: None,
            ip_hash: None,
            region: None,
            requires_3ds: false,
            requires_mfa: false,
            blocked: false,
            review_required: false,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl RiskAssessment {
    pub fn create(
        conn: &mut SqliteConnection,
        new_assessment: &NewRiskAssessment,
    ) -> Result<RiskAssessment> {
        diesel::insert_into(risk_assessments::table)
            .values(new_assessment)
            .execute(conn)
            .context("Failed to insert risk assessment")?;

        risk_assessments::table
            .filter(risk_assessments::id.eq(&new_assessment.id))
            .first(conn)
            .context("Failed to retrieve created risk assessment")
    }

    pub fn find_optional(
        conn: &mut SqliteConnection,
        assessment_id: &str,
    ) -> Result<Option<RiskAssessment>> {
        risk_assessments::table
            .filter(risk_assessments::id.eq(assessment_id))
            .first(conn)
            .optional()
            .context("Failed to query risk assessment")
    }

    /// Most recent assessments for a user, newest first.
    pub fn recent_for_user(
        conn: &mut SqliteConnection,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<RiskAssessment>> {
        risk_assessments::table
            .filter(risk_assessments::user_id.eq(user_id))
            .order(risk_assessments::created_at.desc())
            .limit(limit)
            .load(conn)
            .context("Failed to query recent risk assessments")
    }

    /// Assessments recorded for a user since `since` (velocity window).
    pub fn count_since(
        conn: &mut SqliteConnection,
        user_id: &str,
        since: NaiveDateTime,
    ) -> Result<i64> {
        risk_assessments::table
            .filter(risk_assessments::user_id.eq(user_id))
            .filter(risk_assessments::created_at.ge(since))
            .count()
            .get_result(conn)
            .context("Failed to count recent risk assessments")
    }

    /// Queue of assessments awaiting a human decision, oldest first.
    pub fn pending_reviews(conn: &mut SqliteConnection) -> Result<Vec<RiskAssessment>> {
        risk_assessments::table
            .filter(risk_assessments::review_required.eq(true))
            .order(risk_assessments::created_at.asc())
            .load(conn)
            .context("Failed to query pending risk reviews")
    }

    /// One-shot review: only succeeds while `review_required` is still
    /// set. Returns the affected-row count.
    pub fn mark_reviewed(
        conn: &mut SqliteConnection,
        assessment_id: &str,
        reviewer_id: &str,
        approve: bool,
        notes: Option<&str>,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            risk_assessments::table
                .filter(risk_assessments::id.eq(assessment_id))
                .filter(risk_assessments::review_required.eq(true)),
        )
        .set((
            risk_assessments::review_required.eq(false),
            risk_assessments::reviewed_by.eq(Some(reviewer_id)),
            risk_assessments::review_approved.eq(Some(approve)),
            risk_assessments::review_notes.eq(notes),
            risk_assessments::reviewed_at.eq(Some(now)),
        ))
        .execute(conn)
        .context("Failed to record risk review")
    }

    /// Score as a 0-100 value with two decimals.
    pub fn score(&self) -> f64 {
        self.score_hundredths as f64 / 100.0
    }

    pub fn current_level(&self) -> Result<RiskLevel> {
        RiskLevel::from_str(&self.level).with_context(|| {
            format!(
                "Risk assessment {} has unknown level '{}'",
                self.id, self.level
            )
        })
    }

    pub fn flag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.flags).unwrap_or_default()
    }

    pub fn has_flag(&self, flag: RiskFlag) -> bool {
        self.flag_list().iter().any(|f| f == flag.as_str())
    }
}
