//! Weighted rule-set risk engine gating escrow creation.
//!
//! Each rule that fires adds its configured weight to a fixed-point
//! score (hundredths, capped at 10000 = 100.00) and records a flag.
//! Flags only ever add; a missing external signal is treated as
//! unknown and never raises the score.

use std::sync::Arc;

use anyhow::Context;
use chrono::Timelike;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::crypto::sha256_hex;
use crate::db::DbPool;
use crate::error::{CoreError, CoreResult};
use crate::models::transaction_log::event_types;
use crate::models::{
    ActorType, LogAction, NewRiskAssessment, RiskAssessment, RiskFlag, RiskLevel,
    TransactionLogBuilder,
};
use crate::services::reputation::{IpReputation, ProxySignal};
use crate::services::transaction_log::TransactionLogService;

pub const MAX_SCORE: i64 = 10_000;

/// One assessment request.
#[derive(Debug, Clone, Default)]
pub struct AssessmentInput {
    pub user_id: String,
    pub payment_id: Option<String>,
    /// Minor units.
    pub amount: Option<i64>,
    pub ip: Option<String>,
    pub device_info: Option<serde_json::Value>,
    /// Region the caller claims to be in (e.g. billing country).
    pub declared_region: Option<String>,
}

/// Everything the pure rule evaluation needs, resolved up front.
struct RuleInputs {
    amount: Option<i64>,
    prior_amounts: Vec<i64>,
    prior_in_window: i64,
    has_history: bool,
    device_hash: Option<String>,
    known_device_hashes: Vec<String>,
    declared_region: Option<String>,
    signal: ProxySignal,
    hour_utc: u32,
}

pub struct RiskEngine {
    pool: DbPool,
    config: RiskConfig,
    log: TransactionLogService,
    reputation: Arc<dyn IpReputation>,
}

impl RiskEngine {
    pub fn new(
        pool: DbPool,
        config: RiskConfig,
        log: TransactionLogService,
        reputation: Arc<dyn IpReputation>,
    ) -> Self {
        Self {
            pool,
            config,
            log,
            reputation,
        }
    }

    /// Score one prospective transaction and persist the assessment.
    pub async fn assess(&self, input: AssessmentInput) -> CoreResult<RiskAssessment> {
        if input.user_id.is_empty() {
            return Err(CoreError::validation("user_id is required"));
        }

        let now = chrono::Utc::now();

        // History for size, velocity, and device-novelty rules.
        let pool = self.pool.clone();
        let user_id = input.user_id.clone();
        let history_limit = self.config.history_limit;
        let window_start = now.naive_utc()
            - chrono::Duration::from_std(self.config.velocity_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let (prior, prior_in_window) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            let prior = RiskAssessment::recent_for_user(&mut conn, &user_id, history_limit)?;
            let in_window = RiskAssessment::count_since(&mut conn, &user_id, window_start)?;
            Ok::<_, anyhow::Error>((prior, in_window))
        })
        .await
        .context("Task join error")??;

        // External proxy signal; absence degrades to "unknown".
        let mut signal_degraded = false;
        let signal = match &input.ip {
            Some(ip) => match self.reputation.detect_proxy(ip).await {
                Ok(signal) => signal,
                Err(e) => {
                    let absorbed = CoreError::ExternalSignalUnavailable {
                        signal: "ip_reputation",
                        source: e,
                    };
                    warn!(
                        user_id = %input.user_id,
                        error = %absorbed,
                        "Proxy lookup failed, continuing with unknown signal"
                    );
                    signal_degraded = true;
                    ProxySignal::unknown()
                }
            },
            None => ProxySignal::unknown(),
        };

        let device_hash = input
            .device_info
            .as_ref()
            .map(|d| sha256_hex(&d.to_string()));

        let inputs = RuleInputs {
            amount: input.amount,
            prior_amounts: prior.iter().filter_map(|a| a.amount).collect(),
            prior_in_window,
            has_history: !prior.is_empty(),
            device_hash: device_hash.clone(),
            known_device_hashes: prior.iter().filter_map(|a| a.device_hash.clone()).collect(),
            declared_region: input.declared_region.clone(),
            signal: signal.clone(),
            hour_utc: now.hour(),
        };

        let (score, flags) = evaluate_rules(&self.config, &inputs);
        let level = self.bucket(score);

        let requires_3ds = level >= RiskLevel::Medium;
        let requires_mfa = level >= RiskLevel::High;
        let blocked = level == RiskLevel::Critical && flags.contains(&RiskFlag::HighConfidenceProxy);
        let review_required = level > RiskLevel::Low;

        let flag_strings: Vec<&str> = flags.iter().map(|f| f.as_str()).collect();
        let details = signal_degraded
            .then(|| "ip reputation unavailable; signal treated as unknown".to_string());
        let region = signal.region.clone().or(input.declared_region.clone());

        let new_assessment = NewRiskAssessment {
            user_id: input.user_id.clone(),
            payment_id: input.payment_id.clone(),
            amount: input.amount,
            score_hundredths: score,
            level: level.as_str().to_string(),
            flags: serde_json::to_string(&flag_strings).unwrap_or_else(|_| "[]".to_string()),
            details,
            device_info: input.device_info.as_ref().map(|d| d.to_string()),
            device_hash,
            ip_hash: input.ip.as_deref().map(sha256_hex),
            region,
            requires_3ds,
            requires_mfa,
            blocked,
            review_required,
            ..NewRiskAssessment::default()
        };

        let pool = self.pool.clone();
        let assessment = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            RiskAssessment::create(&mut conn, &new_assessment)
        })
        .await
        .context("Task join error")??;

        let mut builder = TransactionLogBuilder::new(event_types::RISK_ASSESSED, LogAction::Assess)
            .actor(&input.user_id, ActorType::User)
            .entity("risk_assessment", &assessment.id)
            .data("score", serde_json::json!(assessment.score()))
            .data("level", serde_json::json!(level.as_str()))
            .data("flags", serde_json::json!(flag_strings))
            .data("blocked", serde_json::json!(blocked));
        if let Some(ip) = &input.ip {
            builder = builder.ip(ip);
        }
        self.log.record(builder).await?;

        info!(
            user_id = %assessment.user_id,
            assessment_id = %assessment.id,
            score = assessment.score(),
            level = %level,
            blocked = blocked,
            "Risk assessment recorded"
        );

        Ok(assessment)
    }

    /// One-shot human review of a flagged assessment. A denial only
    /// records the verdict; refunding or cancelling the associated
    /// transaction stays with the caller.
    pub async fn review(
        &self,
        assessment_id: &str,
        reviewer_id: &str,
        approve: bool,
        notes: Option<String>,
    ) -> CoreResult<RiskAssessment> {
        let pool = self.pool.clone();
        let id = assessment_id.to_string();
        let assessment = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            RiskAssessment::find_optional(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("risk assessment {} not found", assessment_id)))?;

        if !assessment.review_required {
            return Err(CoreError::validation(format!(
                "risk assessment {} has already been reviewed",
                assessment_id
            )));
        }

        let pool = self.pool.clone();
        let id = assessment_id.to_string();
        let reviewer = reviewer_id.to_string();
        let review_notes = notes.clone();
        let updated = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            RiskAssessment::mark_reviewed(&mut conn, &id, &reviewer, approve, review_notes.as_deref())
        })
        .await
        .context("Task join error")??;

        if updated == 0 {
            // Lost a race with another reviewer.
            return Err(CoreError::validation(format!(
                "risk assessment {} has already been reviewed",
                assessment_id
            )));
        }

        self.log
            .record(
                TransactionLogBuilder::new(event_types::RISK_REVIEWED, LogAction::Review)
                    .actor(reviewer_id, ActorType::Arbiter)
                    .entity("risk_assessment", assessment_id)
                    .data("approved", serde_json::json!(approve))
                    .data("notes", serde_json::json!(notes)),
            )
            .await?;

        let pool = self.pool.clone();
        let id = assessment_id.to_string();
        let reloaded = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            RiskAssessment::find_optional(&mut conn, &id)
        })
        .await
        .context("Task join error")??
        .ok_or_else(|| CoreError::validation(format!("risk assessment {} not found", assessment_id)))?;

        Ok(reloaded)
    }

    /// Assessments awaiting review, oldest first.
    pub async fn pending_reviews(&self) -> CoreResult<Vec<RiskAssessment>> {
        let pool = self.pool.clone();
        let pending = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("Failed to get DB connection")?;
            RiskAssessment::pending_reviews(&mut conn)
        })
        .await
        .context("Task join error")??;

        Ok(pending)
    }

    fn bucket(&self, score: i64) -> RiskLevel {
        if score >= self.config.critical_floor {
            RiskLevel::Critical
        } else if score >= self.config.high_floor {
            RiskLevel::High
        } else if score >= self.config.medium_floor {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Apply every rule; returns the capped score and the flags that fired.
fn evaluate_rules(config: &RiskConfig, inputs: &RuleInputs) -> (i64, Vec<RiskFlag>) {
    let mut score: i64 = 0;
    let mut flags: Vec<RiskFlag> = Vec::new();

    // Transaction size relative to the user's history.
    if let Some(amount) = inputs.amount {
        let large = if inputs.prior_amounts.is_empty() {
            amount >= config.large_transaction_floor
        } else {
            let mean = inputs.prior_amounts.iter().sum::<i64>() as f64
                / inputs.prior_amounts.len() as f64;
            amount as f64 > mean * config.large_transaction_multiplier
        };
        if large {
            score += config.weight_large_transaction;
            flags.push(RiskFlag::LargeTransaction);
        }
    }

    // Velocity inside the rolling window.
    if inputs.prior_in_window >= config.velocity_threshold as i64 {
        score += config.weight_rapid_succession;
        flags.push(RiskFlag::RapidSuccessionPayments);
    }

    // Device novelty, only meaningful once the user has history.
    if let Some(device_hash) = &inputs.device_hash {
        if inputs.has_history && !inputs.known_device_hashes.contains(device_hash) {
            score += config.weight_new_device;
            flags.push(RiskFlag::NewDevice);
        }
    }

    // Region mismatch between the claim and the IP-derived region.
    if let (Some(declared), Some(derived)) = (&inputs.declared_region, &inputs.signal.region) {
        if !declared.eq_ignore_ascii_case(derived) {
            score += config.weight_ip_mismatch;
            flags.push(RiskFlag::IpMismatch);
        }
    }

    // Time-of-day anomaly.
    let (quiet_start, quiet_end) = config.odd_hours_utc;
    if inputs.hour_utc >= quiet_start && inputs.hour_utc <= quiet_end {
        score += config.weight_odd_hour;
        flags.push(RiskFlag::OddHourActivity);
    }

    // Proxy detection, with an extra step at high confidence.
    if inputs.signal.is_proxy {
        score += config.weight_proxy;
        flags.push(RiskFlag::ProxyDetected);
        if inputs.signal.confidence >= config.proxy_block_confidence {
            score += config.weight_proxy_high_confidence;
            flags.push(RiskFlag::HighConfidenceProxy);
        }
    }

    (score.min(MAX_SCORE), flags)
}
