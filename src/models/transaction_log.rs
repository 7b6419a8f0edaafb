//! Append-only transaction log with SHA-256 hash chaining.
//!
//! Each entry hashes its own canonical fields together with the previous
//! entry's hash. Editing or deleting any historical row breaks every
//! hash that follows it, so `verify_chain` can pinpoint tampering.
//! Rows are never updated or deleted.

use anyhow::{Context, Result};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::sha256_hex;
use crate::schema::transaction_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A buyer or seller acting on their own escrow.
    User,
    /// A dispute resolver or risk reviewer.
    Arbiter,
    /// The sweep loop and other internal automation.
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Arbiter => "arbiter",
            ActorType::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ActorType::User),
            "arbiter" => Some(ActorType::Arbiter),
            "system" => Some(ActorType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Create,
    Fund,
    Release,
    Refund,
    Cancel,
    Complete,
    Schedule,
    Update,
    Submit,
    Review,
    Dispute,
    Escalate,
    Resolve,
    Assess,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Create => "create",
            LogAction::Fund => "fund",
            LogAction::Release => "release",
            LogAction::Refund => "refund",
            LogAction::Cancel => "cancel",
            LogAction::Complete => "complete",
            LogAction::Schedule => "schedule",
            LogAction::Update => "update",
            LogAction::Submit => "submit",
            LogAction::Review => "review",
            LogAction::Dispute => "dispute",
            LogAction::Escalate => "escalate",
            LogAction::Resolve => "resolve",
            LogAction::Assess => "assess",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(LogAction::Create),
            "fund" => Some(LogAction::Fund),
            "release" => Some(LogAction::Release),
            "refund" => Some(LogAction::Refund),
            "cancel" => Some(LogAction::Cancel),
            "complete" => Some(LogAction::Complete),
            "schedule" => Some(LogAction::Schedule),
            "update" => Some(LogAction::Update),
            "submit" => Some(LogAction::Submit),
            "review" => Some(LogAction::Review),
            "dispute" => Some(LogAction::Dispute),
            "escalate" => Some(LogAction::Escalate),
            "resolve" => Some(LogAction::Resolve),
            "assess" => Some(LogAction::Assess),
            _ => None,
        }
    }
}

/// Well-known event type strings. Dot notation: `<entity>.<event>`.
pub mod event_types {
    pub const ESCROW_CREATED: &str = "escrow.created";
    pub const ESCROW_FUNDED: &str = "escrow.funded";
    pub const FUNDS_RELEASED: &str = "escrow.funds_released";
    pub const ESCROW_REFUNDED: &str = "escrow.refunded";
    pub const ESCROW_CANCELLED: &str = "escrow.cancelled";
    pub const ESCROW_COMPLETED: &str = "escrow.completed";
    pub const ESCROW_DISPUTED: &str = "escrow.disputed";
    pub const ESCROW_TERMS_UPDATED: &str = "escrow.terms_updated";
    pub const RELEASE_SCHEDULED: &str = "escrow.release_scheduled";
    pub const MILESTONE_UPDATED: &str = "escrow.milestone_updated";

    pub const PROOF_SUBMITTED: &str = "proof.submitted";
    pub const PROOF_REVIEWED: &str = "proof.reviewed";

    pub const DISPUTE_CREATED: &str = "dispute.created";
    pub const DISPUTE_REVIEW_STARTED: &str = "dispute.review_started";
    pub const DISPUTE_EVIDENCE_ADDED: &str = "dispute.evidence_added";
    pub const DISPUTE_ESCALATED: &str = "dispute.escalated";
    pub const DISPUTE_RESOLVED: &str = "dispute.resolved";

    pub const RISK_ASSESSED: &str = "risk.assessed";
    pub const RISK_REVIEWED: &str = "risk.reviewed";
}

/// Field order MUST match the column order in schema.rs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = transaction_log)]
pub struct TransactionLogEntry {
    /// ULID: lexicographic order is creation order.
    pub id: String,
    /// RFC 3339 UTC.
    pub timestamp: String,
    pub event_type: String,
    pub action: String,
    pub actor_id: Option<String>,
    pub actor_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// JSON payload with event-specific context.
    pub event_data: Option<String>,
    /// SHA-256 of the source IP; the raw address is never written.
    pub ip_hash: Option<String>,
    pub device: Option<String>,
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = transaction_log)]
pub struct NewTransactionLogEntry {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    pub action: String,
    pub actor_id: Option<String>,
    pub actor_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub event_data: Option<String>,
    pub ip_hash: Option<String>,
    pub device: Option<String>,
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

/// Accumulates entry fields, then seals and inserts the row.
#[derive(Debug, Clone)]
pub struct TransactionLogBuilder {
    event_type: String,
    action: LogAction,
    actor_id: Option<String>,
    actor_type: ActorType,
    entity_type: Option<String>,
    entity_id: Option<String>,
    event_data: Value,
    ip_hash: Option<String>,
    device: Option<String>,
}

impl TransactionLogBuilder {
    pub fn new(event_type: &str, action: LogAction) -> Self {
        Self {
            event_type: event_type.to_string(),
            action,
            actor_id: None,
            actor_type: ActorType::System,
            entity_type: None,
            entity_id: None,
            event_data: Value::Object(serde_json::Map::new()),
            ip_hash: None,
            device: None,
        }
    }

    pub fn actor(mut self, actor_id: &str, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id.to_string());
        self.actor_type = actor_type;
        self
    }

    pub fn system_actor(mut self) -> Self {
        self.actor_id = Some("system".to_string());
        self.actor_type = ActorType::System;
        self
    }

    pub fn entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    /// Attach one payload field. Repeated calls accumulate.
    pub fn data(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(ref mut map) = self.event_data {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Record the caller's IP as a digest only.
    pub fn ip(mut self, raw_ip: &str) -> Self {
        self.ip_hash = Some(sha256_hex(raw_ip));
        self
    }

    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Seal the entry against `prev_hash` and insert it.
    pub fn build(
        self,
        conn: &mut SqliteConnection,
        prev_hash: Option<String>,
    ) -> Result<TransactionLogEntry> {
        let id = ulid::Ulid::new().to_string();
        let timestamp = chrono::Utc::now().to_rfc3339();

        let event_data = match &self.event_data {
            Value::Object(map) if map.is_empty() => None,
            other => Some(other.to_string()),
        };

        let record_hash = compute_record_hash(
            &id,
            &timestamp,
            &self.event_type,
            self.action.as_str(),
            self.actor_id.as_deref(),
            self.actor_type.as_str(),
            self.entity_type.as_deref(),
            self.entity_id.as_deref(),
            event_data.as_deref(),
            prev_hash.as_deref(),
        );

        let new_entry = NewTransactionLogEntry {
            id,
            timestamp,
            event_type: self.event_type,
            action: self.action.as_str().to_string(),
            actor_id: self.actor_id,
            actor_type: self.actor_type.as_str().to_string(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            event_data,
            ip_hash: self.ip_hash,
            device: self.device,
            prev_hash,
            record_hash,
        };

        diesel::insert_into(transaction_log::table)
            .values(&new_entry)
            .execute(conn)
            .context("Failed to insert transaction log entry")?;

        Ok(TransactionLogEntry {
            id: new_entry.id,
            timestamp: new_entry.timestamp,
            event_type: new_entry.event_type,
            action: new_entry.action,
            actor_id: new_entry.actor_id,
            actor_type: new_entry.actor_type,
            entity_type: new_entry.entity_type,
            entity_id: new_entry.entity_id,
            event_data: new_entry.event_data,
            ip_hash: new_entry.ip_hash,
            device: new_entry.device,
            prev_hash: new_entry.prev_hash,
            record_hash: new_entry.record_hash,
        })
    }
}

/// Canonical hash over the fields that must be tamper-evident.
#[allow(clippy::too_many_arguments)]
fn compute_record_hash(
    id: &str,
    timestamp: &str,
    event_type: &str,
    action: &str,
    actor_id: Option<&str>,
    actor_type: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    event_data: Option<&str>,
    prev_hash: Option<&str>,
) -> String {
    let fields = [
        id,
        timestamp,
        event_type,
        action,
        actor_id.unwrap_or(""),
        actor_type,
        entity_type.unwrap_or(""),
        entity_id.unwrap_or(""),
        event_data.unwrap_or(""),
        prev_hash.unwrap_or(""),
    ];
    // Length-prefixed fields: a `|` inside a value cannot shift a field
    // boundary and alias two different records.
    let mut input = String::new();
    for field in fields {
        input.push_str(&field.len().to_string());
        input.push(':');
        input.push_str(field);
        input.push('|');
    }
    sha256_hex(&input)
}

impl TransactionLogEntry {
    /// Hash of the newest entry, the anchor for the next append.
    pub fn last_hash(conn: &mut SqliteConnection) -> Result<Option<String>> {
        transaction_log::table
            .order((transaction_log::timestamp.desc(), transaction_log::id.desc()))
            .select(transaction_log::record_hash)
            .first(conn)
            .optional()
            .context("Failed to query last log hash")
    }

    /// Full history for one entity, oldest first.
    pub fn find_by_entity(
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<TransactionLogEntry>> {
        transaction_log::table
            .filter(transaction_log::entity_type.eq(entity_type))
            .filter(transaction_log::entity_id.eq(entity_id))
            .order((transaction_log::timestamp.asc(), transaction_log::id.asc()))
            .load(conn)
            .context("Failed to query log entries for entity")
    }

    pub fn recent(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<TransactionLogEntry>> {
        transaction_log::table
            .order((transaction_log::timestamp.desc(), transaction_log::id.desc()))
            .limit(limit)
            .load(conn)
            .context("Failed to query recent log entries")
    }

    pub fn all_ordered(conn: &mut SqliteConnection) -> Result<Vec<TransactionLogEntry>> {
        transaction_log::table
            .order((transaction_log::timestamp.asc(), transaction_log::id.asc()))
            .load(conn)
            .context("Failed to load transaction log")
    }

    /// Walk the chain from the beginning. Returns the number of entries
    /// checked and the ids of entries whose linkage or recomputed hash
    /// does not match.
    pub fn verify_chain(conn: &mut SqliteConnection) -> Result<(usize, Vec<String>)> {
        let entries = Self::all_ordered(conn)?;
        let mut broken = Vec::new();
        let mut expected_prev: Option<String> = None;

        for entry in &entries {
            let recomputed = compute_record_hash(
                &entry.id,
                &entry.timestamp,
                &entry.event_type,
                &entry.action,
                entry.actor_id.as_deref(),
                &entry.actor_type,
                entry.entity_type.as_deref(),
                entry.entity_id.as_deref(),
                entry.event_data.as_deref(),
                entry.prev_hash.as_deref(),
            );

            if entry.prev_hash != expected_prev || recomputed != entry.record_hash {
                broken.push(entry.id.clone());
            }

            expected_prev = Some(entry.record_hash.clone());
        }

        Ok((entries.len(), broken))
    }
}
