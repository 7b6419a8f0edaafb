//! Outbound notifications for lifecycle events.
//!
//! Delivery is fire-and-forget: the state transition has already
//! committed by the time a notifier runs, so implementations swallow
//! their own failures. Nothing here may roll an operation back.

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::models::EscrowStatus;

/// Events emitted after successful operations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    EscrowStatusChanged {
        escrow_id: String,
        status: EscrowStatus,
    },
    MilestoneCompleted {
        escrow_id: String,
        milestone_id: String,
    },
    ProofSubmitted {
        escrow_id: String,
        proof_id: String,
    },
    ProofReviewed {
        escrow_id: String,
        proof_id: String,
        accepted: bool,
    },
    DisputeFiled {
        escrow_id: String,
        dispute_id: String,
    },
    DisputeResolved {
        escrow_id: String,
        dispute_id: String,
        resolution: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: CoreEvent);
}

/// Default notifier: structured log line per event.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: CoreEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = %payload, "Core event"),
            Err(_) => info!(?event, "Core event"),
        }
    }
}

/// Test double that records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: CoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
