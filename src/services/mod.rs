//! Service layer: orchestration, authorization, and audit for every
//! lifecycle operation. Services own a pool handle and run Diesel work
//! on blocking threads; collaborators (gateway, notifier, reputation)
//! are injected as trait objects.

pub mod dispute;
pub mod escrow;
pub mod notifier;
pub mod payment_gateway;
pub mod proof;
pub mod release_monitor;
pub mod reputation;
pub mod risk;
pub mod transaction_log;

pub use dispute::{DisputeOutcome, DisputeService, FileDisputeInput};
pub use escrow::{CreateEscrowInput, EscrowDetail, EscrowService, MilestoneSpec};
pub use notifier::{CoreEvent, LogNotifier, Notifier, RecordingNotifier};
pub use payment_gateway::{GatewayCall, NullGateway, PaymentGateway, RecordingGateway};
pub use proof::{ProofReview, ProofService, ReviewDecision, SubmitProofInput};
pub use release_monitor::{ReleaseMonitor, SweepStats};
pub use reputation::{HttpIpReputation, IpReputation, ProxySignal, StaticReputation};
pub use risk::{AssessmentInput, RiskEngine};
pub use transaction_log::{IntegrityReport, TransactionLogService};

use crate::crypto::FieldCodec;
use crate::error::{CoreError, CoreResult};
use crate::models::TransactionLogBuilder;

/// Caller-supplied request metadata, threaded into risk scoring and the
/// transaction log. Raw IPs are hashed before they are stored anywhere.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub device_info: Option<serde_json::Value>,
    /// Region the caller claims to operate from.
    pub declared_region: Option<String>,
}

impl RequestContext {
    pub(crate) fn apply(&self, mut builder: TransactionLogBuilder) -> TransactionLogBuilder {
        if let Some(ip) = &self.ip {
            builder = builder.ip(ip);
        }
        if let Some(device) = &self.device_info {
            builder = builder.device(&device.to_string());
        }
        builder
    }
}

pub(crate) fn encrypt_field(
    codec: &FieldCodec,
    field: &'static str,
    value: &str,
) -> CoreResult<String> {
    codec.encrypt_str(value).map_err(|e| {
        CoreError::Storage(anyhow::Error::new(e).context(format!("Failed to encrypt {}", field)))
    })
}

/// Strict decrypt for single-field reads. Bulk detail reads use
/// [`FieldCodec::decrypt_or_sentinel`] instead so one bad envelope does
/// not take down the whole record.
pub(crate) fn decrypt_field(
    codec: &FieldCodec,
    field: &'static str,
    envelope: &str,
) -> CoreResult<String> {
    codec
        .decrypt_str(envelope)
        .map_err(|source| CoreError::DecryptionFailure { field, source })
}
