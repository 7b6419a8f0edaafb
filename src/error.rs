//! Typed error taxonomy for the escrow core.
//!
//! Domain rejections (bad transition, wrong party, risk block, validation)
//! are distinct variants so embedders can map them to their own surfaces
//! without string matching. Infrastructure failures are folded into
//! [`CoreError::Storage`] via `anyhow` context chains.

use thiserror::Error;

use crate::crypto::CryptoError;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation was attempted against an entity whose current status
    /// does not permit it (e.g. releasing an unfunded escrow).
    #[error("{entity} {id} is '{current}': cannot {attempted}")]
    InvalidEscrowState {
        entity: &'static str,
        id: String,
        current: String,
        attempted: &'static str,
    },

    /// The acting party is not authorized for the attempted action
    /// (wrong side of the escrow, or not a party at all).
    #[error("actor '{actor}' is not authorized to {action}")]
    NotCounterparty { actor: String, action: &'static str },

    /// Escrow creation was refused by the risk gate.
    #[error("blocked by risk assessment {assessment_id} (level {level}, score {score:.2})")]
    RiskBlocked {
        assessment_id: String,
        level: String,
        score: f64,
    },

    /// An encrypted field could not be decrypted or authenticated.
    #[error("decryption failed for field '{field}'")]
    DecryptionFailure {
        field: &'static str,
        #[source]
        source: CryptoError,
    },

    /// An external signal provider (e.g. IP reputation) was unreachable.
    /// Callers inside the risk engine absorb this and degrade; it only
    /// escapes when a caller explicitly requires the signal.
    #[error("external signal '{signal}' unavailable")]
    ExternalSignalUnavailable {
        signal: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed or inconsistent input (amounts, sequence numbers,
    /// missing rejection reasons, closed evidence windows).
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Database, pool, or task-join failure. The chain carries the
    /// operation context added at each layer.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl CoreError {
    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        current: impl Into<String>,
        attempted: &'static str,
    ) -> Self {
        Self::InvalidEscrowState {
            entity,
            id: id.into(),
            current: current.into(),
            attempted,
        }
    }

    pub fn not_counterparty(actor: impl Into<String>, action: &'static str) -> Self {
        Self::NotCounterparty {
            actor: actor.into(),
            action,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailure(msg.into())
    }

    /// True for errors caused by the caller's request, not by the system.
    /// These are safe to surface verbatim and must not trip alerting.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidEscrowState { .. }
                | Self::NotCounterparty { .. }
                | Self::RiskBlocked { .. }
                | Self::ValidationFailure(_)
        )
    }

    /// True for errors that indicate degraded (but non-fatal) operation.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::ExternalSignalUnavailable { .. } | Self::DecryptionFailure { .. }
        )
    }

    /// True for errors that should page: the persistence layer failed.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}
