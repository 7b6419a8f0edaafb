//! Database row types and their query helpers.
//!
//! Every model owns the Diesel queries for its table; services compose
//! them inside `spawn_blocking` closures. Status columns are plain text
//! with a typed enum alongside for transition checks.

pub mod delivery_proof;
pub mod dispute;
pub mod escrow;
pub mod milestone;
pub mod risk_assessment;
pub mod transaction_log;

pub use delivery_proof::{DeliveryProof, NewDeliveryProof, ProofKind, ProofStatus};
pub use dispute::{
    Dispute, DisputeEvidence, DisputeStatus, NewDispute, NewDisputeEvidence,
};
pub use escrow::{Escrow, EscrowStatus, NewEscrow, PartyRole};
pub use milestone::{Milestone, MilestoneStatus, NewMilestone};
pub use risk_assessment::{NewRiskAssessment, RiskAssessment, RiskFlag, RiskLevel};
pub use transaction_log::{
    ActorType, LogAction, NewTransactionLogEntry, TransactionLogBuilder, TransactionLogEntry,
};
