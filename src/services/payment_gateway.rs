//! Payment gateway seam.
//!
//! The core never moves real money. It records the funding reference it
//! is handed and asks the gateway to execute settlements after a state
//! transition has committed, storing whatever outcome reference comes
//! back. A gateway failure is logged and retried out-of-band; it does
//! not undo the transition that gated it.

use std::sync::Mutex;

use anyhow::Result;
use tracing::info;

use crate::models::Escrow;

pub trait PaymentGateway: Send + Sync {
    /// Called after an escrow is marked funded with the payment that
    /// funded it.
    fn record_funding(&self, escrow: &Escrow, payment_ref: &str) -> Result<()>;

    /// Pay out `amount` minor units to the seller. Returns the
    /// gateway's settlement reference, if it issues one.
    fn record_release(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>>;

    /// Return `amount` minor units to the buyer.
    fn record_refund(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>>;
}

/// Gateway for deployments where money movement happens entirely
/// outside the core. Logs each call and issues no references.
#[derive(Debug, Default)]
pub struct NullGateway;

impl PaymentGateway for NullGateway {
    fn record_funding(&self, escrow: &Escrow, payment_ref: &str) -> Result<()> {
        info!(escrow_id = %escrow.id, payment_ref = %payment_ref, "Funding recorded");
        Ok(())
    }

    fn record_release(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>> {
        info!(escrow_id = %escrow.id, amount = amount, "Release recorded");
        Ok(None)
    }

    fn record_refund(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>> {
        info!(escrow_id = %escrow.id, amount = amount, "Refund recorded");
        Ok(None)
    }
}

/// Test double that records settlement calls and issues sequential
/// references.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Funding { escrow_id: String, payment_ref: String },
    Release { escrow_id: String, amount: i64 },
    Refund { escrow_id: String, amount: i64 },
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn push(&self, call: GatewayCall) -> usize {
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(call);
                calls.len()
            }
            Err(_) => 0,
        }
    }
}

impl PaymentGateway for RecordingGateway {
    fn record_funding(&self, escrow: &Escrow, payment_ref: &str) -> Result<()> {
        self.push(GatewayCall::Funding {
            escrow_id: escrow.id.clone(),
            payment_ref: payment_ref.to_string(),
        });
        Ok(())
    }

    fn record_release(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>> {
        let n = self.push(GatewayCall::Release {
            escrow_id: escrow.id.clone(),
            amount,
        });
        Ok(Some(format!("settle-{}", n)))
    }

    fn record_refund(&self, escrow: &Escrow, amount: i64) -> Result<Option<String>> {
        let n = self.push(GatewayCall::Refund {
            escrow_id: escrow.id.clone(),
            amount,
        });
        Ok(Some(format!("settle-{}", n)))
    }
}
