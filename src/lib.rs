//! Escrow lifecycle and settlement engine.
//!
//! Holds funds between anonymous buyers and sellers with milestone
//! delivery, proof-of-delivery review, dispute resolution, risk-based
//! transaction gating, and field-level encryption of sensitive data.
//! Every status change is a conditional update keyed on the expected
//! current status, and every transition lands exactly one entry in a
//! hash-chained, append-only transaction log.
//!
//! The crate is a library core: HTTP routing, authentication, payment
//! rails, and notification delivery are the embedder's job and attach
//! through the traits in [`services`] ([`services::PaymentGateway`],
//! [`services::Notifier`], [`services::IpReputation`]).
//!
//! # Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use escrow_core::config::CoreConfig;
//! use escrow_core::crypto::FieldCodec;
//! use escrow_core::services::{
//!     DisputeService, EscrowService, LogNotifier, NullGateway, ReleaseMonitor, RiskEngine,
//!     StaticReputation, TransactionLogService,
//! };
//!
//! # async fn wire() -> anyhow::Result<()> {
//! let config = CoreConfig::from_env()?;
//! let pool = escrow_core::db::init_pool(&config.database_url)?;
//! let codec = Arc::new(FieldCodec::new(&config.encryption_key_bytes()?)?);
//!
//! let log = TransactionLogService::new(pool.clone());
//! log.initialize().await?;
//!
//! let risk = Arc::new(RiskEngine::new(
//!     pool.clone(),
//!     config.risk.clone(),
//!     log.clone(),
//!     Arc::new(StaticReputation::clean("US")),
//! ));
//! let escrow = Arc::new(EscrowService::new(
//!     pool.clone(),
//!     codec.clone(),
//!     log.clone(),
//!     risk.clone(),
//!     Arc::new(NullGateway),
//!     Arc::new(LogNotifier),
//! ));
//! let dispute = Arc::new(DisputeService::new(
//!     pool.clone(),
//!     codec,
//!     log,
//!     Arc::new(LogNotifier),
//!     escrow.clone(),
//!     config.sweep.evidence_window,
//! ));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let monitor = Arc::new(ReleaseMonitor::new(pool, config.sweep.clone(), escrow, dispute));
//! tokio::spawn(monitor.start(shutdown_rx));
//! # drop(shutdown_tx);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod services;

pub use config::{ConfigError, CoreConfig, RiskConfig, SweepConfig};
pub use crypto::{CryptoError, FieldCodec};
pub use db::DbPool;
pub use error::{CoreError, CoreResult};
