//! Shared wiring for integration tests: one in-memory database with the
//! full service stack on top, plus recording doubles for the outbound
//! collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::SqliteConnection;

use escrow_core::config::{RiskConfig, SweepConfig};
use escrow_core::crypto::FieldCodec;
use escrow_core::db::{run_migrations, DbPool};
use escrow_core::services::{
    DisputeService, EscrowService, IpReputation, ProofService, RecordingGateway,
    RecordingNotifier, ReleaseMonitor, RequestContext, RiskEngine, StaticReputation,
    TransactionLogService,
};

pub const TEST_KEY: [u8; 32] = [7u8; 32];

/// Single-connection pool over one shared in-memory database.
pub fn test_pool() -> DbPool {
    let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .expect("Failed to create test pool");

    let mut conn = pool.get().expect("Failed to get test connection");
    run_migrations(&mut conn).expect("Failed to run migrations");

    pool
}

pub struct TestCore {
    pub pool: DbPool,
    pub codec: Arc<FieldCodec>,
    pub log: TransactionLogService,
    pub risk: Arc<RiskEngine>,
    pub escrow: Arc<EscrowService>,
    pub proof: ProofService,
    pub dispute: Arc<DisputeService>,
    pub monitor: ReleaseMonitor,
    pub gateway: Arc<RecordingGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

/// Full stack with a clean reputation signal and the default 72h
/// evidence window.
pub async fn core() -> TestCore {
    core_with(Arc::new(StaticReputation::clean("US")), default_evidence_window()).await
}

pub fn default_evidence_window() -> Option<Duration> {
    SweepConfig::default().evidence_window
}

pub async fn core_with(
    reputation: Arc<dyn IpReputation>,
    evidence_window: Option<Duration>,
) -> TestCore {
    let pool = test_pool();
    let codec = Arc::new(FieldCodec::new(&TEST_KEY).expect("Failed to build codec"));

    let log = TransactionLogService::new(pool.clone());
    log.initialize().await.expect("Failed to initialize log");

    let gateway = Arc::new(RecordingGateway::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let risk = Arc::new(RiskEngine::new(
        pool.clone(),
        RiskConfig::default(),
        log.clone(),
        reputation,
    ));

    let escrow = Arc::new(EscrowService::new(
        pool.clone(),
        codec.clone(),
        log.clone(),
        risk.clone(),
        gateway.clone(),
        notifier.clone(),
    ));

    let proof = ProofService::new(pool.clone(), codec.clone(), log.clone(), notifier.clone());

    let dispute = Arc::new(DisputeService::new(
        pool.clone(),
        codec.clone(),
        log.clone(),
        notifier.clone(),
        escrow.clone(),
        evidence_window,
    ));

    let monitor = ReleaseMonitor::new(
        pool.clone(),
        SweepConfig {
            poll_interval: Duration::from_millis(50),
            batch_limit: 100,
            evidence_window,
        },
        escrow.clone(),
        dispute.clone(),
    );

    TestCore {
        pool,
        codec,
        log,
        risk,
        escrow,
        proof,
        dispute,
        monitor,
        gateway,
        notifier,
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::default()
}

pub fn ctx_with_ip(ip: &str) -> RequestContext {
    RequestContext {
        ip: Some(ip.to_string()),
        ..RequestContext::default()
    }
}
