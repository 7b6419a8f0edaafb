//! Database pool construction and embedded migrations.
//!
//! SQLite via Diesel with r2d2 pooling. Every pooled connection gets the
//! same PRAGMA set applied on acquire; blocking Diesel work is pushed onto
//! `tokio::task::spawn_blocking` by the service layer.

use anyhow::{anyhow, Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sql_query;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::time::Duration;
use tracing::info;

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

const POOL_MAX_SIZE: u32 = 10;
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Applies connection-level PRAGMAs when r2d2 hands out a connection.
#[derive(Debug, Clone, Copy)]
struct PragmaCustomizer;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        // Enforce FK constraints (off by default in SQLite).
        sql_query("PRAGMA foreign_keys = ON;")
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;

        // WAL keeps readers unblocked while the sweep loop writes.
        sql_query("PRAGMA journal_mode = WAL;")
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;

        // Wait up to 5s on a locked database instead of failing.
        sql_query("PRAGMA busy_timeout = 5000;")
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;

        sql_query("PRAGMA synchronous = NORMAL;")
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;

        Ok(())
    }
}

/// Create a connection pool for the given SQLite URL.
pub fn create_pool(database_url: &str) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);

    let pool = r2d2::Pool::builder()
        .max_size(POOL_MAX_SIZE)
        .connection_timeout(POOL_CONNECTION_TIMEOUT)
        .connection_customizer(Box::new(PragmaCustomizer))
        .build(manager)
        .context("Failed to create database connection pool")?;

    info!(database_url = %database_url, "Database pool created");

    Ok(pool)
}

/// Run all pending embedded migrations on the given connection.
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<()> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!("Failed to run database migrations: {}", e))?;

    if !applied.is_empty() {
        info!(count = applied.len(), "Applied database migrations");
    }

    Ok(())
}

/// Create a pool and bring the schema up to date in one step.
pub fn init_pool(database_url: &str) -> Result<DbPool> {
    let pool = create_pool(database_url)?;
    let mut conn = pool.get().context("Failed to get DB connection")?;
    run_migrations(&mut conn)?;
    Ok(pool)
}
