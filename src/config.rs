//! Runtime configuration for the escrow core.
//!
//! All knobs are explicit struct fields with working defaults; `from_env`
//! is a convenience layer on top, not the source of truth. Construction
//! fails fast on a missing or malformed encryption key so a misconfigured
//! deployment never starts with field encryption silently disabled.

use std::env;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

/// Length of the AES-256 field-encryption key in bytes.
pub const ENCRYPTION_KEY_BYTES: usize = 32;

#[derive(Debug)]
pub enum ConfigError {
    MissingDatabaseUrl,
    MissingEncryptionKey,
    InvalidEncryptionKey(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingDatabaseUrl => {
                write!(f, "DATABASE_URL environment variable not set")
            }
            ConfigError::MissingEncryptionKey => {
                write!(f, "FIELD_ENCRYPTION_KEY environment variable not set")
            }
            ConfigError::InvalidEncryptionKey(msg) => {
                write!(f, "Invalid FIELD_ENCRYPTION_KEY: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration, threaded into services at construction.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite database path or `:memory:`.
    pub database_url: String,

    /// 64 hex characters (32 bytes) used for AES-256-GCM field encryption.
    pub encryption_key: SecretString,

    pub risk: RiskConfig,
    pub sweep: SweepConfig,
}

impl CoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `DATABASE_URL`, `FIELD_ENCRYPTION_KEY`.
    /// Everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let encryption_key = env::var("FIELD_ENCRYPTION_KEY")
            .map(SecretString::new)
            .map_err(|_| ConfigError::MissingEncryptionKey)?;

        let config = Self {
            database_url,
            encryption_key,
            risk: RiskConfig::from_env(),
            sweep: SweepConfig::from_env(),
        };

        // Validate the key eagerly; a bad key must not surface later as a
        // per-field decryption failure.
        config.encryption_key_bytes()?;

        Ok(config)
    }

    /// Decode the hex-encoded field-encryption key.
    pub fn encryption_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let raw = self.encryption_key.expose_secret();
        let bytes = hex::decode(raw)
            .map_err(|e| ConfigError::InvalidEncryptionKey(format!("not valid hex: {}", e)))?;
        if bytes.len() != ENCRYPTION_KEY_BYTES {
            return Err(ConfigError::InvalidEncryptionKey(format!(
                "expected {} bytes, got {}",
                ENCRYPTION_KEY_BYTES,
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Weights and thresholds for the risk engine.
///
/// Scores are fixed-point hundredths on a 0..=10000 scale (two-decimal
/// precision over 0-100), so threshold comparisons stay exact.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Score floor for MEDIUM (inclusive).
    pub medium_floor: i64,
    /// Score floor for HIGH (inclusive).
    pub high_floor: i64,
    /// Score floor for CRITICAL (inclusive).
    pub critical_floor: i64,

    /// Added when the amount dwarfs the user's history.
    pub weight_large_transaction: i64,
    /// Added when too many payments land inside the velocity window.
    pub weight_rapid_succession: i64,
    /// Added when the device fingerprint has no match in history.
    pub weight_new_device: i64,
    /// Added when the IP-derived region contradicts the declared region.
    pub weight_ip_mismatch: i64,
    /// Added during the configured quiet hours (UTC).
    pub weight_odd_hour: i64,
    /// Added for any detected proxy.
    pub weight_proxy: i64,
    /// Added on top of `weight_proxy` at or above `proxy_block_confidence`.
    pub weight_proxy_high_confidence: i64,

    /// A transaction is "large" above `mean * large_transaction_multiplier`.
    pub large_transaction_multiplier: f64,
    /// Absolute large-transaction floor (minor units) for users with no history.
    pub large_transaction_floor: i64,

    /// Window scanned for rapid-succession detection.
    pub velocity_window: Duration,
    /// Assessments inside the window at which the velocity flag fires.
    pub velocity_threshold: usize,

    /// Proxy confidence (0-100) at or above which CRITICAL assessments block.
    pub proxy_block_confidence: u8,

    /// Inclusive UTC hour range treated as anomalous, e.g. (1, 5).
    pub odd_hours_utc: (u32, u32),

    /// Prior assessments consulted for history-based rules.
    pub history_limit: i64,

    /// Reputation provider base URL. `None` disables proxy lookups.
    pub reputation_endpoint: Option<String>,
    pub reputation_timeout: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            medium_floor: 2_500,
            high_floor: 6_000,
            critical_floor: 8_500,
            weight_large_transaction: 2_000,
            weight_rapid_succession: 2_500,
            weight_new_device: 1_500,
            weight_ip_mismatch: 2_000,
            weight_odd_hour: 1_000,
            weight_proxy: 3_500,
            weight_proxy_high_confidence: 5_500,
            large_transaction_multiplier: 3.0,
            large_transaction_floor: 500_000,
            velocity_window: Duration::from_secs(600),
            velocity_threshold: 5,
            proxy_block_confidence: 90,
            odd_hours_utc: (1, 5),
            history_limit: 50,
            reputation_endpoint: None,
            reputation_timeout: Duration::from_secs(3),
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = read_env_u64("RISK_VELOCITY_WINDOW_SECS") {
            config.velocity_window = Duration::from_secs(secs);
        }
        if let Some(n) = read_env_u64("RISK_VELOCITY_THRESHOLD") {
            config.velocity_threshold = n as usize;
        }
        if let Some(n) = read_env_u64("RISK_PROXY_BLOCK_CONFIDENCE") {
            config.proxy_block_confidence = n.min(100) as u8;
        }
        if let Ok(url) = env::var("RISK_REPUTATION_ENDPOINT") {
            if !url.is_empty() {
                config.reputation_endpoint = Some(url);
            }
        }
        if let Some(secs) = read_env_u64("RISK_REPUTATION_TIMEOUT_SECS") {
            config.reputation_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn has_reputation_provider(&self) -> bool {
        self.reputation_endpoint.is_some()
    }
}

/// Settings for the periodic sweep loop.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Interval between sweep cycles.
    pub poll_interval: Duration,
    /// Maximum rows processed per category per cycle.
    pub batch_limit: i64,
    /// Evidence window granted when a dispute is filed. `None` disables
    /// deadlines (and with them, automatic escalation).
    pub evidence_window: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_limit: 100,
            evidence_window: Some(Duration::from_secs(72 * 3600)),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = read_env_u64("SWEEP_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = read_env_u64("SWEEP_BATCH_LIMIT") {
            config.batch_limit = n as i64;
        }
        if let Some(secs) = read_env_u64("DISPUTE_EVIDENCE_WINDOW_SECS") {
            config.evidence_window = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }

        config
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
