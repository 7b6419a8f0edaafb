//! IP reputation lookups for the risk engine.
//!
//! The provider sits behind a trait so the engine can run against a
//! fixed signal in tests and degrade cleanly when the real provider is
//! down. Raw IPs go to the provider; only digests reach the database.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Provider verdict for one IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySignal {
    pub is_proxy: bool,
    /// 0-100.
    pub confidence: u8,
    /// Provider-derived region, e.g. an ISO country code.
    pub region: Option<String>,
}

impl ProxySignal {
    /// Neutral signal used when no lookup ran.
    pub fn unknown() -> Self {
        Self {
            is_proxy: false,
            confidence: 0,
            region: None,
        }
    }
}

#[async_trait]
pub trait IpReputation: Send + Sync {
    async fn detect_proxy(&self, ip: &str) -> Result<ProxySignal>;
}

/// HTTP-backed provider: `GET {endpoint}?ip={ip}` returning a
/// [`ProxySignal`] JSON body.
pub struct HttpIpReputation {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIpReputation {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build reputation HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IpReputation for HttpIpReputation {
    async fn detect_proxy(&self, ip: &str) -> Result<ProxySignal> {
        let url = format!("{}?ip={}", self.endpoint, ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Reputation request failed")?
            .error_for_status()
            .context("Reputation provider returned an error status")?;

        response
            .json::<ProxySignal>()
            .await
            .context("Failed to parse reputation response")
    }
}

/// Fixed-signal provider for tests and for deployments without a
/// reputation feed.
#[derive(Debug, Clone)]
pub struct StaticReputation {
    signal: Option<ProxySignal>,
}

impl StaticReputation {
    /// Always answers "not a proxy" from the given region.
    pub fn clean(region: &str) -> Self {
        Self {
            signal: Some(ProxySignal {
                is_proxy: false,
                confidence: 0,
                region: Some(region.to_string()),
            }),
        }
    }

    /// Always answers "proxy" with the given confidence.
    pub fn proxy(confidence: u8, region: Option<&str>) -> Self {
        Self {
            signal: Some(ProxySignal {
                is_proxy: true,
                confidence,
                region: region.map(str::to_string),
            }),
        }
    }

    /// Every lookup fails, as if the provider were unreachable.
    pub fn unavailable() -> Self {
        Self { signal: None }
    }
}

#[async_trait]
impl IpReputation for StaticReputation {
    async fn detect_proxy(&self, _ip: &str) -> Result<ProxySignal> {
        match &self.signal {
            Some(signal) => Ok(signal.clone()),
            None => Err(anyhow::anyhow!("reputation provider unreachable")),
        }
    }
}
