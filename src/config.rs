//! Service configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::broadcast::RelayConfig;
use crate::error::{Error, Result};

/// Default purchase-lock lifetime.
const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Default interval between lock/offer expiry sweeps.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Default offer lifetime once created.
const DEFAULT_OFFER_TTL_SECS: u64 = 86_400;

/// Default bound on a single oracle request.
const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_values::network")]
    pub network: Network,

    #[serde(default = "default_values::lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    #[serde(default = "default_values::sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_values::offer_ttl_secs")]
    pub offer_ttl_secs: u64,

    pub oracle: OracleConfig,

    /// Relay endpoints; tried in ascending `priority`.
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    /// Priority value whose relays are raced concurrently.
    #[serde(default)]
    pub parallel_tier: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleConfig {
    pub url: String,

    #[serde(default = "default_values::oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl ServiceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            return Err(Error::Config("at least one relay is required".into()));
        }
        for (name, value) in [
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("offer_ttl_secs", self.offer_ttl_secs),
            ("oracle.timeout_ms", self.oracle.timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for relay in &self.relays {
            relay.validate()?;
        }
        if let Some(tier) = self.parallel_tier {
            if !self.relays.iter().any(|r| r.priority == tier) {
                return Err(Error::Config(format!(
                    "parallel_tier {tier} matches no relay priority"
                )));
            }
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_secs(self.offer_ttl_secs)
    }
}

mod default_values {
    use super::*;

    pub(super) fn network() -> Network {
        Network::Bitcoin
    }

    pub(super) fn lock_ttl_secs() -> u64 {
        DEFAULT_LOCK_TTL_SECS
    }

    pub(super) fn sweep_interval_secs() -> u64 {
        DEFAULT_SWEEP_INTERVAL_SECS
    }

    pub(super) fn offer_ttl_secs() -> u64 {
        DEFAULT_OFFER_TTL_SECS
    }

    pub(super) fn oracle_timeout_ms() -> u64 {
        DEFAULT_ORACLE_TIMEOUT_MS
    }
}
