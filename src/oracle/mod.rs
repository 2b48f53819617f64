//! Asset-presence oracle: which inscriptions and rune balances sit on an output

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use bitcoin::OutPoint;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OracleConfig;
use crate::error::{Error, Result};

/// Oracle view of a single output. Mirrors the indexer's `/output/<outpoint>`
/// JSON; fields the indexer omits fall back to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAssets {
    #[serde(default)]
    pub inscriptions: Vec<String>,
    /// Rune balances keyed by rune id (`block:tx`).
    #[serde(default)]
    pub runes: BTreeMap<String, u128>,
    #[serde(default)]
    pub value: Option<u64>,
    #[serde(default)]
    pub script_pubkey: Option<String>,
    #[serde(default)]
    pub spent: bool,
}

impl OutputAssets {
    pub fn is_empty(&self) -> bool {
        self.inscriptions.is_empty() && self.runes.values().all(|a| *a == 0)
    }

    pub fn rune_balance(&self, rune_id: &str) -> u128 {
        self.runes.get(rune_id).copied().unwrap_or(0)
    }
}

/// Read-only, possibly stale view of on-chain asset placement.
pub trait AssetOracle: Send + Sync {
    fn output(&self, outpoint: &OutPoint) -> Result<OutputAssets>;
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

/// Indexer client speaking the ord-style JSON API.
#[derive(Debug, Clone)]
pub struct HttpAssetOracle {
    client: Client,
    base: String,
}

impl HttpAssetOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Oracle(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }
}

impl AssetOracle for HttpAssetOracle {
    fn output(&self, outpoint: &OutPoint) -> Result<OutputAssets> {
        let url = format!("{}/output/{outpoint}", self.base);
        debug!(%url, "querying asset oracle");
        let oracle_err = |e: reqwest::Error| Error::Oracle(format!("{outpoint}: {e}"));
        self.client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(oracle_err)?
            .error_for_status()
            .map_err(oracle_err)?
            .json()
            .map_err(oracle_err)
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Fixed oracle answers, for offline tooling and tests. Outpoints it has not
/// been told about are reported as errors, as an indexer that has not yet
/// seen them would.
#[derive(Debug, Default)]
pub struct MemoryOracle {
    outputs: RwLock<HashMap<OutPoint, OutputAssets>>,
    failing: RwLock<HashSet<OutPoint>>,
}

impl MemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, outpoint: OutPoint, assets: OutputAssets) {
        if let Ok(mut outputs) = self.outputs.write() {
            outputs.insert(outpoint, assets);
        }
    }

    /// Record a plain output with no assets.
    pub fn insert_pure(&self, outpoint: OutPoint) {
        self.insert(outpoint, OutputAssets::default());
    }

    /// Make every query for `outpoint` fail, as a timed-out indexer would.
    pub fn fail(&self, outpoint: OutPoint) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(outpoint);
        }
    }
}

impl AssetOracle for MemoryOracle {
    fn output(&self, outpoint: &OutPoint) -> Result<OutputAssets> {
        let poisoned = || Error::Oracle("oracle state poisoned".into());
        if self.failing.read().map_err(|_| poisoned())?.contains(outpoint) {
            return Err(Error::Oracle(format!("{outpoint}: timed out")));
        }
        self.outputs
            .read()
            .map_err(|_| poisoned())?
            .get(outpoint)
            .cloned()
            .ok_or_else(|| Error::Oracle(format!("{outpoint}: not indexed")))
    }
}
