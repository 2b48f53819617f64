//! Relay dispatcher: submit a raw transaction with fallback across services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::Transaction;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};

const DEFAULT_RELAY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMethod {
    #[default]
    Post,
    Get,
}

/// How the raw transaction is placed in the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Hex as the whole request body.
    #[default]
    RawBody,
    /// `{"<field>": "<hex>"}`.
    JsonField { field: String },
    /// Substituted for `{tx}` in the URL.
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: PayloadEncoding,
    /// Lower runs first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after a transport failure. HTTP rejections are final.
    #[serde(default)]
    pub retries: u32,
}

fn default_relay_timeout_ms() -> u64 {
    DEFAULT_RELAY_TIMEOUT_MS
}

impl RelayConfig {
    pub fn new(name: &str, url: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            method: HttpMethod::Post,
            payload: PayloadEncoding::RawBody,
            priority,
            timeout_ms: DEFAULT_RELAY_TIMEOUT_MS,
            retries: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |why: &str| Err(Error::Config(format!("relay `{}`: {why}", self.name)));
        if self.name.is_empty() || self.url.is_empty() {
            return bad("name and url are required");
        }
        if self.timeout_ms == 0 {
            return bad("timeout_ms must be greater than zero");
        }
        match (&self.method, &self.payload) {
            (_, PayloadEncoding::Path) if !self.url.contains("{tx}") => {
                bad("path payload needs a `{tx}` placeholder in the url")
            }
            (HttpMethod::Get, PayloadEncoding::RawBody | PayloadEncoding::JsonField { .. }) => {
                bad("GET relays must use the path payload")
            }
            _ => Ok(()),
        }
    }

    pub fn request(&self, raw_tx_hex: &str) -> RelayRequest {
        let (url, body, content_type) = match &self.payload {
            PayloadEncoding::RawBody => (self.url.clone(), Some(raw_tx_hex.to_string()), "text/plain"),
            PayloadEncoding::JsonField { field } => {
                let mut obj = serde_json::Map::new();
                obj.insert(field.clone(), serde_json::Value::String(raw_tx_hex.to_string()));
                (
                    self.url.clone(),
                    Some(serde_json::Value::Object(obj).to_string()),
                    "application/json",
                )
            }
            PayloadEncoding::Path => (self.url.replace("{tx}", raw_tx_hex), None, "text/plain"),
        };
        RelayRequest {
            method: self.method,
            url,
            body,
            content_type,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
    pub content_type: &'static str,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one request. `Err` means the request never got an HTTP answer
/// (timeout, refused connection); any HTTP status is an `Ok` response.
pub trait RelayTransport: Send + Sync {
    fn send(&self, request: &RelayRequest) -> Result<RelayResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl RelayTransport for HttpTransport {
    fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let mut builder = match request.method {
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Get => self.client.get(&request.url),
        }
        .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .body(body.clone());
        }
        let resp = builder
            .send()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(|e| Error::Transport(e.to_string()))?;
        Ok(RelayResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReceipt {
    pub txid: String,
    pub service: String,
}

/// First run of exactly 64 hex characters in a relay response.
pub fn extract_txid(body: &str) -> Option<String> {
    body.split(|c: char| !c.is_ascii_hexdigit())
        .find(|run| run.len() == 64)
        .map(str::to_ascii_lowercase)
}

pub struct Dispatcher {
    relays: Vec<RelayConfig>,
    parallel_tier: Option<u32>,
    transport: Arc<dyn RelayTransport>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("relays", &self.relays.iter().map(|r| &r.name).collect::<Vec<_>>())
            .field("parallel_tier", &self.parallel_tier)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        relays: Vec<RelayConfig>,
        parallel_tier: Option<u32>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        Self {
            relays,
            parallel_tier,
            transport,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.relays.clone(),
            config.parallel_tier,
            Arc::new(HttpTransport::new()),
        )
    }

    /// Relays grouped by priority, lowest first; config order within a tier.
    fn tiers(&self) -> BTreeMap<u32, Vec<RelayConfig>> {
        let mut tiers: BTreeMap<u32, Vec<RelayConfig>> = BTreeMap::new();
        for relay in &self.relays {
            tiers.entry(relay.priority).or_default().push(relay.clone());
        }
        tiers
    }

    pub fn broadcast_tx(&self, tx: &Transaction) -> Result<BroadcastReceipt> {
        self.broadcast(&bitcoin::consensus::encode::serialize_hex(tx))
    }

    /// Submit `raw_tx_hex`, stopping at the first relay that accepts it.
    pub fn broadcast(&self, raw_tx_hex: &str) -> Result<BroadcastReceipt> {
        let local_txid = deserialize_hex::<Transaction>(raw_tx_hex)
            .ok()
            .map(|tx| tx.compute_txid().to_string());
        let mut failures: Vec<(String, String)> = Vec::new();

        for (priority, tier) in self.tiers() {
            let accepted = if self.parallel_tier == Some(priority) && tier.len() > 1 {
                self.race(&tier, raw_tx_hex, &mut failures)
            } else {
                tier.iter().find_map(|relay| {
                    match submit(self.transport.as_ref(), relay, raw_tx_hex) {
                        Ok(txid) => Some((relay.name.clone(), txid)),
                        Err(e) => {
                            warn!(relay = %relay.name, "broadcast failed: {e}");
                            failures.push((relay.name.clone(), e));
                            None
                        }
                    }
                })
            };

            if let Some((service, relay_txid)) = accepted {
                let txid = match &local_txid {
                    Some(local) if *local != relay_txid => {
                        warn!(%service, %relay_txid, %local, "relay reported a different txid");
                        local.clone()
                    }
                    _ => relay_txid,
                };
                info!(%service, %txid, "transaction broadcast");
                return Ok(BroadcastReceipt { txid, service });
            }
        }
        Err(Error::AllBroadcastServicesFailed(failures))
    }

    /// Run every relay of a tier on its own thread; first acceptance wins and
    /// the remaining threads are left to finish on their own.
    fn race(
        &self,
        tier: &[RelayConfig],
        raw_tx_hex: &str,
        failures: &mut Vec<(String, String)>,
    ) -> Option<(String, String)> {
        let (tx, rx) = mpsc::channel();
        let mut spawned = 0;
        for relay in tier {
            let (tx, transport, relay, raw) = (
                tx.clone(),
                Arc::clone(&self.transport),
                relay.clone(),
                raw_tx_hex.to_string(),
            );
            let name = relay.name.clone();
            let spawn = std::thread::Builder::new()
                .name(format!("relay-{name}"))
                .spawn(move || {
                    let result = submit(transport.as_ref(), &relay, &raw);
                    // receiver is gone once a winner was found
                    let _ = tx.send((relay.name, result));
                });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => failures.push((name, format!("spawn failed: {e}"))),
            }
        }
        drop(tx);

        debug!(relays = spawned, "racing parallel tier");
        // ends once every relay thread has reported and dropped its sender
        for (name, result) in rx.iter() {
            match result {
                Ok(txid) => return Some((name, txid)),
                Err(e) => {
                    warn!(relay = %name, "broadcast failed: {e}");
                    failures.push((name, e));
                }
            }
        }
        None
    }
}

/// One relay, with retries on transport failure only.
fn submit(
    transport: &dyn RelayTransport,
    relay: &RelayConfig,
    raw_tx_hex: &str,
) -> std::result::Result<String, String> {
    let request = relay.request(raw_tx_hex);
    let mut attempt = 0;
    loop {
        match transport.send(&request) {
            Ok(resp) if (200..300).contains(&resp.status) => {
                return extract_txid(&resp.body)
                    .ok_or_else(|| format!("no txid in response: {}", resp.body.trim()));
            }
            Ok(resp) => return Err(format!("HTTP {}: {}", resp.status, resp.body.trim())),
            Err(e) if attempt < relay.retries => {
                attempt += 1;
                debug!(relay = %relay.name, attempt, "retrying after transport error: {e}");
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    type Script = Vec<Result<RelayResponse>>;

    /// Answers per URL from a script; the last entry repeats.
    #[derive(Default)]
    struct FakeTransport {
        scripts: Mutex<HashMap<String, Script>>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<RelayRequest>>,
    }

    impl FakeTransport {
        fn script(self, url: &str, responses: Script) -> Self {
            self.scripts.lock().unwrap().insert(url.into(), responses);
            self
        }

        fn delay(mut self, url: &str, d: Duration) -> Self {
            self.delays.insert(url.into(), d);
            self
        }

        fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|r| r.url == url).count()
        }
    }

    impl RelayTransport for FakeTransport {
        fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
            self.calls.lock().unwrap().push(request.clone());
            if let Some(d) = self.delays.get(&request.url) {
                std::thread::sleep(*d);
            }
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(&request.url).expect("unscripted url");
            if script.len() > 1 {
                script.remove(0)
            } else {
                clone(&script[0])
            }
        }
    }

    fn clone(r: &Result<RelayResponse>) -> Result<RelayResponse> {
        match r {
            Ok(resp) => Ok(resp.clone()),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    fn ok(body: &str) -> Result<RelayResponse> {
        Ok(RelayResponse {
            status: 200,
            body: body.into(),
        })
    }

    fn status(code: u16, body: &str) -> Result<RelayResponse> {
        Ok(RelayResponse {
            status: code,
            body: body.into(),
        })
    }

    fn down() -> Result<RelayResponse> {
        Err(Error::Transport("connection refused".into()))
    }

    #[test]
    fn txid_extraction() {
        assert_eq!(extract_txid(TXID).as_deref(), Some(TXID));
        let json = format!(r#"{{"result":"{}","error":null}}"#, TXID.to_uppercase());
        assert_eq!(extract_txid(&json).as_deref(), Some(TXID));
        assert!(extract_txid("sendrawtransaction RPC error: bad-txns-inputs-missingorspent").is_none());
        // 65 hex chars is not a txid
        assert!(extract_txid(&format!("{TXID}0")).is_none());
    }

    #[test]
    fn request_shapes() {
        let mut relay = RelayConfig::new("r", "https://r.example/tx", 0);
        let req = relay.request("00ff");
        assert_eq!(req.body.as_deref(), Some("00ff"));

        relay.payload = PayloadEncoding::JsonField { field: "rawtx".into() };
        assert_eq!(relay.request("00ff").body.as_deref(), Some(r#"{"rawtx":"00ff"}"#));

        relay.url = "https://r.example/push/{tx}".into();
        relay.payload = PayloadEncoding::Path;
        relay.method = HttpMethod::Get;
        relay.validate().unwrap();
        let req = relay.request("00ff");
        assert_eq!(req.url, "https://r.example/push/00ff");
        assert!(req.body.is_none());

        relay.url = "https://r.example/push".into();
        assert!(relay.validate().is_err());
    }

    #[test]
    fn falls_back_in_priority_order_and_stops_at_first_success() {
        let transport = Arc::new(
            FakeTransport::default()
                .script("a", vec![status(400, "bad-txns-nonstandard-inputs")])
                .script("b", vec![ok(TXID)])
                .script("c", vec![ok(TXID)]),
        );
        let dispatcher = Dispatcher::new(
            vec![
                RelayConfig::new("third", "c", 2),
                RelayConfig::new("first", "a", 0),
                RelayConfig::new("second", "b", 1),
            ],
            None,
            transport.clone(),
        );
        let receipt = dispatcher.broadcast("00").unwrap();
        assert_eq!(receipt.service, "second");
        assert_eq!(receipt.txid, TXID);
        assert_eq!(transport.calls_to("c"), 0);
    }

    #[test]
    fn retries_transport_errors_but_not_rejections() {
        let transport = Arc::new(
            FakeTransport::default()
                .script("flaky", vec![down(), down(), ok(TXID)])
                .script("strict", vec![status(400, "bad-txns-inputs-missingorspent")]),
        );
        let mut flaky = RelayConfig::new("flaky", "flaky", 1);
        flaky.retries = 2;
        let mut strict = RelayConfig::new("strict", "strict", 0);
        strict.retries = 5;

        let dispatcher = Dispatcher::new(vec![strict, flaky], None, transport.clone());
        assert_eq!(dispatcher.broadcast("00").unwrap().service, "flaky");
        assert_eq!(transport.calls_to("strict"), 1);
        assert_eq!(transport.calls_to("flaky"), 3);
    }

    #[test]
    fn collects_every_failure_verbatim() {
        let transport = Arc::new(
            FakeTransport::default()
                .script("a", vec![status(400, "bad-txns-inputs-missingorspent")])
                .script("b", vec![down()])
                .script("c", vec![ok("accepted")]),
        );
        let dispatcher = Dispatcher::new(
            vec![
                RelayConfig::new("a", "a", 0),
                RelayConfig::new("b", "b", 1),
                RelayConfig::new("c", "c", 2),
            ],
            None,
            transport,
        );
        match dispatcher.broadcast("00") {
            Err(Error::AllBroadcastServicesFailed(errs)) => {
                assert_eq!(errs.len(), 3);
                assert_eq!(errs[0].0, "a");
                assert!(errs[0].1.contains("bad-txns-inputs-missingorspent"));
                assert!(errs[1].1.contains("connection refused"));
                assert!(errs[2].1.contains("no txid"));
            }
            other => panic!("expected AllBroadcastServicesFailed, got {other:?}"),
        }
    }

    #[test]
    fn parallel_tier_returns_first_success_without_waiting() {
        let transport = Arc::new(
            FakeTransport::default()
                .script("slow", vec![ok(TXID)])
                .script("fast", vec![ok(TXID)])
                .script("later", vec![ok(TXID)])
                .delay("slow", Duration::from_millis(800)),
        );
        let dispatcher = Dispatcher::new(
            vec![
                RelayConfig::new("slow", "slow", 0),
                RelayConfig::new("fast", "fast", 0),
                RelayConfig::new("later", "later", 1),
            ],
            Some(0),
            transport.clone(),
        );
        let start = Instant::now();
        let receipt = dispatcher.broadcast("00").unwrap();
        assert_eq!(receipt.service, "fast");
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(transport.calls_to("later"), 0);
    }

    #[test]
    fn local_txid_wins_over_relay_txid() {
        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: vec![bitcoin::TxOut {
                value: bitcoin::Amount::from_sat(1_000),
                script_pubkey: bitcoin::ScriptBuf::new(),
            }],
        };
        let transport = Arc::new(FakeTransport::default().script("a", vec![ok(TXID)]));
        let dispatcher = Dispatcher::new(vec![RelayConfig::new("a", "a", 0)], None, transport);
        let receipt = dispatcher.broadcast_tx(&tx).unwrap();
        assert_eq!(receipt.txid, tx.compute_txid().to_string());
    }
}
