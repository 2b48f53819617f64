#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, Txid};
use chrono::{DateTime, Utc};
use secp256k1::Keypair;

use ordswap::bitcoin_utils::keys::KeyDeriver;
use ordswap::bitcoin_utils::psbt::{BuyerLayout, BuyerPlan};
use ordswap::bitcoin_utils::sighash::SighashType;
use ordswap::bitcoin_utils::signer::{random_aux, Signer};
use ordswap::broadcast::{Dispatcher, RelayRequest, RelayResponse, RelayTransport};
use ordswap::clock::ManualClock;
use ordswap::config::ServiceConfig;
use ordswap::offer::{MemoryOfferStore, Offer, OfferBook};
use ordswap::oracle::{MemoryOracle, OutputAssets};
use ordswap::types::{AssetRef, RuneId, Utxo};
use ordswap::{Error, Result};

pub const INSCRIPTION_POSTAGE: u64 = 10_000;

pub fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

pub struct Party {
    pub keypair: Keypair,
    pub script: ScriptBuf,
    pub address: String,
}

impl Party {
    pub fn new(deriver: &KeyDeriver, account: u32) -> Self {
        let keypair = deriver.derive(account, 0).unwrap();
        let script = deriver.p2tr_script(account, 0).unwrap();
        let address = Address::from_script(&script, Network::Regtest)
            .unwrap()
            .to_string();
        Self {
            keypair,
            script,
            address,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RelayBehaviour {
    Accept,
    Reject(u16, &'static str),
    Down,
}

/// Relay stand-in keyed by URL. Accepting relays answer with the txid of the
/// raw transaction they were sent; unknown URLs are down.
#[derive(Default)]
pub struct ScriptedRelays {
    behaviour: Mutex<HashMap<String, RelayBehaviour>>,
    pub accepted: Mutex<Vec<(String, Transaction)>>,
}

impl ScriptedRelays {
    pub fn set(&self, url: &str, behaviour: RelayBehaviour) {
        self.behaviour
            .lock()
            .unwrap()
            .insert(url.to_string(), behaviour);
    }

    pub fn last_accepted(&self) -> Option<(String, Transaction)> {
        self.accepted.lock().unwrap().last().cloned()
    }
}

impl RelayTransport for ScriptedRelays {
    fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let behaviour = self
            .behaviour
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or(RelayBehaviour::Down);
        match behaviour {
            RelayBehaviour::Accept => {
                let body = request.body.clone().unwrap_or_default();
                let tx: Transaction = deserialize_hex(&body)
                    .map_err(|e| Error::Transport(format!("bad body: {e}")))?;
                let txid = tx.compute_txid().to_string();
                self.accepted
                    .lock()
                    .unwrap()
                    .push((request.url.clone(), tx));
                Ok(RelayResponse {
                    status: 200,
                    body: txid,
                })
            }
            RelayBehaviour::Reject(status, body) => Ok(RelayResponse {
                status,
                body: body.to_string(),
            }),
            RelayBehaviour::Down => Err(Error::Transport("connection refused".into())),
        }
    }
}

pub const CONFIG: &str = r#"
    network = "regtest"
    lock_ttl_secs = 60
    offer_ttl_secs = 3600
    parallel_tier = 1

    [oracle]
    url = "http://oracle.invalid"

    [[relays]]
    name = "primary"
    url = "http://primary.invalid/tx"
    priority = 0

    [[relays]]
    name = "mirror-a"
    url = "http://mirror-a.invalid/tx"
    priority = 1

    [[relays]]
    name = "mirror-b"
    url = "http://mirror-b.invalid/tx"
    priority = 1
"#;

/// A marketplace with in-memory collaborators and a manual clock.
pub struct Market {
    pub seller: Party,
    pub buyer: Party,
    pub oracle: Arc<MemoryOracle>,
    pub clock: Arc<ManualClock>,
    pub relays: Arc<ScriptedRelays>,
    pub book: Arc<OfferBook>,
    next_txid: AtomicU32,
}

impl Market {
    pub fn new() -> Self {
        Self::with_config(CONFIG)
    }

    pub fn with_config(toml: &str) -> Self {
        let config = ServiceConfig::from_toml_str(toml).unwrap();
        let deriver = KeyDeriver::from_seed(&[42u8; 32], Network::Regtest).unwrap();
        let oracle = Arc::new(MemoryOracle::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let relays = Arc::new(ScriptedRelays::default());
        relays.set("http://primary.invalid/tx", RelayBehaviour::Accept);
        let dispatcher = Dispatcher::new(config.relays.clone(), config.parallel_tier, relays.clone());
        let book = OfferBook::new(
            &config,
            Arc::new(MemoryOfferStore::new()),
            oracle.clone(),
            Arc::new(dispatcher),
            Arc::new(Signer::new()),
            clock.clone(),
        );
        Self {
            seller: Party::new(&deriver, 0),
            buyer: Party::new(&deriver, 1),
            oracle,
            clock,
            relays,
            book: Arc::new(book),
            next_txid: AtomicU32::new(1),
        }
    }

    pub fn fresh_outpoint(&self) -> OutPoint {
        let n = self.next_txid.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        OutPoint::new(Txid::from_byte_array(bytes), 0)
    }

    pub fn index_inscription(&self) -> AssetRef {
        let outpoint = self.fresh_outpoint();
        self.oracle.insert(
            outpoint,
            OutputAssets {
                inscriptions: vec![format!("{}i0", outpoint.txid)],
                value: Some(INSCRIPTION_POSTAGE),
                script_pubkey: Some(self.seller.script.to_hex_string()),
                ..Default::default()
            },
        );
        AssetRef::Inscription { outpoint }
    }

    pub fn index_rune(&self, rune_id: RuneId, balance: u128, amount: u128) -> AssetRef {
        let outpoint = self.fresh_outpoint();
        let mut runes = BTreeMap::new();
        runes.insert(rune_id.to_string(), balance);
        self.oracle.insert(
            outpoint,
            OutputAssets {
                runes,
                value: Some(546),
                script_pubkey: Some(self.seller.script.to_hex_string()),
                ..Default::default()
            },
        );
        AssetRef::Rune {
            rune_id,
            amount,
            outpoint,
        }
    }

    /// Create, sign and activate an offer for `asset`.
    pub fn list(&self, asset: AssetRef, price_sats: u64) -> Offer {
        let offer = self
            .book
            .create_offer(asset, price_sats, &self.seller.address)
            .unwrap();
        let mut template = self.book.seller_template(&offer.id).unwrap();
        Signer::new()
            .sign_psbt_input(
                &mut template,
                0,
                &self.seller.keypair,
                offer.sighash_mode,
                &random_aux(),
            )
            .unwrap();
        self.book.activate_offer(&offer.id, template).unwrap()
    }

    /// Pure buyer UTXOs, registered with the oracle.
    pub fn funding(&self, values: &[u64]) -> Vec<Utxo> {
        values
            .iter()
            .map(|v| {
                let outpoint = self.fresh_outpoint();
                self.oracle.insert_pure(outpoint);
                Utxo::new(outpoint, *v, self.buyer.script.clone())
            })
            .collect()
    }

    pub fn plan(&self, padding: Option<u64>, candidates: &[u64], fee_rate: u64) -> BuyerPlan {
        BuyerPlan {
            receive_script: self.buyer.script.clone(),
            change_script: self.buyer.script.clone(),
            padding: padding.map(|v| self.funding(&[v]).remove(0)),
            candidates: self.funding(candidates),
            fee_rate,
        }
    }

    pub fn sign_buyer(&self, psbt: &mut Psbt, layout: &BuyerLayout) {
        let signer = Signer::new();
        for &index in &layout.buyer_inputs {
            signer
                .sign_psbt_input(psbt, index, &self.buyer.keypair, SighashType::All, &random_aux())
                .unwrap();
        }
    }
}
