//! `OfferBook`: the offer lifecycle wired to its collaborators.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::address::NetworkUnchecked;
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Network, ScriptBuf};
use tracing::{debug, error, info, warn};

use super::{Offer, OfferState, OfferStore, OfferTerms};
use crate::bitcoin_utils::psbt::{
    build_seller_psbt, finalize_psbt, validate_buyer_psbt, validate_seller_psbt,
};
use crate::bitcoin_utils::signer::{psbt_prevouts, Signer};
use crate::broadcast::{BroadcastReceipt, Dispatcher};
use crate::clock::{remaining_secs, spawn_periodic, Clock, PeriodicHandle};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::filter::ensure_pure;
use crate::locks::{LockManager, LockOutcome};
use crate::oracle::AssetOracle;
use crate::types::{AssetRef, OfferId, Utxo};

pub struct OfferBook {
    store: Arc<dyn OfferStore>,
    oracle: Arc<dyn AssetOracle>,
    locks: Arc<LockManager>,
    dispatcher: Arc<Dispatcher>,
    signer: Arc<Signer>,
    clock: Arc<dyn Clock>,
    network: Network,
    lock_ttl: Duration,
    offer_ttl: Duration,
}

impl std::fmt::Debug for OfferBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferBook")
            .field("network", &self.network)
            .field("lock_ttl", &self.lock_ttl)
            .field("offer_ttl", &self.offer_ttl)
            .field("locks", &self.locks)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl OfferBook {
    pub fn new(
        config: &ServiceConfig,
        store: Arc<dyn OfferStore>,
        oracle: Arc<dyn AssetOracle>,
        dispatcher: Arc<Dispatcher>,
        signer: Arc<Signer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            oracle,
            locks: Arc::new(LockManager::new(clock.clone())),
            dispatcher,
            signer,
            clock,
            network: config.network,
            lock_ttl: config.lock_ttl(),
            offer_ttl: config.offer_ttl(),
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub fn get(&self, id: &OfferId) -> Result<Offer> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::OfferNotFound(id.to_string()))
    }

    fn seller_script(&self, address: &str) -> Result<ScriptBuf> {
        let unchecked = Address::<NetworkUnchecked>::from_str(address)
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;
        let checked = unchecked
            .require_network(self.network)
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;
        Ok(checked.script_pubkey())
    }

    /// Check with the oracle that `asset` sits on a live output paid to
    /// `seller_script`, and return that output.
    fn resolve_asset(&self, asset: &AssetRef, seller_script: &ScriptBuf) -> Result<Utxo> {
        let outpoint = asset.outpoint();
        let assets = self.oracle.output(&outpoint)?;
        if assets.spent {
            return Err(Error::AssetNotOwned(format!("{outpoint} is already spent")));
        }
        let owner = assets
            .script_pubkey
            .as_deref()
            .ok_or_else(|| Error::Oracle(format!("{outpoint}: no script reported")))?;
        if !owner.eq_ignore_ascii_case(&seller_script.to_hex_string()) {
            return Err(Error::AssetNotOwned(format!(
                "{outpoint} is not paid to the seller address"
            )));
        }
        match asset {
            AssetRef::Inscription { .. } => {
                if assets.inscriptions.is_empty() {
                    return Err(Error::AssetNotOwned(format!(
                        "{outpoint} carries no inscription"
                    )));
                }
                if assets.inscriptions.len() > 1 {
                    warn!(%outpoint, count = assets.inscriptions.len(), "output carries several inscriptions; all of them transfer");
                }
            }
            AssetRef::Rune {
                rune_id, amount, ..
            } => {
                let balance = assets.rune_balance(&rune_id.to_string());
                if balance < *amount {
                    return Err(Error::AssetNotOwned(format!(
                        "{outpoint} holds {balance} of rune {rune_id}, offer needs {amount}"
                    )));
                }
            }
        }
        let value = assets
            .value
            .ok_or_else(|| Error::Oracle(format!("{outpoint}: no value reported")))?;
        Ok(Utxo::new(outpoint, value, seller_script.clone()))
    }

    /// Register a new offer in `Draft` after checking the seller owns the asset.
    pub fn create_offer(
        &self,
        asset_ref: AssetRef,
        price_sats: u64,
        seller_address: &str,
    ) -> Result<Offer> {
        if price_sats == 0 {
            return Err(Error::InvalidPrice);
        }
        if let AssetRef::Rune { amount: 0, .. } = asset_ref {
            return Err(Error::AssetNotOwned("rune amount must be positive".into()));
        }
        let seller_script = self.seller_script(seller_address)?;
        let asset_utxo = self.resolve_asset(&asset_ref, &seller_script)?;
        let terms = OfferTerms {
            asset_ref,
            asset_utxo,
            price_sats,
            seller_address: seller_address.to_string(),
            seller_script,
        };
        let offer = Offer::new(OfferId::random(), terms, self.clock.now(), self.offer_ttl)?;
        self.store.insert(offer.clone())?;
        info!(offer = %offer.id, seller = seller_address, price_sats, mode = %offer.sighash_mode, "offer created");
        Ok(offer)
    }

    /// The unsigned one-in one-out template the seller signs.
    pub fn seller_template(&self, id: &OfferId) -> Result<Psbt> {
        let offer = self.get(id)?;
        if offer.state != OfferState::Draft {
            return Err(Error::OfferStateConflict {
                operation: "seller_template",
                state: offer.state,
            });
        }
        build_seller_psbt(&offer)
    }

    /// Attach the seller's signed template and list the offer.
    pub fn activate_offer(&self, id: &OfferId, signed: Psbt) -> Result<Offer> {
        let mut signed = Some(signed);
        self.store.update_with(id, &mut |offer| {
            if offer.state != OfferState::Draft {
                return Err(Error::OfferStateConflict {
                    operation: "activate",
                    state: offer.state,
                });
            }
            let psbt = signed
                .take()
                .ok_or_else(|| Error::Psbt("seller psbt already consumed".into()))?;
            validate_seller_psbt(offer, &psbt)?;
            offer.attach_seller_psbt(psbt)?;
            offer.transition("activate", OfferState::Active)
        })
    }

    /// Ask for exclusive rights to complete the purchase. A live lock held by
    /// another buyer is reported as `LockOutcome::Rejected`, not an error.
    pub fn try_purchase_lock(&self, id: &OfferId, buyer_address: &str) -> Result<LockOutcome> {
        let offer = self.get(id)?;
        if offer.is_due(self.clock.now()) {
            self.expire(id)?;
            return Err(Error::OfferStateConflict {
                operation: "lock",
                state: OfferState::Expired,
            });
        }
        if !matches!(offer.state, OfferState::Active | OfferState::Locked) {
            return Err(Error::OfferStateConflict {
                operation: "lock",
                state: offer.state,
            });
        }

        let outcome = self.locks.try_lock(id, buyer_address, self.lock_ttl);
        if !outcome.is_held() {
            return Ok(outcome);
        }
        let marked = self
            .store
            .update_with(id, &mut |offer| offer.transition("lock", OfferState::Locked));
        if let Err(e) = marked {
            // The offer moved on (cancelled, expired) while we were locking.
            self.locks.unlock(id, buyer_address);
            return Err(e);
        }
        Ok(outcome)
    }

    /// Give up a held lock. Returns false if `buyer_address` held none.
    pub fn release_lock(&self, id: &OfferId, buyer_address: &str) -> Result<bool> {
        if !self.locks.unlock(id, buyer_address) {
            return Ok(false);
        }
        // Another buyer may have locked between the unlock and this update.
        self.store.update_with(id, &mut |offer| match offer.state {
            OfferState::Locked if self.locks.holder(id).is_none() => {
                offer.transition("release", OfferState::Active)
            }
            _ => Ok(()),
        })?;
        Ok(true)
    }

    fn ensure_lock_holder(&self, id: &OfferId, buyer_address: &str) -> Result<()> {
        match self.locks.holder(id) {
            Some(lock) if lock.holder_address == buyer_address => Ok(()),
            Some(lock) => Err(Error::LockConflict {
                holder: lock.holder_address,
                remaining_secs: remaining_secs(self.clock.now(), lock.expires_at),
            }),
            None => Err(Error::Unauthorized {
                expected: "the current lock holder".into(),
            }),
        }
    }

    /// Validate, finalise and broadcast the buyer's completed PSBT, then mark
    /// the offer completed. A failed broadcast leaves the lock in place so the
    /// buyer can retry within the lock window. Once a relay accepts the
    /// transaction the sale is recorded even if the lock lapsed meanwhile.
    pub fn submit_buyer_psbt(
        &self,
        id: &OfferId,
        buyer_address: &str,
        mut psbt: Psbt,
    ) -> Result<BroadcastReceipt> {
        self.signer.ensure_enabled()?;
        let offer = self.get(id)?;
        if offer.state != OfferState::Locked {
            return Err(Error::OfferStateConflict {
                operation: "submit",
                state: offer.state,
            });
        }
        self.ensure_lock_holder(id, buyer_address)?;

        let seller_index = validate_buyer_psbt(&offer, &psbt)?;
        debug!(offer = %id, seller_index, "buyer psbt validated");
        self.ensure_buyer_inputs_pure(&psbt, seller_index)?;
        let tx = finalize_psbt(&mut psbt)?;
        let receipt = self.dispatcher.broadcast_tx(&tx)?;
        if let Err(e) = self.record_sale(id, buyer_address, &receipt.txid) {
            error!(offer = %id, txid = %receipt.txid, error = %e, "broadcast sale not recorded");
        }
        Ok(receipt)
    }

    /// Every input other than the seller's must be free of assets right now.
    fn ensure_buyer_inputs_pure(&self, psbt: &Psbt, seller_index: usize) -> Result<()> {
        let prevouts = psbt_prevouts(psbt);
        let mut buyer_utxos = Vec::with_capacity(prevouts.len());
        for (index, (txin, prevout)) in psbt.unsigned_tx.input.iter().zip(prevouts).enumerate() {
            if index == seller_index {
                continue;
            }
            let prevout = prevout.ok_or(Error::MissingPrevoutData { input: index })?;
            buyer_utxos.push(Utxo::new(
                txin.previous_output,
                prevout.value.to_sat(),
                prevout.script_pubkey,
            ));
        }
        ensure_pure(self.oracle.as_ref(), &buyer_utxos)
    }

    /// Record a broadcast purchase. Only the current lock holder may complete.
    pub fn complete(&self, id: &OfferId, buyer_address: &str, txid: &str) -> Result<Offer> {
        self.ensure_lock_holder(id, buyer_address)?;
        self.record_sale(id, buyer_address, txid)
    }

    fn record_sale(&self, id: &OfferId, buyer_address: &str, txid: &str) -> Result<Offer> {
        let offer = self.store.update_with(id, &mut |offer| {
            if offer.state == OfferState::Active {
                // lock lapsed while the relays answered
                offer.transition("relock", OfferState::Locked)?;
            }
            offer.transition("complete", OfferState::Completed)?;
            offer.txid = Some(txid.to_string());
            Ok(())
        })?;
        self.locks.clear(id);
        info!(offer = %id, buyer = buyer_address, txid, "offer completed");
        Ok(offer)
    }

    /// Withdraw an offer. Only the seller may cancel, and only before a buyer
    /// holds it.
    pub fn cancel_offer(&self, id: &OfferId, seller_address: &str) -> Result<Offer> {
        self.store.update_with(id, &mut |offer| {
            if offer.seller_address != seller_address {
                return Err(Error::Unauthorized {
                    expected: offer.seller_address.clone(),
                });
            }
            offer.transition("cancel", OfferState::Cancelled)
        })
    }

    fn expire(&self, id: &OfferId) -> Result<Offer> {
        let offer = self
            .store
            .update_with(id, &mut |offer| offer.transition("expire", OfferState::Expired))?;
        if let Some(lock) = self.locks.clear(id) {
            debug!(offer = %id, holder = %lock.holder_address, "dropped lock on expired offer");
        }
        Ok(offer)
    }

    /// Expire every offer past its deadline.
    pub fn expire_due(&self) -> Result<Vec<OfferId>> {
        let now = self.clock.now();
        let mut expired = vec![];
        for offer in self.store.list()? {
            if !offer.is_due(now) {
                continue;
            }
            match self.expire(&offer.id) {
                Ok(_) => expired.push(offer.id),
                Err(e) => warn!(offer = %offer.id, error = %e, "could not expire offer"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired offers");
        }
        Ok(expired)
    }

    /// Return `Locked` offers whose lock has lapsed to `Active`.
    pub fn reconcile_locks(&self) -> Result<Vec<OfferId>> {
        self.locks.sweep();
        let mut reopened = vec![];
        for offer in self.store.list()? {
            if offer.state != OfferState::Locked || self.locks.holder(&offer.id).is_some() {
                continue;
            }
            // The holder is checked again under the store lock: a buyer may
            // have taken the offer since the sweep.
            let mut moved = false;
            let reopen = self.store.update_with(&offer.id, &mut |o| {
                moved = false;
                if o.state != OfferState::Locked || self.locks.holder(&o.id).is_some() {
                    return Ok(());
                }
                moved = true;
                o.transition("lock expired", OfferState::Active)
            });
            match reopen {
                Ok(_) if moved => reopened.push(offer.id),
                Ok(_) => {}
                Err(e) => warn!(offer = %offer.id, error = %e, "could not reopen offer"),
            }
        }
        Ok(reopened)
    }

    /// One maintenance pass: lapsed locks first, then offer expiry.
    pub fn maintain(&self) -> Result<()> {
        let reopened = self.reconcile_locks()?;
        let expired = self.expire_due()?;
        debug!(reopened = reopened.len(), expired = expired.len(), "maintenance pass");
        Ok(())
    }

    /// Run `maintain` on a background thread every `interval`.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> Result<PeriodicHandle> {
        let book = Arc::clone(self);
        spawn_periodic("offer-maintenance", interval, move || {
            if let Err(e) = book.maintain() {
                warn!(error = %e, "maintenance pass failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin_utils::psbt::{build_buyer_psbt, BuyerPsbt};
    use crate::bitcoin_utils::sighash::SighashType;
    use crate::bitcoin_utils::signer::SigningPolicy;
    use crate::broadcast::{RelayRequest, RelayResponse, RelayTransport};
    use crate::clock::ManualClock;
    use crate::offer::MemoryOfferStore;
    use crate::oracle::{MemoryOracle, OutputAssets};
    use crate::testutil::{outpoint, t0, Fixture, INSCRIPTION_POSTAGE};
    use std::sync::Mutex;

    type Hook = Box<dyn FnOnce() + Send>;

    /// Accepts everything and echoes the txid of the submitted transaction.
    /// `before_reply` runs once while the relay is "thinking".
    #[derive(Default)]
    struct EchoTransport {
        sent: Mutex<Vec<String>>,
        before_reply: Mutex<Option<Hook>>,
    }

    impl RelayTransport for EchoTransport {
        fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
            if let Some(hook) = self.before_reply.lock().unwrap().take() {
                hook();
            }
            let body = request.body.clone().unwrap_or_default();
            let tx: bitcoin::Transaction =
                bitcoin::consensus::encode::deserialize_hex(&body).unwrap();
            self.sent.lock().unwrap().push(body);
            Ok(RelayResponse {
                status: 200,
                body: tx.compute_txid().to_string(),
            })
        }
    }

    /// Memory store that runs a hook once just before the next update, the
    /// way a concurrent caller could slip in between a check and a write.
    #[derive(Default)]
    struct InterleavingStore {
        inner: MemoryOfferStore,
        before_update: Mutex<Option<Hook>>,
    }

    impl InterleavingStore {
        fn before_next_update(&self, hook: impl FnOnce() + Send + 'static) {
            *self.before_update.lock().unwrap() = Some(Box::new(hook));
        }
    }

    impl OfferStore for InterleavingStore {
        fn insert(&self, offer: Offer) -> Result<()> {
            self.inner.insert(offer)
        }

        fn get(&self, id: &OfferId) -> Result<Option<Offer>> {
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<Offer>> {
            self.inner.list()
        }

        fn update_with(
            &self,
            id: &OfferId,
            f: &mut dyn FnMut(&mut Offer) -> Result<()>,
        ) -> Result<Offer> {
            let hook = self.before_update.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.update_with(id, f)
        }
    }

    struct Harness {
        f: Fixture,
        store: Arc<InterleavingStore>,
        oracle: Arc<MemoryOracle>,
        clock: Arc<ManualClock>,
        transport: Arc<EchoTransport>,
        book: OfferBook,
    }

    fn harness() -> Harness {
        let f = Fixture::new();
        let oracle = Arc::new(MemoryOracle::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(EchoTransport::default());
        let config = ServiceConfig::from_toml_str(
            r#"
            network = "regtest"
            lock_ttl_secs = 60
            offer_ttl_secs = 3600
            [oracle]
            url = "http://127.0.0.1:1"
            [[relays]]
            name = "echo"
            url = "http://127.0.0.1:1/tx"
            priority = 0
            "#,
        )
        .unwrap();
        let dispatcher = Dispatcher::new(config.relays.clone(), None, transport.clone());
        let store = Arc::new(InterleavingStore::default());
        let book = OfferBook::new(
            &config,
            store.clone(),
            oracle.clone(),
            Arc::new(dispatcher),
            Arc::new(Signer::new()),
            clock.clone(),
        );
        Harness {
            f,
            store,
            oracle,
            clock,
            transport,
            book,
        }
    }

    impl Harness {
        fn index_inscription(&self) -> AssetRef {
            let op = outpoint(0xa1, 0);
            self.oracle.insert(
                op,
                OutputAssets {
                    inscriptions: vec!["abc123i0".into()],
                    value: Some(INSCRIPTION_POSTAGE),
                    script_pubkey: Some(self.f.seller.script.to_hex_string()),
                    ..Default::default()
                },
            );
            AssetRef::Inscription { outpoint: op }
        }

        fn active_inscription_offer(&self, price: u64) -> Offer {
            let asset = self.index_inscription();
            let offer = self
                .book
                .create_offer(asset, price, &self.f.seller.address)
                .unwrap();
            let signed = self.f.sign_seller(&offer, SighashType::SinglePlusAnyoneCanPay);
            self.book.activate_offer(&offer.id, signed).unwrap()
        }
    }

    #[test]
    fn create_checks_ownership() {
        let h = harness();
        let asset = h.index_inscription();
        assert!(matches!(
            h.book.create_offer(asset.clone(), 0, &h.f.seller.address),
            Err(Error::InvalidPrice)
        ));
        assert!(matches!(
            h.book.create_offer(asset.clone(), 1_000, &h.f.buyer.address),
            Err(Error::AssetNotOwned(_))
        ));
        assert!(matches!(
            h.book.create_offer(asset.clone(), 1_000, "not-an-address"),
            Err(Error::InvalidAddress(_))
        ));

        let offer = h.book.create_offer(asset, 1_000, &h.f.seller.address).unwrap();
        assert_eq!(offer.state, OfferState::Draft);
        assert_eq!(offer.asset_utxo.value_sats, INSCRIPTION_POSTAGE);
        assert_eq!(offer.sighash_mode, SighashType::SinglePlusAnyoneCanPay);
    }

    #[test]
    fn rune_offer_needs_balance() {
        let h = harness();
        let op = outpoint(0xb2, 1);
        let mut runes = std::collections::BTreeMap::new();
        runes.insert("840000:3".to_string(), 500u128);
        h.oracle.insert(
            op,
            OutputAssets {
                runes,
                value: Some(546),
                script_pubkey: Some(h.f.seller.script.to_hex_string()),
                ..Default::default()
            },
        );
        let asset = |amount| AssetRef::Rune {
            rune_id: "840000:3".parse().unwrap(),
            amount,
            outpoint: op,
        };
        assert!(matches!(
            h.book.create_offer(asset(501), 1_000, &h.f.seller.address),
            Err(Error::AssetNotOwned(_))
        ));
        let offer = h
            .book
            .create_offer(asset(500), 1_000, &h.f.seller.address)
            .unwrap();
        assert_eq!(offer.sighash_mode, SighashType::NonePlusAnyoneCanPay);
    }

    #[test]
    fn activation_requires_correct_mode() {
        let h = harness();
        let asset = h.index_inscription();
        let offer = h.book.create_offer(asset, 5_000, &h.f.seller.address).unwrap();
        let template = h.book.seller_template(&offer.id).unwrap();
        assert_eq!(template.unsigned_tx.output[0].value.to_sat(), 5_000);

        let wrong = h.f.sign_seller(&offer, SighashType::All);
        assert!(matches!(
            h.book.activate_offer(&offer.id, wrong),
            Err(Error::InvalidSighashMode { .. })
        ));
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Draft);

        let good = h.f.sign_seller(&offer, SighashType::SinglePlusAnyoneCanPay);
        let active = h.book.activate_offer(&offer.id, good.clone()).unwrap();
        assert_eq!(active.state, OfferState::Active);
        assert!(active.seller_psbt.is_some());
        assert!(matches!(
            h.book.activate_offer(&offer.id, good),
            Err(Error::OfferStateConflict { .. })
        ));
    }

    #[test]
    fn lock_release_and_cancel() {
        let h = harness();
        let offer = h.active_inscription_offer(5_000);

        assert!(matches!(
            h.book.try_purchase_lock(&offer.id, "alice").unwrap(),
            LockOutcome::Locked(_)
        ));
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Locked);
        h.clock.advance(Duration::from_secs(20));
        assert_eq!(
            h.book.try_purchase_lock(&offer.id, "bob").unwrap(),
            LockOutcome::Rejected {
                holder: "alice".into(),
                remaining_secs: 40
            }
        );

        // sellers cannot pull an offer out from under a buyer
        assert!(matches!(
            h.book.cancel_offer(&offer.id, &h.f.seller.address),
            Err(Error::OfferStateConflict {
                state: OfferState::Locked,
                ..
            })
        ));

        assert!(!h.book.release_lock(&offer.id, "bob").unwrap());
        assert!(h.book.release_lock(&offer.id, "alice").unwrap());
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Active);

        assert!(matches!(
            h.book.cancel_offer(&offer.id, "mallory"),
            Err(Error::Unauthorized { .. })
        ));
        let cancelled = h.book.cancel_offer(&offer.id, &h.f.seller.address).unwrap();
        assert_eq!(cancelled.state, OfferState::Cancelled);
        assert!(matches!(
            h.book.try_purchase_lock(&offer.id, "alice"),
            Err(Error::OfferStateConflict { .. })
        ));
    }

    #[test]
    fn lapsed_lock_reopens_offer() {
        let h = harness();
        let offer = h.active_inscription_offer(5_000);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();
        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.book.reconcile_locks().unwrap(), vec![offer.id.clone()]);
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Active);
        assert!(h.book.locks().is_empty());
    }

    #[test]
    fn offers_expire() {
        let h = harness();
        let offer = h.active_inscription_offer(5_000);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();
        h.clock.advance(Duration::from_secs(3_600));
        assert_eq!(h.book.expire_due().unwrap(), vec![offer.id.clone()]);
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Expired);
        assert!(h.book.locks().holder(&offer.id).is_none());
        assert!(h.book.expire_due().unwrap().is_empty());
    }

    #[test]
    fn submit_completes_the_sale() {
        let h = harness();
        let offer = h.active_inscription_offer(50_000);
        let plan = h.f.buyer_plan(&h.oracle, &[600], &[80_000], 2);
        let BuyerPsbt { mut psbt, layout } =
            build_buyer_psbt(h.oracle.as_ref(), &offer, &plan).unwrap();
        h.f.sign_buyer(&mut psbt, &layout);

        // no lock yet
        assert!(matches!(
            h.book.submit_buyer_psbt(&offer.id, "alice", psbt.clone()),
            Err(Error::OfferStateConflict { .. })
        ));
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();
        assert!(matches!(
            h.book.submit_buyer_psbt(&offer.id, "bob", psbt.clone()),
            Err(Error::LockConflict { .. })
        ));

        h.book.signer().set_policy(
            "ops",
            SigningPolicy::Suspended {
                reason: "incident".into(),
            },
        );
        assert!(matches!(
            h.book.submit_buyer_psbt(&offer.id, "alice", psbt.clone()),
            Err(Error::SigningSuspended { .. })
        ));
        h.book.signer().set_policy("ops", SigningPolicy::Enabled);

        let receipt = h.book.submit_buyer_psbt(&offer.id, "alice", psbt).unwrap();
        assert_eq!(receipt.service, "echo");
        assert_eq!(receipt.txid.len(), 64);
        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);

        let done = h.book.get(&offer.id).unwrap();
        assert_eq!(done.state, OfferState::Completed);
        assert_eq!(done.txid.as_deref(), Some(receipt.txid.as_str()));
        assert!(h.book.locks().is_empty());
    }

    #[test]
    fn broadcast_outliving_the_lock_still_completes() {
        let h = harness();
        let offer = h.active_inscription_offer(50_000);
        let plan = h.f.buyer_plan(&h.oracle, &[600], &[80_000], 2);
        let BuyerPsbt { mut psbt, layout } =
            build_buyer_psbt(h.oracle.as_ref(), &offer, &plan).unwrap();
        h.f.sign_buyer(&mut psbt, &layout);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();

        let clock = h.clock.clone();
        *h.transport.before_reply.lock().unwrap() =
            Some(Box::new(move || clock.advance(Duration::from_secs(61))));
        let receipt = h.book.submit_buyer_psbt(&offer.id, "alice", psbt).unwrap();

        let done = h.book.get(&offer.id).unwrap();
        assert_eq!(done.state, OfferState::Completed);
        assert_eq!(done.txid.as_deref(), Some(receipt.txid.as_str()));
        assert!(h.book.reconcile_locks().unwrap().is_empty());
        assert!(matches!(
            h.book.try_purchase_lock(&offer.id, "bob"),
            Err(Error::OfferStateConflict {
                state: OfferState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn sale_recorded_after_offer_reopened() {
        let h = harness();
        let offer = h.active_inscription_offer(50_000);
        let plan = h.f.buyer_plan(&h.oracle, &[600], &[80_000], 2);
        let BuyerPsbt { mut psbt, layout } =
            build_buyer_psbt(h.oracle.as_ref(), &offer, &plan).unwrap();
        h.f.sign_buyer(&mut psbt, &layout);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();

        // the maintenance pass reopens the offer while relays are slow
        let (clock, locks, store, id) = (
            h.clock.clone(),
            h.book.locks().clone(),
            h.store.clone(),
            offer.id.clone(),
        );
        *h.transport.before_reply.lock().unwrap() = Some(Box::new(move || {
            clock.advance(Duration::from_secs(61));
            locks.sweep();
            store
                .update_with(&id, &mut |o| o.transition("lock expired", OfferState::Active))
                .unwrap();
        }));
        h.book.submit_buyer_psbt(&offer.id, "alice", psbt).unwrap();
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Completed);
    }

    #[test]
    fn reopening_skips_offers_relocked_after_the_sweep() {
        let h = harness();
        let offer = h.active_inscription_offer(5_000);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();
        h.clock.advance(Duration::from_secs(61));

        let (locks, id) = (h.book.locks().clone(), offer.id.clone());
        h.store.before_next_update(move || {
            assert!(locks.try_lock(&id, "bob", Duration::from_secs(60)).is_held());
        });
        assert!(h.book.reconcile_locks().unwrap().is_empty());
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Locked);
        assert_eq!(
            h.book.locks().holder(&offer.id).unwrap().holder_address,
            "bob"
        );
        assert!(matches!(
            h.book.cancel_offer(&offer.id, &h.f.seller.address),
            Err(Error::OfferStateConflict { .. })
        ));
    }

    #[test]
    fn release_keeps_offer_locked_for_the_next_holder() {
        let h = harness();
        let offer = h.active_inscription_offer(5_000);
        h.book.try_purchase_lock(&offer.id, "alice").unwrap();

        let (locks, id) = (h.book.locks().clone(), offer.id.clone());
        h.store.before_next_update(move || {
            assert!(locks.try_lock(&id, "bob", Duration::from_secs(60)).is_held());
        });
        assert!(h.book.release_lock(&offer.id, "alice").unwrap());
        assert_eq!(h.book.get(&offer.id).unwrap().state, OfferState::Locked);
    }
}
