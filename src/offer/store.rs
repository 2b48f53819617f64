//! Offer persistence. The production store lives elsewhere; this trait is the
//! seam, and `MemoryOfferStore` backs tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Offer;
use crate::error::{Error, Result};
use crate::types::OfferId;

pub trait OfferStore: Send + Sync {
    fn insert(&self, offer: Offer) -> Result<()>;

    fn get(&self, id: &OfferId) -> Result<Option<Offer>>;

    fn list(&self) -> Result<Vec<Offer>>;

    /// Apply `f` to the stored offer atomically. The change is kept only if
    /// `f` succeeds; the updated offer is returned.
    fn update_with(
        &self,
        id: &OfferId,
        f: &mut dyn FnMut(&mut Offer) -> Result<()>,
    ) -> Result<Offer>;
}

#[derive(Debug, Default)]
pub struct MemoryOfferStore {
    offers: RwLock<HashMap<OfferId, Offer>>,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<OfferId, Offer>> {
        match self.offers.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<OfferId, Offer>> {
        match self.offers.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OfferStore for MemoryOfferStore {
    fn insert(&self, offer: Offer) -> Result<()> {
        let mut offers = self.write();
        if offers.contains_key(&offer.id) {
            return Err(Error::Config(format!("duplicate offer id {}", offer.id)));
        }
        offers.insert(offer.id.clone(), offer);
        Ok(())
    }

    fn get(&self, id: &OfferId) -> Result<Option<Offer>> {
        Ok(self.read().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Offer>> {
        Ok(self.read().values().cloned().collect())
    }

    fn update_with(
        &self,
        id: &OfferId,
        f: &mut dyn FnMut(&mut Offer) -> Result<()>,
    ) -> Result<Offer> {
        let mut offers = self.write();
        let stored = offers
            .get_mut(id)
            .ok_or_else(|| Error::OfferNotFound(id.to_string()))?;
        let mut draft = stored.clone();
        f(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }
}
