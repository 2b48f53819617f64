//! Purchase-lock manager
//!
//! One table behind one mutex. Every transition (lookup, expiry check,
//! insert) happens under the same guard, so two buyers can never both win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{deadline, remaining_secs, spawn_periodic, Clock, PeriodicHandle};
use crate::error::Result;
use crate::types::OfferId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLock {
    pub offer_id: OfferId,
    pub holder_address: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PurchaseLock {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Locked(PurchaseLock),
    Renewed(PurchaseLock),
    /// Someone else holds a live lock; not an error.
    Rejected { holder: String, remaining_secs: u64 },
}

impl LockOutcome {
    pub fn is_held(&self) -> bool {
        !matches!(self, LockOutcome::Rejected { .. })
    }
}

pub struct LockManager {
    table: Mutex<HashMap<OfferId, PurchaseLock>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.table().len())
            .finish()
    }
}

impl LockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<OfferId, PurchaseLock>> {
        // Entries are plain data; a panicked holder cannot leave one half-written.
        match self.table.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn try_lock(&self, offer_id: &OfferId, buyer_address: &str, ttl: Duration) -> LockOutcome {
        let mut table = self.table();
        let now = self.clock.now();

        if let Some(existing) = table.get_mut(offer_id) {
            if existing.is_live(now) {
                if existing.holder_address != buyer_address {
                    let remaining = remaining_secs(now, existing.expires_at);
                    debug!(%offer_id, holder = %existing.holder_address, remaining, "lock rejected");
                    return LockOutcome::Rejected {
                        holder: existing.holder_address.clone(),
                        remaining_secs: remaining,
                    };
                }
                existing.expires_at = deadline(now, ttl);
                debug!(%offer_id, buyer = buyer_address, expires_at = %existing.expires_at, "lock renewed");
                return LockOutcome::Renewed(existing.clone());
            }
        }

        let lock = PurchaseLock {
            offer_id: offer_id.clone(),
            holder_address: buyer_address.to_string(),
            acquired_at: now,
            expires_at: deadline(now, ttl),
        };
        if let Some(stale) = table.insert(offer_id.clone(), lock.clone()) {
            info!(%offer_id, previous = %stale.holder_address, "reclaimed expired lock");
        }
        info!(%offer_id, buyer = buyer_address, expires_at = %lock.expires_at, "lock acquired");
        LockOutcome::Locked(lock)
    }

    /// Release the lock if `buyer_address` holds it.
    pub fn unlock(&self, offer_id: &OfferId, buyer_address: &str) -> bool {
        let mut table = self.table();
        match table.get(offer_id) {
            Some(lock) if lock.holder_address == buyer_address => {
                table.remove(offer_id);
                info!(%offer_id, buyer = buyer_address, "lock released");
                true
            }
            _ => false,
        }
    }

    /// Drop any lock on the offer regardless of holder.
    pub fn clear(&self, offer_id: &OfferId) -> Option<PurchaseLock> {
        self.table().remove(offer_id)
    }

    /// The live lock on an offer; expired entries are removed on sight.
    pub fn holder(&self, offer_id: &OfferId) -> Option<PurchaseLock> {
        let mut table = self.table();
        let now = self.clock.now();
        match table.get(offer_id) {
            Some(lock) if lock.is_live(now) => Some(lock.clone()),
            Some(_) => {
                table.remove(offer_id);
                None
            }
            None => None,
        }
    }

    /// Remove every expired lock and return the offers they were on.
    pub fn sweep(&self) -> Vec<OfferId> {
        let mut table = self.table();
        let now = self.clock.now();
        let expired: Vec<OfferId> = table
            .values()
            .filter(|l| !l.is_live(now))
            .map(|l| l.offer_id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired locks");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `sweep` on a background thread every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Result<PeriodicHandle> {
        let locks = Arc::clone(self);
        spawn_periodic("lock-sweeper", interval, move || {
            locks.sweep();
        })
    }
}
