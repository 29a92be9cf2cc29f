//! Optimistic stock ledger.
//!
//! Stock is decremented the moment a sale is rung up, long before the admin
//! dashboard has seen it. Each sale's delta is applied once, keyed by its
//! local id, and stays "outstanding" until the sale is confirmed.
//!
//! Reconciliation is an overwrite, not a delta: the believed quantity becomes
//! the server's figure minus whatever this terminal still has outstanding for
//! the product. Replaying the same confirmation yields the same ledger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::model::{CanonicalTransaction, LocalId, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StockSource {
    /// Last written by a local sale.
    Local,
    /// Last written from a server figure.
    Authoritative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLedgerEntry {
    pub product_id: String,
    pub quantity: i64,
    pub source: StockSource,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheInner {
    ledger: HashMap<String, StockLedgerEntry>,
    /// Every local id whose delta has been applied (or that arrived confirmed).
    applied: HashSet<LocalId>,
    /// Deltas applied locally but not yet confirmed by the server.
    outstanding: HashMap<LocalId, BTreeMap<String, i64>>,
    confirmed: HashMap<LocalId, CanonicalTransaction>,
}

impl CacheInner {
    fn outstanding_for(&self, product_id: &str) -> i64 {
        self.outstanding
            .values()
            .filter_map(|deltas| deltas.get(product_id))
            .sum()
    }
}

#[derive(Default)]
pub struct OptimisticStateCache {
    inner: Mutex<CacheInner>,
}

impl OptimisticStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load believed stock from the catalog. Outstanding local sales are
    /// subtracted from the figures, since the catalog has not seen them.
    pub fn seed<I, S>(&self, levels: I)
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut inner = self.lock();
        let now = Utc::now();
        for (product_id, quantity) in levels {
            let product_id = product_id.into();
            let quantity = quantity - inner.outstanding_for(&product_id);
            inner.ledger.insert(
                product_id.clone(),
                StockLedgerEntry {
                    product_id,
                    quantity,
                    source: StockSource::Authoritative,
                    updated_at: now,
                },
            );
        }
    }

    /// Decrement believed stock for a newly created sale.
    ///
    /// Returns `false` if this sale was already applied. Products the ledger
    /// does not track are skipped but still counted as outstanding, so a later
    /// `seed` accounts for them.
    pub fn apply_local(&self, transaction: &Transaction) -> bool {
        let mut inner = self.lock();
        if !inner.applied.insert(transaction.local_id.clone()) {
            debug!(local_id = %transaction.local_id, "Stock delta already applied");
            return false;
        }

        let deltas = transaction.payload.quantities();
        let now = Utc::now();
        for (product_id, sold) in &deltas {
            if let Some(entry) = inner.ledger.get_mut(product_id) {
                entry.quantity -= sold;
                entry.source = StockSource::Local;
                entry.updated_at = now;
            }
        }
        inner
            .outstanding
            .insert(transaction.local_id.clone(), deltas);
        true
    }

    /// Merge a confirmed transaction into the ledger.
    pub fn reconcile(&self, canonical: &CanonicalTransaction) {
        let mut inner = self.lock();
        inner.outstanding.remove(&canonical.local_id);
        inner.applied.insert(canonical.local_id.clone());
        inner
            .confirmed
            .insert(canonical.local_id.clone(), canonical.clone());

        let Some(levels) = &canonical.stock_levels else {
            return;
        };
        let now = Utc::now();
        for (product_id, authoritative) in levels {
            let quantity = authoritative - inner.outstanding_for(product_id);
            inner.ledger.insert(
                product_id.clone(),
                StockLedgerEntry {
                    product_id: product_id.clone(),
                    quantity,
                    source: StockSource::Authoritative,
                    updated_at: now,
                },
            );
        }
    }

    /// Give back the stock of a sale that will never be confirmed.
    pub fn revert_local(&self, local_id: &LocalId) -> bool {
        let mut inner = self.lock();
        let Some(deltas) = inner.outstanding.remove(local_id) else {
            return false;
        };
        let now = Utc::now();
        for (product_id, sold) in deltas {
            if let Some(entry) = inner.ledger.get_mut(&product_id) {
                entry.quantity += sold;
                entry.source = StockSource::Local;
                entry.updated_at = now;
            }
        }
        true
    }

    pub fn stock_of(&self, product_id: &str) -> Option<i64> {
        self.lock().ledger.get(product_id).map(|e| e.quantity)
    }

    pub fn entry(&self, product_id: &str) -> Option<StockLedgerEntry> {
        self.lock().ledger.get(product_id).cloned()
    }

    pub fn canonical_for(&self, local_id: &LocalId) -> Option<CanonicalTransaction> {
        self.lock().confirmed.get(local_id).cloned()
    }

    pub fn is_outstanding(&self, local_id: &LocalId) -> bool {
        self.lock().outstanding.contains_key(local_id)
    }

    /// Ledger sorted by product id.
    pub fn snapshot(&self) -> Vec<StockLedgerEntry> {
        let mut entries: Vec<StockLedgerEntry> = self.lock().ledger.values().cloned().collect();
        entries.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        entries
    }
}
