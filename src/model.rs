//! Sale records shared by the pending queue, the remote gateway and the stock
//! cache.
//!
//! A [`Transaction`] is created at the till and carries a `local-` prefixed id
//! until the admin dashboard hands back a [`CanonicalTransaction`] with its own
//! server id. Server ids never carry the prefix, so a sale still awaiting
//! reconciliation cannot be mistaken for a confirmed one.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidLocalId;

/// Reserved prefix for client-generated transaction ids.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// `true` when `id` was generated on this terminal rather than by the server.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

// ---------------------------------------------------------------------------
// LocalId
// ---------------------------------------------------------------------------

/// Client-side transaction identifier (`local-<uuid v4>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidLocalId> {
        let trimmed = raw.trim();
        if !is_local_id(trimmed) || trimmed.len() == LOCAL_ID_PREFIX.len() {
            return Err(InvalidLocalId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LocalId {
    type Error = InvalidLocalId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LocalId> for String {
    fn from(id: LocalId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(alias = "product_id")]
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub quantity: u32,
    #[serde(default, alias = "unit_price")]
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEntry {
    pub method: String,
    pub amount: f64,
}

/// Everything the till knows about a sale. Opaque to the queue; the stock
/// cache only reads product ids and quantities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default, alias = "customer_id", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub payments: Vec<PaymentEntry>,
    #[serde(default, alias = "discount_amount")]
    pub discount_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TransactionPayload {
    /// Quantity sold per product, summed across duplicate lines.
    pub fn quantities(&self) -> BTreeMap<String, i64> {
        let mut totals = BTreeMap::new();
        for item in &self.items {
            *totals.entry(item.product_id.clone()).or_insert(0) += i64::from(item.quantity);
        }
        totals
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Queued,
    InFlight,
    Confirmed,
    Failed,
}

/// One completed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub local_id: LocalId,
    pub created_at: DateTime<Utc>,
    pub payload: TransactionPayload,
    pub sync_state: SyncState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Transaction {
    /// Stamp a new sale with a fresh local id and its creation time.
    pub fn new(payload: TransactionPayload) -> Self {
        Self {
            local_id: LocalId::generate(),
            created_at: Utc::now(),
            payload,
            sync_state: SyncState::Queued,
            attempts: 0,
            last_error: None,
        }
    }
}

/// The server's authoritative version of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTransaction {
    pub server_id: String,
    pub local_id: LocalId,
    pub payload: TransactionPayload,
    /// Authoritative stock per product after this sale, when the server sends it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_levels: Option<BTreeMap<String, i64>>,
    pub confirmed_at: DateTime<Utc>,
}

/// A transaction the server explicitly refused. Excluded from automatic retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub transaction: Transaction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(mut transaction: Transaction, reason: impl Into<String>, status: Option<u16>) -> Self {
        transaction.sync_state = SyncState::Failed;
        Self {
            transaction,
            reason: reason.into(),
            status,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_reserved_prefix() {
        let id = LocalId::generate();
        assert!(is_local_id(id.as_str()));
        assert_ne!(id, LocalId::generate());
        assert!(!is_local_id("9f1c2d7e-0000-4000-8000-000000000000"));
    }

    #[test]
    fn test_parse_rejects_server_ids() {
        assert!(LocalId::parse("txn_123").is_err());
        assert!(LocalId::parse("local-").is_err());
        assert_eq!(LocalId::parse(" local-abc ").unwrap().as_str(), "local-abc");
    }

    #[test]
    fn test_transaction_json_rejects_non_local_id() {
        let json = serde_json::json!({
            "localId": "srv-1",
            "createdAt": "2026-02-23T12:00:00Z",
            "payload": {},
            "syncState": "queued"
        });
        assert!(serde_json::from_value::<Transaction>(json).is_err());
    }

    #[test]
    fn test_payload_accepts_snake_case_aliases() {
        let payload: TransactionPayload = serde_json::from_value(serde_json::json!({
            "items": [{ "product_id": "sku-1", "quantity": 2, "unit_price": 1.5 }],
            "customer_id": "cust-9",
            "discount_amount": 0.5
        }))
        .unwrap();
        assert_eq!(payload.items[0].product_id, "sku-1");
        assert_eq!(payload.customer_id.as_deref(), Some("cust-9"));
        assert_eq!(payload.discount_amount, 0.5);
    }

    #[test]
    fn test_quantities_sum_duplicate_lines() {
        let payload = TransactionPayload {
            items: vec![
                LineItem {
                    product_id: "p".into(),
                    name: None,
                    quantity: 2,
                    unit_price: 1.0,
                },
                LineItem {
                    product_id: "q".into(),
                    name: None,
                    quantity: 1,
                    unit_price: 1.0,
                },
                LineItem {
                    product_id: "p".into(),
                    name: None,
                    quantity: 3,
                    unit_price: 1.0,
                },
            ],
            ..Default::default()
        };
        let totals = payload.quantities();
        assert_eq!(totals.get("p"), Some(&5));
        assert_eq!(totals.get("q"), Some(&1));
    }

    #[test]
    fn test_dead_letter_marks_transaction_failed() {
        let tx = Transaction::new(TransactionPayload::default());
        let dl = DeadLetter::new(tx, "Validation failed", Some(422));
        assert_eq!(dl.transaction.sync_state, SyncState::Failed);
        assert_eq!(dl.status, Some(422));
    }
}
