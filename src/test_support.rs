//! Shared fakes for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::db::RecordStore;
use crate::error::{AuthorityError, StorageError};
use crate::gateway::TransactionAuthority;
use crate::model::{CanonicalTransaction, LineItem, LocalId, Transaction, TransactionPayload};

/// In-memory record store whose writes can be made to fail.
#[derive(Default)]
pub struct MemoryRecords {
    records: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryRecords {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl RecordStore for MemoryRecords {
    fn load(&self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    fn save(&self, name: &str, value: &str) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("quota exceeded".into()));
        }
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// A sale of `quantity` units of one product.
pub fn sale(product_id: &str, quantity: u32) -> Transaction {
    Transaction::new(TransactionPayload {
        items: vec![LineItem {
            product_id: product_id.to_string(),
            name: None,
            quantity,
            unit_price: 2.5,
        }],
        ..Default::default()
    })
}

/// What the fake backend does with one submission.
pub enum Reply {
    Accept,
    AcceptWithStock(Vec<(&'static str, i64)>),
    Fail(AuthorityError),
    /// Never answers; exercises the gateway timeout.
    Hang,
}

/// Scripted stand-in for the admin dashboard.
///
/// Replies are consumed in call order; once the script runs out every call is
/// accepted. Submissions are recorded by local id.
#[derive(Default)]
pub struct ScriptedAuthority {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<LocalId>>,
    gate: Mutex<Option<std::sync::Arc<Notify>>>,
    server_seq: Mutex<u64>,
}

impl ScriptedAuthority {
    pub fn with_script(replies: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<LocalId> {
        self.calls.lock().unwrap().clone()
    }

    /// Hold every submission until the returned `Notify` is signalled.
    pub fn gated(&self) -> std::sync::Arc<Notify> {
        let notify = std::sync::Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(notify.clone());
        notify
    }

    fn canonical(
        &self,
        transaction: &Transaction,
        stock: Option<BTreeMap<String, i64>>,
    ) -> CanonicalTransaction {
        let mut seq = self.server_seq.lock().unwrap();
        *seq += 1;
        CanonicalTransaction {
            server_id: format!("txn_{}", *seq),
            local_id: transaction.local_id.clone(),
            payload: transaction.payload.clone(),
            stock_levels: stock,
            confirmed_at: Utc::now(),
        }
    }
}

#[async_trait]
impl TransactionAuthority for ScriptedAuthority {
    async fn create_authoritative_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<CanonicalTransaction, AuthorityError> {
        self.calls
            .lock()
            .unwrap()
            .push(transaction.local_id.clone());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            None | Some(Reply::Accept) => Ok(self.canonical(transaction, None)),
            Some(Reply::AcceptWithStock(levels)) => {
                let stock = levels
                    .into_iter()
                    .map(|(product, qty)| (product.to_string(), qty))
                    .collect();
                Ok(self.canonical(transaction, Some(stock)))
            }
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AuthorityError::network("unreachable"))
            }
        }
    }
}
