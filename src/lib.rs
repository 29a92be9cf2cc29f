//! The Small POS - offline sale queue
//!
//! Lets the till complete a sale with no connection to the admin dashboard.
//! Every sale is written to a durable local queue before the till is told it
//! succeeded, stock is decremented optimistically, and a background engine
//! submits queued sales one at a time, oldest first, whenever the dashboard is
//! reachable. Confirmed sales are reconciled into the stock ledger; sales the
//! server refuses are parked as dead letters for the operator.
//!
//! [`OfflineSyncService`] is the entry point.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod queue;
pub mod service;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::AdminApiClient;
pub use cache::{OptimisticStateCache, StockLedgerEntry, StockSource};
pub use config::{GatewayCredentials, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivityTransition};
pub use error::{
    AuthorityError, ConfigError, EnqueueError, QueueError, StorageError, SubmissionError,
};
pub use gateway::{RemoteMutationGateway, TransactionAuthority};
pub use model::{
    CanonicalTransaction, DeadLetter, LineItem, LocalId, PaymentEntry, SyncState, Transaction,
    TransactionPayload,
};
pub use queue::{DeadLetterStore, PendingTransactionStore};
pub use service::{OfflineSyncService, SaleReceipt, SyncStatus};
pub use sync::{DrainOutcome, EngineState, SyncEngine, SyncEvent, TriggerReason};
