//! Offline sync service: the surface the till talks to.
//!
//! Owns the queue, the dead-letter list, the stock cache, the connectivity
//! monitor and the sync engine, and runs the engine's background tasks
//! between [`OfflineSyncService::start`] and [`OfflineSyncService::stop`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AdminApiClient;
use crate::cache::{OptimisticStateCache, StockLedgerEntry};
use crate::config::{GatewayCredentials, SyncConfig};
use crate::connectivity::{spawn_probe_loop, ConnectivityMonitor, ConnectivityProbe};
use crate::db::{self, RecordStore};
use crate::error::{EnqueueError, StorageError};
use crate::gateway::{RemoteMutationGateway, TransactionAuthority};
use crate::model::{DeadLetter, LocalId, SyncState, Transaction};
use crate::queue::{DeadLetterStore, PendingTransactionStore};
use crate::sync::{DrainOutcome, EngineState, SyncEngine, SyncEvent, TriggerReason};

/// What the till gets back once a sale is safely recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleReceipt {
    pub local_id: LocalId,
    /// `true` when the terminal is offline and the sale waits in the queue.
    pub queued_offline: bool,
    pub pending_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_running: bool,
    pub state: EngineState,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    /// A storage write failed and has not been retried successfully yet.
    pub storage_dirty: bool,
}

pub struct OfflineSyncService {
    store: Arc<PendingTransactionStore>,
    dead_letters: Arc<DeadLetterStore>,
    cache: Arc<OptimisticStateCache>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    config: SyncConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
    stopped: AtomicBool,
}

impl OfflineSyncService {
    /// Rehydrate the queue and dead letters from `records`. The terminal
    /// starts out offline until a probe or the host reports otherwise.
    pub fn new(
        records: Arc<dyn RecordStore>,
        authority: Arc<dyn TransactionAuthority>,
        config: SyncConfig,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(PendingTransactionStore::open(records.clone())?);
        let dead_letters = Arc::new(DeadLetterStore::open(records)?);

        // Sales from an earlier session are still unknown to the server, so
        // their deltas stay outstanding against any figure seeded later. The
        // ledger is empty here, so nothing is decremented twice.
        let cache = Arc::new(OptimisticStateCache::new());
        for transaction in store.drain_snapshot() {
            cache.apply_local(&transaction);
        }
        for dead_letter in dead_letters.list() {
            cache.apply_local(&dead_letter.transaction);
        }
        if !store.is_empty() || !dead_letters.is_empty() {
            info!(
                pending = store.len(),
                dead_letters = dead_letters.len(),
                "Rehydrated offline sales from storage"
            );
        }
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let gateway = RemoteMutationGateway::new(authority, config.submit_timeout());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            dead_letters.clone(),
            gateway,
            cache.clone(),
            monitor.clone(),
            config.clone(),
        ));

        Ok(Self {
            store,
            dead_letters,
            cache,
            monitor,
            engine,
            probe: None,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Open the terminal's database under `data_dir` and wire up the admin
    /// dashboard client as both submission backend and health probe.
    pub fn open(data_dir: &Path, credentials: GatewayCredentials) -> anyhow::Result<Self> {
        let db = Arc::new(db::init(data_dir).context("failed to open offline queue database")?);
        let config = SyncConfig::load(&db).with_env_overrides();
        let client = Arc::new(
            AdminApiClient::new(credentials, config.submit_timeout())
                .context("failed to create admin dashboard client")?,
        );
        let service = Self::new(db, client.clone(), config)
            .context("failed to rehydrate offline queue")?
            .with_probe(client);
        Ok(service)
    }

    /// Spawn the drain loop, the connectivity watcher and, when configured,
    /// the health probe. Must run inside a tokio runtime. Idempotent; a
    /// stopped service stays stopped.
    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Offline sync service was stopped; refusing to restart");
            return;
        }
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = Vec::new();
        handles.push(self.engine.spawn_connectivity_watcher(self.cancel.clone()));
        if let Some(handle) = self.engine.spawn_run_loop(self.cancel.clone()) {
            handles.push(handle);
        }
        match (&self.probe, self.config.probe_enabled) {
            (Some(probe), true) => handles.push(spawn_probe_loop(
                self.monitor.clone(),
                probe.clone(),
                self.config.probe_interval(),
                self.cancel.clone(),
            )),
            (Some(_), false) => info!("Connectivity probe disabled by configuration"),
            (None, _) => {}
        }
        lock_tasks(&self.tasks).extend(handles);

        info!(
            version = env!("CARGO_PKG_VERSION"),
            git_sha = env!("BUILD_GIT_SHA"),
            pending = self.store.len(),
            dead_letters = self.dead_letters.len(),
            "Offline sync service started"
        );
    }

    /// Cancel the background tasks and flush the queue. Never clears it.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let handles = std::mem::take(&mut *lock_tasks(&self.tasks));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }

        // A submission cut off by shutdown has an unknown outcome; queue it
        // again so it is resent under the same idempotency key.
        if let Some(local_id) = self.store.in_flight() {
            warn!(%local_id, "Submission interrupted by shutdown; returned to queue");
            if let Err(e) = self.store.release(&local_id, None) {
                warn!(error = %e, "Failed to requeue interrupted submission");
            }
        }
        self.engine.flush_stores();

        self.is_running.store(false, Ordering::SeqCst);
        info!(pending = self.store.len(), "Offline sync service stopped");
    }

    /// Record a completed sale.
    ///
    /// Stock is decremented and the sale durably queued before this returns;
    /// the network is never waited on. When online the engine is asked to
    /// drain, so the sale goes out right behind anything older.
    ///
    /// On a storage error the sale is still held in memory and will be
    /// submitted and flushed later; the error is for the operator. A sale
    /// that was already confirmed or dead-lettered is acknowledged and left
    /// alone.
    pub fn enqueue_or_submit(&self, transaction: Transaction) -> Result<SaleReceipt, EnqueueError> {
        let local_id = transaction.local_id.clone();
        let online = self.monitor.is_online();

        if !self.cache.apply_local(&transaction) {
            // A repeated completion event for a sale the server already has,
            // or one parked for the operator, must not go out again.
            let settled = self.cache.canonical_for(&local_id).is_some()
                || self.dead_letters.get(&local_id).is_some();
            if settled {
                debug!(%local_id, "Sale already recorded; not queued again");
                return Ok(SaleReceipt {
                    local_id,
                    queued_offline: false,
                    pending_count: self.store.len(),
                });
            }
        }

        let result = self.store.enqueue(transaction);
        let pending_count = self.store.len();

        self.engine.emit(SyncEvent::Enqueued {
            local_id: local_id.clone(),
            online,
        });
        self.engine
            .emit(SyncEvent::PendingCountChanged { pending: pending_count });
        if online {
            self.engine.trigger(TriggerReason::Enqueued);
        }

        match result {
            Ok(()) => Ok(SaleReceipt {
                local_id,
                queued_offline: !online,
                pending_count,
            }),
            Err(err) => {
                self.engine.emit(SyncEvent::StorageFailed {
                    message: err.source.to_string(),
                });
                Err(err)
            }
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.monitor.is_online(),
            is_running: self.is_running.load(Ordering::SeqCst),
            state: self.engine.state(),
            pending_count: self.store.len(),
            dead_letter_count: self.dead_letters.len(),
            last_sync: self.engine.last_sync(),
            storage_dirty: self.store.is_dirty(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Feed a reachability observation from the host (e.g. an OS network
    /// change notification). Returns whether it changed the state.
    pub fn report_connectivity(&self, online: bool) -> bool {
        self.monitor.set_online(online)
    }

    pub fn pending_count(&self) -> usize {
        self.store.len()
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.store.drain_snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list()
    }

    /// Operator retry: put a dead letter back at the tail of the queue with a
    /// fresh attempt count. Returns `false` if no such dead letter exists.
    pub fn retry_dead_letter(&self, local_id: &LocalId) -> Result<bool, StorageError> {
        let Some(dead_letter) = self.dead_letters.get(local_id) else {
            return Ok(false);
        };
        let mut transaction = dead_letter.transaction;
        transaction.sync_state = SyncState::Queued;
        transaction.attempts = 0;
        transaction.last_error = None;

        self.store.enqueue(transaction).map_err(|e| e.source)?;
        self.dead_letters.discard(local_id)?;
        info!(%local_id, "Dead letter returned to the pending queue");

        self.engine.emit(SyncEvent::PendingCountChanged {
            pending: self.store.len(),
        });
        if self.monitor.is_online() {
            self.engine.trigger(TriggerReason::Force);
        }
        Ok(true)
    }

    /// Operator drop: forget a dead letter and give its stock back.
    pub fn discard_dead_letter(&self, local_id: &LocalId) -> Result<bool, StorageError> {
        if self.dead_letters.discard(local_id)?.is_none() {
            return Ok(false);
        }
        self.cache.revert_local(local_id);
        warn!(%local_id, "Dead letter discarded by operator");
        Ok(true)
    }

    /// Drain now on the caller's task, ignoring any backoff.
    pub async fn force_sync(&self) -> DrainOutcome {
        let outcome = self.engine.drain().await;
        info!(?outcome, "Force sync finished");
        outcome
    }

    pub fn seed_stock<I, S>(&self, levels: I)
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        self.cache.seed(levels);
    }

    pub fn stock_of(&self, product_id: &str) -> Option<i64> {
        self.cache.stock_of(product_id)
    }

    pub fn stock_snapshot(&self) -> Vec<StockLedgerEntry> {
        self.cache.snapshot()
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthorityError;
    use crate::test_support::{sale, MemoryRecords, Reply, ScriptedAuthority};
    use std::time::Duration;

    fn test_config() -> SyncConfig {
        SyncConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            probe_enabled: false,
            ..SyncConfig::default()
        }
    }

    fn service(replies: Vec<Reply>) -> (OfflineSyncService, Arc<ScriptedAuthority>, Arc<MemoryRecords>) {
        let records = Arc::new(MemoryRecords::default());
        let authority = Arc::new(ScriptedAuthority::with_script(replies));
        let service =
            OfflineSyncService::new(records.clone(), authority.clone(), test_config()).unwrap();
        (service, authority, records)
    }

    async fn wait_for_confirmed(rx: &mut broadcast::Receiver<SyncEvent>) -> LocalId {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::Confirmed { local_id, .. }) = rx.recv().await {
                    return local_id;
                }
            }
        })
        .await
        .expect("confirmation within timeout")
    }

    #[tokio::test]
    async fn test_offline_sale_is_queued_then_synced_on_reconnect() {
        let (service, authority, _) = service(vec![]);
        let mut events = service.subscribe();
        service.seed_stock([("P", 10)]);
        service.start();

        let tx = sale("P", 2);
        let receipt = service.enqueue_or_submit(tx.clone()).unwrap();
        assert!(receipt.queued_offline);
        assert_eq!(receipt.pending_count, 1);
        assert_eq!(service.stock_of("P"), Some(8));
        assert!(authority.calls().is_empty());

        assert!(service.report_connectivity(true));
        assert_eq!(wait_for_confirmed(&mut events).await, tx.local_id);
        assert_eq!(service.pending_count(), 0);
        assert_eq!(service.stock_of("P"), Some(8));
        assert!(service.status().last_sync.is_some());

        service.stop().await;
        assert!(!service.status().is_running);
    }

    #[tokio::test]
    async fn test_online_sale_goes_out_immediately() {
        let (service, authority, _) = service(vec![]);
        let mut events = service.subscribe();
        service.report_connectivity(true);
        service.start();

        let tx = sale("P", 1);
        let receipt = service.enqueue_or_submit(tx.clone()).unwrap();
        assert!(!receipt.queued_offline);
        assert_eq!(wait_for_confirmed(&mut events).await, tx.local_id);
        assert_eq!(authority.calls(), vec![tx.local_id]);

        service.stop().await;
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = std::env::temp_dir().join(format!("pos-offline-svc-{}", uuid::Uuid::new_v4()));
        let t1 = sale("P", 1);
        let t2 = sale("P", 2);
        {
            let db = Arc::new(db::init(&dir).unwrap());
            let authority = Arc::new(ScriptedAuthority::default());
            let service = OfflineSyncService::new(db, authority, test_config()).unwrap();
            service.enqueue_or_submit(t1.clone()).unwrap();
            service.enqueue_or_submit(t2.clone()).unwrap();
            service.stop().await;
        }

        let db = Arc::new(db::init(&dir).unwrap());
        let authority = Arc::new(ScriptedAuthority::default());
        let service = OfflineSyncService::new(db, authority.clone(), test_config()).unwrap();
        assert_eq!(service.pending_count(), 2);

        service.report_connectivity(true);
        assert_eq!(
            service.force_sync().await,
            DrainOutcome::Drained {
                confirmed: 2,
                dead_lettered: 0
            }
        );
        assert_eq!(authority.calls(), vec![t1.local_id, t2.local_id]);

        drop(service);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stock_seeded_after_restart_still_counts_queued_sales() {
        let dir = std::env::temp_dir().join(format!("pos-offline-svc-{}", uuid::Uuid::new_v4()));
        {
            let db = Arc::new(db::init(&dir).unwrap());
            let authority = Arc::new(ScriptedAuthority::default());
            let service = OfflineSyncService::new(db, authority, test_config()).unwrap();
            service.seed_stock([("P", 10)]);
            service.enqueue_or_submit(sale("P", 2)).unwrap();
            service.enqueue_or_submit(sale("P", 1)).unwrap();
            assert_eq!(service.stock_of("P"), Some(7));
            service.stop().await;
        }

        let db = Arc::new(db::init(&dir).unwrap());
        let authority = Arc::new(ScriptedAuthority::default());
        let service = OfflineSyncService::new(db, authority, test_config()).unwrap();
        assert_eq!(service.pending_count(), 2);

        service.seed_stock([("P", 10)]);
        assert_eq!(service.stock_of("P"), Some(7));

        drop(service);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_repeated_sale_event_after_confirmation_is_not_resubmitted() {
        let (service, authority, _) = service(vec![]);
        service.seed_stock([("P", 10)]);
        service.report_connectivity(true);

        let tx = sale("P", 1);
        service.enqueue_or_submit(tx.clone()).unwrap();
        assert_eq!(
            service.force_sync().await,
            DrainOutcome::Drained {
                confirmed: 1,
                dead_lettered: 0
            }
        );

        let receipt = service.enqueue_or_submit(tx.clone()).unwrap();
        assert_eq!(receipt.local_id, tx.local_id);
        assert_eq!(receipt.pending_count, 0);
        assert_eq!(service.pending_count(), 0);
        service.force_sync().await;

        assert_eq!(authority.calls(), vec![tx.local_id]);
        assert_eq!(service.stock_of("P"), Some(9));
    }

    #[tokio::test]
    async fn test_repeated_sale_event_for_dead_letter_stays_parked() {
        let (service, authority, _) = service(vec![Reply::Fail(AuthorityError::http(
            422,
            "Validation failed",
        ))]);
        service.report_connectivity(true);

        let tx = sale("P", 1);
        service.enqueue_or_submit(tx.clone()).unwrap();
        service.force_sync().await;
        assert_eq!(service.dead_letters().len(), 1);

        service.enqueue_or_submit(tx.clone()).unwrap();
        assert_eq!(service.pending_count(), 0);
        service.force_sync().await;
        assert_eq!(authority.calls(), vec![tx.local_id]);
    }

    #[tokio::test]
    async fn test_dead_letter_retry_and_discard() {
        let (service, _, _) = service(vec![
            Reply::Fail(AuthorityError::http(422, "Validation failed")),
            Reply::Fail(AuthorityError::http(422, "Validation failed")),
        ]);
        service.seed_stock([("P", 10)]);
        service.report_connectivity(true);
        let t1 = sale("P", 1);
        let t2 = sale("P", 2);
        service.enqueue_or_submit(t1.clone()).unwrap();
        service.enqueue_or_submit(t2.clone()).unwrap();

        assert_eq!(
            service.force_sync().await,
            DrainOutcome::Drained {
                confirmed: 0,
                dead_lettered: 2
            }
        );
        assert_eq!(service.dead_letters().len(), 2);
        assert_eq!(service.stock_of("P"), Some(7));

        assert!(service.retry_dead_letter(&t1.local_id).unwrap());
        assert!(!service.retry_dead_letter(&t1.local_id).unwrap());
        let pending = service.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(
            service.force_sync().await,
            DrainOutcome::Drained {
                confirmed: 1,
                dead_lettered: 0
            }
        );

        assert!(service.discard_dead_letter(&t2.local_id).unwrap());
        assert!(!service.discard_dead_letter(&t2.local_id).unwrap());
        assert!(service.dead_letters().is_empty());
        assert_eq!(service.stock_of("P"), Some(9));
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported_but_sale_kept() {
        let (service, authority, records) = service(vec![]);
        service.seed_stock([("P", 5)]);
        records.set_failing(true);

        let tx = sale("P", 1);
        let err = service.enqueue_or_submit(tx.clone()).unwrap_err();
        assert_eq!(err.transaction.local_id, tx.local_id);
        assert_eq!(service.pending_count(), 1);
        assert!(service.status().storage_dirty);
        assert_eq!(service.stock_of("P"), Some(4));

        records.set_failing(false);
        service.report_connectivity(true);
        assert_eq!(
            service.force_sync().await,
            DrainOutcome::Drained {
                confirmed: 1,
                dead_lettered: 0
            }
        );
        assert_eq!(authority.calls(), vec![tx.local_id]);
        assert!(!service.status().storage_dirty);
    }

    #[tokio::test]
    async fn test_stop_returns_interrupted_submission_to_queue() {
        let (service, authority, _) = service(vec![]);
        let _gate = authority.gated();
        service.report_connectivity(true);
        service.start();

        let tx = sale("P", 1);
        service.enqueue_or_submit(tx.clone()).unwrap();
        while authority.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(service.status().state, EngineState::Draining);

        service.stop().await;
        let pending = service.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_state, SyncState::Queued);
        assert_eq!(service.status().state, EngineState::Idle);

        service.start();
        assert!(!service.status().is_running);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let (service, _, _) = service(vec![]);
        let json = serde_json::to_value(service.status()).unwrap();
        assert_eq!(json["isOnline"], false);
        assert_eq!(json["pendingCount"], 0);
        assert_eq!(json["deadLetterCount"], 0);
        assert_eq!(json["state"], "idle");
        assert!(json["lastSync"].is_null());
    }
}
