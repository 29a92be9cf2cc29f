//! Sync engine: drains the pending queue through the remote gateway.
//!
//! One drain runs at a time. A drain walks the queue oldest first and keeps a
//! single transaction in flight; a confirmed sale is removed from the queue
//! on its own, never as part of a bulk clear. The first transient failure
//! puts the failed sale and everything behind it back at the head of the
//! queue and parks the engine in `Backoff`. Rejected sales move to the
//! dead-letter list and the drain carries on.
//!
//! Triggers (connectivity restored, new sale, periodic tick, forced sync) are
//! folded into a bitmask and a capacity-one wake channel, so any number of
//! triggers raised during a drain collapse into at most one follow-up drain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::OptimisticStateCache;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{QueueError, StorageError, SubmissionError};
use crate::gateway::RemoteMutationGateway;
use crate::model::{CanonicalTransaction, DeadLetter, LocalId, Transaction};
use crate::queue::{DeadLetterStore, PendingTransactionStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Draining,
    Backoff,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged {
        online: bool,
    },
    StateChanged {
        state: EngineState,
    },
    /// A sale was durably queued. `online` tells the UI whether it will go
    /// out straight away or is waiting for the network.
    Enqueued {
        local_id: LocalId,
        online: bool,
    },
    Confirmed {
        local_id: LocalId,
        server_id: String,
    },
    DeadLettered {
        local_id: LocalId,
        reason: String,
        status: Option<u16>,
    },
    StorageFailed {
        message: String,
    },
    PendingCountChanged {
        pending: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    BecameOnline,
    Enqueued,
    Tick,
    Force,
    BackoffElapsed,
}

impl TriggerReason {
    fn bit(self) -> u8 {
        match self {
            TriggerReason::BecameOnline => 1,
            TriggerReason::Enqueued => 1 << 1,
            TriggerReason::Tick => 1 << 2,
            TriggerReason::Force => 1 << 3,
            TriggerReason::BackoffElapsed => 1 << 4,
        }
    }
}

/// Reasons that cut a backoff short.
const URGENT_REASONS: u8 = 1 | (1 << 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing left to submit.
    Drained {
        confirmed: usize,
        dead_lettered: usize,
    },
    /// A transient failure stopped the drain; the engine is in backoff.
    BackedOff {
        confirmed: usize,
        dead_lettered: usize,
        delay: Duration,
    },
    /// Connectivity dropped part way through.
    Interrupted {
        confirmed: usize,
        dead_lettered: usize,
    },
    /// Another drain was already running.
    Coalesced,
    Offline,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: i64) -> u64 {
    (seed.unsigned_abs() % 700) + 50
}

/// Exponential backoff after `failures` consecutive transient failures,
/// bounded by `max_ms`. A server hint wins when it asks for longer.
pub fn backoff_delay(
    failures: u32,
    base_ms: u64,
    max_ms: u64,
    retry_after: Option<Duration>,
    seed: i64,
) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let hinted = retry_after
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX).min(max_ms))
        .unwrap_or(0);
    Duration::from_millis(delay.max(hinted) + deterministic_jitter_ms(seed))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<PendingTransactionStore>,
    dead_letters: Arc<DeadLetterStore>,
    gateway: RemoteMutationGateway,
    cache: Arc<OptimisticStateCache>,
    monitor: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    state: watch::Sender<EngineState>,
    is_draining: AtomicBool,
    reasons: AtomicU8,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    consecutive_failures: AtomicU32,
    backoff_until: Mutex<Option<Instant>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

/// Resets the single-drain flag however the drain ends, including when its
/// future is dropped mid-submit.
struct DrainGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.engine.state() == EngineState::Draining {
            self.engine.set_state(EngineState::Idle);
        }
        self.engine.is_draining.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<PendingTransactionStore>,
        dead_letters: Arc<DeadLetterStore>,
        gateway: RemoteMutationGateway,
        cache: Arc<OptimisticStateCache>,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(EngineState::Idle);
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            store,
            dead_letters,
            gateway,
            cache,
            monitor,
            config,
            events,
            state,
            is_draining: AtomicBool::new(false),
            reasons: AtomicU8::new(0),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            consecutive_failures: AtomicU32::new(0),
            backoff_until: Mutex::new(None),
            last_sync: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_sync)
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: EngineState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "Sync engine state changed");
            self.emit(SyncEvent::StateChanged { state: next });
        }
    }

    fn storage_failed(&self, err: &StorageError) {
        error!(error = %err, "Local storage write failed; changes held in memory");
        self.emit(SyncEvent::StorageFailed {
            message: err.to_string(),
        });
    }

    fn pending_changed(&self) {
        self.emit(SyncEvent::PendingCountChanged {
            pending: self.store.len(),
        });
    }

    /// Ask the run loop for a drain. Never blocks; repeated triggers coalesce.
    pub fn trigger(&self, reason: TriggerReason) {
        self.reasons.fetch_or(reason.bit(), Ordering::SeqCst);
        // Full means a wake-up is already pending.
        let _ = self.wake_tx.try_send(());
    }

    fn in_backoff(&self) -> bool {
        lock(&self.backoff_until).is_some()
    }

    fn clear_backoff(&self) {
        *lock(&self.backoff_until) = None;
    }

    fn end_backoff(&self) {
        self.clear_backoff();
        if self.state() == EngineState::Backoff {
            self.set_state(EngineState::Idle);
        }
        if self.monitor.is_online() && !self.store.is_empty() {
            self.reasons
                .fetch_or(TriggerReason::BackoffElapsed.bit(), Ordering::SeqCst);
        }
    }

    /// Retry any writes that failed earlier.
    pub fn flush_stores(&self) {
        if let Err(e) = self.store.flush() {
            self.storage_failed(&e);
        }
        if let Err(e) = self.dead_letters.flush() {
            self.storage_failed(&e);
        }
    }

    // -- drain ---------------------------------------------------------------

    /// Submit queued sales until the queue is empty, a transient failure
    /// occurs, or connectivity drops.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.monitor.is_online() {
            debug!("Offline; drain deferred");
            return DrainOutcome::Offline;
        }
        if self
            .is_draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already active; trigger coalesced");
            return DrainOutcome::Coalesced;
        }
        let _guard = DrainGuard { engine: self };
        self.clear_backoff();
        self.set_state(EngineState::Draining);

        let mut confirmed = 0;
        let mut dead_lettered = 0;
        // Sales already tried in this drain; a sale whose dead-letter write
        // failed stays queued and must not be resubmitted until the next drain.
        let mut attempted: HashSet<LocalId> = HashSet::new();

        loop {
            let batch: Vec<Transaction> = self
                .store
                .drain_snapshot()
                .into_iter()
                .filter(|t| !attempted.contains(&t.local_id))
                .collect();
            if batch.is_empty() {
                break;
            }
            debug!(batch = batch.len(), "Draining pending transactions");

            for (idx, queued) in batch.iter().enumerate() {
                if !self.monitor.is_online() {
                    info!(
                        confirmed,
                        dead_lettered,
                        remaining = batch.len() - idx,
                        "Network offline; deferring remote sync and keeping queue pending"
                    );
                    self.set_state(EngineState::Idle);
                    return DrainOutcome::Interrupted {
                        confirmed,
                        dead_lettered,
                    };
                }

                attempted.insert(queued.local_id.clone());
                let Some(transaction) = self.begin_attempt(queued) else {
                    continue;
                };

                match self.gateway.submit(&transaction).await {
                    Ok(canonical) => {
                        self.confirm(&transaction, canonical);
                        confirmed += 1;
                    }
                    Err(SubmissionError::Rejected { message, status }) => {
                        if self.dead_letter(transaction, message, status) {
                            dead_lettered += 1;
                        }
                    }
                    Err(SubmissionError::Transient {
                        message,
                        retry_after,
                    }) => {
                        let delay = self.back_off(&transaction, &message, retry_after);
                        return DrainOutcome::BackedOff {
                            confirmed,
                            dead_lettered,
                            delay,
                        };
                    }
                }
            }
        }

        self.set_state(EngineState::Idle);
        if confirmed + dead_lettered > 0 {
            info!(confirmed, dead_lettered, "Drain complete");
        }
        DrainOutcome::Drained {
            confirmed,
            dead_lettered,
        }
    }

    fn begin_attempt(&self, queued: &Transaction) -> Option<Transaction> {
        match self.store.mark_in_flight(&queued.local_id) {
            Ok(transaction) => Some(transaction),
            Err(QueueError::Storage(e)) => {
                // Marked in memory all the same.
                self.storage_failed(&e);
                self.store
                    .drain_snapshot()
                    .into_iter()
                    .find(|t| t.local_id == queued.local_id)
            }
            Err(QueueError::NotQueued(local_id)) => {
                debug!(%local_id, "Transaction left the queue before submission");
                None
            }
            Err(err @ QueueError::AlreadyInFlight(_)) => {
                error!(error = %err, "Refusing to submit while another transaction is in flight");
                None
            }
        }
    }

    fn confirm(&self, transaction: &Transaction, canonical: CanonicalTransaction) {
        if let Err(e) = self.store.remove(&transaction.local_id) {
            self.storage_failed(&e);
        }
        self.cache.reconcile(&canonical);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *lock(&self.last_sync) = Some(Utc::now());

        info!(
            local_id = %transaction.local_id,
            server_id = %canonical.server_id,
            attempts = transaction.attempts,
            "Transaction confirmed"
        );
        self.emit(SyncEvent::Confirmed {
            local_id: transaction.local_id.clone(),
            server_id: canonical.server_id,
        });
        self.pending_changed();
    }

    /// Move a rejected sale to the dead-letter list. Returns `false` when the
    /// dead-letter write failed and the sale was left queued in place.
    fn dead_letter(&self, transaction: Transaction, reason: String, status: Option<u16>) -> bool {
        let local_id = transaction.local_id.clone();
        warn!(
            %local_id,
            status = ?status,
            reason = %reason,
            "Transaction rejected by admin dashboard; moved to dead letters"
        );

        let dead_letter = DeadLetter::new(transaction, reason.clone(), status);
        match self.dead_letters.push(dead_letter) {
            Ok(()) => {
                if let Err(e) = self.store.remove(&local_id) {
                    self.storage_failed(&e);
                }
                self.emit(SyncEvent::DeadLettered {
                    local_id,
                    reason,
                    status,
                });
                self.pending_changed();
                true
            }
            Err(e) => {
                self.storage_failed(&e);
                if let Err(e) = self.store.release(&local_id, Some(reason)) {
                    self.storage_failed(&e);
                }
                false
            }
        }
    }

    fn back_off(
        &self,
        failed: &Transaction,
        message: &str,
        retry_after: Option<Duration>,
    ) -> Duration {
        // Everything not yet confirmed is still in the queue in arrival order;
        // only the failed sale needs to come out of flight.
        if let Err(e) = self.store.release(&failed.local_id, Some(message.to_string())) {
            self.storage_failed(&e);
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let seed = failed.created_at.timestamp_millis() + i64::from(failed.attempts);
        let delay = backoff_delay(
            failures,
            self.config.base_backoff_ms,
            self.config.max_backoff_ms,
            retry_after,
            seed,
        );
        *lock(&self.backoff_until) = Some(Instant::now() + delay);

        warn!(
            local_id = %failed.local_id,
            attempts = failed.attempts,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = message,
            "Transient submission failure; backing off"
        );
        self.set_state(EngineState::Backoff);
        delay
    }

    // -- background tasks ----------------------------------------------------

    /// Spawn the drain loop. Returns `None` if it was already started once.
    pub fn spawn_run_loop(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Some(wake) = lock(&self.wake_rx).take() else {
            warn!("Sync loop already started");
            return None;
        };
        let engine = Arc::clone(self);
        Some(tokio::spawn(engine.run(wake, cancel)))
    }

    async fn run(self: Arc<Self>, mut wake: mpsc::Receiver<()>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.drain_interval_secs,
            "Sync loop started"
        );
        let mut ticker = tokio::time::interval(self.config.drain_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff_deadline = *lock(&self.backoff_until);
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = wake.recv() => {}
                _ = ticker.tick() => {
                    self.reasons.fetch_or(TriggerReason::Tick.bit(), Ordering::SeqCst);
                }
                _ = sleep_until_opt(backoff_deadline) => self.end_backoff(),
            }

            let reasons = self.reasons.swap(0, Ordering::SeqCst);
            if reasons == 0 {
                continue;
            }
            if reasons & TriggerReason::Tick.bit() != 0 {
                self.flush_stores();
            }
            if self.in_backoff() && reasons & URGENT_REASONS == 0 {
                debug!(reasons, "In backoff; trigger deferred");
                continue;
            }
            if self.store.is_empty() || !self.monitor.is_online() {
                continue;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.drain() => outcome,
            };
            if outcome == DrainOutcome::Coalesced {
                // A forced drain owns the flag; pick these up on the next wake.
                self.reasons.fetch_or(reasons, Ordering::SeqCst);
            }
            debug!(?outcome, "Drain finished");
        }
        info!("Sync loop stopped");
    }

    /// Forward connectivity transitions to the UI and turn every transition
    /// to online into a drain trigger.
    pub fn spawn_connectivity_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        // Subscribe before spawning so no transition slips through.
        let mut transitions = self.monitor.subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = transitions.recv() => received,
                };
                let online = match received {
                    Ok(transition) => transition.online,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connectivity watcher lagged; resyncing");
                        engine.monitor.is_online()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                engine.emit(SyncEvent::ConnectivityChanged { online });
                if online {
                    engine.trigger(TriggerReason::BecameOnline);
                }
            }
        })
    }
}
