//! Reachability of the admin dashboard.
//!
//! The monitor only reports. Observations that do not change the state are
//! swallowed, so subscribers see exactly one event per transition.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TRANSITION_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityTransition {
    pub online: bool,
    pub at: DateTime<Utc>,
}

pub struct ConnectivityMonitor {
    online: Mutex<bool>,
    transitions: broadcast::Sender<ConnectivityTransition>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            online: Mutex::new(initially_online),
            transitions,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a reachability observation. Returns `true` if it changed the
    /// state (and an event was emitted).
    pub fn set_online(&self, online: bool) -> bool {
        let mut current = self.online.lock().unwrap_or_else(|p| p.into_inner());
        if *current == online {
            return false;
        }
        *current = online;

        if online {
            info!("Network restored; resuming queued sync");
        } else {
            info!("Network offline; deferring remote sync and keeping queue pending");
        }
        // Sent under the lock so events are ordered like the state changes.
        let _ = self.transitions.send(ConnectivityTransition {
            online,
            at: Utc::now(),
        });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.transitions.subscribe()
    }
}

/// A reachability check, e.g. an HTTP health endpoint.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Periodically run `probe` and feed the result into `monitor` until
/// cancelled. The first check runs immediately.
pub fn spawn_probe_loop(
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Connectivity probe started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = probe.check() => online,
            };
            if !monitor.set_online(online) {
                debug!(online, "Connectivity unchanged");
            }
        }
        info!("Connectivity probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct SequenceProbe {
        answers: Mutex<VecDeque<bool>>,
    }

    #[async_trait]
    impl ConnectivityProbe for SequenceProbe {
        async fn check(&self) -> bool {
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap_or(false)
            } else {
                answers.front().copied().unwrap_or(false)
            }
        }
    }

    #[test]
    fn test_transition_reported_once_per_change() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.is_online());

        assert!(rx.try_recv().unwrap().online);
        assert!(!rx.try_recv().unwrap().online);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_loop_drives_monitor() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let mut rx = monitor.subscribe();
        let probe = Arc::new(SequenceProbe {
            answers: Mutex::new(VecDeque::from(vec![false, true, true])),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_probe_loop(
            monitor.clone(),
            probe,
            Duration::from_millis(5),
            cancel.clone(),
        );

        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("transition within timeout")
            .expect("channel open");
        assert!(transition.online);
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}
