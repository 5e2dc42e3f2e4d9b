//! Online/offline signal for the handset.
//!
//! The monitor owns the only writer of the connectivity state and publishes
//! it on a `watch` channel. Observations that do not change the state are
//! swallowed, so subscribers see exactly one event per transition.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Cheap reachability check, e.g. a health endpoint.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Connectivity>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Starts offline; the first successful probe is the first transition.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Connectivity::Offline);
        Self { state: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    /// Feed one observation (probe result or native callback).
    /// Returns the new state only when it differs from the previous one.
    pub fn observe(&self, online: bool) -> Option<Connectivity> {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = ?next, "connectivity changed");
            Some(next)
        } else {
            None
        }
    }

    /// Probe every `interval` until `shutdown` flips.
    pub async fn run(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let online = probe.probe().await;
                    debug!(online, "connectivity probe");
                    self.observe(online);
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    #[test]
    fn duplicate_observations_are_swallowed() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.observe(false), None);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(monitor.observe(true), Some(Connectivity::Online));
        assert_eq!(monitor.observe(true), None);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Connectivity::Online);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(monitor.observe(false), Some(Connectivity::Offline));
        assert!(!monitor.is_online());
    }

    struct ScriptedProbe(Mutex<VecDeque<bool>>);

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn probe(&self) -> bool {
            self.0.lock().await.pop_front().unwrap_or(true)
        }
    }

    #[tokio::test]
    async fn run_publishes_probe_transitions() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();
        let probe = Arc::new(ScriptedProbe(Mutex::new(VecDeque::from(vec![false, false, true]))));
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = monitor.clone();
        let handle = tokio::spawn(async move {
            runner.run(probe, Duration::from_millis(5), stop_rx).await;
        });

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Online);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
