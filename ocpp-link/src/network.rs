//! Host connectivity
//!
//! `NetworkMonitor` holds the current online/offline status and broadcasts
//! transitions. The manager subscribes to it; anything that can observe the
//! host network (the TCP probe below, a platform hook, a test) feeds it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Host-level connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Shared connectivity signal. Cloning yields a handle to the same signal.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Monitor that starts online
    pub fn online() -> Self {
        Self::new(NetworkStatus::Online)
    }

    /// Record a status. Returns true if it was a transition.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Network is now {:?}", status);
        }
        changed
    }

    pub fn set_online(&self) -> bool {
        self.set_status(NetworkStatus::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.set_status(NetworkStatus::Offline)
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// Receiver that wakes on every transition
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Periodically try a TCP connect to `target` (`host:port`) and feed the
/// result into `monitor`. Runs until the returned handle is aborted.
pub fn spawn_probe(monitor: NetworkMonitor, target: String, interval: Duration) -> JoinHandle<()> {
    let attempt_timeout = interval.min(Duration::from_secs(5));

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let reachable = match time::timeout(attempt_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!("Probe to {} failed: {}", target, e);
                    false
                }
                Err(_) => {
                    debug!("Probe to {} timed out", target);
                    false
                }
            };

            let status = if reachable {
                NetworkStatus::Online
            } else {
                NetworkStatus::Offline
            };
            if monitor.set_status(status) && !reachable {
                warn!("{} unreachable, marking network offline", target);
            }
        }
    })
}
