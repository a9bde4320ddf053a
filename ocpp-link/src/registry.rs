//! Connection registry and per-identifier operation lock
//!
//! The registry is the single table of connections, keyed by charge point id.
//! Entries are created lazily and never removed, so reconnect bookkeeping
//! survives disconnects.
//!
//! `OperationLock` enforces at most one in-flight connect or disconnect per
//! identifier:
//!
//! ```text
//!   connect(id) ──► lock free?  ── yes ──► install + spawn op ──► await
//!                      │
//!                      ├─ same kind in flight ──► await its shared outcome
//!                      └─ other kind in flight ──► await it, then retry
//! ```
//!
//! The operation runs on its own task and the lock is released by a guard
//! dropped inside that task, so the lock is gone before the shared outcome
//! resolves and also if the operation panics.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::error::LinkError;

pub(crate) type OperationOutcome = Result<(), LinkError>;
type SharedOperation = Shared<BoxFuture<'static, OperationOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Connect,
    Disconnect,
}

struct InFlight {
    kind: OperationKind,
    ticket: u64,
    outcome: SharedOperation,
}

#[derive(Default)]
struct LockSlot {
    current: Option<InFlight>,
    next_ticket: u64,
}

/// Per-identifier "operation in progress" token
pub(crate) struct OperationLock {
    id: String,
    slot: Mutex<LockSlot>,
}

/// Clears the lock when the owning operation task ends
struct OperationGuard {
    lock: Arc<OperationLock>,
    ticket: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut slot = self.lock.slot.lock();
        if slot.current.as_ref().map(|f| f.ticket) == Some(self.ticket) {
            slot.current = None;
        }
    }
}

impl OperationLock {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            slot: Mutex::new(LockSlot::default()),
        })
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.slot.lock().current.is_some()
    }

    /// Run `start()` as the single in-flight operation of `kind`, or join
    /// the one already running.
    pub async fn run<F, Fut>(self: &Arc<Self>, kind: OperationKind, start: F) -> OperationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationOutcome> + Send + 'static,
    {
        let outcome = loop {
            let (outcome, joined_same_kind) = {
                let mut slot = self.slot.lock();
                match slot.current.as_ref() {
                    Some(in_flight) => (in_flight.outcome.clone(), in_flight.kind == kind),
                    None => {
                        slot.next_ticket += 1;
                        let ticket = slot.next_ticket;
                        let guard = OperationGuard {
                            lock: Arc::clone(self),
                            ticket,
                        };

                        let operation = start();
                        let task = tokio::spawn(async move {
                            let _guard = guard;
                            operation.await
                        });

                        let id = self.id.clone();
                        let outcome = async move {
                            match task.await {
                                Ok(outcome) => outcome,
                                Err(e) => Err(LinkError::ConnectionClosed {
                                    id,
                                    reason: format!("operation aborted: {}", e),
                                }),
                            }
                        }
                        .boxed()
                        .shared();

                        slot.current = Some(InFlight {
                            kind,
                            ticket,
                            outcome: outcome.clone(),
                        });
                        break outcome;
                    }
                }
            };

            if joined_same_kind {
                debug!(charge_point_id = %self.id, "{:?} already in flight, joining it", kind);
                break outcome;
            }

            debug!(charge_point_id = %self.id, "Waiting for in-flight operation before {:?}", kind);
            let _ = outcome.await;
        };

        outcome.await
    }
}

/// Table of every connection ever touched
#[derive(Default)]
pub(crate) struct Registry {
    connections: Mutex<BTreeMap<String, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Connection> {
        let mut connections = self.connections.lock();
        Arc::clone(
            connections
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Connection::new(id))),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    /// All connections, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }
}
