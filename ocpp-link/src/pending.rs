//! Pending-call tracker
//!
//! Correlates outbound Calls with their CallResult/CallError by
//! `(charge point, message id)`. Every waiter settles exactly once: by a
//! response, by its deadline, or by a purge when the connection goes away.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::ocpp::{Action, ErrorCode};

type Key = (String, String);
type Outcome = Result<Value, LinkError>;

struct Waiter {
    action: Action,
    registered_at: Instant,
    tx: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

/// Receiving end of one registered Call
#[derive(Debug)]
pub struct PendingReply {
    charge_point_id: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    /// Wait for the response payload
    pub async fn wait(self) -> Result<Value, LinkError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(LinkError::ConnectionClosed {
                id: self.charge_point_id,
                reason: "pending call dropped".into(),
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: Mutex<HashMap<Key, Waiter>>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a waiter with a deadline. Must be called before the Call is
    /// handed to the transport so a fast response cannot miss it.
    pub fn register(
        self: &Arc<Self>,
        charge_point_id: &str,
        message_id: &str,
        action: Action,
        timeout: Duration,
    ) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let key = (charge_point_id.to_string(), message_id.to_string());

        let tracker: Weak<Self> = Arc::downgrade(self);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(&timer_key);
            }
        });

        let previous = self.entries.lock().insert(
            key,
            Waiter {
                action,
                registered_at: Instant::now(),
                tx,
                timer,
            },
        );
        if let Some(previous) = previous {
            // Reused message id; the older waiter can never be answered now
            previous.timer.abort();
            let _ = previous.tx.send(Err(LinkError::ConnectionClosed {
                id: charge_point_id.to_string(),
                reason: format!("message id {} reused", message_id),
            }));
        }

        PendingReply {
            charge_point_id: charge_point_id.to_string(),
            rx,
        }
    }

    fn take(&self, charge_point_id: &str, message_id: &str) -> Option<Waiter> {
        self.entries
            .lock()
            .remove(&(charge_point_id.to_string(), message_id.to_string()))
    }

    fn expire(&self, key: &Key) {
        let Some(waiter) = self.entries.lock().remove(key) else {
            return;
        };
        let elapsed = waiter.registered_at.elapsed();
        warn!(
            charge_point_id = %key.0,
            message_id = %key.1,
            "{} timed out after {:?}",
            waiter.action,
            elapsed
        );
        let _ = waiter.tx.send(Err(LinkError::CallTimeout {
            id: key.0.clone(),
            action: waiter.action.to_string(),
            elapsed,
        }));
    }

    /// Complete a waiter with a CallResult payload. Returns false for late
    /// or duplicate responses.
    pub fn resolve(&self, charge_point_id: &str, message_id: &str, payload: Value) -> bool {
        match self.take(charge_point_id, message_id) {
            Some(waiter) => {
                waiter.timer.abort();
                let _ = waiter.tx.send(Ok(payload));
                true
            }
            None => {
                debug!(
                    charge_point_id,
                    message_id, "CallResult without a pending call, ignored"
                );
                false
            }
        }
    }

    /// Complete a waiter with a CallError
    pub fn reject(
        &self,
        charge_point_id: &str,
        message_id: &str,
        code: ErrorCode,
        description: &str,
    ) -> bool {
        self.fail(
            charge_point_id,
            message_id,
            LinkError::Protocol {
                id: charge_point_id.to_string(),
                code,
                description: description.to_string(),
            },
        )
    }

    /// Fail one waiter with an arbitrary error
    pub fn fail(&self, charge_point_id: &str, message_id: &str, error: LinkError) -> bool {
        match self.take(charge_point_id, message_id) {
            Some(waiter) => {
                waiter.timer.abort();
                let _ = waiter.tx.send(Err(error));
                true
            }
            None => {
                debug!(
                    charge_point_id,
                    message_id, "No pending call to fail, ignored"
                );
                false
            }
        }
    }

    /// Fail every waiter of one charge point. Returns how many were failed.
    pub fn purge(&self, charge_point_id: &str, reason: LinkError) -> usize {
        let drained: Vec<Waiter> = {
            let mut entries = self.entries.lock();
            let keys: Vec<Key> = entries
                .keys()
                .filter(|(cp, _)| cp == charge_point_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        let count = drained.len();
        for waiter in drained {
            waiter.timer.abort();
            let _ = waiter.tx.send(Err(reason.clone()));
        }
        if count > 0 {
            debug!(charge_point_id, "Purged {} pending calls", count);
        }
        count
    }

    /// Outstanding calls for one charge point
    pub fn count(&self, charge_point_id: &str) -> usize {
        self.entries
            .lock()
            .keys()
            .filter(|(cp, _)| cp == charge_point_id)
            .count()
    }
}
