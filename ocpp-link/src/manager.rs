//! Connection manager facade
//!
//! `ConnectionManager` is the surface the rest of the system uses: connect
//! and disconnect charge points, send typed requests, subscribe to errors and
//! raw inbound messages, and query status. It is a cheap `Clone` handle over
//! one shared `Core`; construct as many independent managers as needed.
//!
//! ```text
//!   caller ──► ConnectionManager ──► Registry (per-id lock) ──► Connection ──► Transport
//!                     ▲                                              │
//!                     └──── error / message subscribers ◄────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::dispatcher;
use crate::error::LinkError;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::ocpp::{
    Action, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, Call, ChargePointErrorCode, ChargePointStatus,
    DataTransferRequest, DataTransferResponse, HeartbeatRequest, HeartbeatResponse, MeterValue,
    MeterValuesRequest, OcppMessage, Request, SampledValue, StartTransactionRequest,
    StartTransactionResponse, StatusNotificationRequest, StopReason, StopTransactionRequest,
};
use crate::pending::{PendingCalls, PendingReply};
use crate::registry::{OperationKind, Registry};
use crate::transport::Transport;

/// Error subscriber for one charge point
pub type ErrorHandler = Arc<dyn Fn(&LinkError) + Send + Sync>;

/// Raw inbound message subscriber for one charge point
pub type MessageHandler = Arc<dyn Fn(&OcppMessage) + Send + Sync>;

/// Outcome of one member of an aggregate operation
pub type MemberOutcome = (String, Result<(), LinkError>);

/// Aggregate connection counts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    /// Percentage of tracked charge points currently connected
    pub connection_rate: f64,
}

impl ConnectionStats {
    pub fn from_statuses(statuses: &[ConnectionStatus]) -> Self {
        let total = statuses.len();
        let connected = statuses.iter().filter(|s| s.connected).count();
        let connection_rate = if total == 0 {
            0.0
        } else {
            connected as f64 * 100.0 / total as f64
        };
        Self {
            total,
            connected,
            disconnected: total - connected,
            connection_rate,
        }
    }
}

#[derive(Default)]
struct CoreTasks {
    watcher: Option<JoinHandle<()>>,
    settle: Option<JoinHandle<()>>,
}

/// Shared state behind every `ConnectionManager` clone
pub(crate) struct Core {
    pub(crate) config: LinkConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) network: NetworkMonitor,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) registry: Registry,
    error_handlers: Mutex<HashMap<String, ErrorHandler>>,
    message_handlers: Mutex<HashMap<String, MessageHandler>>,
    shut_down: AtomicBool,
    tasks: Mutex<CoreTasks>,
}

impl Drop for Core {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in tasks.watcher.take().into_iter().chain(tasks.settle.take()) {
            task.abort();
        }
    }
}

impl Core {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Hand an error to the charge point's subscriber, if any. The handler
    /// runs outside every lock.
    pub(crate) fn notify_error(&self, id: &str, error: &LinkError) {
        let handler = self.error_handlers.lock().get(id).cloned();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    pub(crate) fn notify_message(&self, id: &str, message: &OcppMessage) {
        let handler = self.message_handlers.lock().get(id).cloned();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    pub(crate) async fn connect(self: &Arc<Self>, id: &str) -> Result<(), LinkError> {
        if self.is_shut_down() {
            return Err(LinkError::Shutdown);
        }
        let conn = self.registry.get_or_create(id);
        let core = Arc::clone(self);
        let target = Arc::clone(&conn);
        conn.operation
            .run(OperationKind::Connect, move || target.connect(core))
            .await
    }

    /// Connect issued by a reconnect timer or network recovery
    pub(crate) async fn reconnect(self: &Arc<Self>, id: &str) -> Result<(), LinkError> {
        if self.is_shut_down() {
            return Err(LinkError::Shutdown);
        }
        let Some(conn) = self.registry.get(id) else {
            return Ok(());
        };
        let core = Arc::clone(self);
        let target = Arc::clone(&conn);
        conn.operation
            .run(OperationKind::Connect, move || target.reconnect(core))
            .await
    }

    pub(crate) async fn disconnect(self: &Arc<Self>, id: &str) -> Result<(), LinkError> {
        let Some(conn) = self.registry.get(id) else {
            debug!(charge_point_id = %id, "Unknown charge point, nothing to disconnect");
            return Ok(());
        };
        let core = Arc::clone(self);
        let target = Arc::clone(&conn);
        conn.operation
            .run(OperationKind::Disconnect, move || target.disconnect(core))
            .await
    }

    /// Submit a message for a caller. Offline failures are also reported
    /// to the subscriber.
    fn submit(self: &Arc<Self>, id: &str, message: OcppMessage) -> Result<Option<PendingReply>, LinkError> {
        let conn = self.registry.get_or_create(id);
        let result = conn.send(self, message);
        if let Err(err @ LinkError::NetworkUnavailable { .. }) = &result {
            self.notify_error(id, err);
        }
        result
    }

    pub(crate) async fn call(self: &Arc<Self>, id: &str, request: &Request) -> Result<Value, LinkError> {
        let call = Call::from_request(request).map_err(|e| LinkError::codec(id, e))?;
        match self.submit(id, OcppMessage::Call(call))? {
            Some(reply) => reply.wait().await,
            None => Ok(Value::Null),
        }
    }

    /// Fire a request nobody awaits. Failures go to the error subscriber.
    pub(crate) fn send_background(self: &Arc<Self>, id: &str, request: Request) {
        let action = request.action();
        let result = Call::from_request(&request)
            .map_err(|e| LinkError::codec(id, e))
            .and_then(|call| {
                self.registry
                    .get_or_create(id)
                    .send(self, OcppMessage::Call(call))
            });

        match result {
            Ok(Some(reply)) => self.watch_reply(id, action, reply, |_| {}),
            Ok(None) => {}
            Err(e) => {
                warn!(charge_point_id = %id, "{} not sent: {}", action, e);
                self.notify_error(id, &e);
            }
        }
    }

    /// Await a background Call's response on its own task
    pub(crate) fn watch_reply<F>(self: &Arc<Self>, id: &str, action: Action, reply: PendingReply, on_success: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let core: Weak<Self> = Arc::downgrade(self);
        let id = id.to_string();
        tokio::spawn(async move {
            match reply.wait().await {
                Ok(payload) => on_success(payload),
                // The close itself is reported where it happens
                Err(LinkError::ConnectionClosed { .. }) | Err(LinkError::NetworkUnavailable { .. }) => {
                    debug!(charge_point_id = %id, "{} abandoned with its connection", action);
                }
                Err(e) => {
                    warn!(charge_point_id = %id, "{} failed: {}", action, e);
                    if let Some(core) = core.upgrade() {
                        core.notify_error(&id, &e);
                    }
                }
            }
        });
    }

    fn on_network_change(self: &Arc<Self>, status: NetworkStatus) {
        let previous_settle = self.tasks.lock().settle.take();
        if let Some(task) = previous_settle {
            task.abort();
        }

        match status {
            NetworkStatus::Offline => {
                warn!("Network offline, marking every connection closed");
                for conn in self.registry.snapshot() {
                    conn.network_down(self);
                    self.notify_error(
                        conn.id(),
                        &LinkError::NetworkUnavailable {
                            id: conn.id().to_string(),
                        },
                    );
                }
            }
            NetworkStatus::Online => {
                let delay = self.config.network_settle_delay;
                info!("Network back online, reconnecting in {:?}", delay);
                let core = Arc::downgrade(self);
                let settle = tokio::spawn(async move {
                    time::sleep(delay).await;
                    let Some(core) = core.upgrade() else { return };
                    core.reconnect_after_outage().await;
                });
                self.tasks.lock().settle = Some(settle);
            }
        }
    }

    async fn reconnect_after_outage(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| conn.awaits_reconnect())
            .map(|conn| conn.id().to_string())
            .collect();

        if ids.is_empty() {
            return;
        }
        info!("Reconnecting {} charge points after network recovery", ids.len());

        let outcomes = join_all(ids.iter().map(|id| self.reconnect(id))).await;
        for (id, outcome) in ids.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(charge_point_id = %id, "Reconnect after network recovery failed: {}", e);
            }
        }
    }
}

async fn watch_network(core: Weak<Core>, mut rx: watch::Receiver<NetworkStatus>) {
    while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        let Some(core) = core.upgrade() else { return };
        core.on_network_change(status);
    }
}

/// Manager for many concurrent charge point connections
#[derive(Clone)]
pub struct ConnectionManager {
    core: Arc<Core>,
}

impl ConnectionManager {
    /// Create a manager. Must be called from within a Tokio runtime: it
    /// starts the task watching `network`.
    pub fn new(config: LinkConfig, transport: Arc<dyn Transport>, network: NetworkMonitor) -> Self {
        let rx = network.subscribe();
        let core = Arc::new(Core {
            config,
            transport,
            network,
            pending: PendingCalls::new(),
            registry: Registry::new(),
            error_handlers: Mutex::new(HashMap::new()),
            message_handlers: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(CoreTasks::default()),
        });

        let watcher = tokio::spawn(watch_network(Arc::downgrade(&core), rx));
        core.tasks.lock().watcher = Some(watcher);

        Self { core }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.core.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.core.network
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect one charge point. Concurrent calls for the same id share one
    /// attempt and its outcome.
    pub async fn connect(&self, charge_point_id: &str) -> Result<(), LinkError> {
        self.core.connect(charge_point_id).await
    }

    /// Disconnect one charge point. Always leaves it Closed.
    pub async fn disconnect(&self, charge_point_id: &str) -> Result<(), LinkError> {
        self.core.disconnect(charge_point_id).await
    }

    /// Disconnect every tracked charge point. Never fails as a whole.
    pub async fn disconnect_all(&self) -> Vec<MemberOutcome> {
        let ids = self.core.registry.ids();
        let outcomes = join_all(ids.iter().map(|id| self.core.disconnect(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }

    /// Connect (or reconnect) every tracked charge point. Never fails as a
    /// whole.
    pub async fn reconnect_all(&self) -> Vec<MemberOutcome> {
        let ids = self.core.registry.ids();
        let outcomes = join_all(ids.iter().map(|id| self.core.connect(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }

    /// Stop watching the network, cancel reconnects and disconnect
    /// everything. Later connects fail with `Shutdown`.
    pub async fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection manager");

        let tasks = std::mem::take(&mut *self.core.tasks.lock());
        for task in tasks.watcher.into_iter().chain(tasks.settle) {
            task.abort();
        }
        for conn in self.core.registry.snapshot() {
            conn.cancel_reconnect(false);
        }

        for (id, outcome) in self.disconnect_all().await {
            if let Err(e) = outcome {
                warn!(charge_point_id = %id, "Disconnect during shutdown failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a request and wait for its CallResult payload. Fails fast with
    /// `SendWhileDisconnected` (and queues the request) when not open.
    pub async fn send_request(&self, charge_point_id: &str, request: Request) -> Result<Value, LinkError> {
        self.core.call(charge_point_id, &request).await
    }

    async fn send_typed<T: DeserializeOwned>(&self, charge_point_id: &str, request: Request) -> Result<T, LinkError> {
        let payload = self.send_request(charge_point_id, request).await?;
        serde_json::from_value(payload).map_err(|e| LinkError::codec(charge_point_id, e.into()))
    }

    pub async fn send_boot_notification(&self, charge_point_id: &str) -> Result<BootNotificationResponse, LinkError> {
        let identity = &self.core.config.identity;
        let request = Request::BootNotification(BootNotificationRequest {
            charge_point_vendor: identity.vendor.clone(),
            charge_point_model: identity.model.clone(),
            charge_point_serial_number: Some(charge_point_id.to_string()),
            firmware_version: identity.firmware_version.clone(),
        });
        self.send_typed(charge_point_id, request).await
    }

    pub async fn send_heartbeat(&self, charge_point_id: &str) -> Result<HeartbeatResponse, LinkError> {
        self.send_typed(charge_point_id, Request::Heartbeat(HeartbeatRequest {}))
            .await
    }

    pub async fn send_status_notification(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Result<(), LinkError> {
        let mut request = dispatcher::status_request(connector_id, status);
        if let Request::StatusNotification(StatusNotificationRequest { error_code: code, .. }) = &mut request {
            *code = error_code;
        }
        self.send_request(charge_point_id, request).await.map(|_| ())
    }

    pub async fn send_start_transaction(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<StartTransactionResponse, LinkError> {
        let request = Request::StartTransaction(StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: 0,
            reservation_id: None,
            timestamp: chrono::Utc::now(),
        });
        self.send_typed(charge_point_id, request).await
    }

    pub async fn send_stop_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
        meter_stop: i64,
        reason: StopReason,
    ) -> Result<(), LinkError> {
        let request = Request::StopTransaction(StopTransactionRequest {
            transaction_id,
            meter_stop,
            timestamp: chrono::Utc::now(),
            reason: Some(reason),
            id_tag: None,
        });
        self.send_request(charge_point_id, request).await.map(|_| ())
    }

    /// Report one set of sampled values, timestamped now
    pub async fn send_meter_values(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        transaction_id: Option<i32>,
        values: Vec<SampledValue>,
    ) -> Result<(), LinkError> {
        let request = Request::MeterValues(MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: chrono::Utc::now(),
                sampled_value: values,
            }],
        });
        self.send_request(charge_point_id, request).await.map(|_| ())
    }

    pub async fn send_authorize(&self, charge_point_id: &str, id_tag: &str) -> Result<AuthorizeResponse, LinkError> {
        let request = Request::Authorize(AuthorizeRequest {
            id_tag: id_tag.to_string(),
        });
        self.send_typed(charge_point_id, request).await
    }

    /// Vendor specific exchange; `data` is opaque to the link
    pub async fn send_data_transfer(
        &self,
        charge_point_id: &str,
        vendor_id: &str,
        message_id: Option<String>,
        data: Option<String>,
    ) -> Result<DataTransferResponse, LinkError> {
        let request = Request::DataTransfer(DataTransferRequest {
            vendor_id: vendor_id.to_string(),
            message_id,
            data,
        });
        self.send_typed(charge_point_id, request).await
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register the error subscriber for one charge point, replacing any
    /// previous one
    pub fn on_error<F>(&self, charge_point_id: &str, handler: F)
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        self.core
            .error_handlers
            .lock()
            .insert(charge_point_id.to_string(), Arc::new(handler));
    }

    pub fn off_error(&self, charge_point_id: &str) {
        self.core.error_handlers.lock().remove(charge_point_id);
    }

    /// Register the raw inbound message subscriber for one charge point
    pub fn on_message<F>(&self, charge_point_id: &str, handler: F)
    where
        F: Fn(&OcppMessage) + Send + Sync + 'static,
    {
        self.core
            .message_handlers
            .lock()
            .insert(charge_point_id.to_string(), Arc::new(handler));
    }

    pub fn off_message(&self, charge_point_id: &str) {
        self.core.message_handlers.lock().remove(charge_point_id);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.core
            .registry
            .get(charge_point_id)
            .map(|conn| conn.is_open())
            .unwrap_or(false)
    }

    pub fn connection_state(&self, charge_point_id: &str) -> ConnectionState {
        self.core
            .registry
            .get(charge_point_id)
            .map(|conn| conn.state())
            .unwrap_or(ConnectionState::Closed)
    }

    /// Status of one charge point. Unknown ids report Closed without being
    /// tracked.
    pub fn get_connection_status(&self, charge_point_id: &str) -> ConnectionStatus {
        match self.core.registry.get(charge_point_id) {
            Some(conn) => conn.status(self.core.pending.count(charge_point_id)),
            None => ConnectionStatus::untracked(charge_point_id),
        }
    }

    /// Status of every tracked charge point, ordered by id
    pub fn get_all_connection_status(&self) -> Vec<ConnectionStatus> {
        self.core
            .registry
            .snapshot()
            .iter()
            .map(|conn| conn.status(self.core.pending.count(conn.id())))
            .collect()
    }

    /// Number of open connections
    pub fn get_connection_count(&self) -> usize {
        self.core
            .registry
            .snapshot()
            .iter()
            .filter(|conn| conn.is_open())
            .count()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats::from_statuses(&self.get_all_connection_status())
    }

    /// Messages waiting for the charge point's next open, in send order
    pub fn queued_messages(&self, charge_point_id: &str) -> Vec<OcppMessage> {
        self.core
            .registry
            .get(charge_point_id)
            .map(|conn| conn.queued())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{ErrorCode, Measurand};
    use crate::transport::mock::{settle, MockOpen, MockTransport};
    use crate::transport::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn test_config() -> LinkConfig {
        LinkConfig::new("ws://csms.test/ocpp")
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_reconnect(Duration::from_secs(1), 3)
            .with_call_timeout(Duration::from_secs(30))
            .with_connect_timeout(Duration::from_secs(10))
            .with_disconnect_timeout(Duration::from_secs(5))
            .with_network_settle_delay(Duration::from_secs(2))
    }

    fn setup() -> (ConnectionManager, MockTransport, NetworkMonitor) {
        let transport = MockTransport::new();
        let network = NetworkMonitor::online();
        let manager = ConnectionManager::new(test_config(), Arc::new(transport.clone()), network.clone());
        (manager, transport, network)
    }

    /// Collects everything the error subscriber sees
    fn record_errors(manager: &ConnectionManager, id: &str) -> Arc<Mutex<Vec<LinkError>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_error(id, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id_reports_closed() {
        let (manager, _, _) = setup();

        assert!(!manager.is_connected("CP-404"));
        let status = manager.get_connection_status("CP-404");
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Closed);
        assert!(manager.get_all_connection_status().is_empty());
        assert_ok!(manager.disconnect("CP-404").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_boot_then_flushes_queue_in_order() {
        let (manager, transport, _) = setup();

        let first = manager
            .send_status_notification("CP-1", 1, ChargePointStatus::Available, ChargePointErrorCode::NoError)
            .await;
        assert!(matches!(first, Err(LinkError::SendWhileDisconnected { .. })));
        let second = manager.send_authorize("CP-1", "TAG-1").await;
        assert!(matches!(second, Err(LinkError::SendWhileDisconnected { .. })));
        assert_eq!(manager.queued_messages("CP-1").len(), 2);

        assert_ok!(manager.connect("CP-1").await);
        settle().await;

        let socket = transport.last_socket();
        assert_eq!(socket.url, "ws://csms.test/ocpp/CP-1");
        assert_eq!(socket.protocols, vec!["ocpp1.6"]);
        assert_eq!(
            socket.sent_actions(),
            vec!["BootNotification", "StatusNotification", "Authorize"]
        );
        let boot = &socket.calls()[0];
        assert_eq!(boot.payload["chargePointSerialNumber"], "CP-1");
        assert_eq!(boot.payload["chargePointVendor"], "SimulatorVendor");

        assert!(manager.queued_messages("CP-1").is_empty());
        let status = manager.get_connection_status("CP-1");
        assert!(status.connected);
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.pending_calls, 3);
        assert!(status.connected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_follows_boot() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        let socket = transport.last_socket();

        settle().await;
        assert_eq!(socket.sent_actions(), vec!["BootNotification"]);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(socket.sent_actions(), vec!["BootNotification", "Heartbeat"]);
        assert!(manager.get_connection_status("CP-1").last_heartbeat.is_none());

        let beat = socket.calls().pop().unwrap();
        socket.reply(&beat.message_id, json!({"currentTime": "2026-01-20T12:00:00Z"}));
        settle().await;
        assert!(manager.get_connection_status("CP-1").last_heartbeat.is_some());

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(socket.sent_actions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_is_reported_but_keeps_connection() {
        let (manager, transport, _) = setup();
        let errors = record_errors(&manager, "CP-1");
        assert_ok!(manager.connect("CP-1").await);
        let socket = transport.last_socket();
        settle().await;
        let boot = socket.calls()[0].clone();
        socket.reply(&boot.message_id, json!({"status": "Accepted", "currentTime": "2026-01-20T12:00:00Z", "interval": 60}));

        // Heartbeat at 60s, unanswered until 90s
        time::sleep(Duration::from_secs(91)).await;

        let seen = errors.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], LinkError::CallTimeout { action, .. } if action == "Heartbeat"));
        assert!(manager.is_connected("CP-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_open() {
        let (manager, transport, _) = setup();

        let (a, b) = tokio::join!(manager.connect("CP-1"), manager.connect("CP-1"));
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_failure() {
        let (manager, transport, _) = setup();
        transport.script([MockOpen::Refuse]);

        let (a, b) = tokio::join!(manager.connect("CP-1"), manager.connect("CP-1"));
        assert!(matches!(a, Err(LinkError::ConnectTransport { .. })));
        assert_eq!(a, b);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_leaves_closed() {
        let (manager, transport, _) = setup();
        let errors = record_errors(&manager, "CP-1");
        transport.script([MockOpen::Hang]);

        let outcome = manager.connect("CP-1").await;
        assert_eq!(
            outcome,
            Err(LinkError::ConnectTimeout {
                id: "CP-1".into(),
                timeout: Duration::from_secs(10),
            })
        );
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
        assert_eq!(errors.lock().len(), 1);
        settle().await;
        assert_eq!(transport.socket(0).close_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_open_replaces_link() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-1").await);

        assert_eq!(transport.open_count(), 2);
        assert_eq!(
            transport.socket(0).close_requests(),
            vec![(NORMAL_CLOSURE, "Normal closure".to_string())]
        );
        assert!(manager.is_connected("CP-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_result_and_error_routing() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        let socket = transport.last_socket();

        let authorize = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_authorize("CP-1", "TAG-1").await })
        };
        let start = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_start_transaction("CP-1", 1, "TAG-1").await })
        };
        settle().await;

        let calls = socket.calls();
        let authorize_id = calls.iter().find(|c| c.action == Action::Authorize).unwrap().message_id.clone();
        let start_id = calls.iter().find(|c| c.action == Action::StartTransaction).unwrap().message_id.clone();

        socket.reply(&authorize_id, json!({"idTagInfo": {"status": "Accepted"}}));
        socket.inject(&format!(r#"[4, "{}", "SecurityError", "tag blocked", {{}}]"#, start_id));

        let authorized = authorize.await.unwrap().unwrap();
        assert_eq!(authorized.id_tag_info.status, crate::ocpp::AuthorizationStatus::Accepted);
        assert_eq!(
            start.await.unwrap(),
            Err(LinkError::Protocol {
                id: "CP-1".into(),
                code: ErrorCode::SecurityError,
                description: "tag blocked".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_and_late_reply() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        let socket = transport.last_socket();

        let outcome = manager.send_heartbeat("CP-1").await;
        match outcome {
            Err(LinkError::CallTimeout { action, elapsed, .. }) => {
                assert_eq!(action, "Heartbeat");
                assert_eq!(elapsed, Duration::from_secs(30));
            }
            other => panic!("expected CallTimeout, got {:?}", other),
        }

        let late = socket.calls().pop().unwrap();
        assert_eq!(late.action, Action::Heartbeat);
        socket.reply(&late.message_id, json!({"currentTime": "2026-01-20T12:00:00Z"}));
        settle().await;
        assert!(manager.is_connected("CP-1"));
        assert_eq!(manager.get_connection_status("CP-1").last_heartbeat, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_reach_subscriber() {
        let (manager, transport, _) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_message("CP-1", move |m| sink.lock().push(m.clone()));

        assert_ok!(manager.connect("CP-1").await);
        let socket = transport.last_socket();
        socket.inject(r#"[2, "c-1", "ClearCache", {}]"#);
        socket.inject("not json");
        settle().await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].message_id(), "c-1");

        manager.off_message("CP-1");
        socket.inject(r#"[2, "c-2", "ClearCache", {}]"#);
        settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_confirmed_close() {
        let (manager, transport, _) = setup();
        let errors = record_errors(&manager, "CP-1");
        assert_ok!(manager.connect("CP-1").await);

        assert_ok!(manager.disconnect("CP-1").await);
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
        assert_eq!(manager.get_connection_status("CP-1").pending_calls, 0);
        assert!(errors.lock().is_empty());

        // Normal closure never reconnects
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_forces_cleanup_on_timeout() {
        let (manager, transport, _) = setup();
        let errors = record_errors(&manager, "CP-1");
        transport.set_ack_close(false);
        assert_ok!(manager.connect("CP-1").await);

        let started = time::Instant::now();
        assert_ok!(manager.disconnect("CP-1").await);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
        assert_eq!(
            errors.lock().clone(),
            vec![LinkError::DisconnectTimeout {
                id: "CP-1".into(),
                timeout: Duration::from_secs(5),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_way_to_disconnect_in_flight() {
        let (manager, transport, _) = setup();
        transport.set_ack_close(false);
        assert_ok!(manager.connect("CP-1").await);

        let disconnecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.disconnect("CP-1").await }
        });
        settle().await;
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closing);

        // A reconnect timer firing now queues behind the disconnect
        let reconnect = manager.core.reconnect("CP-1").await;
        assert_ok!(disconnecting.await.unwrap());

        assert!(matches!(reconnect, Err(LinkError::ConnectionClosed { .. })));
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_interval_is_refused() {
        let transport = MockTransport::new();
        let config = test_config().with_heartbeat_interval(Duration::ZERO);
        let manager = ConnectionManager::new(config, Arc::new(transport.clone()), NetworkMonitor::online());
        let errors = record_errors(&manager, "CP-1");

        let outcome = manager.connect("CP-1").await;
        assert!(matches!(outcome, Err(LinkError::InvalidConfig { .. })));
        assert_eq!(errors.lock().len(), 1);
        assert!(matches!(&errors.lock()[0], LinkError::InvalidConfig { id, .. } if id == "CP-1"));

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.open_count(), 0);
        assert!(!manager.is_connected("CP-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_normal_close_does_not_reconnect() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);

        transport.last_socket().kill(NORMAL_CLOSURE);
        settle().await;
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_backs_off_then_resets() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 0);

        transport.script([MockOpen::Refuse, MockOpen::Accept]);
        transport.last_socket().kill(ABNORMAL_CLOSURE);
        settle().await;
        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 1);

        // First reconnect after base * 2^0 = 1s, refused
        time::sleep(Duration::from_millis(990)).await;
        assert_eq!(transport.open_count(), 1);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 2);

        // Second after base * 2^1 = 2s, accepted
        time::sleep(Duration::from_millis(1980)).await;
        assert_eq!(transport.open_count(), 2);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.open_count(), 3);
        assert!(manager.is_connected("CP-1"));
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_limit_exceeded() {
        let (manager, transport, _) = setup();
        let errors = record_errors(&manager, "CP-1");
        assert_ok!(manager.connect("CP-1").await);

        transport.set_default(MockOpen::Refuse);
        transport.last_socket().kill(ABNORMAL_CLOSURE);

        // 1s + 2s + 4s for three attempts, then the limit
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 4);

        let seen = errors.lock().clone();
        assert_eq!(
            seen.last(),
            Some(&LinkError::ReconnectLimitExceeded {
                id: "CP-1".into(),
                max: 3,
            })
        );
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, LinkError::ReconnectLimitExceeded { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_calls_fail_when_link_dies() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);

        let heartbeat = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_heartbeat("CP-1").await })
        };
        settle().await;
        transport.last_socket().kill(ABNORMAL_CLOSURE);

        assert!(matches!(
            heartbeat.await.unwrap(),
            Err(LinkError::ConnectionClosed { .. })
        ));
        assert_eq!(manager.get_connection_status("CP-1").pending_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_closes_everything_and_fails_fast() {
        let (manager, transport, network) = setup();
        let errors = record_errors(&manager, "CP-1");
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-2").await);

        network.set_offline();
        settle().await;

        assert_eq!(manager.connection_state("CP-1"), ConnectionState::Closed);
        assert_eq!(manager.connection_state("CP-2"), ConnectionState::Closed);
        assert_eq!(
            errors.lock().clone(),
            vec![LinkError::NetworkUnavailable { id: "CP-1".into() }]
        );

        assert_eq!(
            manager.connect("CP-1").await,
            Err(LinkError::NetworkUnavailable { id: "CP-1".into() })
        );
        assert_eq!(
            manager.send_heartbeat("CP-1").await.unwrap_err(),
            LinkError::NetworkUnavailable { id: "CP-1".into() }
        );
        assert!(manager.queued_messages("CP-1").is_empty());
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_reconnects_after_settle_delay() {
        let (manager, transport, network) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-2").await);
        assert_ok!(manager.connect("CP-3").await);
        assert_ok!(manager.disconnect("CP-3").await);

        network.set_offline();
        settle().await;
        network.set_online();
        settle().await;
        assert_eq!(transport.open_count(), 3);

        time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.open_count(), 5);
        assert!(manager.is_connected("CP-1"));
        assert!(manager.is_connected("CP-2"));
        assert!(!manager.is_connected("CP-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_reconnect_does_not_consume_attempt() {
        let (manager, transport, network) = setup();
        assert_ok!(manager.connect("CP-1").await);

        transport.last_socket().kill(ABNORMAL_CLOSURE);
        settle().await;
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 1);

        // Offline before the 1s timer fires: the attempt is given back
        network.set_offline();
        settle().await;
        assert_eq!(manager.get_connection_status("CP-1").reconnect_attempts, 0);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_count(), 1);

        network.set_online();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.open_count(), 2);
        assert!(manager.is_connected("CP-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_tolerates_closed_members() {
        let (manager, _, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-2").await);
        assert_ok!(manager.connect("CP-3").await);
        assert_ok!(manager.disconnect("CP-2").await);

        let outcomes = manager.disconnect_all().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
        assert_eq!(manager.get_connection_count(), 0);
        for id in ["CP-1", "CP-2", "CP-3"] {
            assert_eq!(manager.connection_state(id), ConnectionState::Closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_all_and_stats() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-2").await);
        assert_ok!(manager.disconnect("CP-2").await);

        let stats = manager.connection_stats();
        assert_eq!((stats.total, stats.connected, stats.disconnected), (2, 1, 1));
        assert_eq!(stats.connection_rate, 50.0);

        let outcomes = manager.reconnect_all().await;
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
        assert_eq!(manager.get_connection_count(), 2);
        assert_eq!(transport.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_values_payload() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);

        let send = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_meter_values(
                        "CP-1",
                        1,
                        Some(7),
                        vec![SampledValue::new(Measurand::PowerActiveImport, 11.5, "kW")],
                    )
                    .await
            })
        };
        settle().await;

        let socket = transport.last_socket();
        let call = socket.calls().pop().unwrap();
        assert_eq!(call.action, Action::MeterValues);
        assert_eq!(call.payload["transactionId"], 7);
        assert_eq!(call.payload["meterValue"][0]["sampledValue"][0]["measurand"], "Power.Active.Import");

        socket.reply(&call.message_id, json!({}));
        assert_ok!(send.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_and_refuses_new_work() {
        let (manager, transport, _) = setup();
        assert_ok!(manager.connect("CP-1").await);
        assert_ok!(manager.connect("CP-2").await);

        manager.shutdown().await;
        assert_eq!(manager.get_connection_count(), 0);
        assert_eq!(manager.connect("CP-1").await, Err(LinkError::Shutdown));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_replace_and_remove() {
        let (manager, transport, _) = setup();
        let first = record_errors(&manager, "CP-1");
        let second = record_errors(&manager, "CP-1");
        transport.script([MockOpen::Refuse]);

        assert!(manager.connect("CP-1").await.is_err());
        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);

        manager.off_error("CP-1");
        manager.off_error("CP-1");
        assert!(manager.disconnect("CP-1").await.is_ok());
    }
}
