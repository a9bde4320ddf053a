//! Per-connection state machine
//!
//! Owns one charge point's lifecycle:
//! - Connect: transport open raced against the connect timeout, then
//!   BootNotification and the flush of everything queued while offline
//! - Heartbeat while open
//! - Graceful and forced teardown
//! - Reconnect with exponential backoff after abnormal closes
//!
//! ```text
//! Closed --connect--> Connecting --(open ok)--> Open --disconnect--> Closing --(closed)--> Closed
//! Connecting --(open fail / timeout)--> Closed
//! Open --(abnormal close)--> Closed [may auto-schedule Connecting]
//! Closing --(timeout)--> Closed (forced)
//! ```
//!
//! All mutable state sits in one `Slot` behind a short `parking_lot` lock.
//! The lock is never held across an `.await`. Every spawned task is tagged
//! with the slot generation it was started for and goes quiet once the
//! generation moves on.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::dispatcher;
use crate::error::LinkError;
use crate::manager::Core;
use crate::ocpp::{
    Action, BootNotificationRequest, BootNotificationResponse, Call, HeartbeatRequest,
    OcppMessage, Request,
};
use crate::pending::PendingReply;
use crate::registry::{OperationLock, OperationOutcome};
use crate::transport::{TransportCommand, TransportEvent, TransportLink, NORMAL_CLOSURE};

/// Lifecycle state of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub charge_point_id: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub queued_messages: usize,
    pub pending_calls: usize,
    pub connected_at: Option<DateTime<Utc>>,
    /// Time of the last acknowledged heartbeat
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ConnectionStatus {
    /// Status of an identifier the manager has never seen
    pub fn untracked(charge_point_id: &str) -> Self {
        Self {
            charge_point_id: charge_point_id.to_string(),
            state: ConnectionState::Closed,
            connected: false,
            reconnect_attempts: 0,
            queued_messages: 0,
            pending_calls: 0,
            connected_at: None,
            last_heartbeat: None,
        }
    }
}

struct Slot {
    state: ConnectionState,
    generation: u64,
    link: Option<mpsc::UnboundedSender<TransportCommand>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    scripts: Vec<JoinHandle<()>>,
    queue: VecDeque<OcppMessage>,
    reconnect_attempts: u32,
    ever_opened: bool,
    /// Cleared by an explicit disconnect; gates automatic reconnects
    wants_connection: bool,
    connected_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Tasks detached from a slot during teardown, aborted after unlocking
struct Released {
    tasks: Vec<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Released {
    fn abort(self, keep_reader: bool) {
        for task in self.tasks {
            task.abort();
        }
        if let Some(reader) = self.reader {
            if !keep_reader {
                reader.abort();
            }
        }
    }
}

pub(crate) struct Connection {
    id: String,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) operation: Arc<OperationLock>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        let slot = self.slot.get_mut();
        let released = Released {
            tasks: slot
                .scripts
                .drain(..)
                .chain(slot.heartbeat.take())
                .chain(slot.reconnect.take())
                .collect(),
            reader: slot.reader.take(),
        };
        released.abort(false);
    }
}

impl Connection {
    pub fn new(id: &str) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            id: id.to_string(),
            slot: Mutex::new(Slot {
                state: ConnectionState::Closed,
                generation: 0,
                link: None,
                reader: None,
                heartbeat: None,
                reconnect: None,
                scripts: Vec::new(),
                queue: VecDeque::new(),
                reconnect_attempts: 0,
                ever_opened: false,
                wants_connection: false,
                connected_at: None,
                last_heartbeat: None,
            }),
            state_tx,
            operation: OperationLock::new(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn status(&self, pending_calls: usize) -> ConnectionStatus {
        let slot = self.slot.lock();
        ConnectionStatus {
            charge_point_id: self.id.clone(),
            state: slot.state,
            connected: slot.state == ConnectionState::Open,
            reconnect_attempts: slot.reconnect_attempts,
            queued_messages: slot.queue.len(),
            pending_calls,
            connected_at: slot.connected_at,
            last_heartbeat: slot.last_heartbeat,
        }
    }

    /// Snapshot of the outbound queue
    pub fn queued(&self) -> Vec<OcppMessage> {
        self.slot.lock().queue.iter().cloned().collect()
    }

    /// Closed, was open at some point, and nobody asked it to stay down
    pub fn awaits_reconnect(&self) -> bool {
        let slot = self.slot.lock();
        slot.state == ConnectionState::Closed && slot.ever_opened && slot.wants_connection
    }

    fn set_state(&self, slot: &mut Slot, state: ConnectionState) {
        if slot.state != state {
            debug!(charge_point_id = %self.id, "{} -> {}", slot.state, state);
        }
        slot.state = state;
        self.state_tx.send_replace(state);
    }

    /// Detach everything tied to the live link and mark the slot Closed
    fn close_slot(&self, slot: &mut Slot) -> Released {
        slot.generation += 1;
        slot.link = None;
        slot.connected_at = None;
        self.set_state(slot, ConnectionState::Closed);
        Released {
            tasks: slot.scripts.drain(..).chain(slot.heartbeat.take()).collect(),
            reader: slot.reader.take(),
        }
    }

    /// Release every resource of the current link and fail its pending calls
    pub(crate) fn teardown(&self, core: &Core, reason: LinkError) {
        let released = {
            let mut slot = self.slot.lock();
            self.close_slot(&mut slot)
        };
        released.abort(false);
        core.pending.purge(&self.id, reason);
    }

    async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let result = time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Closed)).await;
        matches!(result, Ok(Ok(_)))
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Connect operation. Runs under the identifier's operation lock.
    pub(crate) async fn connect(self: Arc<Self>, core: Arc<Core>) -> OperationOutcome {
        let id = self.id.clone();

        if core.is_shut_down() {
            return Err(LinkError::Shutdown);
        }

        if let Err(reason) = core.config.validate() {
            let err = LinkError::InvalidConfig { id: id.clone(), reason };
            error!(charge_point_id = %id, "{}", err);
            core.notify_error(&id, &err);
            return Err(err);
        }

        if !core.network.is_online() {
            let err = LinkError::NetworkUnavailable { id: id.clone() };
            warn!(charge_point_id = %id, "Network offline, not connecting");
            core.notify_error(&id, &err);
            return Err(err);
        }

        match self.state() {
            ConnectionState::Connecting => {
                return Err(LinkError::AlreadyConnecting { id });
            }
            ConnectionState::Open => {
                info!(charge_point_id = %id, "Already connected, closing the old link first");
                self.close_gracefully(&core).await;
            }
            ConnectionState::Closing => {
                info!(charge_point_id = %id, "Still closing, waiting for Closed");
                let timeout = core.config.disconnect_timeout;
                if !self.wait_closed(timeout).await {
                    let err = LinkError::DisconnectTimeout { id: id.clone(), timeout };
                    core.notify_error(&id, &err);
                    return Err(err);
                }
            }
            ConnectionState::Closed => {}
        }

        let generation = {
            let mut slot = self.slot.lock();
            if let Some(pending) = slot.reconnect.take() {
                pending.abort();
            }
            slot.generation += 1;
            slot.wants_connection = true;
            self.set_state(&mut slot, ConnectionState::Connecting);
            slot.generation
        };

        let url = core.config.url_for(&id);
        info!(charge_point_id = %id, "Connecting to {}", url);

        let TransportLink {
            commands,
            mut events,
        } = core.transport.open(&url, &core.config.protocols);

        let timeout = core.config.connect_timeout;
        let failure = match time::timeout(timeout, wait_for_open(&mut events)).await {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(LinkError::ConnectTransport {
                id: id.clone(),
                reason,
            }),
            Err(_) => {
                let _ = commands.send(TransportCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "Connect timeout".into(),
                });
                Some(LinkError::ConnectTimeout {
                    id: id.clone(),
                    timeout,
                })
            }
        };

        if let Some(err) = failure {
            {
                let mut slot = self.slot.lock();
                if slot.generation == generation {
                    self.set_state(&mut slot, ConnectionState::Closed);
                }
            }
            error!(charge_point_id = %id, "Connect failed: {}", err);
            core.notify_error(&id, &err);
            self.schedule_reconnect(&core);
            return Err(err);
        }

        self.on_open(&core, generation, commands, events)
    }

    /// Automatic reconnect. Same as `connect`, but gives way to an explicit
    /// disconnect that ran while it was waiting for the operation lock.
    pub(crate) async fn reconnect(self: Arc<Self>, core: Arc<Core>) -> OperationOutcome {
        if !self.slot.lock().wants_connection {
            debug!(charge_point_id = %self.id, "Disconnected meanwhile, reconnect dropped");
            return Err(self.closed_reason("reconnect cancelled by disconnect"));
        }
        self.connect(core).await
    }

    /// Transport is open: install the link, start the background tasks,
    /// send BootNotification and flush the queue, all under one lock so
    /// nothing can interleave with the flush.
    fn on_open(
        &self,
        core: &Arc<Core>,
        generation: u64,
        commands: mpsc::UnboundedSender<TransportCommand>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> OperationOutcome {
        let weak = Arc::downgrade(core);
        let mut replies: Vec<(Action, PendingReply)> = Vec::new();

        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || core.is_shut_down() {
                drop(slot);
                let _ = commands.send(TransportCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "Superseded".into(),
                });
                return Err(LinkError::ConnectionClosed {
                    id: self.id.clone(),
                    reason: "connect superseded".into(),
                });
            }

            self.set_state(&mut slot, ConnectionState::Open);
            slot.reconnect_attempts = 0;
            slot.ever_opened = true;
            slot.connected_at = Some(Utc::now());
            slot.link = Some(commands);
            slot.reader = Some(tokio::spawn(read_events(
                weak.clone(),
                self.id.clone(),
                generation,
                events,
            )));
            slot.heartbeat = Some(tokio::spawn(run_heartbeat(
                weak,
                self.id.clone(),
                generation,
                core.config.heartbeat_interval,
            )));

            match Call::from_request(&boot_request(&core.config, &self.id)) {
                Ok(boot) => match self.transmit(&mut slot, core, OcppMessage::Call(boot)) {
                    Ok(Some(reply)) => replies.push((Action::BootNotification, reply)),
                    Ok(None) => {}
                    Err(e) => warn!(charge_point_id = %self.id, "BootNotification not sent: {}", e),
                },
                Err(e) => warn!(charge_point_id = %self.id, "BootNotification not encoded: {}", e),
            }

            let queued = slot.queue.len();
            if queued > 0 {
                info!(charge_point_id = %self.id, "Flushing {} queued messages", queued);
            }
            while let Some(message) = slot.queue.pop_front() {
                let action = describe(&message);
                match self.transmit(&mut slot, core, message.clone()) {
                    Ok(Some(reply)) => replies.push((Action::from(action.as_str()), reply)),
                    Ok(None) => {}
                    Err(LinkError::Codec { reason, .. }) => {
                        warn!(charge_point_id = %self.id, "Dropping queued {}: {}", action, reason);
                    }
                    Err(e) => {
                        warn!(charge_point_id = %self.id, "Flush interrupted: {}", e);
                        slot.queue.push_front(message);
                        break;
                    }
                }
            }
        }

        info!(charge_point_id = %self.id, "Connected");

        for (action, reply) in replies {
            if action == Action::BootNotification {
                let id = self.id.clone();
                core.watch_reply(&self.id, action, reply, move |payload| {
                    match serde_json::from_value::<BootNotificationResponse>(payload) {
                        Ok(boot) => info!(
                            charge_point_id = %id,
                            "BootNotification {:?} (interval {}s)",
                            boot.status,
                            boot.interval
                        ),
                        Err(e) => debug!(charge_point_id = %id, "Unexpected BootNotification response: {}", e),
                    }
                });
            } else {
                core.watch_reply(&self.id, action, reply, |_| {});
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    /// Explicit disconnect. Runs under the identifier's operation lock.
    /// Always ends in Closed; a close the transport never confirms is
    /// reported through the error subscriber, not the result.
    pub(crate) async fn disconnect(self: Arc<Self>, core: Arc<Core>) -> OperationOutcome {
        self.cancel_reconnect(false);
        self.slot.lock().wants_connection = false;
        self.close_gracefully(&core).await;
        Ok(())
    }

    async fn close_gracefully(&self, core: &Arc<Core>) {
        let link = {
            let mut slot = self.slot.lock();
            if slot.state == ConnectionState::Open {
                self.set_state(&mut slot, ConnectionState::Closing);
                slot.link.clone()
            } else {
                None
            }
        };

        let Some(link) = link else {
            debug!(charge_point_id = %self.id, "Not connected, clearing residual state");
            self.teardown(core, self.closed_reason("disconnected"));
            return;
        };

        info!(charge_point_id = %self.id, "Disconnecting");
        let _ = link.send(TransportCommand::Close {
            code: NORMAL_CLOSURE,
            reason: "Normal closure".into(),
        });
        drop(link);

        let timeout = core.config.disconnect_timeout;
        if self.wait_closed(timeout).await {
            info!(charge_point_id = %self.id, "Disconnected");
            return;
        }

        warn!(charge_point_id = %self.id, "Close not confirmed within {:?}, forcing cleanup", timeout);
        self.teardown(core, self.closed_reason("disconnect timeout"));
        core.notify_error(
            &self.id,
            &LinkError::DisconnectTimeout {
                id: self.id.clone(),
                timeout,
            },
        );
    }

    fn closed_reason(&self, reason: &str) -> LinkError {
        LinkError::ConnectionClosed {
            id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    /// The link reported closure on its own
    fn on_transport_closed(&self, core: &Arc<Core>, generation: u64, code: u16, reason: &str) {
        let (previous, released) = {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return;
            }
            let previous = slot.state;
            if !matches!(previous, ConnectionState::Open | ConnectionState::Closing) {
                return;
            }
            (previous, self.close_slot(&mut slot))
        };
        released.abort(true);

        let closed = format!("closed with code {}: {}", code, reason);
        core.pending.purge(&self.id, self.closed_reason(&closed));

        if previous == ConnectionState::Closing {
            debug!(charge_point_id = %self.id, "Close confirmed ({})", code);
            return;
        }

        if code == NORMAL_CLOSURE {
            info!(charge_point_id = %self.id, "Closed by peer: {}", reason);
            return;
        }

        warn!(charge_point_id = %self.id, "Connection lost ({})", closed);
        core.notify_error(&self.id, &self.closed_reason(&closed));
        self.schedule_reconnect(core);
    }

    // ------------------------------------------------------------------
    // Network transitions
    // ------------------------------------------------------------------

    /// Host went offline: drop the link without a close handshake
    pub(crate) fn network_down(&self, core: &Core) {
        self.cancel_reconnect(true);
        if self.state() != ConnectionState::Closed {
            self.teardown(
                core,
                LinkError::NetworkUnavailable {
                    id: self.id.clone(),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------

    /// Abort a scheduled reconnect. With `refund` the attempt it consumed
    /// is given back.
    pub(crate) fn cancel_reconnect(&self, refund: bool) {
        let pending = {
            let mut slot = self.slot.lock();
            let pending = slot.reconnect.take();
            if pending.is_some() && refund {
                slot.reconnect_attempts = slot.reconnect_attempts.saturating_sub(1);
            }
            pending
        };
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    fn schedule_reconnect(&self, core: &Arc<Core>) {
        if core.is_shut_down() {
            return;
        }
        if !core.network.is_online() {
            debug!(charge_point_id = %self.id, "Network offline, no reconnect scheduled");
            return;
        }

        let max = core.config.max_reconnect_attempts;
        let scheduled = {
            let mut slot = self.slot.lock();
            if !slot.wants_connection {
                return;
            }
            if slot.reconnect_attempts >= max {
                None
            } else {
                let attempt = slot.reconnect_attempts;
                slot.reconnect_attempts += 1;
                let delay = core.config.reconnect_delay(attempt);
                if let Some(previous) = slot.reconnect.take() {
                    previous.abort();
                }
                slot.reconnect = Some(tokio::spawn(reconnect_after(
                    Arc::downgrade(core),
                    self.id.clone(),
                    delay,
                )));
                Some((attempt + 1, delay))
            }
        };

        match scheduled {
            Some((attempt, delay)) => {
                info!(
                    charge_point_id = %self.id,
                    "Reconnect attempt {}/{} in {:?}",
                    attempt,
                    max,
                    delay
                );
            }
            None => {
                let err = LinkError::ReconnectLimitExceeded {
                    id: self.id.clone(),
                    max,
                };
                error!(charge_point_id = %self.id, "{}", err);
                core.notify_error(&self.id, &err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send now if open, otherwise queue and fail fast. For Calls the
    /// returned reply resolves with the response payload.
    pub(crate) fn send(
        &self,
        core: &Arc<Core>,
        message: OcppMessage,
    ) -> Result<Option<PendingReply>, LinkError> {
        if !core.network.is_online() {
            return Err(LinkError::NetworkUnavailable {
                id: self.id.clone(),
            });
        }

        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Open || slot.link.is_none() {
            let action = describe(&message);
            slot.queue.push_back(message);
            debug!(
                charge_point_id = %self.id,
                "Not connected, queued {} ({} waiting)",
                action,
                slot.queue.len()
            );
            return Err(LinkError::SendWhileDisconnected {
                id: self.id.clone(),
                action,
            });
        }

        self.transmit(&mut slot, core, message)
    }

    fn transmit(
        &self,
        slot: &mut Slot,
        core: &Arc<Core>,
        message: OcppMessage,
    ) -> Result<Option<PendingReply>, LinkError> {
        let bytes = message
            .to_bytes()
            .map_err(|e| LinkError::codec(&self.id, e))?;

        let Some(link) = slot.link.as_ref() else {
            return Err(self.closed_reason("no transport link"));
        };

        // Register before handing the frame over so a fast reply finds its waiter
        let reply = match &message {
            OcppMessage::Call(call) => Some(core.pending.register(
                &self.id,
                &call.message_id,
                call.action.clone(),
                core.config.call_timeout,
            )),
            _ => None,
        };

        if link.send(TransportCommand::Send(bytes)).is_err() {
            let err = LinkError::Transport {
                id: self.id.clone(),
                reason: "transport task has exited".into(),
            };
            if let OcppMessage::Call(call) = &message {
                core.pending.fail(&self.id, &call.message_id, err.clone());
            }
            return Err(err);
        }

        debug!(charge_point_id = %self.id, "Sent {}", describe(&message));
        Ok(reply)
    }

    pub(crate) fn mark_heartbeat(&self) {
        self.slot.lock().last_heartbeat = Some(Utc::now());
    }

    /// Keep a dispatcher script alive only as long as the current link
    pub(crate) fn track_script(&self, script: JoinHandle<()>) {
        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Open {
            script.abort();
            return;
        }
        slot.scripts.retain(|s| !s.is_finished());
        slot.scripts.push(script);
    }

    fn handle_frame(self: &Arc<Self>, core: &Arc<Core>, bytes: &[u8]) {
        let message = match OcppMessage::parse(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    charge_point_id = %self.id,
                    "Undecodable frame ({}): {}",
                    e,
                    String::from_utf8_lossy(bytes)
                );
                core.notify_error(&self.id, &LinkError::codec(&self.id, e));
                return;
            }
        };

        match &message {
            OcppMessage::Call(call) => dispatcher::handle_call(core, self, call),
            OcppMessage::CallResult(result) => {
                core.pending
                    .resolve(&self.id, &result.message_id, result.payload.clone());
            }
            OcppMessage::CallError(err) => {
                warn!(
                    charge_point_id = %self.id,
                    "CallError for {}: {} {}",
                    err.message_id,
                    err.error_code,
                    err.error_description
                );
                core.pending.reject(
                    &self.id,
                    &err.message_id,
                    err.error_code,
                    &err.error_description,
                );
            }
        }

        core.notify_message(&self.id, &message);
    }
}

/// Short label for logs and errors: the action for Calls, the shape otherwise
fn describe(message: &OcppMessage) -> String {
    match message {
        OcppMessage::Call(call) => call.action.to_string(),
        OcppMessage::CallResult(r) => format!("CallResult({})", r.message_id),
        OcppMessage::CallError(e) => format!("CallError({})", e.message_id),
    }
}

fn boot_request(config: &LinkConfig, charge_point_id: &str) -> Request {
    Request::BootNotification(BootNotificationRequest {
        charge_point_vendor: config.identity.vendor.clone(),
        charge_point_model: config.identity.model.clone(),
        charge_point_serial_number: Some(charge_point_id.to_string()),
        firmware_version: config.identity.firmware_version.clone(),
    })
}

/// Wait for the handshake outcome
async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<(), String> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Opened => return Ok(()),
            TransportEvent::Error(reason) => return Err(reason),
            TransportEvent::Closed { code, reason } => {
                return Err(format!("closed during handshake ({}): {}", code, reason));
            }
            TransportEvent::Message(_) => debug!("Frame before open, ignored"),
        }
    }
    Err("transport dropped during handshake".into())
}

/// Pump inbound events of one link generation
async fn read_events(
    core: Weak<Core>,
    id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else { return };
        let Some(conn) = core.registry.get(&id) else { return };
        if conn.generation() != generation {
            return;
        }

        match event {
            TransportEvent::Message(bytes) => conn.handle_frame(&core, &bytes),
            TransportEvent::Error(reason) => {
                warn!(charge_point_id = %id, "Transport error: {}", reason);
                core.notify_error(&id, &LinkError::Transport { id: id.clone(), reason });
            }
            TransportEvent::Closed { code, reason } => {
                conn.on_transport_closed(&core, generation, code, &reason);
                return;
            }
            TransportEvent::Opened => debug!(charge_point_id = %id, "Duplicate open event"),
        }
    }

    // Transport vanished without a close frame
    if let Some(core) = core.upgrade() {
        if let Some(conn) = core.registry.get(&id) {
            conn.on_transport_closed(
                &core,
                generation,
                crate::transport::ABNORMAL_CLOSURE,
                "transport dropped",
            );
        }
    }
}

/// Heartbeat loop. The first beat is one full period after open, so
/// BootNotification always goes first.
async fn run_heartbeat(core: Weak<Core>, id: String, generation: u64, period: Duration) {
    let mut ticker = time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        let Some(core) = core.upgrade() else { return };
        let Some(conn) = core.registry.get(&id) else { return };
        if conn.generation() != generation {
            return;
        }

        let call = match Call::from_request(&Request::Heartbeat(HeartbeatRequest {})) {
            Ok(call) => call,
            Err(e) => {
                error!(charge_point_id = %id, "Heartbeat not encoded: {}", e);
                continue;
            }
        };

        match conn.send(&core, OcppMessage::Call(call)) {
            Ok(Some(reply)) => {
                let beat = Arc::clone(&conn);
                core.watch_reply(&id, Action::Heartbeat, reply, move |_| beat.mark_heartbeat());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(charge_point_id = %id, "Heartbeat failed: {}", e);
                core.notify_error(&id, &e);
            }
        }
    }
}

/// One scheduled reconnect
async fn reconnect_after(core: Weak<Core>, id: String, delay: Duration) {
    time::sleep(delay).await;

    let Some(core) = core.upgrade() else { return };
    let Some(conn) = core.registry.get(&id) else { return };

    // Detach our own handle so the connect below does not abort us
    drop(conn.slot.lock().reconnect.take());

    if !core.network.is_online() {
        // Skipped attempts do not consume a retry slot
        let mut slot = conn.slot.lock();
        slot.reconnect_attempts = slot.reconnect_attempts.saturating_sub(1);
        debug!(charge_point_id = %id, "Network offline, reconnect skipped");
        return;
    }

    match core.reconnect(&id).await {
        Ok(()) => info!(charge_point_id = %id, "Reconnected"),
        Err(e) => debug!(charge_point_id = %id, "Reconnect attempt failed: {}", e),
    }
}
