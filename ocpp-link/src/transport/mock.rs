//! Scripted in-memory transport for tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Transport, TransportCommand, TransportEvent, TransportLink, ABNORMAL_CLOSURE};
use crate::ocpp::{Call, CallResult, OcppMessage};

/// How the next `open` behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockOpen {
    /// Report `Opened` right away
    Accept,
    /// Report an error followed by an abnormal close
    Refuse,
    /// Never answer the handshake
    Hang,
}

struct MockState {
    script: VecDeque<MockOpen>,
    fallback: MockOpen,
    ack_close: bool,
    sockets: Vec<Arc<MockSocket>>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// One opened link as seen from the far side
pub(crate) struct MockSocket {
    pub url: String,
    pub protocols: Vec<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    log: Mutex<Vec<TransportCommand>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback: MockOpen::Accept,
                ack_close: true,
                sockets: Vec::new(),
            })),
        }
    }

    /// Queue behaviours for the next opens, in order
    pub fn script(&self, opens: impl IntoIterator<Item = MockOpen>) {
        self.state.lock().script.extend(opens);
    }

    /// Behaviour once the script is exhausted
    pub fn set_default(&self, open: MockOpen) {
        self.state.lock().fallback = open;
    }

    /// Whether a requested close is confirmed with `Closed`
    pub fn set_ack_close(&self, ack: bool) {
        self.state.lock().ack_close = ack;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().sockets.len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        Arc::clone(&self.state.lock().sockets[index])
    }

    pub fn last_socket(&self) -> Arc<MockSocket> {
        let state = self.state.lock();
        Arc::clone(state.sockets.last().expect("no socket opened"))
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &str, protocols: &[String]) -> TransportLink {
        let (link, endpoint) = TransportLink::pair();
        let mut commands = endpoint.commands;

        let socket = Arc::new(MockSocket {
            url: url.to_string(),
            protocols: protocols.to_vec(),
            events: endpoint.events,
            log: Mutex::new(Vec::new()),
        });

        let behaviour = {
            let mut state = self.state.lock();
            state.sockets.push(Arc::clone(&socket));
            let fallback = state.fallback;
            state.script.pop_front().unwrap_or(fallback)
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            match behaviour {
                MockOpen::Accept => socket.emit(TransportEvent::Opened),
                MockOpen::Refuse => {
                    socket.emit(TransportEvent::Error("connection refused".into()));
                    socket.emit(TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection refused".into(),
                    });
                }
                MockOpen::Hang => {}
            }

            while let Some(command) = commands.recv().await {
                socket.log.lock().push(command.clone());
                if let TransportCommand::Close { code, reason } = command {
                    if state.lock().ack_close {
                        socket.emit(TransportEvent::Closed { code, reason });
                    }
                }
            }
        });

        link
    }
}

impl MockSocket {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Every frame the core sent, decoded
    pub fn sent_messages(&self) -> Vec<OcppMessage> {
        self.log
            .lock()
            .iter()
            .filter_map(|command| match command {
                TransportCommand::Send(bytes) => OcppMessage::parse(bytes).ok(),
                TransportCommand::Close { .. } => None,
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.sent_messages()
            .into_iter()
            .filter_map(|message| match message {
                OcppMessage::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Action names of every Call sent, in order
    pub fn sent_actions(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.action.to_string()).collect()
    }

    pub fn close_requests(&self) -> Vec<(u16, String)> {
        self.log
            .lock()
            .iter()
            .filter_map(|command| match command {
                TransportCommand::Close { code, reason } => Some((*code, reason.clone())),
                TransportCommand::Send(_) => None,
            })
            .collect()
    }

    /// Answer a Call with a CallResult
    pub fn reply(&self, message_id: &str, payload: Value) {
        let result = CallResult {
            message_id: message_id.to_string(),
            payload,
        };
        self.emit(TransportEvent::Message(result.to_bytes().unwrap()));
    }

    /// Inject raw text as an inbound frame
    pub fn inject(&self, text: &str) {
        self.emit(TransportEvent::Message(text.as_bytes().to_vec()));
    }

    /// Drop the link from the far side
    pub fn kill(&self, code: u16) {
        self.emit(TransportEvent::Closed {
            code,
            reason: "killed".into(),
        });
    }
}

/// Let spawned tasks run without moving the paused clock meaningfully
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
