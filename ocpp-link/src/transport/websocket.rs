//! WebSocket transport
//!
//! Opens one WebSocket per link with the OCPP subprotocol list and pumps
//! frames between the socket and the link channels until either side closes.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        http::{header, Uri},
        protocol::{frame::coding::CloseCode, frame::CloseFrame, WebSocketConfig},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::{
    Transport, TransportCommand, TransportEndpoint, TransportEvent, TransportLink,
    ABNORMAL_CLOSURE,
};

/// Close code used when the peer sent a close frame without a status
const NO_STATUS_RECEIVED: u16 = 1005;

/// WebSocket implementation of [`Transport`]
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    max_message_size: usize,
    max_frame_size: usize,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override frame/message size limits
    pub fn with_limits(mut self, max_message_size: usize, max_frame_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self.max_frame_size = max_frame_size;
        self
    }

    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_frame_size),
            ..Default::default()
        }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str, protocols: &[String]) -> TransportLink {
        let (link, endpoint) = TransportLink::pair();
        tokio::spawn(run_socket(
            url.to_string(),
            protocols.to_vec(),
            self.ws_config(),
            endpoint,
        ));
        link
    }
}

/// Build the upgrade request with the subprotocol header
fn build_request(url: &str, protocols: &[String]) -> Result<Request, String> {
    let uri: Uri = url.parse().map_err(|e| format!("invalid url {}: {}", url, e))?;
    let host = uri.host().unwrap_or("localhost");
    let host = match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut builder = Request::builder()
        .uri(url)
        .header(header::HOST, host)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, generate_key());

    if !protocols.is_empty() {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocols.join(", "));
    }

    builder.body(()).map_err(|e| e.to_string())
}

async fn run_socket(
    url: String,
    protocols: Vec<String>,
    ws_config: WebSocketConfig,
    mut endpoint: TransportEndpoint,
) {
    let request = match build_request(&url, &protocols) {
        Ok(request) => request,
        Err(e) => {
            endpoint.emit(TransportEvent::Error(e.clone()));
            endpoint.emit(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: e,
            });
            return;
        }
    };

    let (ws_stream, response) = match connect_async_with_config(request, Some(ws_config), false).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("WebSocket connection to {} failed: {}", url, e);
            endpoint.emit(TransportEvent::Error(e.to_string()));
            endpoint.emit(TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: e.to_string(),
            });
            return;
        }
    };

    // Verify subprotocol
    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());

    if !protocols.is_empty() && !protocols.iter().any(|p| Some(p.as_str()) == accepted_protocol) {
        warn!(
            "Central system did not accept any of {:?}, got: {:?}",
            protocols, accepted_protocol
        );
    }

    info!("WebSocket connected to {}", url);
    endpoint.emit(TransportEvent::Opened);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut close_requested = false;

    loop {
        tokio::select! {
            // Keep listening after a close so a dropped link still ends the task
            command = endpoint.commands.recv() => {
                match command {
                    Some(TransportCommand::Send(bytes)) if !close_requested => {
                        debug!("Sending: {}", String::from_utf8_lossy(&bytes));
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            endpoint.emit(TransportEvent::Error(e.to_string()));
                        }
                    }
                    Some(TransportCommand::Close { code, reason }) if !close_requested => {
                        close_requested = true;
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                            warn!("Failed to send close frame to {}: {}", url, e);
                            endpoint.emit(TransportEvent::Closed {
                                code: ABNORMAL_CLOSURE,
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                    Some(command) => {
                        debug!("Closing {}, ignoring {:?}", url, command);
                    }
                    None => {
                        // Link abandoned by the core
                        debug!("Link to {} dropped, closing socket", url);
                        if !close_requested {
                            let _ = ws_tx.send(Message::Close(None)).await;
                        }
                        return;
                    }
                }
            }

            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received: {}", text);
                        endpoint.emit(TransportEvent::Message(text.as_bytes().to_vec()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        endpoint.emit(TransportEvent::Message(data.to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                        info!("WebSocket {} closed: code={}, reason={}", url, code, reason);
                        endpoint.emit(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong handled by tungstenite
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", url, e);
                        endpoint.emit(TransportEvent::Error(e.to_string()));
                        endpoint.emit(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        info!("WebSocket stream {} ended", url);
                        endpoint.emit(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }
}
