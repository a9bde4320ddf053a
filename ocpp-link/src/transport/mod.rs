//! Transport boundary
//!
//! One `TransportLink` per logical connection attempt. The link is a pair of
//! channels: commands flow to the transport task, events flow back. The core
//! never sees the socket itself.
//!
//! ```text
//!   Connection ──commands──► transport task ──frames──► central system
//!   Connection ◄──events──── transport task ◄─frames─── central system
//! ```

pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

use tokio::sync::mpsc;

pub use websocket::WebSocketTransport;

/// Close code for a deliberate, orderly shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the link died without a close handshake
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// What the transport reports back
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake complete; `Send` is valid from now on
    Opened,
    /// One inbound frame
    Message(Vec<u8>),
    /// Transport-level failure; a `Closed` normally follows
    Error(String),
    /// Link is gone. Terminal.
    Closed { code: u16, reason: String },
}

/// What the core asks of the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Send(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Core side of one transport instance
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Transport side of one transport instance
#[derive(Debug)]
pub struct TransportEndpoint {
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportLink {
    /// Create both ends of a link
    pub fn pair() -> (TransportLink, TransportEndpoint) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            TransportLink {
                commands: command_tx,
                events: event_rx,
            },
            TransportEndpoint {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

impl TransportEndpoint {
    /// Report an event. The core may already have dropped the link.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// A message-framed bidirectional transport.
///
/// `open` must not block: it starts the handshake in the background and
/// reports progress through the returned link's events.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &str, protocols: &[String]) -> TransportLink;
}
