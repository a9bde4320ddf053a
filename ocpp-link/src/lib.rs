//! # OCPP Link
//!
//! Client-side OCPP 1.6J connection manager. Maintains one WebSocket link per
//! simulated charge point to a central system, with heartbeat, offline
//! queueing, reconnect backoff and network awareness.
//!
//! ## Architecture
//!
//! ```text
//!                 ConnectionManager (facade)
//!                          │
//!        ┌─────────────────┼──────────────────┐
//!        ▼                 ▼                  ▼
//!   ┌──────────┐   ┌──────────────┐   ┌────────────────┐
//!   │ Registry │   │ PendingCalls │   │ NetworkMonitor │
//!   │ + op lock│   │ (timeouts)   │   │ (online/off)   │
//!   └────┬─────┘   └──────▲───────┘   └────────────────┘
//!        ▼                │
//!   ┌────────────┐  ┌─────┴──────┐
//!   │ Connection │◄►│ Dispatcher │  remote start/stop scripts
//!   └────┬───────┘  └────────────┘
//!        │ TransportCommand / TransportEvent
//!        ▼
//!   Transport (WebSocket, subprotocol ocpp1.6)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_link::{ConnectionManager, LinkConfig, NetworkMonitor, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::new("ws://localhost:8080/ocpp");
//!     let manager = ConnectionManager::new(
//!         config,
//!         Arc::new(WebSocketTransport::new()),
//!         NetworkMonitor::online(),
//!     );
//!
//!     manager.on_error("CP-001", |e| eprintln!("CP-001: {}", e));
//!     manager.connect("CP-001").await?;
//!     let accepted = manager.send_authorize("CP-001", "TAG-1").await?;
//!     println!("{:?}", accepted.id_tag_info.status);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod manager;
pub mod network;
pub mod ocpp;
pub mod transport;

mod connection;
mod dispatcher;
mod pending;
mod registry;

pub use catalog::{
    bring_fleet_online, bring_online, Catalog, CatalogError, ChargePoint, CommandResponse,
    CommandStatus, FleetReport, Station,
};
pub use config::{build_ocpp_url, LinkConfig, ScriptTiming, StationIdentity};
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::LinkError;
pub use manager::{ConnectionManager, ConnectionStats, ErrorHandler, MessageHandler, MemberOutcome};
pub use network::{spawn_probe, NetworkMonitor, NetworkStatus};
pub use transport::{Transport, TransportCommand, TransportEvent, TransportLink, WebSocketTransport};

// Re-export the OCPP vocabulary callers need most
pub use ocpp::{
    Action, ChargePointErrorCode, ChargePointStatus, Measurand, OcppError, OcppMessage, Request,
    SampledValue, StopReason,
};
