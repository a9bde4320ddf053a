//! Error taxonomy of the connection manager
//!
//! Every variant is scoped to one charge point. Nothing here is process-fatal.

use std::time::Duration;

use thiserror::Error;

use crate::ocpp::{ErrorCode, OcppError};

/// Errors surfaced by the connection manager, either as the result of the
/// triggering call or through the per charge point error subscriber.
///
/// `Clone` so one in-flight connect/disconnect outcome can be handed to every
/// waiter joined on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("connect timeout: {id} ({timeout:?})")]
    ConnectTimeout { id: String, timeout: Duration },

    #[error("transport error while connecting {id}: {reason}")]
    ConnectTransport { id: String, reason: String },

    #[error("{id} is already connecting")]
    AlreadyConnecting { id: String },

    #[error("{id} did not reach Closed within {timeout:?}")]
    DisconnectTimeout { id: String, timeout: Duration },

    #[error("{id} connection unavailable, {action} queued")]
    SendWhileDisconnected { id: String, action: String },

    #[error("{action} to {id} timed out after {elapsed:?}")]
    CallTimeout {
        id: String,
        action: String,
        elapsed: Duration,
    },

    #[error("{id} answered {code}: {description}")]
    Protocol {
        id: String,
        code: ErrorCode,
        description: String,
    },

    #[error("network unavailable ({id})")]
    NetworkUnavailable { id: String },

    #[error("{id} reached the reconnect limit ({max})")]
    ReconnectLimitExceeded { id: String, max: u32 },

    #[error("connection closed: {id} ({reason})")]
    ConnectionClosed { id: String, reason: String },

    #[error("codec error for {id}: {reason}")]
    Codec { id: String, reason: String },

    #[error("transport error on {id}: {reason}")]
    Transport { id: String, reason: String },

    #[error("invalid configuration for {id}: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("connection manager shut down")]
    Shutdown,
}

impl LinkError {
    pub(crate) fn codec(id: &str, err: OcppError) -> Self {
        LinkError::Codec {
            id: id.to_string(),
            reason: err.to_string(),
        }
    }

    /// Charge point the error belongs to, if any
    pub fn charge_point_id(&self) -> Option<&str> {
        match self {
            LinkError::ConnectTimeout { id, .. }
            | LinkError::ConnectTransport { id, .. }
            | LinkError::AlreadyConnecting { id }
            | LinkError::DisconnectTimeout { id, .. }
            | LinkError::SendWhileDisconnected { id, .. }
            | LinkError::CallTimeout { id, .. }
            | LinkError::Protocol { id, .. }
            | LinkError::NetworkUnavailable { id }
            | LinkError::ReconnectLimitExceeded { id, .. }
            | LinkError::ConnectionClosed { id, .. }
            | LinkError::Codec { id, .. }
            | LinkError::Transport { id, .. }
            | LinkError::InvalidConfig { id, .. } => Some(id),
            LinkError::Shutdown => None,
        }
    }
}
