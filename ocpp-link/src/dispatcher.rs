//! Inbound command dispatcher
//!
//! Answers Calls from the central system. Remote start/stop are accepted and
//! followed by a scripted sequence emulating the charge point:
//!
//! ```text
//! RemoteStartTransaction -> Accepted
//!     +preparing_delay  StatusNotification(Preparing)
//!     +start_delay      StartTransaction(meterStart 0)
//!
//! RemoteStopTransaction -> Accepted
//!     +stop_delay       StopTransaction(meterStop) then StatusNotification(1, Available)
//! ```
//!
//! Every other action gets an empty CallResult so no Call goes unanswered.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::LinkError;
use crate::manager::Core;
use crate::ocpp::{
    Action, Call, CallError, CallResult, ChargePointErrorCode, ChargePointStatus, ErrorCode,
    OcppMessage, RemoteStartStopStatus, RemoteStartTransactionRequest,
    RemoteStartTransactionResponse, RemoteStopTransactionRequest,
    RemoteStopTransactionResponse, Request, StartTransactionRequest, StatusNotificationRequest,
    StopReason, StopTransactionRequest,
};

/// Connector used when the central system does not name one
const DEFAULT_CONNECTOR: u32 = 1;

pub(crate) fn handle_call(core: &Arc<Core>, conn: &Arc<Connection>, call: &Call) {
    let id = conn.id();
    info!(charge_point_id = %id, "Received {} ({})", call.action, call.message_id);

    let response = match &call.action {
        Action::RemoteStartTransaction => remote_start(core, conn, call),
        Action::RemoteStopTransaction => remote_stop(core, conn, call),
        other => {
            debug!(charge_point_id = %id, "No handler for {}, acknowledging", other);
            Ok(OcppMessage::CallResult(CallResult::empty(&call.message_id)))
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(charge_point_id = %id, "Could not build response to {}: {}", call.action, e);
            OcppMessage::CallError(CallError::new(
                &call.message_id,
                ErrorCode::InternalError,
                e.to_string(),
            ))
        }
    };

    if let Err(e) = conn.send(core, response) {
        warn!(charge_point_id = %id, "Response to {} not sent: {}", call.action, e);
        core.notify_error(id, &e);
    }
}

fn formation_violation(call: &Call, detail: impl std::fmt::Display) -> OcppMessage {
    OcppMessage::CallError(CallError::new(
        &call.message_id,
        ErrorCode::FormationViolation,
        format!("invalid {} payload: {}", call.action, detail),
    ))
}

fn remote_start(
    core: &Arc<Core>,
    conn: &Arc<Connection>,
    call: &Call,
) -> Result<OcppMessage, LinkError> {
    let request: RemoteStartTransactionRequest = match call.request() {
        Ok(Request::RemoteStartTransaction(request)) => request,
        Ok(_) => return Ok(formation_violation(call, "unexpected payload")),
        Err(e) => return Ok(formation_violation(call, e)),
    };

    let response = CallResult::new(
        &call.message_id,
        RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        },
    )
    .map_err(|e| LinkError::codec(conn.id(), e))?;

    let connector_id = request.connector_id.unwrap_or(DEFAULT_CONNECTOR);
    let script = core.config.script.clone();
    let weak = Arc::downgrade(core);
    let id = conn.id().to_string();

    conn.track_script(tokio::spawn(async move {
        time::sleep(script.preparing_delay).await;
        if !send_scripted(&weak, &id, status_request(connector_id, ChargePointStatus::Preparing)) {
            return;
        }

        time::sleep(script.start_delay).await;
        send_scripted(
            &weak,
            &id,
            Request::StartTransaction(StartTransactionRequest {
                connector_id,
                id_tag: request.id_tag,
                meter_start: 0,
                reservation_id: None,
                timestamp: Utc::now(),
            }),
        );
    }));

    Ok(OcppMessage::CallResult(response))
}

fn remote_stop(
    core: &Arc<Core>,
    conn: &Arc<Connection>,
    call: &Call,
) -> Result<OcppMessage, LinkError> {
    let request: RemoteStopTransactionRequest = match call.request() {
        Ok(Request::RemoteStopTransaction(request)) => request,
        Ok(_) => return Ok(formation_violation(call, "unexpected payload")),
        Err(e) => return Ok(formation_violation(call, e)),
    };

    let response = CallResult::new(
        &call.message_id,
        RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        },
    )
    .map_err(|e| LinkError::codec(conn.id(), e))?;

    let script = core.config.script.clone();
    let weak = Arc::downgrade(core);
    let id = conn.id().to_string();

    conn.track_script(tokio::spawn(async move {
        time::sleep(script.stop_delay).await;
        let stopped = send_scripted(
            &weak,
            &id,
            Request::StopTransaction(StopTransactionRequest {
                transaction_id: request.transaction_id,
                meter_stop: script.meter_stop,
                timestamp: Utc::now(),
                reason: Some(StopReason::Remote),
                id_tag: None,
            }),
        );
        if stopped {
            send_scripted(
                &weak,
                &id,
                status_request(DEFAULT_CONNECTOR, ChargePointStatus::Available),
            );
        }
    }));

    Ok(OcppMessage::CallResult(response))
}

pub(crate) fn status_request(connector_id: u32, status: ChargePointStatus) -> Request {
    Request::StatusNotification(StatusNotificationRequest {
        connector_id,
        error_code: ChargePointErrorCode::NoError,
        status,
        info: Some(format!("Connector {} status: {}", connector_id, status)),
        timestamp: Some(Utc::now()),
    })
}

/// Fire one scripted request. Returns false once the manager is gone.
fn send_scripted(core: &Weak<Core>, id: &str, request: Request) -> bool {
    let Some(core) = core.upgrade() else {
        return false;
    };
    core.send_background(id, request);
    true
}
