//! OCPP-J message framing
//!
//! OCPP over WebSocket uses a positional JSON array tagged by a numeric type:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J 1.6 CallError codes. The misspellings are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP action names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> Central System
    BootNotification,
    Heartbeat,
    StatusNotification,
    StartTransaction,
    StopTransaction,
    MeterValues,
    Authorize,

    // Central System -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    UnlockConnector,
    GetConfiguration,
    ChangeConfiguration,
    ClearCache,
    ChangeAvailability,
    GetDiagnostics,
    UpdateFirmware,

    // Bidirectional
    DataTransfer,

    /// Any action outside the vocabulary above. Still acknowledged.
    Other(String),
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Other(name) => f.write_str(name),
            known => write!(f, "{:?}", known),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "BootNotification" => Action::BootNotification,
            "Heartbeat" => Action::Heartbeat,
            "StatusNotification" => Action::StatusNotification,
            "StartTransaction" => Action::StartTransaction,
            "StopTransaction" => Action::StopTransaction,
            "MeterValues" => Action::MeterValues,
            "Authorize" => Action::Authorize,
            "RemoteStartTransaction" => Action::RemoteStartTransaction,
            "RemoteStopTransaction" => Action::RemoteStopTransaction,
            "Reset" => Action::Reset,
            "UnlockConnector" => Action::UnlockConnector,
            "GetConfiguration" => Action::GetConfiguration,
            "ChangeConfiguration" => Action::ChangeConfiguration,
            "ClearCache" => Action::ClearCache,
            "ChangeAvailability" => Action::ChangeAvailability,
            "GetDiagnostics" => Action::GetDiagnostics,
            "UpdateFirmware" => Action::UpdateFirmware,
            "DataTransfer" => Action::DataTransfer,
            other => Action::Other(other.to_string()),
        }
    }
}

/// Errors in OCPP message encoding and decoding
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Action {0} has no typed payload")]
    UntypedAction(Action),
}

/// Generate a message id: millisecond timestamp prefix plus a random suffix.
pub fn generate_message_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

/// Closed set of request payloads the link understands.
///
/// `DataTransfer` is the only vendor escape hatch; its `data` is opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    BootNotification(BootNotificationRequest),
    Heartbeat(HeartbeatRequest),
    StatusNotification(StatusNotificationRequest),
    StartTransaction(StartTransactionRequest),
    StopTransaction(StopTransactionRequest),
    MeterValues(MeterValuesRequest),
    Authorize(AuthorizeRequest),
    DataTransfer(DataTransferRequest),
    RemoteStartTransaction(RemoteStartTransactionRequest),
    RemoteStopTransaction(RemoteStopTransactionRequest),
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Request::BootNotification(_) => Action::BootNotification,
            Request::Heartbeat(_) => Action::Heartbeat,
            Request::StatusNotification(_) => Action::StatusNotification,
            Request::StartTransaction(_) => Action::StartTransaction,
            Request::StopTransaction(_) => Action::StopTransaction,
            Request::MeterValues(_) => Action::MeterValues,
            Request::Authorize(_) => Action::Authorize,
            Request::DataTransfer(_) => Action::DataTransfer,
            Request::RemoteStartTransaction(_) => Action::RemoteStartTransaction,
            Request::RemoteStopTransaction(_) => Action::RemoteStopTransaction,
        }
    }

    pub fn to_payload(&self) -> Result<Value, OcppError> {
        let value = match self {
            Request::BootNotification(r) => serde_json::to_value(r)?,
            Request::Heartbeat(r) => serde_json::to_value(r)?,
            Request::StatusNotification(r) => serde_json::to_value(r)?,
            Request::StartTransaction(r) => serde_json::to_value(r)?,
            Request::StopTransaction(r) => serde_json::to_value(r)?,
            Request::MeterValues(r) => serde_json::to_value(r)?,
            Request::Authorize(r) => serde_json::to_value(r)?,
            Request::DataTransfer(r) => serde_json::to_value(r)?,
            Request::RemoteStartTransaction(r) => serde_json::to_value(r)?,
            Request::RemoteStopTransaction(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    /// Decode a payload for a typed action
    pub fn decode(action: &Action, payload: &Value) -> Result<Self, OcppError> {
        fn typed<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, OcppError> {
            Ok(T::deserialize(payload)?)
        }

        Ok(match action {
            Action::BootNotification => Request::BootNotification(typed(payload)?),
            Action::Heartbeat => Request::Heartbeat(typed(payload)?),
            Action::StatusNotification => Request::StatusNotification(typed(payload)?),
            Action::StartTransaction => Request::StartTransaction(typed(payload)?),
            Action::StopTransaction => Request::StopTransaction(typed(payload)?),
            Action::MeterValues => Request::MeterValues(typed(payload)?),
            Action::Authorize => Request::Authorize(typed(payload)?),
            Action::DataTransfer => Request::DataTransfer(typed(payload)?),
            Action::RemoteStartTransaction => Request::RemoteStartTransaction(typed(payload)?),
            Action::RemoteStopTransaction => Request::RemoteStopTransaction(typed(payload)?),
            other => return Err(OcppError::UntypedAction(other.clone())),
        })
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: generate_message_id(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create a CALL from a typed request
    pub fn from_request(request: &Request) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: generate_message_id(),
            action: request.action(),
            payload: request.to_payload()?,
        })
    }

    /// Decode the payload into the typed request for this action
    pub fn request(&self) -> Result<Request, OcppError> {
        Request::decode(&self.action, &self.payload)
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Empty acknowledgement `{}`
    pub fn empty(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat("missing message type"))?;

        let message_id = |array: &[Value]| -> Result<String, OcppError> {
            array[1]
                .as_str()
                .map(str::to_string)
                .ok_or(OcppError::InvalidFormat("message id must be a string"))
        };

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat("CALL must have 4 elements"));
                }

                let message_id = message_id(&array)?;
                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("action must be a string"))?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action: Action::from(action),
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat("CALLRESULT must have 3 elements"));
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat("CALLERROR must have 5 elements"));
                }

                let message_id = message_id(&array)?;
                let error_code_str = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("error code must be a string"))?;

                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}
