//! OCPP 1.6J protocol layer
//!
//! - `types`: payload structs and enumerations
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR) and typed requests

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
