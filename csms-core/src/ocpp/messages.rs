//! OCPP-J message framing
//!
//! OCPP 1.6 JSON uses a JSON array envelope over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The action of a CALL is kept as the raw string so that a frame for an
//! unknown action still decodes and can be answered with `NotImplemented`.

use serde::de::DeserializeOwned;
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

/// OCPP 1.6 error codes (spelled as in the 1.6 JSON specification)
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

/// OCPP actions this system knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CS
    BootNotification,
    Heartbeat,
    StatusNotification,

    // CS -> CP
    GetConfiguration,
    ChangeConfiguration,
    SetChargingProfile,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// A typed request payload and the response it expects
pub trait Request: Serialize {
    const ACTION: Action;
    type Response: DeserializeOwned;
}

impl Request for BootNotificationRequest {
    const ACTION: Action = Action::BootNotification;
    type Response = BootNotificationResponse;
}

impl Request for HeartbeatRequest {
    const ACTION: Action = Action::Heartbeat;
    type Response = HeartbeatResponse;
}

impl Request for StatusNotificationRequest {
    const ACTION: Action = Action::StatusNotification;
    type Response = StatusNotificationResponse;
}

impl Request for GetConfigurationRequest {
    const ACTION: Action = Action::GetConfiguration;
    type Response = GetConfigurationResponse;
}

impl Request for ChangeConfigurationRequest {
    const ACTION: Action = Action::ChangeConfiguration;
    type Response = ChangeConfigurationResponse;
}

impl Request for SetChargingProfileRequest {
    const ACTION: Action = Action::SetChargingProfile;
    type Response = SetChargingProfileResponse;
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create a CALL from a typed request
    pub fn from_request<R: Request>(request: &R) -> Result<Self, OcppError> {
        Self::new(R::ACTION, request)
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    fn to_json(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    fn to_json(&self) -> Value {
        serde_json::json!([MessageType::CallResult as i32, &self.message_id, &self.payload])
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    fn to_json(&self) -> Value {
        serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ])
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

fn message_id(value: &Value) -> Result<String, OcppError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat)
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id: message_id(&array[1])?,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id(&array[1])?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // errorDetails is optional in the wild
                if array.len() != 4 && array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id: message_id(&array[1])?,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array
                        .get(4)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    /// Serialize to a WebSocket text payload
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    fn to_json(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_json(),
            OcppMessage::CallResult(r) => r.to_json(),
            OcppMessage::CallError(e) => e.to_json(),
        }
    }
}
