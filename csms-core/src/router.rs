//! Inbound action routing
//!
//! CALLs from a charge point are decoded into [`InboundRequest`] and handled
//! by an exhaustive match. Every CALL gets exactly one reply frame:
//!
//! | Situation | Reply |
//! |-----------|-------|
//! | BootNotification / Heartbeat / StatusNotification | CALLRESULT |
//! | Action name not known at all | CALLERROR `NotImplemented` |
//! | Known action the charge point may not initiate | CALLERROR `NotSupported` |
//! | Payload does not match the action schema | CALLERROR `FormationViolation` |

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::ocpp::*;
use crate::session::{BootInfo, SessionHandle};

/// A decoded charge-point-initiated request
#[derive(Debug, Clone)]
pub enum InboundRequest {
    BootNotification(BootNotificationRequest),
    Heartbeat(HeartbeatRequest),
    StatusNotification(StatusNotificationRequest),
}

impl InboundRequest {
    /// Decode a CALL, or produce the CALLERROR to send back
    pub fn decode(call: &Call) -> Result<Self, CallError> {
        let action: Action = call.action.parse().map_err(|_| {
            CallError::new(
                call.message_id.clone(),
                ErrorCode::NotImplemented,
                format!("Action {} is not implemented", call.action),
            )
        })?;

        let payload = call.payload.clone();
        let decoded = match action {
            Action::BootNotification => {
                serde_json::from_value(payload).map(InboundRequest::BootNotification)
            }
            Action::Heartbeat => serde_json::from_value(payload).map(InboundRequest::Heartbeat),
            Action::StatusNotification => {
                serde_json::from_value(payload).map(InboundRequest::StatusNotification)
            }
            Action::GetConfiguration
            | Action::ChangeConfiguration
            | Action::SetChargingProfile => {
                return Err(CallError::new(
                    call.message_id.clone(),
                    ErrorCode::NotSupported,
                    format!("{} is initiated by the central system", action),
                ));
            }
        };

        decoded.map_err(|e| {
            CallError::new(
                call.message_id.clone(),
                ErrorCode::FormationViolation,
                format!("Invalid {} payload: {}", action, e),
            )
        })
    }
}

/// Current server time, whole seconds
pub fn server_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Routes inbound CALLs to their handlers
#[derive(Debug, Clone)]
pub struct Router {
    heartbeat_interval: i32,
}

impl Router {
    pub fn new(heartbeat_interval: i32) -> Self {
        Self {
            heartbeat_interval: heartbeat_interval.max(1),
        }
    }

    /// Handle one CALL and build the reply frame
    pub fn dispatch(&self, session: &SessionHandle, call: Call) -> OcppMessage {
        let request = match InboundRequest::decode(&call) {
            Ok(request) => request,
            Err(call_error) => {
                warn!(
                    "[{}] Rejecting {} ({}): {:?} - {}",
                    session.identity(),
                    call.action,
                    call.message_id,
                    call_error.error_code,
                    call_error.error_description
                );
                return OcppMessage::CallError(call_error);
            }
        };

        let message_id = call.message_id;
        match request {
            InboundRequest::BootNotification(req) => {
                reply(message_id, self.boot_notification(session, &req))
            }
            InboundRequest::Heartbeat(_) => reply(message_id, self.heartbeat(session)),
            InboundRequest::StatusNotification(req) => {
                reply(message_id, self.status_notification(session, &req))
            }
        }
    }

    /// Always accepts; no registration policy
    pub fn boot_notification(
        &self,
        session: &SessionHandle,
        req: &BootNotificationRequest,
    ) -> BootNotificationResponse {
        let now = server_time();
        info!(
            "[{}] BootNotification: vendor={}, model={}, serial={:?}, firmware={:?}",
            session.identity(),
            req.charge_point_vendor,
            req.charge_point_model,
            req.charge_point_serial_number,
            req.firmware_version
        );
        session.record_boot(BootInfo::from_request(req, now));

        BootNotificationResponse {
            current_time: now,
            interval: self.heartbeat_interval,
            status: RegistrationStatus::Accepted,
        }
    }

    pub fn heartbeat(&self, session: &SessionHandle) -> HeartbeatResponse {
        debug!("[{}] Heartbeat", session.identity());
        HeartbeatResponse {
            current_time: server_time(),
        }
    }

    /// Classifies the status for logging only
    pub fn status_notification(
        &self,
        session: &SessionHandle,
        req: &StatusNotificationRequest,
    ) -> StatusNotificationResponse {
        info!(
            "[{}] StatusNotification: connector={}, error_code={}, status={}",
            session.identity(),
            req.connector_id,
            req.error_code,
            req.status
        );

        match ConnectorState::classify(&req.status) {
            ConnectorState::Available => {
                info!("[{}] Connector {} is available", session.identity(), req.connector_id)
            }
            ConnectorState::Occupied => {
                info!("[{}] Connector {} is occupied", session.identity(), req.connector_id)
            }
            ConnectorState::Faulted => warn!(
                "[{}] Connector {} has a fault: {}",
                session.identity(),
                req.connector_id,
                req.error_code
            ),
            ConnectorState::Other => info!(
                "[{}] Connector {} reported unrecognized status {}",
                session.identity(),
                req.connector_id,
                req.status
            ),
        }

        StatusNotificationResponse {}
    }
}

fn reply(message_id: String, payload: impl Serialize) -> OcppMessage {
    match CallResult::new(message_id.clone(), payload) {
        Ok(result) => OcppMessage::CallResult(result),
        Err(e) => {
            error!("Failed to encode reply {}: {}", message_id, e);
            OcppMessage::CallError(CallError::new(
                message_id,
                ErrorCode::InternalError,
                "failed to encode reply",
            ))
        }
    }
}
