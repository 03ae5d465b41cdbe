//! Charge point simulator
//!
//! A minimal OCPP 1.6 charge point used by the `simulate` subcommand and by
//! the integration tests. It:
//! - connects to `{central_url}/{identity}` offering the configured subprotocols
//! - sends BootNotification, one StatusNotification per connector, then
//!   Heartbeats at the interval the central system hands out
//! - answers GetConfiguration / ChangeConfiguration / SetChargingProfile from
//!   a local configuration table and profile store

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::OCPP16_SUBPROTOCOL;
use crate::correlation::PendingCalls;
use crate::error::{ClientError, CommandError};
use crate::ocpp::*;
use crate::session::spawn_writer;

/// Configuration for the simulated charge point
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Central system WebSocket URL, without the identity
    pub central_url: String,
    /// Charge point identity (appended to the URL path)
    pub identity: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Subprotocols offered in the handshake
    pub subprotocols: Vec<String>,
    /// Connectors reported with StatusNotification (1..=connectors)
    pub connectors: i32,
    /// Request timeout for calls to the central system
    pub request_timeout: Duration,
    /// Local configuration table
    pub configuration: Vec<ConfigurationEntry>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            central_url: "ws://127.0.0.1:8080".to_string(),
            identity: "CP_1".to_string(),
            vendor: "The Mobility House".to_string(),
            model: "Optimus".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            subprotocols: vec![OCPP16_SUBPROTOCOL.to_string()],
            connectors: 1,
            request_timeout: Duration::from_secs(30),
            configuration: default_configuration(),
        }
    }
}

impl SimulatorConfig {
    pub fn new(central_url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            central_url: central_url.into(),
            identity: identity.into(),
            ..Default::default()
        }
    }
}

/// Configuration keys a freshly booted simulator reports
pub fn default_configuration() -> Vec<ConfigurationEntry> {
    let entry = |key: &str, readonly: bool, value: &str| ConfigurationEntry {
        key: key.to_string(),
        readonly,
        value: Some(value.to_string()),
    };

    vec![
        entry("HeartbeatInterval", false, "10"),
        entry("ConnectionTimeOut", false, "60"),
        entry("MeterValueSampleInterval", false, "60"),
        entry("NumberOfConnectors", true, "1"),
        entry("SupportedFeatureProfiles", true, "Core,SmartCharging"),
        entry("ChargeProfileMaxStackLevel", true, "8"),
    ]
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, identity: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), identity)
}

/// A charging profile installed by the central system
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledProfile {
    pub connector_id: i32,
    pub profile: ChargingProfile,
}

/// Local state the simulator answers central system calls from
#[derive(Debug, Clone, Default)]
pub struct ChargePointState {
    configuration: Vec<ConfigurationEntry>,
    profiles: Vec<InstalledProfile>,
}

impl ChargePointState {
    pub fn new(configuration: Vec<ConfigurationEntry>) -> Self {
        Self {
            configuration,
            profiles: Vec::new(),
        }
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.configuration
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.clone())
    }

    pub fn profiles(&self) -> &[InstalledProfile] {
        &self.profiles
    }

    /// Build the reply to a CALL from the central system
    pub fn answer(&mut self, call: &Call) -> OcppMessage {
        let action = match call.action.parse::<Action>() {
            Ok(action) => action,
            Err(_) => {
                return OcppMessage::CallError(CallError::new(
                    call.message_id.clone(),
                    ErrorCode::NotImplemented,
                    format!("Action {} is not implemented", call.action),
                ))
            }
        };

        let reply = match action {
            Action::GetConfiguration => {
                decode(call).map(|req| result(call, self.get_configuration(&req)))
            }
            Action::ChangeConfiguration => {
                decode(call).map(|req| result(call, self.change_configuration(&req)))
            }
            Action::SetChargingProfile => {
                decode(call).map(|req| result(call, self.set_charging_profile(req)))
            }
            Action::BootNotification | Action::Heartbeat | Action::StatusNotification => {
                Err(CallError::new(
                    call.message_id.clone(),
                    ErrorCode::NotImplemented,
                    format!("{} is not handled by a charge point", action),
                ))
            }
        };

        reply.unwrap_or_else(OcppMessage::CallError)
    }

    fn get_configuration(&self, req: &GetConfigurationRequest) -> GetConfigurationResponse {
        if req.key.is_empty() {
            return GetConfigurationResponse {
                configuration_key: self.configuration.clone(),
                unknown_key: Vec::new(),
            };
        }

        let mut response = GetConfigurationResponse::default();
        for key in &req.key {
            match self.configuration.iter().find(|entry| &entry.key == key) {
                Some(entry) => response.configuration_key.push(entry.clone()),
                None => response.unknown_key.push(key.clone()),
            }
        }
        response
    }

    fn change_configuration(&mut self, req: &ChangeConfigurationRequest) -> ChangeConfigurationResponse {
        let status = match self.configuration.iter_mut().find(|entry| entry.key == req.key) {
            Some(entry) if entry.readonly => ConfigurationStatus::Rejected,
            Some(entry) => {
                entry.value = Some(req.value.clone());
                ConfigurationStatus::Accepted
            }
            None => ConfigurationStatus::NotSupported,
        };
        ChangeConfigurationResponse { status }
    }

    fn set_charging_profile(&mut self, req: SetChargingProfileRequest) -> SetChargingProfileResponse {
        if let Err(e) = req.cs_charging_profiles.charging_schedule.validate() {
            warn!(
                "Rejecting charging profile {}: {}",
                req.cs_charging_profiles.charging_profile_id, e
            );
            return SetChargingProfileResponse {
                status: ChargingProfileStatus::Rejected,
            };
        }

        let installed = InstalledProfile {
            connector_id: req.connector_id,
            profile: req.cs_charging_profiles,
        };
        match self.profiles.iter_mut().find(|p| {
            p.connector_id == installed.connector_id
                && p.profile.charging_profile_id == installed.profile.charging_profile_id
        }) {
            Some(existing) => *existing = installed,
            None => self.profiles.push(installed),
        }

        SetChargingProfileResponse {
            status: ChargingProfileStatus::Accepted,
        }
    }
}

fn decode<T: DeserializeOwned>(call: &Call) -> Result<T, CallError> {
    serde_json::from_value(call.payload.clone()).map_err(|e| {
        CallError::new(
            call.message_id.clone(),
            ErrorCode::FormationViolation,
            format!("Invalid {} payload: {}", call.action, e),
        )
    })
}

fn result(call: &Call, payload: impl Serialize) -> OcppMessage {
    match CallResult::new(call.message_id.clone(), payload) {
        Ok(result) => OcppMessage::CallResult(result),
        Err(e) => OcppMessage::CallError(CallError::new(
            call.message_id.clone(),
            ErrorCode::InternalError,
            e.to_string(),
        )),
    }
}

/// Connected charge point simulator
pub struct ChargePointClient {
    config: SimulatorConfig,
    accepted_protocol: Option<String>,
    outbound: mpsc::Sender<OcppMessage>,
    pending: PendingCalls,
    state: Arc<Mutex<ChargePointState>>,
    closed: watch::Receiver<bool>,
    stop_tx: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ChargePointClient {
    /// Connect to the central system and start the connection tasks
    pub async fn connect(config: SimulatorConfig) -> Result<Self, ClientError> {
        let url = build_ocpp_url(&config.central_url, &config.identity);
        let invalid = |reason: String| ClientError::InvalidUrl {
            url: url.clone(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        if !config.subprotocols.is_empty() {
            let offered = HeaderValue::from_str(&config.subprotocols.join(", "))
                .map_err(|e| invalid(e.to_string()))?;
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        info!("Connecting to {}", url);
        let (ws, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let acceptable = match &accepted {
            Some(protocol) => config.subprotocols.contains(protocol),
            None => config.subprotocols.is_empty(),
        };
        if !acceptable {
            return Err(ClientError::SubprotocolRejected {
                offered: config.subprotocols.clone(),
                accepted,
            });
        }

        info!("[{}] Connected (subprotocol {:?})", config.identity, accepted);
        Ok(Self::from_stream(config, ws, accepted))
    }

    /// Run the simulator over an already established WebSocket
    pub fn from_stream<S>(
        config: SimulatorConfig,
        ws: WebSocketStream<S>,
        accepted_protocol: Option<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_tx, mut ws_rx) = ws.split();
        let (outbound, outbound_rx) = mpsc::channel::<OcppMessage>(64);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (closed_tx, closed) = watch::channel(false);
        let pending = PendingCalls::new();
        let state = Arc::new(Mutex::new(ChargePointState::new(config.configuration.clone())));

        let writer = spawn_writer(
            Arc::from(config.identity.as_str()),
            ws_tx,
            outbound_rx,
            stop_rx,
        );

        let reader = {
            let identity = config.identity.clone();
            let outbound = outbound.clone();
            let pending = pending.clone();
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let text = match ws_rx.next().await {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) => {
                            info!("[{}] Connection closed by central system", identity);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("[{}] WebSocket error: {}", identity, e);
                            break;
                        }
                        None => break,
                    };

                    debug!("[{}] Received: {}", identity, text.as_str());

                    match OcppMessage::parse(text.as_bytes()) {
                        Ok(OcppMessage::Call(call)) => {
                            info!("[{}] Central system called {}", identity, call.action);
                            let reply = state.lock().answer(&call);
                            if outbound.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(OcppMessage::CallResult(result)) => {
                            pending.resolve_result(result);
                        }
                        Ok(OcppMessage::CallError(error)) => {
                            pending.resolve_error(error);
                        }
                        Err(e) => warn!("[{}] Failed to parse OCPP message: {}", identity, e),
                    }
                }

                pending.close();
                let _ = closed_tx.send(true);
            })
        };

        Self {
            config,
            accepted_protocol,
            outbound,
            pending,
            state,
            closed,
            stop_tx: Some(stop_tx),
            writer,
            reader,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn accepted_protocol(&self) -> Option<&str> {
        self.accepted_protocol.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the central system closes the connection
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Profiles installed by the central system so far
    pub fn installed_profiles(&self) -> Vec<InstalledProfile> {
        self.state.lock().profiles().to_vec()
    }

    pub fn configuration_value(&self, key: &str) -> Option<String> {
        self.state.lock().value(key)
    }

    /// Send a typed request to the central system and wait for the response
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response, CommandError> {
        self.pending
            .call(&self.outbound, request, self.config.request_timeout)
            .await
    }

    pub async fn boot_notification(&self) -> Result<BootNotificationResponse, CommandError> {
        let request = BootNotificationRequest {
            charge_point_vendor: self.config.vendor.clone(),
            charge_point_model: self.config.model.clone(),
            charge_point_serial_number: self.config.serial_number.clone(),
            firmware_version: self.config.firmware_version.clone(),
        };
        let response = self.call(&request).await?;
        info!(
            "[{}] BootNotification {:?}, heartbeat interval {}s",
            self.config.identity, response.status, response.interval
        );
        Ok(response)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, CommandError> {
        let response = self.call(&HeartbeatRequest {}).await?;
        debug!(
            "[{}] Heartbeat acknowledged at {}",
            self.config.identity, response.current_time
        );
        Ok(response)
    }

    pub async fn status_notification(
        &self,
        connector_id: i32,
        status: &str,
    ) -> Result<StatusNotificationResponse, CommandError> {
        let request = StatusNotificationRequest {
            connector_id,
            error_code: "NoError".to_string(),
            status: status.to_string(),
            timestamp: Some(chrono::Utc::now()),
            info: None,
        };
        self.call(&request).await
    }

    /// Boot, report connectors and heartbeat until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        let boot = self.boot_notification().await?;
        if boot.status != RegistrationStatus::Accepted {
            return Err(ClientError::NotAccepted(boot.status));
        }

        for connector_id in 1..=self.config.connectors {
            self.status_notification(connector_id, "Available").await?;
        }

        let period = Duration::from_secs(u64::try_from(boot.interval.max(1)).unwrap_or(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        tokio::pin!(shutdown);
        let mut closed = self.closed.clone();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[{}] Stopping simulator", self.config.identity);
                    return Ok(());
                }
                _ = closed.wait_for(|closed| *closed) => {
                    return Err(CommandError::ConnectionClosed.into());
                }
                _ = ticker.tick() => match self.heartbeat().await {
                    Ok(_) => {}
                    Err(CommandError::Timeout) => {
                        warn!("[{}] Heartbeat timed out", self.config.identity);
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Send a close frame and wait for both connection tasks
    pub async fn close(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let _ = self.writer.await;
        if tokio::time::timeout(Duration::from_secs(5), &mut self.reader)
            .await
            .is_err()
        {
            self.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::router::Router;
    use crate::session::tests::ws_pair;
    use crate::session::Session;
    use tokio_test::{assert_err, assert_ok};

    fn call(action: &str, payload: serde_json::Value) -> Call {
        Call {
            message_id: "cs-1".to_string(),
            action: action.to_string(),
            payload,
        }
    }

    fn result_payload(msg: OcppMessage) -> serde_json::Value {
        match msg {
            OcppMessage::CallResult(result) => result.payload,
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_build_ocpp_url() {
        assert_eq!(build_ocpp_url("ws://localhost:8080", "UKAGKHTV"), "ws://localhost:8080/UKAGKHTV");
        assert_eq!(build_ocpp_url("ws://localhost:8080/", "UKAGKHTV"), "ws://localhost:8080/UKAGKHTV");
    }

    #[test]
    fn test_get_configuration_reports_unknown_keys() {
        let mut state = ChargePointState::new(default_configuration());

        let all = result_payload(state.answer(&call("GetConfiguration", serde_json::json!({}))));
        assert_eq!(all["configurationKey"].as_array().unwrap().len(), 6);

        let some = result_payload(state.answer(&call(
            "GetConfiguration",
            serde_json::json!({"key": ["HeartbeatInterval", "Bogus"]}),
        )));
        assert_eq!(some["configurationKey"][0]["key"], "HeartbeatInterval");
        assert_eq!(some["unknownKey"], serde_json::json!(["Bogus"]));
    }

    #[test]
    fn test_change_configuration() {
        let mut state = ChargePointState::new(default_configuration());
        let change = |state: &mut ChargePointState, key: &str| {
            result_payload(state.answer(&call(
                "ChangeConfiguration",
                serde_json::json!({"key": key, "value": "30"}),
            )))["status"]
                .clone()
        };

        assert_eq!(change(&mut state, "HeartbeatInterval"), "Accepted");
        assert_eq!(state.value("HeartbeatInterval").as_deref(), Some("30"));
        assert_eq!(change(&mut state, "NumberOfConnectors"), "Rejected");
        assert_eq!(state.value("NumberOfConnectors").as_deref(), Some("1"));
        assert_eq!(change(&mut state, "Bogus"), "NotSupported");
    }

    #[test]
    fn test_set_charging_profile_stores_valid_profiles() {
        let mut state = ChargePointState::new(default_configuration());
        let profile = default_daily_profile();

        let payload = serde_json::json!({"connectorId": 1, "csChargingProfiles": profile});
        let reply = result_payload(state.answer(&call("SetChargingProfile", payload.clone())));
        assert_eq!(reply["status"], "Accepted");
        // same id on the same connector replaces
        state.answer(&call("SetChargingProfile", payload));
        assert_eq!(state.profiles().len(), 1);
        assert_eq!(state.profiles()[0].profile, default_daily_profile());

        let mut broken = default_daily_profile();
        broken.charging_schedule.charging_schedule_period.reverse();
        let reply = result_payload(state.answer(&call(
            "SetChargingProfile",
            serde_json::json!({"connectorId": 1, "csChargingProfiles": broken}),
        )));
        assert_eq!(reply["status"], "Rejected");
        assert_eq!(state.profiles().len(), 1);
    }

    #[test]
    fn test_unhandled_calls() {
        let mut state = ChargePointState::new(Vec::new());
        for (action, payload, code) in [
            ("RemoteStartTransaction", serde_json::json!({}), ErrorCode::NotImplemented),
            ("Heartbeat", serde_json::json!({}), ErrorCode::NotImplemented),
            ("ChangeConfiguration", serde_json::json!({"key": 1}), ErrorCode::FormationViolation),
        ] {
            match state.answer(&call(action, payload)) {
                OcppMessage::CallError(error) => {
                    assert_eq!(error.message_id, "cs-1");
                    assert_eq!(error.error_code, code);
                }
                other => panic!("expected CallError, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_boot_against_session() {
        let (session, handle) = Session::new(
            "CP_SIM",
            16,
            Arc::new(Router::new(15)),
            SessionRegistry::new(),
            3,
        );
        let (server, client) = ws_pair().await;
        let server_task = tokio::spawn(session.run(server));

        let sim = ChargePointClient::from_stream(
            SimulatorConfig::new("ws://unused", "CP_SIM"),
            client,
            Some(OCPP16_SUBPROTOCOL.to_string()),
        );
        let boot = assert_ok!(sim.boot_notification().await);
        assert_eq!(boot.status, RegistrationStatus::Accepted);
        assert_eq!(boot.interval, 15);
        assert_ok!(sim.status_notification(1, "Available").await);
        assert_eq!(handle.boot_info().unwrap().model, "Optimus");

        handle.close();
        server_task.await.unwrap();
        sim.closed().await;
        assert!(sim.is_closed());
        assert_err!(sim.heartbeat().await);
        sim.close().await;
    }
}
