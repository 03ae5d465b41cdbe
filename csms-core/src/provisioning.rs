//! One-time provisioning of newly seen charge points
//!
//! The first connection of an identity claims it in [`ProvisioningStatus`];
//! that connection installs the default charging profile, applies any
//! configured ChangeConfiguration steps and optionally reads back the full
//! configuration. The identity is marked done whatever the charge point
//! answered, so provisioning happens at most once per identity for the
//! lifetime of the status table. Reconnects are never re-provisioned.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::commands;
use crate::config::ProvisioningConfig;
use crate::error::CommandError;
use crate::ocpp::{ChargingProfileStatus, ConfigurationStatus, GetConfigurationResponse};
use crate::session::SessionHandle;

/// Provisioning progress of one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    InProgress,
    Done,
}

/// Identity -> provisioning state, shared by all sessions
#[derive(Debug, Clone, Default)]
pub struct ProvisioningStatus {
    states: Arc<Mutex<HashMap<String, ProvisioningState>>>,
}

impl ProvisioningStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identity`. Only the first caller ever gets `true`.
    pub fn begin(&self, identity: &str) -> bool {
        let mut states = self.states.lock();
        if states.contains_key(identity) {
            return false;
        }
        states.insert(identity.to_string(), ProvisioningState::InProgress);
        true
    }

    pub fn complete(&self, identity: &str) {
        self.states
            .lock()
            .insert(identity.to_string(), ProvisioningState::Done);
    }

    pub fn state(&self, identity: &str) -> Option<ProvisioningState> {
        self.states.lock().get(identity).copied()
    }

    pub fn is_provisioned(&self, identity: &str) -> bool {
        self.state(identity) == Some(ProvisioningState::Done)
    }
}

/// What a provisioning run sent and what came back
#[derive(Debug, Default)]
pub struct ProvisioningReport {
    pub profile: Option<Result<ChargingProfileStatus, CommandError>>,
    pub changes: Vec<(String, Result<ConfigurationStatus, CommandError>)>,
    pub configuration: Option<Result<GetConfigurationResponse, CommandError>>,
}

/// Result of [`Provisioner::provision`]
#[derive(Debug)]
pub enum ProvisioningOutcome {
    /// Another connection already claimed this identity
    AlreadyProvisioned,
    /// Provisioning disabled or identity not targeted; marked done anyway
    Skipped,
    /// Commands were sent
    Completed(ProvisioningReport),
}

/// Runs the provisioning plan against a session
#[derive(Debug, Clone)]
pub struct Provisioner {
    config: Arc<ProvisioningConfig>,
    status: ProvisioningStatus,
}

impl Provisioner {
    pub fn new(config: ProvisioningConfig, status: ProvisioningStatus) -> Self {
        Self {
            config: Arc::new(config),
            status,
        }
    }

    pub fn status(&self) -> &ProvisioningStatus {
        &self.status
    }

    pub async fn provision(&self, session: &SessionHandle) -> ProvisioningOutcome {
        let identity = session.identity();
        if !self.status.begin(identity) {
            info!("[{}] Already provisioned, skipping", identity);
            return ProvisioningOutcome::AlreadyProvisioned;
        }

        if !self.config.enabled || !self.config.targets(identity) {
            self.status.complete(identity);
            info!("[{}] Not a provisioning target", identity);
            return ProvisioningOutcome::Skipped;
        }

        info!("[{}] Provisioning new charge point", identity);
        let report = self.run_plan(session).await;
        self.status.complete(identity);

        let failures = report.failures();
        if failures == 0 {
            info!("[{}] Provisioning finished", identity);
        } else {
            warn!(
                "[{}] Provisioning finished with {} failed step(s); not retrying",
                identity, failures
            );
        }

        ProvisioningOutcome::Completed(report)
    }

    async fn run_plan(&self, session: &SessionHandle) -> ProvisioningReport {
        let timeouts = self.config.timeouts;
        let mut report = ProvisioningReport::default();

        if let Some(profile) = &self.config.profile {
            report.profile = Some(
                commands::set_charging_profile(
                    session,
                    self.config.connector_id,
                    profile.clone(),
                    timeouts.set_charging_profile,
                )
                .await,
            );
        }

        for (key, value) in &self.config.configuration_changes {
            let result =
                commands::change_configuration(session, key, value, timeouts.change_configuration)
                    .await;
            report.changes.push((key.clone(), result));
        }

        if self.config.fetch_configuration {
            report.configuration = Some(
                commands::get_configuration(session, Vec::new(), timeouts.get_configuration).await,
            );
        }

        report
    }
}

impl ProvisioningReport {
    /// Steps that errored or were not accepted
    pub fn failures(&self) -> usize {
        let profile = match &self.profile {
            Some(Ok(ChargingProfileStatus::Accepted)) | None => 0,
            Some(_) => 1,
        };
        let changes = self
            .changes
            .iter()
            .filter(|(_, r)| {
                !matches!(
                    r,
                    Ok(ConfigurationStatus::Accepted) | Ok(ConfigurationStatus::RebootRequired)
                )
            })
            .count();
        let configuration = usize::from(matches!(self.configuration, Some(Err(_))));
        profile + changes + configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandTimeouts;
    use crate::ocpp::{default_daily_profile, CallResult, OcppMessage};
    use crate::registry::SessionRegistry;
    use crate::router::Router;
    use crate::session::tests::{next_message, send, ws_pair};
    use crate::session::Session;
    use std::time::Duration;

    fn plan() -> ProvisioningConfig {
        ProvisioningConfig {
            configuration_changes: vec![("HeartbeatInterval".into(), "30".into())],
            timeouts: CommandTimeouts::uniform(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_claims_once() {
        let status = ProvisioningStatus::new();
        assert!(status.begin("UKAGKHTV"));
        assert!(!status.begin("UKAGKHTV"));
        assert_eq!(status.state("UKAGKHTV"), Some(ProvisioningState::InProgress));
        status.complete("UKAGKHTV");
        assert!(status.is_provisioned("UKAGKHTV"));
        assert!(!status.begin("UKAGKHTV"));
        assert!(status.state("UKF78PEM").is_none());
    }

    #[tokio::test]
    async fn test_plan_order_and_report() {
        let (session, handle) = Session::new(
            "UKAGKHTV",
            16,
            Arc::new(Router::new(10)),
            SessionRegistry::new(),
            3,
        );
        let (server, mut client) = ws_pair().await;
        tokio::spawn(session.run(server));

        let provisioner = Provisioner::new(plan(), ProvisioningStatus::new());
        let task = {
            let provisioner = provisioner.clone();
            let handle = handle.clone();
            tokio::spawn(async move { provisioner.provision(&handle).await })
        };

        let replies = [
            ("SetChargingProfile", serde_json::json!({"status": "Rejected"})),
            ("ChangeConfiguration", serde_json::json!({"status": "Accepted"})),
            ("GetConfiguration", serde_json::json!({})),
        ];
        for (action, payload) in replies {
            let call = match next_message(&mut client).await {
                OcppMessage::Call(call) => call,
                other => panic!("expected Call, got {:?}", other),
            };
            assert_eq!(call.action, action);
            if action == "SetChargingProfile" {
                assert_eq!(call.payload["connectorId"], 1);
                assert_eq!(
                    call.payload["csChargingProfiles"],
                    serde_json::to_value(default_daily_profile()).unwrap()
                );
            }
            send(
                &mut client,
                OcppMessage::CallResult(CallResult {
                    message_id: call.message_id,
                    payload,
                }),
            )
            .await;
        }

        match task.await.unwrap() {
            ProvisioningOutcome::Completed(report) => {
                assert!(matches!(
                    report.profile,
                    Some(Ok(ChargingProfileStatus::Rejected))
                ));
                assert_eq!(report.changes.len(), 1);
                assert!(matches!(report.configuration, Some(Ok(_))));
                assert_eq!(report.failures(), 1);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        // rejected profile still counts as provisioned
        assert!(provisioner.status().is_provisioned("UKAGKHTV"));
        assert!(matches!(
            provisioner.provision(&handle).await,
            ProvisioningOutcome::AlreadyProvisioned
        ));
    }

    #[tokio::test]
    async fn test_untargeted_identity_is_marked_without_commands() {
        let (_session, handle) = Session::new(
            "UKF78PEM",
            16,
            Arc::new(Router::new(10)),
            SessionRegistry::new(),
            3,
        );
        let config = ProvisioningConfig {
            targets: vec!["UKAGKHTV".into()],
            ..plan()
        };
        let provisioner = Provisioner::new(config, ProvisioningStatus::new());

        assert!(matches!(
            provisioner.provision(&handle).await,
            ProvisioningOutcome::Skipped
        ));
        assert!(provisioner.status().is_provisioned("UKF78PEM"));
        assert!(handle.pending().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_still_marks_done() {
        let (session, handle) = Session::new(
            "CP_9",
            16,
            Arc::new(Router::new(10)),
            SessionRegistry::new(),
            3,
        );
        let (server, client) = ws_pair().await;
        let run = tokio::spawn(session.run(server));
        drop(client);
        run.await.unwrap();

        let provisioner = Provisioner::new(plan(), ProvisioningStatus::new());
        match provisioner.provision(&handle).await {
            ProvisioningOutcome::Completed(report) => {
                assert!(matches!(
                    report.profile,
                    Some(Err(CommandError::ConnectionClosed))
                ));
                assert_eq!(report.failures(), 3);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
        assert!(provisioner.status().is_provisioned("CP_9"));
    }
}
