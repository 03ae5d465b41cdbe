//! Outbound commands to a charge point
//!
//! Thin typed wrappers over [`SessionHandle::call`] that log the outcome.
//! Nothing here retries: a rejection or timeout is reported once and
//! returned to the caller.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::CommandError;
use crate::ocpp::*;
use crate::session::SessionHandle;

/// Fetch configuration keys; an empty `keys` list asks for everything
pub async fn get_configuration(
    session: &SessionHandle,
    keys: Vec<String>,
    timeout: Duration,
) -> Result<GetConfigurationResponse, CommandError> {
    let request = GetConfigurationRequest { key: keys };
    let result = session.call(&request, timeout).await;

    match &result {
        Ok(response) => {
            if response.configuration_key.is_empty() {
                warn!("[{}] No configuration keys were returned", session.identity());
            } else {
                info!("[{}] Received configuration keys:", session.identity());
                for entry in &response.configuration_key {
                    info!(
                        "[{}] Key: {}, Value: {}, Readonly: {}",
                        session.identity(),
                        entry.key,
                        entry.value.as_deref().unwrap_or("Not set"),
                        entry.readonly
                    );
                }
            }
            for key in &response.unknown_key {
                warn!("[{}] Unknown key: {}", session.identity(), key);
            }
        }
        Err(e) => log_failure(session, Action::GetConfiguration, e),
    }

    result
}

/// Change one configuration key
pub async fn change_configuration(
    session: &SessionHandle,
    key: &str,
    value: &str,
    timeout: Duration,
) -> Result<ConfigurationStatus, CommandError> {
    let request = ChangeConfigurationRequest {
        key: key.to_string(),
        value: value.to_string(),
    };
    let result = session.call(&request, timeout).await.map(|r| r.status);

    match &result {
        Ok(ConfigurationStatus::Accepted) => {
            info!("[{}] Configuration key '{}' changed to '{}'", session.identity(), key, value)
        }
        Ok(ConfigurationStatus::RebootRequired) => info!(
            "[{}] Configuration key '{}' changed, but a reboot is required",
            session.identity(),
            key
        ),
        Ok(ConfigurationStatus::Rejected) => error!(
            "[{}] ChangeConfiguration request for key '{}' was rejected",
            session.identity(),
            key
        ),
        Ok(ConfigurationStatus::NotSupported) => warn!(
            "[{}] ChangeConfiguration: key '{}' is not supported",
            session.identity(),
            key
        ),
        Err(e) => log_failure(session, Action::ChangeConfiguration, e),
    }

    result
}

/// Install a charging profile on `connector_id` (0 = whole charge point)
pub async fn set_charging_profile(
    session: &SessionHandle,
    connector_id: i32,
    profile: ChargingProfile,
    timeout: Duration,
) -> Result<ChargingProfileStatus, CommandError> {
    let profile_id = profile.charging_profile_id;
    let request = SetChargingProfileRequest {
        connector_id,
        cs_charging_profiles: profile,
    };
    let result = session.call(&request, timeout).await.map(|r| r.status);

    match &result {
        Ok(ChargingProfileStatus::Accepted) => info!(
            "[{}] Charging profile {} set on connector {}",
            session.identity(),
            profile_id,
            connector_id
        ),
        Ok(status) => error!(
            "[{}] Failed to set charging profile {}: {:?}",
            session.identity(),
            profile_id,
            status
        ),
        Err(e) => log_failure(session, Action::SetChargingProfile, e),
    }

    result
}

fn log_failure(session: &SessionHandle, action: Action, e: &CommandError) {
    match e {
        CommandError::Timeout => error!(
            "[{}] Timed out waiting for the {} response",
            session.identity(),
            action
        ),
        _ => error!("[{}] {} failed: {}", session.identity(), action, e),
    }
}
