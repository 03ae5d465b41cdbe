//! Configuration for the central system
//!
//! Combines listener settings, protocol behaviour and the one-time
//! provisioning plan applied to newly seen charge points.

use std::time::Duration;

use crate::ocpp::{default_daily_profile, ChargingProfile};

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Complete central system configuration
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    /// Listen address (host:port)
    pub listen_addr: String,

    /// Subprotocols the server accepts, in order of preference
    pub subprotocols: Vec<String>,

    /// Heartbeat interval handed out in BootNotification responses (seconds)
    pub heartbeat_interval: i32,

    /// Consecutive undecodable frames tolerated before a session is closed
    pub max_decode_failures: u32,

    /// Outbound frame queue depth per session
    pub outbound_queue: usize,

    /// How long shutdown waits for sessions and handshakes before aborting them
    pub shutdown_grace: Duration,

    /// One-time provisioning plan
    pub provisioning: ProvisioningConfig,
}

/// What to send to a charge point the first time it connects
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Master switch; when off, identities are still marked provisioned
    pub enabled: bool,

    /// Identities to provision (empty = every identity)
    pub targets: Vec<String>,

    /// Connector the default profile is installed on
    pub connector_id: i32,

    /// Profile sent with SetChargingProfile (None = skip)
    pub profile: Option<ChargingProfile>,

    /// ChangeConfiguration key/value pairs, applied in order
    pub configuration_changes: Vec<(String, String)>,

    /// Fetch all configuration keys after applying changes
    pub fetch_configuration: bool,

    /// Per-command timeouts
    pub timeouts: CommandTimeouts,
}

/// Timeouts for outbound commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub get_configuration: Duration,
    pub change_configuration: Duration,
    pub set_charging_profile: Duration,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            subprotocols: vec![OCPP16_SUBPROTOCOL.to_string()],
            heartbeat_interval: 10,
            max_decode_failures: 3,
            outbound_queue: 64,
            shutdown_grace: Duration::from_secs(5),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: Vec::new(),
            connector_id: 1,
            profile: Some(default_daily_profile()),
            configuration_changes: Vec::new(),
            fetch_configuration: true,
            timeouts: CommandTimeouts::default(),
        }
    }
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            get_configuration: Duration::from_secs(120),
            change_configuration: Duration::from_secs(120),
            set_charging_profile: Duration::from_secs(180),
        }
    }
}

impl CommandTimeouts {
    /// Use the same timeout for every command
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            get_configuration: timeout,
            change_configuration: timeout,
            set_charging_profile: timeout,
        }
    }
}

impl ProvisioningConfig {
    /// Whether `identity` is covered by the target list
    pub fn targets(&self, identity: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| t == identity)
    }
}

impl CentralSystemConfig {
    /// Create config listening on `listen_addr`
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Replace the accepted subprotocol list
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set heartbeat interval (seconds, clamped to at least 1)
    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds.max(1);
        self
    }

    pub fn with_max_decode_failures(mut self, failures: u32) -> Self {
        self.max_decode_failures = failures.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_provisioning(mut self, provisioning: ProvisioningConfig) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Restrict provisioning to one more identity
    pub fn with_provisioning_target(mut self, identity: impl Into<String>) -> Self {
        self.provisioning.targets.push(identity.into());
        self
    }

    /// Add a ChangeConfiguration step to provisioning
    pub fn with_configuration_change(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.provisioning
            .configuration_changes
            .push((key.into(), value.into()));
        self
    }

    /// Disable one-time provisioning
    pub fn without_provisioning(mut self) -> Self {
        self.provisioning.enabled = false;
        self
    }
}
