//! # CSMS Core
//!
//! OCPP 1.6 JSON central system: accepts charge point WebSocket connections,
//! answers their requests and sends them commands.
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ WebSocket, subprotocol "ocpp1.6"
//!       ▼
//! ┌─────────────────────────────────────────────┐
//! │ Gateway      TCP accept, upgrade, negotiate │
//! │    │                                        │
//! │    ▼                                        │
//! │ CentralSystem::attach                       │
//! │    ├── SessionRegistry   identity -> handle │
//! │    ├── Session           inbound loop       │
//! │    │     ├── Router      Boot/Heartbeat/Status
//! │    │     └── PendingCalls  outbound replies │
//! │    └── Provisioner       once per identity  │
//! │          └── commands    SetChargingProfile,│
//! │                          ChangeConfiguration,
//! │                          GetConfiguration   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use csms_core::{CentralSystem, CentralSystemConfig, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let central = CentralSystem::new(CentralSystemConfig::new("0.0.0.0:8080"));
//!     let gateway = Gateway::bind(central).await?;
//!
//!     gateway
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod error;
pub mod correlation;
pub mod session;
pub mod registry;
pub mod router;
pub mod commands;
pub mod provisioning;
pub mod central;
pub mod gateway;
pub mod client;

pub use central::{AttachedSession, CentralSystem};
pub use client::{ChargePointClient, SimulatorConfig};
pub use config::{CentralSystemConfig, CommandTimeouts, ProvisioningConfig, OCPP16_SUBPROTOCOL};
pub use error::{ClientError, CommandError, GatewayError};
pub use gateway::Gateway;
pub use provisioning::{Provisioner, ProvisioningOutcome, ProvisioningState, ProvisioningStatus};
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{CloseReason, SessionHandle, SessionState};

// Re-export key protocol types
pub use ocpp::{
    Action, Call, CallError, CallResult, ChargingProfile, ErrorCode, OcppMessage,
    default_daily_profile,
};
