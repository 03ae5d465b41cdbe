//! OCPP 1.6 message types
//!
//! Payload types for the actions the central system handles:
//! - BootNotification / Heartbeat / StatusNotification (CP -> CS)
//! - GetConfiguration / ChangeConfiguration / SetChargingProfile (CS -> CP)

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Enumerations
// ============================================================================

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// ChangeConfiguration result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationStatus {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}

/// SetChargingProfile result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileStatus {
    Accepted,
    Rejected,
    NotSupported,
}

/// Charging profile purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

/// Charging profile kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

/// Charging rate unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

/// Recurrency kind for recurring profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

/// Coarse connector state derived from a StatusNotification `status` string.
///
/// Unknown strings map to `Other` instead of failing deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Available,
    Occupied,
    Faulted,
    Other,
}

impl ConnectorState {
    pub fn classify(status: &str) -> Self {
        match status {
            "Available" => ConnectorState::Available,
            "Occupied" | "Preparing" | "Charging" | "SuspendedEV" | "SuspendedEVSE"
            | "Finishing" => ConnectorState::Occupied,
            "Faulted" => ConnectorState::Faulted,
            _ => ConnectorState::Other,
        }
    }
}

// ============================================================================
// Complex Types
// ============================================================================

/// One entry of a GetConfiguration response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationEntry {
    pub key: String,
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Charging schedule period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    /// Offset in seconds from the start of the schedule
    pub start_period: i32,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
}

/// Charging schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

/// Reasons a charging schedule is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("schedule has no periods")]
    Empty,

    #[error("first period must start at offset 0, got {0}")]
    NonZeroStart(i32),

    #[error("period offsets must be strictly increasing ({previous} then {next})")]
    NotIncreasing { previous: i32, next: i32 },

    #[error("period at offset {start} lies outside the {duration}s schedule")]
    BeyondDuration { start: i32, duration: i32 },

    #[error("period at offset {start} has invalid limit {limit}")]
    InvalidLimit { start: i32, limit: f64 },
}

impl ChargingSchedule {
    /// Check the period list: starts at 0, strictly increasing offsets,
    /// finite non-negative limits, all offsets inside `duration` if set.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        let first = self
            .charging_schedule_period
            .first()
            .ok_or(ScheduleError::Empty)?;
        if first.start_period != 0 {
            return Err(ScheduleError::NonZeroStart(first.start_period));
        }

        for pair in self.charging_schedule_period.windows(2) {
            if pair[1].start_period <= pair[0].start_period {
                return Err(ScheduleError::NotIncreasing {
                    previous: pair[0].start_period,
                    next: pair[1].start_period,
                });
            }
        }

        for period in &self.charging_schedule_period {
            if !period.limit.is_finite() || period.limit < 0.0 {
                return Err(ScheduleError::InvalidLimit {
                    start: period.start_period,
                    limit: period.limit,
                });
            }
            if let Some(duration) = self.duration {
                if period.start_period >= duration {
                    return Err(ScheduleError::BeyondDuration {
                        start: period.start_period,
                        duration,
                    });
                }
            }
        }

        Ok(())
    }

    /// Start offsets in order
    pub fn offsets(&self) -> Vec<i32> {
        self.charging_schedule_period
            .iter()
            .map(|p| p.start_period)
            .collect()
    }
}

/// Charging profile (`csChargingProfiles` in SetChargingProfile)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    /// `None` applies the profile to all transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    /// Higher stack level wins
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<RecurrencyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

/// Seconds in one daily recurrence
pub const DAY_SECONDS: i32 = 86_400;

/// Builder for recurring daily TxDefault profiles
#[derive(Debug, Clone)]
pub struct DailyProfileBuilder {
    profile_id: i32,
    stack_level: i32,
    unit: ChargingRateUnit,
    start_schedule: DateTime<Utc>,
    periods: Vec<(i32, f64)>,
}

impl DailyProfileBuilder {
    pub fn new(profile_id: i32, start_schedule: DateTime<Utc>) -> Self {
        Self {
            profile_id,
            stack_level: 0,
            unit: ChargingRateUnit::A,
            start_schedule,
            periods: Vec::new(),
        }
    }

    pub fn stack_level(mut self, level: i32) -> Self {
        self.stack_level = level;
        self
    }

    pub fn unit(mut self, unit: ChargingRateUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Append a period; the limit stays in effect until the next period
    /// or the end of the day.
    pub fn period(mut self, start_offset: i32, limit: f64) -> Self {
        self.periods.push((start_offset, limit));
        self
    }

    pub fn build(self) -> Result<ChargingProfile, ScheduleError> {
        let schedule = ChargingSchedule {
            duration: Some(DAY_SECONDS),
            start_schedule: Some(self.start_schedule),
            charging_rate_unit: self.unit,
            charging_schedule_period: self
                .periods
                .into_iter()
                .map(|(start_period, limit)| ChargingSchedulePeriod {
                    start_period,
                    limit,
                    number_phases: None,
                })
                .collect(),
            min_charging_rate: None,
        };
        schedule.validate()?;

        Ok(ChargingProfile {
            charging_profile_id: self.profile_id,
            transaction_id: None,
            stack_level: self.stack_level,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: ChargingProfileKind::Recurring,
            recurrency_kind: Some(RecurrencyKind::Daily),
            valid_from: None,
            valid_to: None,
            charging_schedule: schedule,
        })
    }
}

/// Default daily schedule: (offset seconds, amps)
pub const DEFAULT_DAILY_PERIODS: [(i32, f64); 5] = [
    (0, 8.7),
    (7200, 17.4),
    (14400, 21.7),
    (21600, 28.3),
    (30600, 0.0),
];

/// Default TxDefault profile installed on first connection: a 13:30 UTC
/// anchored daily ramp, off from 22:00 until the next cycle.
pub fn default_daily_profile() -> ChargingProfile {
    let start = Utc
        .with_ymd_and_hms(2024, 8, 23, 13, 30, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let builder = DEFAULT_DAILY_PERIODS
        .iter()
        .fold(DailyProfileBuilder::new(1, start), |b, &(offset, limit)| {
            b.period(offset, limit)
        });

    match builder.build() {
        Ok(profile) => profile,
        // DEFAULT_DAILY_PERIODS is a valid schedule
        Err(e) => unreachable!("default schedule invalid: {e}"),
    }
}

// ============================================================================
// Request Messages
// ============================================================================

/// BootNotification request (CP -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

/// Heartbeat request (CP -> CS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

/// StatusNotification request (CP -> CS)
///
/// `status` stays a string so unknown values reach the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: i32,
    pub error_code: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// GetConfiguration request (CS -> CP); empty `key` means all keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
}

/// ChangeConfiguration request (CS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfigurationRequest {
    pub key: String,
    pub value: String,
}

/// SetChargingProfile request (CS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub connector_id: i32,
    pub cs_charging_profiles: ChargingProfile,
}

// ============================================================================
// Response Messages
// ============================================================================

/// BootNotification response (CS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
}

/// Heartbeat response (CS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// StatusNotification response (CS -> CP)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

/// GetConfiguration response (CP -> CS)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigurationResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configuration_key: Vec<ConfigurationEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_key: Vec<String>,
}

/// ChangeConfiguration response (CP -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigurationResponse {
    pub status: ConfigurationStatus,
}

/// SetChargingProfile response (CP -> CS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
}
