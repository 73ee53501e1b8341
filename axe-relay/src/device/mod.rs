//! Device status: the normalized snapshot and how it is fetched.
//!
//! Every field of [`DeviceSnapshot`] is optional. Firmwares differ in
//! what they report (a BitAxe has no block counters, older AxeOS builds
//! have no windowed hashrates), and a missing value stays missing rather
//! than turning into a zero that looks like a reading.

pub mod client;
pub mod layout;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::DeviceConfig;

pub use client::HttpClient;
pub use layout::LayoutKind;

/// Source of device snapshots.
///
/// The production implementation is [`HttpClient`]; tests substitute
/// scripted sources to drive the monitor without a network.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch and normalize the current status of one device.
    async fn fetch(&self, device: &DeviceConfig) -> Result<DeviceSnapshot, FetchError>;
}

/// Why a fetch produced no snapshot.
///
/// The variants fall into two classes that downstream logic treats
/// differently: the device could not be reached at all
/// ([`is_unreachable`](Self::is_unreachable)), or it answered with
/// something unusable. Only the first counts toward offline detection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("device answered with HTTP status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// The device did not answer (connect failure or timeout).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Unreachable(_))
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        if self.is_unreachable() {
            "unreachable"
        } else {
            "invalid_response"
        }
    }
}

/// One normalized status reading.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DeviceSnapshot {
    /// When the reading was taken (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,

    /// API shape the reading was parsed from.
    pub layout: LayoutKind,

    pub identity: Identity,
    pub hashrate: Hashrate,
    pub power: Power,
    pub thermal: Thermal,
    pub mining: Mining,
    pub stratum: Stratum,
    pub network: Network,
    pub system: System,
}

/// Hardware and firmware identification.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asic_model: Option<String>,
    /// Board model, e.g. "601" for a Gamma or "NerdQAxe++".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asic_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axe_os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idf_version: Option<String>,
}

/// Hashrates in GH/s.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Hashrate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_1m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_10m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_1h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_1d: Option<f64>,
    /// Nominal rate for the configured frequency and core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<f64>,
}

/// Electrical readings. Units follow AxeOS.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Power {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    /// Input voltage in millivolts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_mv: Option<f64>,
    /// Input current in milliamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_ma: Option<f64>,
    /// Configured ASIC core voltage in millivolts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_voltage_mv: Option<f64>,
    /// Measured ASIC core voltage in millivolts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_voltage_actual_mv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_mhz: Option<f64>,
}

impl Power {
    pub fn voltage_v(&self) -> Option<f64> {
        self.voltage_mv.map(|mv| mv / 1000.0)
    }
}

/// Temperatures (°C) and fan state.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Thermal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
    /// Voltage regulator temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vr_temp_c: Option<f64>,
    /// Fan controller target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temp_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_rpm: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overheat_mode: Option<bool>,
}

/// Share and difficulty counters.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Mining {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares_accepted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares_rejected: Option<u64>,
    /// All-time best difficulty as the device prints it ("4.29G").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_diff: Option<String>,
    /// Best difficulty since the device booted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_session_diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_difficulty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_blocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_found_blocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_hw_nonces: Option<u64>,
}

/// Pool connection.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Stratum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_port: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub using_fallback: Option<bool>,
    /// NerdAxe pool mode ("normal", "dual", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_balance: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct System {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Free heap in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<u64>,
}

impl DeviceSnapshot {
    /// Hashing efficiency in GH/W, when both inputs are known and power
    /// is non-zero.
    pub fn efficiency_gh_per_w(&self) -> Option<f64> {
        match (self.hashrate.current, self.power.power_w) {
            (Some(hashrate), Some(power)) if power > 0.0 => Some(hashrate / power),
            _ => None,
        }
    }
}
