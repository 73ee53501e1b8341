//! Per-device alert evaluation.
//!
//! Each poll result is fed to the device's [`DeviceAlerts`], which
//! decides whether any alert should go out. Every alert kind has its own
//! [`CooldownAlarm`], so a device that stays hot, or keeps dropping off
//! the network, produces one message per cooldown window rather than one
//! per poll.
//!
//! Offline detection is debounced: only consecutive *unreachable* fetches
//! count, and any successful fetch resets the count. A device that
//! answers with garbage is reachable and leaves the count alone.

use std::fmt;
use std::time::Duration;

use strum::{AsRefStr, Display};
use tokio::time::Instant;

use crate::device::{DeviceSnapshot, FetchError};
use crate::tracing::prelude::*;
use crate::types::{AlarmStatus, CooldownAlarm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    CriticalTemperature,
    CriticalVrTemperature,
    Offline,
}

impl AlertKind {
    pub fn icon(self) -> &'static str {
        match self {
            AlertKind::CriticalTemperature | AlertKind::CriticalVrTemperature => "🔥",
            AlertKind::Offline => "⚠️",
        }
    }
}

/// Fixed alert limits, shared by all devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// ASIC temperature (°C) at or above which to alert.
    pub critical_temp_c: f64,
    /// Voltage regulator temperature (°C) at or above which to alert.
    pub critical_vr_temp_c: f64,
    /// Consecutive unreachable fetches before a device is offline.
    pub offline_after: u32,
    /// Minimum time between two alerts of the same kind for one device.
    pub cooldown: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical_temp_c: 75.0,
            critical_vr_temp_c: 85.0,
            offline_after: 3,
            cooldown: Duration::from_secs(15 * 60),
        }
    }
}

/// One alert, ready to be rendered for the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub device: String,
    pub kind: AlertKind,
    pub description: String,
}

impl Alert {
    /// Message text, with a trailing `<@id>` mention when configured.
    pub fn render(&self, mention: Option<&str>) -> String {
        with_mention(self.to_string(), mention)
    }
}

/// Append the `<@id>` mention token to a channel message.
pub fn with_mention(text: String, mention: Option<&str>) -> String {
    match mention {
        Some(id) => format!("{text} <@{id}>"),
        None => text,
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind.icon(), self.device, self.description)
    }
}

/// Alert state for one device. Lives as long as the process.
#[derive(Debug)]
pub struct DeviceAlerts {
    device: String,
    thresholds: AlertThresholds,
    consecutive_failures: u32,
    temperature: CooldownAlarm,
    vr_temperature: CooldownAlarm,
    offline: CooldownAlarm,
}

impl DeviceAlerts {
    pub fn new(device: impl Into<String>, thresholds: AlertThresholds) -> Self {
        Self {
            device: device.into(),
            thresholds,
            consecutive_failures: 0,
            temperature: CooldownAlarm::new(thresholds.cooldown),
            vr_temperature: CooldownAlarm::new(thresholds.cooldown),
            offline: CooldownAlarm::new(thresholds.cooldown),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feed one poll result observed at `now` and return the alerts to
    /// send. Kinds are evaluated independently; several may fire at once.
    pub fn observe(
        &mut self,
        result: &Result<DeviceSnapshot, FetchError>,
        now: Instant,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        match result {
            Ok(snapshot) => {
                self.consecutive_failures = 0;
                let status = self.offline.check(false, now);
                self.note(AlertKind::Offline, status, None, &mut alerts);

                let temp = snapshot.thermal.temp_c;
                let hot = temp.is_some_and(|t| t >= self.thresholds.critical_temp_c);
                let status = self.temperature.check(hot, now);
                let description = temp.map(|t| format!("critical temperature {t}°C"));
                self.note(AlertKind::CriticalTemperature, status, description, &mut alerts);

                let vr_temp = snapshot.thermal.vr_temp_c;
                let hot = vr_temp.is_some_and(|t| t >= self.thresholds.critical_vr_temp_c);
                let status = self.vr_temperature.check(hot, now);
                let description = vr_temp.map(|t| format!("critical VR temperature {t}°C"));
                self.note(AlertKind::CriticalVrTemperature, status, description, &mut alerts);
            }
            Err(err) if err.is_unreachable() => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let offline = self.consecutive_failures >= self.thresholds.offline_after;
                let status = self.offline.check(offline, now);
                let description = format!(
                    "offline ({} consecutive failed checks)",
                    self.consecutive_failures
                );
                self.note(AlertKind::Offline, status, Some(description), &mut alerts);
            }
            Err(err) => {
                debug!(device = %self.device, error = %err, "Invalid response, offline count unchanged");
            }
        }

        alerts
    }

    fn note(
        &self,
        kind: AlertKind,
        status: AlarmStatus,
        description: Option<String>,
        alerts: &mut Vec<Alert>,
    ) {
        match status {
            AlarmStatus::Triggered => {
                let description = description.unwrap_or_else(|| kind.to_string());
                warn!(device = %self.device, kind = %kind, %description, "Alert triggered");
                alerts.push(Alert {
                    device: self.device.clone(),
                    kind,
                    description,
                });
            }
            AlarmStatus::Suppressed => {
                debug!(device = %self.device, kind = %kind, "Alert suppressed by cooldown");
            }
            AlarmStatus::Resolved => {
                info!(device = %self.device, kind = %kind, "Alert condition cleared");
            }
            AlarmStatus::Idle => {}
        }
    }
}
