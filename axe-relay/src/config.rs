//! Resolved runtime configuration.
//!
//! Settings come from an optional TOML file with environment variables
//! layered on top. Resolution happens once at startup; everything past
//! this module receives an immutable [`Settings`] and never looks at the
//! environment or the filesystem for configuration again.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Cycles closer together than this would hammer the devices and the
/// chat API's rate limits.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

const BEST_DIFF_FILE: &str = "best_difficulty.json";

/// Ordered metric boundaries, low to high.
///
/// How the boundaries map to indicator levels depends on the metric;
/// see [`crate::summary::Level`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<f64>")]
pub struct Thresholds(Vec<f64>);

impl Thresholds {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Config(format!(
                "thresholds must be finite numbers: {values:?}"
            )));
        }
        if values.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Config(format!(
                "thresholds must be ordered low to high: {values:?}"
            )));
        }
        Ok(Self(values))
    }

    /// Parse a comma-separated list such as `"60,65,70"`.
    pub fn parse_list(text: &str) -> Result<Self> {
        let values = text
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| Error::Config(format!("invalid threshold list: {text:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, count: usize, device: &str, metric: &str) -> Result<()> {
        if self.len() < count {
            return Err(Error::Config(format!(
                "device {device}: {metric} needs at least {count} thresholds, got {:?}",
                self.0
            )));
        }
        Ok(())
    }

    fn defaults(values: &[f64]) -> Self {
        Self(values.to_vec())
    }
}

impl TryFrom<Vec<f64>> for Thresholds {
    type Error = Error;

    fn try_from(values: Vec<f64>) -> Result<Self> {
        Self::new(values)
    }
}

/// One monitored device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Identity used in messages, the cache, and the best-difficulty file.
    pub name: String,

    /// Host or `host:port` of the device's AxeOS web server.
    pub address: String,

    /// Chip temperature boundaries (°C).
    pub temp_thresholds: Thresholds,

    /// Fan RPM boundaries. Only the first two are used for levels.
    pub fan_thresholds: Thresholds,

    /// ASIC core voltage boundaries (V).
    pub volt_thresholds: Thresholds,

    /// Voltage regulator temperature boundaries (°C).
    pub vr_temp_thresholds: Thresholds,
}

impl DeviceConfig {
    /// A device with the stock thresholds.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            temp_thresholds: Thresholds::defaults(&[60.0, 65.0, 70.0]),
            fan_thresholds: Thresholds::defaults(&[0.0, 2000.0, 3500.0, 7500.0]),
            volt_thresholds: Thresholds::defaults(&[0.95, 1.1, 1.3]),
            vr_temp_thresholds: Thresholds::defaults(&[65.0, 75.0, 80.0]),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("device with empty name".into()));
        }
        if self.address.trim().is_empty() {
            return Err(Error::Config(format!("device {}: empty address", self.name)));
        }
        self.temp_thresholds.require(3, &self.name, "temperature")?;
        self.fan_thresholds.require(2, &self.name, "fan")?;
        self.volt_thresholds.require(3, &self.name, "voltage")?;
        self.vr_temp_thresholds.require(3, &self.name, "VR temperature")?;
        Ok(())
    }
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Time between poll cycles. Never below [`MIN_UPDATE_INTERVAL`].
    pub update_interval: Duration,

    /// Chat user to mention on alerts and new records.
    pub mention_user_id: Option<String>,

    /// Directory holding the best-difficulty file.
    pub data_dir: PathBuf,

    /// Chat webhook; when absent, notifications only go to the log.
    pub webhook_url: Option<String>,

    /// Devices sorted by name.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            mention_user_id: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            webhook_url: None,
            devices: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from the process environment and the config file it names
    /// (`AXE_RELAY_CONFIG`, else `config.toml` if present).
    pub fn load() -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let path = env
            .get("AXE_RELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            info!(path = %path.display(), "Loaded configuration file");
            Some(toml::from_str::<FileConfig>(&text)?)
        } else {
            if env.contains_key("AXE_RELAY_CONFIG") {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            info!(
                path = %path.display(),
                "No configuration file, using environment only"
            );
            None
        };

        Self::resolve(file.unwrap_or_default(), &env)
    }

    /// Parse a TOML document and apply `env` on top.
    pub fn from_toml(text: &str, env: &HashMap<String, String>) -> Result<Self> {
        Self::resolve(toml::from_str(text)?, env)
    }

    /// Path of the persisted best-difficulty mapping.
    pub fn best_diff_path(&self) -> PathBuf {
        self.data_dir.join(BEST_DIFF_FILE)
    }

    fn resolve(file: FileConfig, env: &HashMap<String, String>) -> Result<Self> {
        let defaults = Settings::default();

        let mut interval_secs = file.update_interval;
        if let Some(raw) = env.get("UPDATE_INTERVAL") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => interval_secs = Some(secs),
                Err(_) => warn!(value = %raw, "Invalid UPDATE_INTERVAL, ignoring"),
            }
        }
        let update_interval = interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.update_interval);
        let update_interval = if update_interval < MIN_UPDATE_INTERVAL {
            warn!(
                requested = ?update_interval,
                minimum = ?MIN_UPDATE_INTERVAL,
                "Update interval too short, clamping"
            );
            MIN_UPDATE_INTERVAL
        } else {
            update_interval
        };

        let mention_user_id = non_empty(env.get("MENTION_USER_ID").cloned())
            .or_else(|| non_empty(file.mention_user_id));
        let webhook_url =
            non_empty(env.get("WEBHOOK_URL").cloned()).or_else(|| non_empty(file.webhook_url));
        let data_dir = env
            .get("AXE_RELAY_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or(defaults.data_dir);

        let mut devices = BTreeMap::new();
        for (name, entry) in file.devices {
            let mut device = DeviceConfig::new(name.clone(), entry.address);
            if let Some(t) = entry.temp_thresholds {
                device.temp_thresholds = t;
            }
            if let Some(t) = entry.fan_thresholds {
                device.fan_thresholds = t;
            }
            if let Some(t) = entry.volt_thresholds {
                device.volt_thresholds = t;
            }
            if let Some(t) = entry.vr_temp_thresholds {
                device.vr_temp_thresholds = t;
            }
            devices.insert(name, device);
        }
        apply_device_env(&mut devices, env)?;

        let devices: Vec<DeviceConfig> = devices.into_values().collect();
        for device in &devices {
            device.validate()?;
        }

        Ok(Self {
            update_interval,
            mention_user_id,
            data_dir,
            webhook_url,
            devices,
        })
    }
}

/// Devices declared as `DEVICE_<NAME>_IP`, with optional
/// `DEVICE_<NAME>_<METRIC>_THRESHOLDS` lists. `<NAME>` maps to a device
/// name by lowercasing and turning `_` into `-`, so
/// `DEVICE_BITAXE_GAMMA_IP` configures `bitaxe-gamma`.
fn apply_device_env(
    devices: &mut BTreeMap<String, DeviceConfig>,
    env: &HashMap<String, String>,
) -> Result<()> {
    for (key, address) in env {
        let Some(raw_name) = key
            .strip_prefix("DEVICE_")
            .and_then(|rest| rest.strip_suffix("_IP"))
        else {
            continue;
        };
        if raw_name.is_empty() {
            continue;
        }

        let name = raw_name.to_lowercase().replace('_', "-");
        let device = devices
            .entry(name.clone())
            .or_insert_with(|| DeviceConfig::new(name.clone(), ""));
        device.address = address.trim().to_string();

        let prefix = format!("DEVICE_{raw_name}_");
        let lookup = |metric: &str| env.get(&format!("{prefix}{metric}_THRESHOLDS"));
        if let Some(list) = lookup("TEMP") {
            device.temp_thresholds = Thresholds::parse_list(list)?;
        }
        if let Some(list) = lookup("FAN") {
            device.fan_thresholds = Thresholds::parse_list(list)?;
        }
        if let Some(list) = lookup("VOLT") {
            device.volt_thresholds = Thresholds::parse_list(list)?;
        }
        if let Some(list) = lookup("VR_TEMP") {
            device.vr_temp_thresholds = Thresholds::parse_list(list)?;
        }
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// On-disk layout of the TOML file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    update_interval: Option<u64>,
    mention_user_id: Option<String>,
    data_dir: Option<PathBuf>,
    webhook_url: Option<String>,
    #[serde(default)]
    devices: BTreeMap<String, FileDevice>,
}

#[derive(Debug, Deserialize)]
struct FileDevice {
    #[serde(alias = "ip")]
    address: String,
    temp_thresholds: Option<Thresholds>,
    fan_thresholds: Option<Thresholds>,
    volt_thresholds: Option<Thresholds>,
    vr_temp_thresholds: Option<Thresholds>,
}
