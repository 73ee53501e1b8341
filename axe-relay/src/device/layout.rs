//! Response layouts of the device status endpoint.
//!
//! BitAxe firmwares return one flat JSON object. NerdAxe firmwares group
//! pool state under a `stratum` object and spell a few fields
//! differently. Both are described here as tables mapping each logical
//! field to the JSON paths that may hold it, tried in order.
//!
//! Layouts are checked in [`LAYOUTS`] order and the first whose
//! detector matches is used. The flat layout matches any object, so it
//! goes last.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::{
    DeviceSnapshot, FetchError, Hashrate, Identity, Mining, Network, Power, Stratum, System,
    Thermal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Nested,
    Flat,
}

/// A JSON path from the document root.
type Path = &'static [&'static str];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Hostname,
    AsicModel,
    DeviceModel,
    AsicCount,
    FirmwareVersion,
    AxeOsVersion,
    IdfVersion,

    HashRate,
    HashRate1m,
    HashRate10m,
    HashRate1h,
    HashRate1d,
    ExpectedHashRate,

    Power,
    Voltage,
    Current,
    CoreVoltage,
    CoreVoltageActual,
    Frequency,

    Temp,
    VrTemp,
    TargetTemp,
    FanSpeed,
    FanRpm,
    OverheatMode,

    SharesAccepted,
    SharesRejected,
    BestDiff,
    BestSessionDiff,
    PoolDifficulty,
    FoundBlocks,
    TotalFoundBlocks,
    DuplicateHwNonces,

    StratumUrl,
    StratumPort,
    StratumUser,
    FallbackUrl,
    FallbackPort,
    FallbackUser,
    UsingFallback,
    PoolMode,
    PoolBalance,

    Ip,
    Mac,
    Ssid,
    WifiStatus,
    WifiRssi,

    Uptime,
    FreeHeap,
}

struct Layout {
    kind: LayoutKind,
    detect: fn(&Map<String, Value>) -> bool,
    paths: fn(Field) -> &'static [Path],
}

const NESTED: Layout = Layout {
    kind: LayoutKind::Nested,
    detect: |root| root.get("stratum").is_some_and(Value::is_object),
    paths: nested_paths,
};

const FLAT: Layout = Layout {
    kind: LayoutKind::Flat,
    detect: |_| true,
    paths: flat_paths,
};

const LAYOUTS: &[Layout] = &[NESTED, FLAT];

fn flat_paths(field: Field) -> &'static [Path] {
    use Field::*;
    match field {
        Hostname => &[&["hostname"]],
        AsicModel => &[&["ASICModel"]],
        DeviceModel => &[&["deviceModel"], &["boardVersion"]],
        AsicCount => &[&["asicCount"]],
        FirmwareVersion => &[&["version"]],
        AxeOsVersion => &[&["axeOSVersion"]],
        IdfVersion => &[&["idfVersion"]],

        HashRate => &[&["hashRate"]],
        HashRate1m => &[&["hashRate_1m"]],
        HashRate10m => &[&["hashRate_10m"]],
        HashRate1h => &[&["hashRate_1h"]],
        HashRate1d => &[&["hashRate_1d"]],
        ExpectedHashRate => &[&["expectedHashrate"]],

        Power => &[&["power"]],
        Voltage => &[&["voltage"]],
        Current => &[&["current"]],
        CoreVoltage => &[&["coreVoltage"]],
        CoreVoltageActual => &[&["coreVoltageActual"], &["coreVoltageActualMV"]],
        Frequency => &[&["frequency"]],

        Temp => &[&["temp"]],
        VrTemp => &[&["vrTemp"]],
        TargetTemp => &[&["temptarget"], &["pidTargetTemp"]],
        FanSpeed => &[&["fanspeed"]],
        FanRpm => &[&["fanrpm"]],
        OverheatMode => &[&["overheat_mode"]],

        SharesAccepted => &[&["sharesAccepted"]],
        SharesRejected => &[&["sharesRejected"]],
        BestDiff => &[&["bestDiff"]],
        BestSessionDiff => &[&["bestSessionDiff"]],
        PoolDifficulty => &[&["poolDifficulty"]],
        FoundBlocks => &[&["foundBlocks"]],
        TotalFoundBlocks => &[&["totalFoundBlocks"]],
        DuplicateHwNonces => &[&["duplicateHWNonces"]],

        StratumUrl => &[&["stratumURL"]],
        StratumPort => &[&["stratumPort"]],
        StratumUser => &[&["stratumUser"]],
        FallbackUrl => &[&["fallbackStratumURL"]],
        FallbackPort => &[&["fallbackStratumPort"]],
        FallbackUser => &[&["fallbackStratumUser"]],
        UsingFallback => &[&["isUsingFallbackStratum"]],
        PoolMode | PoolBalance => &[],

        Ip => &[&["ip"], &["hostip"]],
        Mac => &[&["macAddr"], &["mac"]],
        Ssid => &[&["ssid"]],
        WifiStatus => &[&["wifiStatus"]],
        WifiRssi => &[&["wifiRSSI"]],

        Uptime => &[&["uptimeSeconds"]],
        FreeHeap => &[&["freeHeap"]],
    }
}

/// NerdAxe keeps pool state under `stratum`; everything else is shared
/// with the flat layout, so top-level keys are still consulted.
fn nested_paths(field: Field) -> &'static [Path] {
    use Field::*;
    match field {
        PoolDifficulty => &[&["stratum", "poolDifficulty"], &["poolDifficulty"]],
        UsingFallback => &[&["stratum", "usingFallback"], &["isUsingFallbackStratum"]],
        PoolMode => &[&["stratum", "poolMode"]],
        PoolBalance => &[&["stratum", "poolBalance"]],
        BestDiff => &[&["bestDiff"], &["stratum", "totalBestDiff"]],
        other => flat_paths(other),
    }
}

/// Read-only view of one response under a chosen layout.
struct Reader<'a> {
    root: &'a Map<String, Value>,
    layout: &'static Layout,
}

impl<'a> Reader<'a> {
    /// First non-null value found along the field's paths.
    fn value(&self, field: Field) -> Option<&'a Value> {
        (self.layout.paths)(field)
            .iter()
            .filter_map(|path| lookup(self.root, path))
            .find(|value| !value.is_null())
    }

    fn text(&self, field: Field) -> Option<String> {
        match self.value(field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn float(&self, field: Field) -> Option<f64> {
        let value = match self.value(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        value.filter(|v: &f64| v.is_finite())
    }

    fn unsigned(&self, field: Field) -> Option<u64> {
        match self.value(field)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn signed(&self, field: Field) -> Option<i64> {
        match self.value(field)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn flag(&self, field: Field) -> Option<bool> {
        match self.value(field)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            _ => None,
        }
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, path: Path) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(root.get(*first)?, |value, key| value.get(*key))
}

/// Normalize a status response into a [`DeviceSnapshot`].
///
/// Only a non-object document is an error. Missing or mistyped fields
/// are left empty.
pub fn parse(raw: &Value, captured_at: OffsetDateTime) -> Result<DeviceSnapshot, FetchError> {
    let root = raw.as_object().ok_or_else(|| {
        FetchError::InvalidResponse(format!("expected a JSON object, got {}", type_name(raw)))
    })?;

    let layout = LAYOUTS
        .iter()
        .find(|layout| (layout.detect)(root))
        .unwrap_or(&FLAT);
    let r = Reader { root, layout };

    Ok(DeviceSnapshot {
        captured_at,
        layout: layout.kind,
        identity: Identity {
            hostname: r.text(Field::Hostname),
            asic_model: r.text(Field::AsicModel),
            device_model: r.text(Field::DeviceModel),
            asic_count: r.unsigned(Field::AsicCount),
            firmware_version: r.text(Field::FirmwareVersion),
            axe_os_version: r.text(Field::AxeOsVersion),
            idf_version: r.text(Field::IdfVersion),
        },
        hashrate: Hashrate {
            current: r.float(Field::HashRate),
            avg_1m: r.float(Field::HashRate1m),
            avg_10m: r.float(Field::HashRate10m),
            avg_1h: r.float(Field::HashRate1h),
            avg_1d: r.float(Field::HashRate1d),
            expected: r.float(Field::ExpectedHashRate),
        },
        power: Power {
            power_w: r.float(Field::Power),
            voltage_mv: r.float(Field::Voltage),
            current_ma: r.float(Field::Current),
            core_voltage_mv: r.float(Field::CoreVoltage),
            core_voltage_actual_mv: r.float(Field::CoreVoltageActual),
            frequency_mhz: r.float(Field::Frequency),
        },
        thermal: Thermal {
            temp_c: r.float(Field::Temp),
            vr_temp_c: r.float(Field::VrTemp),
            target_temp_c: r.float(Field::TargetTemp),
            fan_percent: r.float(Field::FanSpeed),
            fan_rpm: r.unsigned(Field::FanRpm),
            overheat_mode: r.flag(Field::OverheatMode),
        },
        mining: Mining {
            shares_accepted: r.unsigned(Field::SharesAccepted),
            shares_rejected: r.unsigned(Field::SharesRejected),
            best_diff: r.text(Field::BestDiff),
            best_session_diff: r.text(Field::BestSessionDiff),
            pool_difficulty: r.float(Field::PoolDifficulty),
            found_blocks: r.unsigned(Field::FoundBlocks),
            total_found_blocks: r.unsigned(Field::TotalFoundBlocks),
            duplicate_hw_nonces: r.unsigned(Field::DuplicateHwNonces),
        },
        stratum: Stratum {
            url: r.text(Field::StratumUrl),
            port: r.unsigned(Field::StratumPort),
            user: r.text(Field::StratumUser),
            fallback_url: r.text(Field::FallbackUrl),
            fallback_port: r.unsigned(Field::FallbackPort),
            fallback_user: r.text(Field::FallbackUser),
            using_fallback: r.flag(Field::UsingFallback),
            pool_mode: r.text(Field::PoolMode),
            pool_balance: r.float(Field::PoolBalance),
        },
        network: Network {
            ip: r.text(Field::Ip),
            mac: r.text(Field::Mac),
            ssid: r.text(Field::Ssid),
            wifi_status: r.text(Field::WifiStatus),
            wifi_rssi: r.signed(Field::WifiRssi),
        },
        system: System {
            uptime_secs: r.unsigned(Field::Uptime),
            free_heap: r.unsigned(Field::FreeHeap),
        },
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
