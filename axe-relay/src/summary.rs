//! Consolidated status view published once per cycle.
//!
//! A [`StatusSummary`] carries every device's latest snapshot (or the
//! reason there is none), traffic-light [`Level`]s for the metrics that
//! have per-device thresholds, and the best-difficulty ranking.
//! Its [`Display`](fmt::Display) impl is the plain-text rendering posted
//! to the channel. [`StatusSummary::sections`] yields the same text in
//! pieces that must not be split across messages; notifiers that want
//! structure can serialize it.

use std::fmt::{self, Write as _};

use serde::Serialize;
use strum::Display;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::best_diff::{BestDifficultyRecord, Records};
use crate::config::{DeviceConfig, Thresholds};
use crate::device::{DeviceSnapshot, FetchError};
use crate::types::Difficulty;

/// Traffic-light level of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Ok,
    Warn,
    Critical,
}

impl Level {
    pub fn icon(self) -> &'static str {
        match self {
            Level::Ok => "🟢",
            Level::Warn => "🟡",
            Level::Critical => "🔴",
        }
    }

    /// For metrics where higher is worse (temperatures):
    /// `< t[0]` Ok, `< t[1]` Warn, otherwise Critical.
    pub fn rising(value: f64, thresholds: &Thresholds) -> Self {
        if value < bound(thresholds, 0, f64::INFINITY) {
            Level::Ok
        } else if value < bound(thresholds, 1, f64::INFINITY) {
            Level::Warn
        } else {
            Level::Critical
        }
    }

    /// Fan speed, where a stalled fan is the problem:
    /// `<= f[0]` Critical, `<= f[1]` Warn, otherwise Ok.
    pub fn fan(rpm: f64, thresholds: &Thresholds) -> Self {
        if rpm <= bound(thresholds, 0, f64::NEG_INFINITY) {
            Level::Critical
        } else if rpm <= bound(thresholds, 1, f64::NEG_INFINITY) {
            Level::Warn
        } else {
            Level::Ok
        }
    }

    /// Core voltage in volts: `>= v[2]` Critical, `>= v[1]` Warn,
    /// otherwise Ok.
    pub fn voltage(volts: f64, thresholds: &Thresholds) -> Self {
        if volts >= bound(thresholds, 2, f64::INFINITY) {
            Level::Critical
        } else if volts >= bound(thresholds, 1, f64::INFINITY) {
            Level::Warn
        } else {
            Level::Ok
        }
    }
}

/// Missing boundaries fall back to a value that never matches.
fn bound(thresholds: &Thresholds, index: usize, missing: f64) -> f64 {
    thresholds.values().get(index).copied().unwrap_or(missing)
}

/// Levels for one snapshot. Absent readings have no level.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Indicators {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vr_temp: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<Level>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<Level>,
}

impl Indicators {
    pub fn evaluate(snapshot: &DeviceSnapshot, config: &DeviceConfig) -> Self {
        let thermal = &snapshot.thermal;
        let core_mv = snapshot
            .power
            .core_voltage_actual_mv
            .or(snapshot.power.core_voltage_mv);

        Self {
            temp: thermal
                .temp_c
                .map(|t| Level::rising(t, &config.temp_thresholds)),
            // AxeOS reports 0 when the board has no VR sensor.
            vr_temp: thermal
                .vr_temp_c
                .filter(|t| *t > 0.0)
                .map(|t| Level::rising(t, &config.vr_temp_thresholds)),
            fan: thermal
                .fan_rpm
                .map(|rpm| Level::fan(rpm as f64, &config.fan_thresholds)),
            voltage: core_mv.map(|mv| Level::voltage(mv / 1000.0, &config.volt_thresholds)),
        }
    }

    /// Worst level among the readings present.
    pub fn worst(&self) -> Option<Level> {
        [self.temp, self.vr_temp, self.fan, self.voltage]
            .into_iter()
            .flatten()
            .max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceStatus {
    Online {
        snapshot: Box<DeviceSnapshot>,
        indicators: Indicators,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub address: String,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

impl DeviceSummary {
    pub fn new(config: &DeviceConfig, result: &Result<DeviceSnapshot, FetchError>) -> Self {
        let status = match result {
            Ok(snapshot) => DeviceStatus::Online {
                indicators: Indicators::evaluate(snapshot, config),
                snapshot: Box::new(snapshot.clone()),
            },
            Err(e) => DeviceStatus::Error {
                error: e.to_string(),
            },
        };
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
            status,
        }
    }
}

/// One device's entry in the best-difficulty ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHolder {
    pub device: String,
    #[serde(flatten)]
    pub record: BestDifficultyRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// Sorted by device name.
    pub devices: Vec<DeviceSummary>,
    /// Highest best difficulty across all records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordHolder>,
    /// Every recorded device, highest difficulty first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ranking: Vec<RecordHolder>,
    /// Seconds until the next cycle, when published by a running monitor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_update_secs: Option<u64>,
}

impl StatusSummary {
    pub fn new(
        mut devices: Vec<DeviceSummary>,
        records: &Records,
        generated_at: OffsetDateTime,
    ) -> Self {
        devices.sort_by(|a, b| a.name.cmp(&b.name));

        let mut ranking: Vec<RecordHolder> = records
            .iter()
            .map(|(device, record)| RecordHolder {
                device: device.clone(),
                record: record.clone(),
            })
            .collect();
        // Stable, so ties keep name order.
        ranking.sort_by(|a, b| b.record.best_difficulty.cmp(&a.record.best_difficulty));

        Self {
            generated_at,
            devices,
            record: ranking.first().cloned(),
            ranking,
            next_update_secs: None,
        }
    }

    /// Adds the "next update" footer.
    pub fn with_next_update(mut self, interval: std::time::Duration) -> Self {
        self.next_update_secs = Some(interval.as_secs());
        self
    }

    pub fn online_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.status, DeviceStatus::Online { .. }))
            .count()
    }

    /// The rendered summary in order: header, one block per device, the
    /// ranking, then the footer. Each block ends with a newline; joined
    /// with `"\n"` they give the [`Display`](fmt::Display) output.
    pub fn sections(&self) -> Vec<String> {
        let mut sections = Vec::with_capacity(self.devices.len() + 3);
        sections.push(render(|out| self.render_header(out)));

        for device in &self.devices {
            sections.push(render(|out| match &device.status {
                DeviceStatus::Error { error } => {
                    writeln!(out, "❌ {} ({}): {error}", device.name, device.address)
                }
                DeviceStatus::Online {
                    snapshot,
                    indicators,
                } => render_device(out, &device.name, &device.address, snapshot, indicators),
            }));
        }

        if !self.ranking.is_empty() {
            sections.push(render(|out| self.render_ranking(out)));
        }
        if let Some(secs) = self.next_update_secs {
            sections.push(format!("⏳ Next update in {}m {}s\n", secs / 60, secs % 60));
        }
        sections
    }

    fn render_header(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "📡 Device overview")?;

        if let Some(holder) = &self.record {
            let best = holder.record.best_difficulty;
            write!(out, "🏆 Record: {best} ({}) by {}", best.to_plain_string(), holder.device)?;
            if let Some(at) = holder.record.timestamp {
                write!(out, ", {} ({})", format_stamp(at), time_ago(self.generated_at - at))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn render_ranking(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "🏆 Best difficulty ranking")?;
        for (index, holder) in self.ranking.iter().enumerate() {
            let best = holder.record.best_difficulty;
            let when = holder
                .record
                .timestamp
                .map_or_else(|| "unknown date".to_string(), format_stamp);
            match MEDALS.get(index) {
                Some(medal) => write!(out, "{medal}")?,
                None => write!(out, "{}.", index + 1)?,
            }
            writeln!(
                out,
                " {best} ({}) | {when} | {}",
                best.to_plain_string(),
                holder.device
            )?;
        }
        Ok(())
    }
}

const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sections().join("\n"))
    }
}

/// Writing into a `String` only fails if a value's own formatting does;
/// the section then keeps what was written before it.
fn render(section: impl FnOnce(&mut String) -> fmt::Result) -> String {
    let mut out = String::new();
    let _ = section(&mut out);
    out
}

/// `2026-03-01 12:00 UTC`
fn format_stamp(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute] UTC"))
        .unwrap_or_else(|_| at.to_string())
}

fn render_device(
    f: &mut impl fmt::Write,
    name: &str,
    address: &str,
    s: &DeviceSnapshot,
    levels: &Indicators,
) -> fmt::Result {
    let icon = |level: Option<Level>| level.map_or("", Level::icon);

    writeln!(f, "🛠️ {name} ({address})")?;

    if let Some(asic) = &s.identity.asic_model {
        write!(f, "🖥️ ASIC      : {asic}")?;
        if let Some(model) = &s.identity.device_model {
            write!(f, " | {model}")?;
        }
        writeln!(f)?;
    }
    if let Some(freq) = s.power.frequency_mhz {
        write!(f, "🧭 Frequency : {freq} MHz")?;
        if let Some(actual) = s.power.core_voltage_actual_mv {
            write!(f, " @ {:.3} V", actual / 1000.0)?;
        }
        if let Some(set) = s.power.core_voltage_mv {
            write!(f, " | {:.3} V", set / 1000.0)?;
        }
        writeln!(f, " {}", icon(levels.voltage))?;
    }

    if let Some(rate) = s.hashrate.current {
        writeln!(f, "⚡ Hashrate  : {rate:.2} GH/s")?;
    }
    if let (Some(m1), Some(m10), Some(h1)) =
        (s.hashrate.avg_1m, s.hashrate.avg_10m, s.hashrate.avg_1h)
    {
        writeln!(f, "📊 Avg 1m/10m/1h: {m1:.1} / {m10:.1} / {h1:.1} GH/s")?;
    }
    if let Some(d1) = s.hashrate.avg_1d {
        writeln!(f, "📊 Avg 24h   : {d1:.1} GH/s")?;
    }
    if let (Some(accepted), Some(rejected)) = (s.mining.shares_accepted, s.mining.shares_rejected) {
        writeln!(f, "🧠 Shares    : ✅ {accepted} / ❌ {rejected}")?;
    }
    if let Some(best) = &s.mining.best_diff {
        write!(f, "💎 BestDiff  : {}", pretty_difficulty(best))?;
        if let Some(session) = &s.mining.best_session_diff {
            write!(f, " (session {})", pretty_difficulty(session))?;
        }
        writeln!(f)?;
    }
    if let Some(pool) = s.mining.pool_difficulty {
        writeln!(f, "🎯 Pool Diff : {pool}")?;
    }
    if let (Some(session), Some(total)) = (s.mining.found_blocks, s.mining.total_found_blocks) {
        writeln!(f, "🏆 Blocks    : {session} session / {total} total")?;
    }
    if let Some(dups) = s.mining.duplicate_hw_nonces.filter(|n| *n > 0) {
        writeln!(f, "⚠️ Duplicate nonces: {dups}")?;
    }

    if let Some(temp) = s.thermal.temp_c {
        writeln!(f, "🌡️ Temp      : {temp} °C {}", icon(levels.temp))?;
    }
    if let Some(vr) = s.thermal.vr_temp_c.filter(|t| *t > 0.0) {
        writeln!(f, "🔌 VR Temp   : {vr} °C {}", icon(levels.vr_temp))?;
    }
    if let Some(power) = s.power.power_w {
        write!(f, "🔋 Power     : {power:.2} W")?;
        if let Some(volts) = s.power.voltage_v() {
            write!(f, " @ {volts:.3} V")?;
        }
        writeln!(f)?;
    }
    if let Some(eff) = s.efficiency_gh_per_w() {
        writeln!(f, "📈 Eff       : {eff:.2} GH/W")?;
    }
    if s.thermal.fan_percent.is_some() || s.thermal.fan_rpm.is_some() {
        write!(f, "💨 Fan       :")?;
        if let Some(pct) = s.thermal.fan_percent {
            write!(f, " {pct}%")?;
        }
        if let Some(rpm) = s.thermal.fan_rpm {
            write!(f, " {rpm} RPM")?;
        }
        writeln!(f, " {}", icon(levels.fan))?;
    }

    let on_fallback = s.stratum.using_fallback.unwrap_or(false);
    if let Some(url) = &s.stratum.url {
        write!(f, "🌐 Stratum   : {url}")?;
        if let Some(port) = s.stratum.port {
            write!(f, ":{port}")?;
        }
        writeln!(f, " {}", if on_fallback { "❌" } else { "✅" })?;
    }
    if let Some(url) = &s.stratum.fallback_url {
        write!(f, "⚠️ Fallback  : {url}")?;
        if let Some(port) = s.stratum.fallback_port {
            write!(f, ":{port}")?;
        }
        writeln!(f, " {}", if on_fallback { "✅" } else { "❌" })?;
    }
    if let Some(user) = &s.stratum.user {
        writeln!(f, "👤 User      : {user}")?;
    }
    if let Some(mode) = &s.stratum.pool_mode {
        writeln!(f, "🎱 Pool Mode : {mode}")?;
    }
    if let Some(balance) = s.stratum.pool_balance.filter(|b| *b > 0.0) {
        writeln!(f, "⚖️ Balance   : {balance}")?;
    }
    if let Some(uptime) = s.system.uptime_secs {
        writeln!(f, "⏱️ Uptime    : {}", format_uptime(uptime))?;
    }
    Ok(())
}

/// `7384` -> `"2h, 03:04"`
pub fn format_uptime(secs: u64) -> String {
    let (mins, secs) = (secs / 60, secs % 60);
    let (hours, mins) = (mins / 60, mins % 60);
    format!("{hours}h, {mins:02}:{secs:02}")
}

/// Whole days, hours and minutes, largest first; zero parts omitted.
pub fn time_ago(elapsed: Duration) -> String {
    let minutes = elapsed.whole_minutes().max(0);
    let (days, rest) = (minutes / 1440, minutes % 1440);
    let (hours, minutes) = (rest / 60, rest % 60);

    let parts: Vec<String> = [(days, "day"), (hours, "hour"), (minutes, "minute")]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n} {unit}{}", if n == 1 { "" } else { "s" }))
        .collect();

    if parts.is_empty() {
        "just now".to_string()
    } else {
        format!("{} ago", parts.join(" "))
    }
}

/// Device difficulty text with SI suffix, or as reported if it does not
/// parse.
fn pretty_difficulty(text: &str) -> String {
    text.parse::<Difficulty>()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| text.to_string())
}
