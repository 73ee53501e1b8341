//! The polling loop.
//!
//! Every update interval the [`Monitor`] runs one cycle:
//!
//! 1. Poll all devices concurrently. For each: fetch through the cache,
//!    record the device's best difficulty, evaluate alerts.
//! 2. Publish the consolidated [`StatusSummary`].
//! 3. Deliver the cycle's alerts, then new-record announcements.
//!
//! A device's failure only shows up in its own summary entry. Throttled
//! notifications are retried after the server's requested delay; the
//! wait is abandoned on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alert::{self, Alert, AlertThresholds, DeviceAlerts};
use crate::best_diff::{BestDifficultyStore, RecordOutcome};
use crate::cache::StatusCache;
use crate::config::{DeviceConfig, Settings};
use crate::device::{DeviceSnapshot, StatusSource};
use crate::notify::{Notifier, NotifyError};
use crate::summary::{DeviceSummary, StatusSummary};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Attempts per message when the notifier keeps throttling.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Counts from one cycle, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub devices: usize,
    pub online: usize,
    pub alerts: usize,
    pub new_records: usize,
}

/// Per-device state carried across cycles.
struct DeviceWorker {
    config: DeviceConfig,
    alerts: DeviceAlerts,
}

struct DeviceOutcome {
    summary: DeviceSummary,
    alerts: Vec<Alert>,
    new_record: Option<(String, RecordOutcome)>,
}

impl DeviceWorker {
    async fn poll(
        &mut self,
        source: &dyn StatusSource,
        cache: &StatusCache,
        store: &BestDifficultyStore,
        now: Instant,
    ) -> DeviceOutcome {
        let config = &self.config;
        let result = cache
            .get_or_fetch(&config.name, || source.fetch(config))
            .await;

        let new_record = match &result {
            Ok(snapshot) => {
                trace!(device = %config.name, "Status fetched");
                track_best(store, &config.name, snapshot).await
            }
            Err(e) => {
                warn!(device = %config.name, kind = e.kind(), error = %e, "Fetch failed");
                None
            }
        };
        let alerts = self.alerts.observe(&result, now);

        DeviceOutcome {
            summary: DeviceSummary::new(config, &result),
            alerts,
            new_record: new_record.map(|outcome| (config.name.clone(), outcome)),
        }
    }
}

/// Update the store from the snapshot's best difficulty. Returns the
/// outcome only when an existing record was beaten.
async fn track_best(
    store: &BestDifficultyStore,
    device: &str,
    snapshot: &DeviceSnapshot,
) -> Option<RecordOutcome> {
    let text = snapshot.mining.best_diff.as_deref()?;
    let observed = match text.parse::<Difficulty>() {
        Ok(d) => d,
        Err(e) => {
            debug!(device, value = text, error = %e, "Unparseable best difficulty");
            return None;
        }
    };

    let outcome = store
        .record_if_better(device, observed, snapshot.captured_at)
        .await;
    if outcome.is_new_record() {
        info!(device, difficulty = %observed, "New best difficulty");
        Some(outcome)
    } else {
        None
    }
}

pub struct Monitor {
    interval: Duration,
    mention: Option<String>,
    source: Arc<dyn StatusSource>,
    notifier: Arc<dyn Notifier>,
    cache: StatusCache,
    store: Arc<BestDifficultyStore>,
    workers: Vec<DeviceWorker>,
}

impl Monitor {
    pub fn new(
        settings: &Settings,
        source: Arc<dyn StatusSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<BestDifficultyStore>,
    ) -> Self {
        let thresholds = AlertThresholds::default();
        let workers = settings
            .devices
            .iter()
            .map(|config| DeviceWorker {
                alerts: DeviceAlerts::new(config.name.clone(), thresholds),
                config: config.clone(),
            })
            .collect();

        Self {
            interval: settings.update_interval,
            mention: settings.mention_user_id.clone(),
            source,
            notifier,
            cache: StatusCache::default(),
            store,
            workers,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run cycles until `cancellation` fires. The first cycle starts
    /// immediately. A cycle in progress is finished before returning.
    pub async fn run(mut self, cancellation: CancellationToken) {
        info!(
            devices = self.workers.len(),
            interval = ?self.interval,
            "Monitor started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_cycle(&cancellation).await;
                    debug!(?report, "Cycle complete");
                }
            }
        }

        info!("Monitor stopped");
    }

    /// Poll every device once and deliver the results.
    pub async fn run_cycle(&mut self, cancellation: &CancellationToken) -> CycleReport {
        let now = Instant::now();
        let source = self.source.as_ref();
        let cache = &self.cache;
        let store = self.store.as_ref();

        let outcomes = join_all(
            self.workers
                .iter_mut()
                .map(|worker| worker.poll(source, cache, store, now)),
        )
        .await;

        let mut summaries = Vec::with_capacity(outcomes.len());
        let mut alerts = Vec::new();
        let mut records = Vec::new();
        for outcome in outcomes {
            summaries.push(outcome.summary);
            alerts.extend(outcome.alerts);
            records.extend(outcome.new_record);
        }

        let summary = StatusSummary::new(
            summaries,
            &self.store.records().await,
            OffsetDateTime::now_utc(),
        )
        .with_next_update(self.interval);
        let report = CycleReport {
            devices: summary.devices.len(),
            online: summary.online_count(),
            alerts: alerts.len(),
            new_records: records.len(),
        };

        let notifier = self.notifier.as_ref();
        let mention = self.mention.as_deref();

        deliver("summary", cancellation, || notifier.publish_summary(&summary)).await;

        for alert in &alerts {
            let text = alert.render(mention);
            deliver("alert", cancellation, || notifier.send_alert(&text)).await;
        }

        for (device, outcome) in &records {
            let text = alert::with_mention(record_message(device, outcome), mention);
            deliver("record", cancellation, || notifier.send_alert(&text)).await;
        }

        report
    }
}

fn record_message(device: &str, outcome: &RecordOutcome) -> String {
    let new = outcome.record.best_difficulty;
    match &outcome.previous {
        Some(previous) => format!(
            "🎉 {device}: new best difficulty {new} (previous {})",
            previous.best_difficulty
        ),
        None => format!("🎉 {device}: new best difficulty {new}"),
    }
}

/// Send one message, backing off while the notifier is throttled.
/// Returns whether it was delivered.
async fn deliver<F, Fut>(what: &str, cancellation: &CancellationToken, send: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), NotifyError>>,
{
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match send().await {
            Ok(()) => return true,
            Err(NotifyError::Throttled { retry_after }) if attempt < MAX_SEND_ATTEMPTS => {
                warn!(what, attempt, ?retry_after, "Notification throttled, backing off");
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        info!(what, "Shutdown during backoff, dropping notification");
                        return false;
                    }
                    _ = tokio::time::sleep(retry_after) => {}
                }
            }
            Err(e) => {
                error!(what, attempt, error = %e, "Notification failed, dropping");
                return false;
            }
        }
    }
    false
}
