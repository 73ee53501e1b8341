//! Durable per-device best-difficulty records.
//!
//! The store keeps the highest difficulty each device has ever reported
//! and persists the whole mapping as one JSON file:
//!
//! ```json
//! {
//!   "bitaxe-gamma": { "best_difficulty": "4290000000", "timestamp": "2026-03-01T12:00:00Z" }
//! }
//! ```
//!
//! Records only ever grow. Every update rewrites the file through a
//! temporary sibling that is synced and then renamed over the target, so
//! a crash leaves either the old or the new mapping on disk, never a
//! truncated one.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Device name to record.
pub type Records = BTreeMap<String, BestDifficultyRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestDifficultyRecord {
    pub best_difficulty: Difficulty,

    /// When the record was set. Files written by older releases may
    /// lack it.
    #[serde(
        default,
        with = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

/// Result of [`BestDifficultyStore::record_if_better`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// The observation replaced the stored record (or was the first).
    pub updated: bool,

    /// Record held before this observation.
    pub previous: Option<BestDifficultyRecord>,

    /// Record held after this observation.
    pub record: BestDifficultyRecord,
}

impl RecordOutcome {
    /// An existing record was beaten. First observations don't count.
    pub fn is_new_record(&self) -> bool {
        self.updated && self.previous.is_some()
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode records: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Single-record file written by the first releases:
/// `{"value": 4290000000, "short": "G", "hostname": "...", "timestamp": "..."}`.
#[derive(Deserialize)]
struct LegacyRecord {
    value: Difficulty,
    hostname: Option<String>,
    #[serde(default, with = "timestamp")]
    timestamp: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFile {
    Legacy(LegacyRecord),
    Records(Records),
}

impl From<StoredFile> for Records {
    fn from(file: StoredFile) -> Self {
        match file {
            StoredFile::Records(records) => records,
            StoredFile::Legacy(legacy) => {
                let name = legacy.hostname.unwrap_or_else(|| "unknown".to_string());
                let record = BestDifficultyRecord {
                    best_difficulty: legacy.value,
                    timestamp: legacy.timestamp,
                };
                Records::from([(name, record)])
            }
        }
    }
}

#[derive(Debug)]
pub struct BestDifficultyStore {
    path: PathBuf,
    /// Held across file writes so updates from concurrent device workers
    /// hit the disk one at a time.
    records: Mutex<Records>,
}

impl BestDifficultyStore {
    /// Open the store backed by `path`.
    ///
    /// A missing file starts an empty mapping. An unreadable or corrupt
    /// file is logged and also starts empty; it is replaced on the first
    /// update.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredFile>(&bytes) {
                Ok(file) => {
                    let records = Records::from(file);
                    info!(path = %path.display(), count = records.len(), "Loaded best-difficulty records");
                    records
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt best-difficulty file");
                    Records::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No best-difficulty file yet");
                Records::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read best-difficulty file");
                Records::new()
            }
        };

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record for `device` if `observed` is strictly greater.
    ///
    /// On replacement the whole mapping is persisted before returning. A
    /// failed write is logged and the new record stays in memory, so the
    /// next successful write carries it.
    pub async fn record_if_better(
        &self,
        device: &str,
        observed: Difficulty,
        at: OffsetDateTime,
    ) -> RecordOutcome {
        let mut records = self.records.lock().await;

        if let Some(current) = records.get(device) {
            if observed <= current.best_difficulty {
                return RecordOutcome {
                    updated: false,
                    previous: Some(current.clone()),
                    record: current.clone(),
                };
            }
        }

        let record = BestDifficultyRecord {
            best_difficulty: observed,
            timestamp: Some(at),
        };
        let previous = records.insert(device.to_string(), record.clone());

        match self.persist(&records).await {
            Ok(()) => debug!(device, difficulty = %observed, "Best difficulty saved"),
            Err(e) => error!(device, error = %e, "Failed to persist best difficulty"),
        }

        RecordOutcome {
            updated: true,
            previous,
            record,
        }
    }

    pub async fn get(&self, device: &str) -> Option<BestDifficultyRecord> {
        self.records.lock().await.get(device).cloned()
    }

    /// Copy of the whole mapping.
    pub async fn records(&self) -> Records {
        self.records.lock().await.clone()
    }

    async fn persist(&self, records: &Records) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = tmp_path(&self.path);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| PersistError::Io { path, source }
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        }

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
        file.write_all(&bytes).await.map_err(io_err(&tmp))?;
        file.sync_all().await.map_err(io_err(&tmp))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err(&self.path))
    }
}

/// `best_difficulty.json` -> `best_difficulty.json.tmp`
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// RFC 3339 on write. On read also accepts the naive ISO 8601 form older
/// releases wrote (`2025-02-14T09:30:12.123456`), taken as UTC. An
/// unparseable value reads as absent.
mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::{Iso8601, Rfc3339};
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => {
                let text = ts.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
                serializer.serialize_str(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        Ok(text.as_deref().and_then(parse))
    }

    pub fn parse(text: &str) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(text, &Rfc3339).ok().or_else(|| {
            PrimitiveDateTime::parse(text, &Iso8601::DEFAULT)
                .ok()
                .map(PrimitiveDateTime::assume_utc)
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;

    const T0: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);
    const T1: OffsetDateTime = datetime!(2026-03-01 12:05 UTC);

    fn diff(text: &str) -> Difficulty {
        text.parse().unwrap()
    }

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("best_difficulty.json")
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BestDifficultyStore::load(store_path(&dir)).await;
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(&path, b"{\"bitaxe\": {\"best_diff").unwrap();

        let store = BestDifficultyStore::load(&path).await;
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_difficulty_is_a_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(
            &path,
            br#"{"gamma": {"best_difficulty": "1e9223372036854775807K"}}"#,
        )
        .unwrap();

        let store = BestDifficultyStore::load(&path).await;
        assert!(store.records().await.is_empty());

        let outcome = store.record_if_better("gamma", diff("1000000"), T0).await;
        assert!(outcome.updated);
    }

    #[tokio::test]
    async fn first_observation_is_stored_but_not_a_new_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = BestDifficultyStore::load(store_path(&dir)).await;

        let outcome = store.record_if_better("gamma", diff("1000000"), T0).await;
        assert!(outcome.updated);
        assert_eq!(outcome.previous, None);
        assert!(!outcome.is_new_record());
        assert_eq!(outcome.record.timestamp, Some(T0));
    }

    #[tokio::test]
    async fn higher_value_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = BestDifficultyStore::load(store_path(&dir)).await;
        store.record_if_better("gamma", diff("1000000"), T0).await;

        let outcome = store.record_if_better("gamma", diff("1234567"), T1).await;
        assert!(outcome.updated);
        assert!(outcome.is_new_record());
        assert_eq!(outcome.previous.unwrap().best_difficulty, diff("1000000"));
        assert_eq!(outcome.record.best_difficulty, diff("1234567"));
    }

    #[tokio::test]
    async fn equal_or_lower_value_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = BestDifficultyStore::load(store_path(&dir)).await;
        store.record_if_better("gamma", diff("4.29G"), T0).await;

        for observed in ["4290000000", "999M"] {
            let outcome = store.record_if_better("gamma", diff(observed), T1).await;
            assert!(!outcome.updated);
            assert_eq!(outcome.record.best_difficulty, diff("4.29G"));
            assert_eq!(outcome.record.timestamp, Some(T0));
        }
    }

    #[tokio::test]
    async fn persisted_value_is_the_highest_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let store = BestDifficultyStore::load(&path).await;
        store.record_if_better("gamma", diff("5000"), T0).await;
        store.record_if_better("gamma", diff("7.5K"), T1).await;
        store.record_if_better("gamma", diff("6000"), T1).await;

        let reloaded = BestDifficultyStore::load(&path).await;
        let record = reloaded.get("gamma").await.unwrap();
        assert_eq!(record.best_difficulty, Difficulty::from(7500));
        assert_eq!(record.timestamp, Some(T1));
    }

    #[tokio::test]
    async fn reload_yields_identical_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let store = BestDifficultyStore::load(&path).await;
        store.record_if_better("gamma", diff("4.29G"), T0).await;
        store
            .record_if_better("nerd", diff("123456789012345678901234567890"), T1)
            .await;

        let reloaded = BestDifficultyStore::load(&path).await;
        assert_eq!(reloaded.records().await, store.records().await);
    }

    #[tokio::test]
    async fn writes_decimal_strings_and_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let store = BestDifficultyStore::load(&path).await;
        store.record_if_better("gamma", diff("4.29G"), T0).await;

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["gamma"]["best_difficulty"], "4290000000");
        assert_eq!(raw["gamma"]["timestamp"], "2026-03-01T12:00:00Z");
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn reads_numbers_and_naive_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(
            &path,
            r#"{
                "gamma": { "best_difficulty": 4290000000, "timestamp": "2025-02-14T09:30:12.5", "note": "x" },
                "nerd": { "best_difficulty": "1.2M" }
            }"#,
        )
        .unwrap();

        let records = BestDifficultyStore::load(&path).await.records().await;
        let gamma = &records["gamma"];
        assert_eq!(gamma.best_difficulty, Difficulty::from(4_290_000_000));
        assert_eq!(
            gamma.timestamp,
            Some(datetime!(2025-02-14 09:30:12.5 UTC))
        );
        assert_eq!(records["nerd"].best_difficulty, Difficulty::from(1_200_000));
        assert_eq!(records["nerd"].timestamp, None);
    }

    #[tokio::test]
    async fn reads_legacy_single_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(
            &path,
            r#"{"value": 2871000000, "short": "G", "hostname": "bitaxe", "timestamp": "2025-01-05T18:00:00"}"#,
        )
        .unwrap();

        let records = BestDifficultyStore::load(&path).await.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            records["bitaxe"].best_difficulty,
            Difficulty::from(2_871_000_000)
        );
        assert_eq!(
            records["bitaxe"].timestamp,
            Some(datetime!(2025-01-05 18:00 UTC))
        );
    }

    #[tokio::test]
    async fn failed_write_keeps_record_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let store = BestDifficultyStore::load(blocker.join("best_difficulty.json")).await;

        let outcome = store.record_if_better("gamma", diff("100"), T0).await;
        assert!(outcome.updated);
        assert_eq!(
            store.get("gamma").await.unwrap().best_difficulty,
            Difficulty::from(100)
        );
    }
}
