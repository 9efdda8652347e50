//! Advisory progress snapshots.
//!
//! Each worker writes a small JSON file under a per-execution directory; the
//! parent reads them to answer UI progress polls. Writes go through a temp
//! file + rename so readers never observe a torn snapshot. The ledger stays
//! authoritative for status; stale reads here are acceptable.

use crate::domain::outcome::{FilterStage, TaskStats};
use crate::domain::task::TaskKey;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub execution_id: String,
    pub strategy_id: i64,
    pub timeframe: String,
    /// Gate the evaluation loop last touched, e.g. "ml_confidence".
    pub current_filter: Option<String>,
    pub timepoint_index: usize,
    pub total_timepoints: usize,
    pub gate_rejections: BTreeMap<FilterStage, u64>,
    pub signals: u64,
    pub no_signals: u64,
    pub early_exits: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn from_stats(
        key: &TaskKey,
        stats: &TaskStats,
        timepoint_index: usize,
        total_timepoints: usize,
        current_filter: Option<FilterStage>,
    ) -> Self {
        Self {
            execution_id: key.execution_id.clone(),
            strategy_id: key.strategy_id,
            timeframe: key.timeframe.label().to_string(),
            current_filter: current_filter.map(|s| s.label().to_string()),
            timepoint_index,
            total_timepoints,
            gate_rejections: stats.gate_rejections.clone(),
            signals: stats.signals,
            no_signals: stats.no_signals,
            early_exits: stats.total_early_exits(),
            updated_at: Utc::now(),
        }
    }
}

/// Filesystem store rooted at `<progress_dir>/<execution_id>/`, one file per
/// task keyed by `<strategy_id>_<timeframe>.json`.
#[derive(Clone)]
pub struct ProgressStore {
    execution_dir: PathBuf,
}

impl ProgressStore {
    pub fn new(progress_dir: &Path, execution_id: &str) -> Result<Self> {
        let execution_dir = progress_dir.join(execution_id);
        std::fs::create_dir_all(&execution_dir)
            .with_context(|| format!("Failed to create progress dir {:?}", execution_dir))?;
        Ok(Self { execution_dir })
    }

    fn path_for(&self, key: &TaskKey) -> PathBuf {
        self.execution_dir.join(format!("{}.json", key.file_stem()))
    }

    pub fn write(&self, key: &TaskKey, snapshot: &ProgressSnapshot) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, raw)
            .with_context(|| format!("Failed to write snapshot {:?}", tmp))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to publish snapshot {:?}", path))?;
        Ok(())
    }

    pub fn read(&self, key: &TaskKey) -> Result<Option<ProgressSnapshot>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read snapshot {:?}", path))?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// All task snapshots of the execution, for the parent's progress poll.
    pub fn read_all(&self) -> Result<Vec<ProgressSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.execution_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Tolerate torn/partial files from a dying worker.
            if let Ok(raw) = std::fs::read_to_string(&path)
                && let Ok(snapshot) = serde_json::from_str(&raw)
            {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timeframe::Timeframe;

    fn key() -> TaskKey {
        TaskKey {
            execution_id: "symbol_addition_20250314092653_ab12cd34".to_string(),
            strategy_id: 3,
            timeframe: Timeframe::OneHour,
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "symbol_addition_20250314092653_ab12cd34")
            .unwrap();
        let key = key();

        let mut stats = TaskStats::default();
        stats.record_gate_rejection(FilterStage::Volatility);
        stats.signals = 2;
        let snapshot =
            ProgressSnapshot::from_stats(&key, &stats, 120, 500, Some(FilterStage::Volatility));
        store.write(&key, &snapshot).unwrap();

        let loaded = store.read(&key).unwrap().unwrap();
        assert_eq!(loaded.timepoint_index, 120);
        assert_eq!(loaded.signals, 2);
        assert_eq!(loaded.current_filter.as_deref(), Some("volatility"));
        assert_eq!(loaded.gate_rejections[&FilterStage::Volatility], 1);
    }

    #[test]
    fn test_read_all_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "exec").unwrap();
        let key = key();
        let snapshot = ProgressSnapshot::from_stats(&key, &TaskStats::default(), 1, 10, None);
        store.write(&key, &snapshot).unwrap();
        std::fs::write(dir.path().join("exec").join("torn.json"), b"{not json").unwrap();

        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "exec").unwrap();
        assert!(store.read(&key()).unwrap().is_none());
    }
}
