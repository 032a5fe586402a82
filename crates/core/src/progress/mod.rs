//! Durable per-mission progress records.
//!
//! Every mission directory owns one `progress.json`. The scheduler, the worker process and
//! HTTP pollers all read and write it; writes are whole-document atomic replacements so any
//! reader observes a complete record.

mod consistency;
mod duration;
mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use consistency::{reconcile, ConsistencyEvidence};
pub use duration::{format_duration, processing_duration, scan_logs_for_time_cost, total_duration};
pub use store::{count_input_songs, ProgressStore};

pub const PROGRESS_FILE_NAME: &str = "progress.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Terminated
        )
    }

    /// States whose `end_time` freezes the elapsed-time figures.
    pub fn is_stopped(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Terminated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepProgress {
    pub name: String,
    pub processed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDetail {
    pub file_name: String,
    pub status: String,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRecord {
    pub total_files: u64,
    pub processed_files: u64,
    pub status: ProgressStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_start_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub total_files_locked: bool,
    /// Keyed by 1-based step index. Only present for multi-step presets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_progress: BTreeMap<u32, StepProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub details: Vec<FileDetail>,
}

impl ProgressRecord {
    pub fn new(total_files: u64, now: DateTime<Utc>) -> Self {
        Self {
            total_files: total_files.max(1),
            processed_files: 0,
            status: ProgressStatus::Waiting,
            start_time: now,
            end_time: None,
            processing_start_time: None,
            last_update: now,
            total_files_locked: false,
            step_progress: BTreeMap::new(),
            total_steps: None,
            details: Vec::new(),
        }
    }

    /// Merge `patch` into the record. A locked total is never overwritten by a patch.
    pub fn apply(&mut self, patch: &ProgressPatch, now: DateTime<Utc>) {
        if let Some(total) = patch.total_files {
            if self.total_files_locked {
                if total != self.total_files {
                    tracing::debug!(
                        locked_total = self.total_files,
                        requested = total,
                        "Ignoring total_files update on locked record"
                    );
                }
            } else {
                self.total_files = total;
            }
        }
        if let Some(locked) = patch.total_files_locked {
            self.total_files_locked = self.total_files_locked || locked;
        }
        if let Some(processed) = patch.processed_files {
            self.processed_files = processed;
        }
        if let Some(started) = patch.processing_start_time {
            self.processing_start_time = Some(started);
        }
        if let Some(status) = patch.status {
            self.status = status;
            if status == ProgressStatus::Running && self.processing_start_time.is_none() {
                self.processing_start_time = Some(now);
            }
            if status.is_terminal() && self.end_time.is_none() {
                self.end_time = Some(now);
            }
        }
        self.last_update = now;
    }

    pub fn fraction(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        (self.processed_files as f64 / self.total_files as f64).min(1.0)
    }
}

/// Partial update for [`ProgressStore::update`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressPatch {
    pub total_files: Option<u64>,
    pub processed_files: Option<u64>,
    pub status: Option<ProgressStatus>,
    pub total_files_locked: Option<bool>,
    pub processing_start_time: Option<DateTime<Utc>>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_files(mut self, total: u64) -> Self {
        self.total_files = Some(total);
        self
    }

    pub fn processed_files(mut self, processed: u64) -> Self {
        self.processed_files = Some(processed);
        self
    }

    pub fn status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn lock_total(mut self) -> Self {
        self.total_files_locked = Some(true);
        self
    }

    pub fn processing_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.processing_start_time = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub fn progress_path(mission_dir: &Path) -> PathBuf {
    mission_dir.join(PROGRESS_FILE_NAME)
}

/// The few descriptor fields the store consults. Every field is optional so a partially
/// written or foreign `mission.json` still yields what it can.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DescriptorHints {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub preset_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    #[test]
    fn locked_total_survives_any_patch() {
        let mut record = ProgressRecord::new(3, at(0));
        record.apply(&ProgressPatch::new().total_files(3).lock_total(), at(1));

        for requested in [0, 1, 7, 1_000] {
            record.apply(
                &ProgressPatch {
                    total_files: Some(requested),
                    total_files_locked: Some(false),
                    ..ProgressPatch::default()
                },
                at(2),
            );
            assert_eq!(record.total_files, 3);
            assert!(record.total_files_locked);
        }
    }

    #[test]
    fn status_transitions_stamp_timestamps_once() {
        let mut record = ProgressRecord::new(1, at(0));
        record.apply(&ProgressPatch::new().status(ProgressStatus::Running), at(5));
        assert_eq!(record.processing_start_time, Some(at(5)));

        record.apply(&ProgressPatch::new().status(ProgressStatus::Running), at(8));
        assert_eq!(record.processing_start_time, Some(at(5)));

        record.apply(&ProgressPatch::new().status(ProgressStatus::Completed), at(10));
        record.apply(&ProgressPatch::new().status(ProgressStatus::Completed), at(20));
        assert_eq!(record.end_time, Some(at(10)));
        assert_eq!(record.last_update, at(20));
    }

    #[test]
    fn record_serializes_with_snake_case_status_and_numeric_step_keys() {
        let mut record = ProgressRecord::new(2, at(0));
        record.step_progress.insert(
            1,
            StepProgress {
                name: "vocal_model".to_string(),
                processed: 0,
                total: 2,
            },
        );
        record.end_time = Some(at(0) + Duration::seconds(3));

        let value = serde_json::to_value(&record).expect("encode");
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["step_progress"]["1"]["name"], "vocal_model");

        let decoded: ProgressRecord = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn new_record_has_floor_of_one() {
        assert_eq!(ProgressRecord::new(0, at(0)).total_files, 1);
    }
}
