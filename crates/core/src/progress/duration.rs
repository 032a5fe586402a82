use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::{ProgressRecord, ProgressStatus};

const MAX_LOG_FILES: usize = 20;
const MAX_LOG_LINES: usize = 1000;

/// Wall-clock seconds since the record was created, including time spent queued.
pub fn total_duration(record: &ProgressRecord, now: DateTime<Utc>) -> f64 {
    elapsed_since(record, Some(record.start_time), now)
}

/// Seconds spent actually processing, measured from `processing_start_time`.
pub fn processing_duration(record: &ProgressRecord, now: DateTime<Utc>) -> f64 {
    elapsed_since(record, record.processing_start_time, now)
}

fn elapsed_since(
    record: &ProgressRecord,
    start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let Some(start) = start else {
        return 0.0;
    };
    let end = match (record.end_time, record.status) {
        (Some(end), status) if status.is_stopped() => end,
        (_, ProgressStatus::Running) => now,
        _ => return 0.0,
    };
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        format!("{:.1}min", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

fn time_cost_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"time cost:\s*([0-9.]+)s").ok())
        .as_ref()
}

/// Find the most recent worker `time cost` line mentioning `output_dir` in the newest
/// `.log` files under `log_dir`.
pub fn scan_logs_for_time_cost(log_dir: &Path, output_dir: &Path) -> Option<f64> {
    let pattern = time_cost_pattern()?;
    let needle = output_dir.to_string_lossy();
    if needle.is_empty() {
        return None;
    }

    let mut logs: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
                Some((modified, path))
            } else {
                None
            }
        })
        .collect();
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in logs.into_iter().take(MAX_LOG_FILES) {
        let Ok(raw) = fs::read(&path) else {
            continue;
        };
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = text.lines().collect();
        let tail = &lines[lines.len().saturating_sub(MAX_LOG_LINES)..];
        for line in tail.iter().rev() {
            if !line.contains("time cost") || !line.contains(needle.as_ref()) {
                continue;
            }
            if let Some(secs) = pattern
                .captures(line)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
            {
                return Some(secs);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    #[test]
    fn durations_follow_status() {
        let mut record = ProgressRecord::new(1, at(0));
        assert_eq!(total_duration(&record, at(100)), 0.0);

        record.status = ProgressStatus::Running;
        record.processing_start_time = Some(at(30));
        assert_eq!(total_duration(&record, at(100)), 100.0);
        assert_eq!(processing_duration(&record, at(100)), 70.0);

        record.status = ProgressStatus::Completed;
        record.end_time = Some(at(90));
        assert_eq!(total_duration(&record, at(500)), 90.0);
        assert_eq!(processing_duration(&record, at(500)), 60.0);

        record.status = ProgressStatus::Failed;
        assert_eq!(total_duration(&record, at(500)), 0.0);
    }

    #[test]
    fn format_duration_picks_unit() {
        assert_eq!(format_duration(12.34), "12.3s");
        assert_eq!(format_duration(270.0), "4.5min");
        assert_eq!(format_duration(4320.0), "1.2h");
    }

    #[test]
    fn log_scan_matches_output_dir_and_latest_line() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("stemflow.2026-01-01.log"),
            "INFO Preset: a inference process completed, results saved to /m/one/outputs, time cost: 11.50s\n\
             INFO Preset: a inference process completed, results saved to /m/two/outputs, time cost: 3.25s\n\
             INFO Preset: a inference process completed, results saved to /m/one/outputs, time cost: 42.00s\n",
        )
        .expect("write log");
        fs::write(dir.path().join("notes.txt"), "time cost: 1.0s /m/one/outputs").expect("write");

        assert_eq!(
            scan_logs_for_time_cost(dir.path(), Path::new("/m/one/outputs")),
            Some(42.0)
        );
        assert_eq!(
            scan_logs_for_time_cost(dir.path(), Path::new("/m/two/outputs")),
            Some(3.25)
        );
        assert_eq!(
            scan_logs_for_time_cost(dir.path(), Path::new("/m/three/outputs")),
            None
        );
    }

    #[test]
    fn log_scan_tolerates_missing_directory() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(
            scan_logs_for_time_cost(&dir.path().join("logs"), Path::new("/out")),
            None
        );
    }
}
