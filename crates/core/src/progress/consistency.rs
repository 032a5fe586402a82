use chrono::{DateTime, Utc};

use super::{ProgressRecord, ProgressStatus};

/// Filesystem facts gathered for one mission while its record says `running`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyEvidence {
    /// The mission descriptor independently reports completion.
    pub descriptor_completed: bool,
    /// Output audio files across every output location of the mission.
    pub output_files: u64,
    /// Output files one input song produces under the mission's preset.
    pub outputs_per_song: u64,
    /// Fresh song count from the mission's inputs, used only when no total is locked yet.
    pub counted_total: u64,
}

/// Compute the record implied by `evidence`. Pure; the caller decides whether to persist.
///
/// Records that are not `running` are returned unchanged. A completed record keeps its
/// first `end_time`, so repeated passes are idempotent.
pub fn reconcile(
    record: &ProgressRecord,
    evidence: &ConsistencyEvidence,
    now: DateTime<Utc>,
) -> ProgressRecord {
    let mut next = record.clone();
    if next.status != ProgressStatus::Running {
        return next;
    }

    if evidence.descriptor_completed {
        mark_completed(&mut next, now);
        return next;
    }

    let total = if next.total_files_locked && next.total_files > 0 {
        next.total_files
    } else {
        let counted = evidence.counted_total.max(1);
        next.total_files = counted;
        next.total_files_locked = true;
        counted
    };

    let per_song = evidence.outputs_per_song.max(1);
    let processed = (evidence.output_files / per_song).min(total);
    next.processed_files = processed;

    if processed >= total {
        mark_completed(&mut next, now);
    }
    next
}

fn mark_completed(record: &mut ProgressRecord, now: DateTime<Utc>) {
    record.status = ProgressStatus::Completed;
    if record.end_time.is_none() {
        record.end_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    fn running(total: u64, locked: bool) -> ProgressRecord {
        let mut record = ProgressRecord::new(total, at(0));
        record.status = ProgressStatus::Running;
        record.total_files_locked = locked;
        record
    }

    #[test]
    fn non_running_records_are_untouched() {
        let mut record = running(2, true);
        record.status = ProgressStatus::Failed;
        let evidence = ConsistencyEvidence {
            output_files: 10,
            outputs_per_song: 1,
            ..ConsistencyEvidence::default()
        };
        assert_eq!(reconcile(&record, &evidence, at(5)), record);
    }

    #[test]
    fn descriptor_completion_is_adopted() {
        let record = running(4, true);
        let evidence = ConsistencyEvidence {
            descriptor_completed: true,
            ..ConsistencyEvidence::default()
        };
        let next = reconcile(&record, &evidence, at(9));
        assert_eq!(next.status, ProgressStatus::Completed);
        assert_eq!(next.end_time, Some(at(9)));
    }

    #[test]
    fn partial_outputs_keep_running_with_locked_total() {
        let record = running(3, true);
        let evidence = ConsistencyEvidence {
            output_files: 5,
            outputs_per_song: 2,
            counted_total: 9,
            ..ConsistencyEvidence::default()
        };
        let next = reconcile(&record, &evidence, at(1));
        assert_eq!(next.status, ProgressStatus::Running);
        assert_eq!(next.processed_files, 2);
        assert_eq!(next.total_files, 3);
        assert!(next.end_time.is_none());
    }

    #[test]
    fn unlocked_total_is_recounted_and_locked() {
        let record = running(1, false);
        let evidence = ConsistencyEvidence {
            output_files: 2,
            outputs_per_song: 2,
            counted_total: 4,
            ..ConsistencyEvidence::default()
        };
        let next = reconcile(&record, &evidence, at(1));
        assert_eq!(next.total_files, 4);
        assert!(next.total_files_locked);
        assert_eq!(next.processed_files, 1);
    }

    #[test]
    fn completion_is_idempotent() {
        let record = running(2, true);
        let evidence = ConsistencyEvidence {
            output_files: 7,
            outputs_per_song: 3,
            ..ConsistencyEvidence::default()
        };
        let first = reconcile(&record, &evidence, at(10));
        assert_eq!(first.status, ProgressStatus::Completed);
        assert_eq!(first.processed_files, 2);

        let mut again = first.clone();
        for later in [20, 30, 40] {
            again = reconcile(&again, &evidence, at(later));
            assert_eq!(again.status, ProgressStatus::Completed);
            assert_eq!(again.end_time, Some(at(10)));
        }

        let mut rerun = first.clone();
        rerun.status = ProgressStatus::Running;
        let rerun = reconcile(&rerun, &evidence, at(50));
        assert_eq!(rerun.end_time, Some(at(10)));
    }

    #[test]
    fn zero_outputs_per_song_is_treated_as_one() {
        let record = running(2, true);
        let evidence = ConsistencyEvidence {
            output_files: 1,
            outputs_per_song: 0,
            ..ConsistencyEvidence::default()
        };
        assert_eq!(reconcile(&record, &evidence, at(1)).processed_files, 1);
    }
}
