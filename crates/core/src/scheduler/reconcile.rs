use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::launch::progress_dirs;
use super::{Scheduler, SchedulerState};
use crate::executor::ProcessPoll;
use crate::mission::{
    update_descriptor_state, Mission, MissionProgress, MissionState, DESCRIPTOR_FILE_NAME,
};
use crate::progress::{ProgressPatch, ProgressStatus};
use crate::scan;
use crate::worker::EXIT_CANCELLED;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Running missions that left the running set after their process exited.
    pub finished: usize,
    /// Running entries without a live process or without a mission directory.
    pub retired: usize,
    pub started: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitCount {
    processed: u64,
    expected: u64,
}

impl UnitCount {
    fn complete(self) -> bool {
        self.processed >= self.expected
    }
}

enum Verdict {
    Keep,
    Remove,
    Finalize(MissionState, Option<UnitCount>),
}

impl Scheduler {
    /// One reconciliation pass: observe running missions, retire zombies, then fill free
    /// slots from the waiting queue.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut state = self.lock();
        if state.waiting.is_empty() && state.running.is_empty() {
            return report;
        }

        let mut index = 0;
        while index < state.running.len() {
            let mut mission = state.running.remove(index);
            match self.observe(&mut state, &mut mission) {
                Verdict::Keep => {
                    state.running.insert(index, mission);
                    index += 1;
                }
                Verdict::Remove => report.finished += 1,
                Verdict::Finalize(outcome, units) => {
                    self.finalize(&mut state, &mut mission, outcome, units);
                    report.finished += 1;
                }
            }
        }

        report.retired = self.sweep_zombies(&mut state);

        while state.running.len() < state.thread_count {
            let before = state.running.len();
            if !self.start_next_locked(&mut state) {
                break;
            }
            if state.running.len() > before {
                report.started += 1;
            }
        }

        if report != TickReport::default() {
            debug!(
                finished = report.finished,
                retired = report.retired,
                started = report.started,
                running = state.running.len(),
                waiting = state.waiting.len(),
                "Scheduler tick"
            );
        }
        report
    }

    fn observe(&self, state: &mut SchedulerState, mission: &mut Mission) -> Verdict {
        let exit = match mission.executor_mut().map(|executor| executor.poll()) {
            Some(ProcessPoll::Running) => None,
            Some(ProcessPoll::Exited(code)) => Some(code),
            Some(ProcessPoll::NotStarted) | None => return Verdict::Keep,
        };

        let Some(dir) = mission.mission_dir().map(Path::to_path_buf) else {
            return match exit {
                Some(code) => Verdict::Finalize(outcome_for(code), None),
                None => Verdict::Keep,
            };
        };
        if !dir.exists() {
            return Verdict::Keep;
        }

        let store = self.store();
        let record = store.read(&dir).unwrap_or_else(|err| {
            warn!(mission_dir = %dir.display(), error = %err, "Failed to read progress record");
            None
        });
        let locked_total = record
            .as_ref()
            .filter(|record| record.total_files_locked)
            .map(|record| record.total_files);
        let units = self.count_units(mission, &dir, locked_total);
        let record_completed = record
            .as_ref()
            .is_some_and(|r| r.status == ProgressStatus::Completed);

        if units.complete() || record_completed {
            if mission.state != MissionState::Completed {
                info!(
                    mission_dir = %dir.display(),
                    processed = units.processed,
                    expected = units.expected,
                    "All expected outputs present; mission completed"
                );
                self.finalize(state, mission, MissionState::Completed, Some(units));
            }
            return if exit.is_some() {
                Verdict::Remove
            } else {
                Verdict::Keep
            };
        }

        if let Some(record) = &record {
            let processed = units.processed.min(record.total_files);
            if processed != record.processed_files {
                let patch = ProgressPatch::new().processed_files(processed);
                if let Err(err) = store.update(&dir, &patch) {
                    warn!(
                        mission_dir = %dir.display(),
                        error = %err,
                        "Failed to update processed files"
                    );
                }
            }
        }
        self.persist(mission);

        match exit {
            Some(code) => Verdict::Finalize(outcome_for(code), Some(units)),
            None => Verdict::Keep,
        }
    }

    /// Expected and produced song units for a running mission. A merged batch expects the
    /// sum over its inputs; otherwise a locked total wins over a fresh count.
    fn count_units(&self, mission: &Mission, dir: &Path, locked_total: Option<u64>) -> UnitCount {
        let expected = if mission.is_batch() {
            mission
                .inputs()
                .iter()
                .map(|input| {
                    scan::list_input_dir(input)
                        .map(|listing| listing.song_count().max(1) as u64)
                        .unwrap_or(1)
                })
                .sum()
        } else if let Some(total) = locked_total {
            total
        } else {
            detect_expected(mission, dir)
        };

        let per_song = self
            .settings()
            .presets
            .load(&mission.preset_name)
            .map(|preset| preset.outputs_per_song())
            .unwrap_or(1)
            .max(1) as u64;
        let outputs = scan::count_mission_outputs(dir, Some(&mission.output_dir)) as u64;

        UnitCount {
            processed: (outputs / per_song).min(expected),
            expected: expected.max(1),
        }
    }

    /// Apply a terminal state to the mission and every progress record it reports into.
    /// The mission must already be out of the running set so sibling counts exclude it.
    pub(crate) fn finalize(
        &self,
        state: &mut SchedulerState,
        mission: &mut Mission,
        outcome: MissionState,
        units: Option<UnitCount>,
    ) {
        mission.set_state(outcome);
        let own = mission.mission_dir().map(Path::to_path_buf);
        for dir in progress_dirs(mission) {
            let processed = if own.as_deref() == Some(dir.as_path()) {
                units.map(|units| units.processed)
            } else {
                None
            };
            self.settle_dir(state, &dir, mission.descriptor_path(), outcome, processed);
        }
        if own.as_deref().map_or(true, Path::exists) {
            self.persist(mission);
        }
        info!(
            mission_dir = ?own,
            state = outcome.as_str(),
            members = mission.members().len(),
            "Mission finished"
        );
    }

    /// Record one finished job against `dir`. While sibling sub-jobs remain only the
    /// processed count moves; the last sibling writes the aggregate state.
    fn settle_dir(
        &self,
        state: &mut SchedulerState,
        dir: &Path,
        own_descriptor: Option<&Path>,
        outcome: MissionState,
        processed: Option<u64>,
    ) {
        if !dir.exists() {
            return;
        }
        let store = self.store();
        if outcome == MissionState::Failed {
            state.failed_dirs.insert(dir.to_path_buf());
        }

        let siblings = state.siblings_of(dir);
        if siblings > 0 {
            if let Some(processed) = processed {
                let patch = ProgressPatch::new().processed_files(processed);
                if let Err(err) = store.update(dir, &patch) {
                    warn!(
                        mission_dir = %dir.display(),
                        error = %err,
                        "Failed to update processed files"
                    );
                }
            }
            debug!(
                mission_dir = %dir.display(),
                siblings,
                "Sub-job finished; siblings still pending"
            );
            return;
        }

        let aggregate = if state.failed_dirs.remove(dir) && outcome == MissionState::Completed {
            MissionState::Failed
        } else {
            outcome
        };

        let mut patch = ProgressPatch::new().status(aggregate.progress_status());
        if let Some(processed) = processed {
            patch = patch.processed_files(processed);
        }
        if aggregate == MissionState::Completed {
            if let Ok(Some(record)) = store.read(dir) {
                patch = patch.processed_files(record.total_files);
            }
        }
        let record = match store.update(dir, &patch) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    mission_dir = %dir.display(),
                    error = %err,
                    "Failed to finalize progress record"
                );
                None
            }
        };

        let parent: PathBuf = dir.join(DESCRIPTOR_FILE_NAME);
        if own_descriptor != Some(parent.as_path()) {
            let progress = record.as_ref().map(MissionProgress::from);
            if let Err(err) = update_descriptor_state(&parent, aggregate, progress) {
                warn!(path = %parent.display(), error = %err, "Failed to update parent descriptor");
            }
        }
    }

    /// Retire running entries that can never make progress: no executor, an executor that
    /// never started, or a mission directory that disappeared.
    fn sweep_zombies(&self, state: &mut SchedulerState) -> usize {
        let mut retired = 0;
        let mut index = 0;
        while index < state.running.len() {
            let entry = &mut state.running[index];
            let vanished = entry.mission_dir().is_some_and(|dir| !dir.exists());
            let poll = entry.executor_mut().map(|executor| executor.poll());
            let reason = if vanished {
                "mission directory vanished"
            } else {
                match poll {
                    None => "no executor",
                    Some(ProcessPoll::NotStarted) => "no process",
                    Some(ProcessPoll::Exited(_)) => "process exited",
                    Some(ProcessPoll::Running) => {
                        index += 1;
                        continue;
                    }
                }
            };

            let mut mission = state.running.remove(index);
            if let Some(executor) = mission.executor_mut() {
                if let Err(err) = executor.kill() {
                    warn!(error = %err, "Failed to kill zombie process tree");
                }
            }
            warn!(
                mission_dir = ?mission.mission_dir(),
                reason,
                "Retiring mission without a live worker"
            );
            if vanished {
                mission.set_state(MissionState::Terminated);
            } else {
                self.finalize(state, &mut mission, MissionState::Terminated, None);
            }
            retired += 1;
        }
        retired
    }
}

fn outcome_for(code: Option<i32>) -> MissionState {
    match code {
        Some(0) => MissionState::Completed,
        Some(EXIT_CANCELLED) => MissionState::Terminated,
        _ => MissionState::Failed,
    }
}

/// Song count for a mission whose total was never locked: several prepared inputs under
/// `<mission_dir>/inputs`, then several audio files in the input directory, else one.
fn detect_expected(mission: &Mission, dir: &Path) -> u64 {
    let prepared = dir.join(scan::INPUTS_DIR_NAME);
    if let Ok(listing) = scan::list_input_dir(&prepared) {
        if listing.subdirs.len() > 1 {
            return listing.subdirs.len() as u64;
        }
    }
    match scan::list_input_dir(&mission.input_dir) {
        Ok(listing) if listing.audio_files.len() > 1 => listing.audio_files.len() as u64,
        _ => 1,
    }
}
