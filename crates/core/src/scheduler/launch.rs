use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::{Scheduler, SchedulerState};
use crate::executor::StartOutcome;
use crate::mission::{update_descriptor_state, Mission, MissionState, DESCRIPTOR_FILE_NAME};
use crate::progress::{ProgressPatch, ProgressStatus};
use crate::scan;

pub(crate) const WORKER_LOG_FILE_NAME: &str = "worker.log";

impl Scheduler {
    /// Start the next waiting mission (or merged batch). Returns `false` when nothing
    /// was waiting.
    pub(crate) fn start_next_locked(&self, state: &mut SchedulerState) -> bool {
        if state.waiting.is_empty() {
            return false;
        }
        if state.batch_mode && state.force_batch_mode {
            self.start_batch_locked(state)
        } else {
            self.start_single_locked(state)
        }
    }

    fn start_single_locked(&self, state: &mut SchedulerState) -> bool {
        let Some(mission) = state.waiting.pop_front() else {
            return false;
        };

        if let Some(dir) = mission.mission_dir() {
            if !dir.exists() {
                warn!(
                    mission_dir = %dir.display(),
                    "Mission directory vanished while queued; dropping mission"
                );
                return true;
            }
        }

        if let Some(mission) = self.launch(state, mission) {
            state.running.push(mission);
        }
        true
    }

    /// Merge every waiting mission sharing the head's preset, format and debug flag into
    /// one worker invocation. Falls back to a single start when only the head qualifies.
    fn start_batch_locked(&self, state: &mut SchedulerState) -> bool {
        let Some(head) = state.waiting.front() else {
            return false;
        };
        let key = (head.preset_name.clone(), head.output_format, head.debug);

        let matching: Vec<usize> = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, mission)| {
                (mission.preset_name.clone(), mission.output_format, mission.debug) == key
            })
            .map(|(index, _)| index)
            .collect();

        if matching.len() < 2 {
            return self.start_single_locked(state);
        }

        let mut members = Vec::with_capacity(matching.len());
        for index in matching.iter().rev() {
            if let Some(mission) = state.waiting.remove(*index) {
                members.push(mission);
            }
        }
        members.reverse();

        let Some(batch) = merge_batch(members) else {
            return false;
        };
        info!(
            inputs = batch.input_dirs.len(),
            preset = %batch.preset_name,
            output_dir = %batch.output_dir.display(),
            "Starting merged batch"
        );
        if let Some(batch) = self.launch(state, batch) {
            state.running.push(batch);
        }
        true
    }

    /// Spawn the worker for `mission`. A mission that cannot be started is marked failed
    /// and not returned, so it never occupies a running slot.
    fn launch(&self, state: &mut SchedulerState, mut mission: Mission) -> Option<Mission> {
        let spawned = self.worker_command(&mission).and_then(|mut command| {
            mission.ensure_executor().start(&mut command)
        });

        match spawned {
            Ok(StartOutcome::Started { pid }) | Ok(StartOutcome::AlreadyRunning { pid }) => {
                self.mark_running(&mut mission);
                info!(
                    pid,
                    mission_dir = ?mission.mission_dir(),
                    preset = %mission.preset_name,
                    "Mission started"
                );
                Some(mission)
            }
            Err(err) => {
                error!(
                    mission_dir = ?mission.mission_dir(),
                    input_dir = %mission.input_dir.display(),
                    error = %format!("{err:#}"),
                    "Failed to start worker process; marking mission failed"
                );
                self.finalize(state, &mut mission, MissionState::Failed, None);
                None
            }
        }
    }

    /// Move the mission (and every batch member) to `running` in memory, in the progress
    /// records it reports into, and in its descriptors.
    fn mark_running(&self, mission: &mut Mission) {
        let store = self.store();
        mission.set_state(MissionState::Running);

        for dir in progress_dirs(mission) {
            let patch = ProgressPatch::new().status(ProgressStatus::Running);
            if let Err(err) = store.update(&dir, &patch) {
                warn!(
                    mission_dir = %dir.display(),
                    error = %err,
                    "Failed to update progress status"
                );
            }
            let parent = dir.join(DESCRIPTOR_FILE_NAME);
            if mission.descriptor_path() != Some(parent.as_path()) {
                if let Err(err) = update_descriptor_state(&parent, MissionState::Running, None) {
                    warn!(
                        path = %parent.display(),
                        error = %err,
                        "Failed to mark parent descriptor running"
                    );
                }
            }
        }

        self.persist(mission);
    }

    /// Write the mission descriptor and, for a merged batch, each member's descriptor.
    pub(crate) fn persist(&self, mission: &Mission) {
        let store = self.store();
        if let Err(err) = mission.write(store) {
            warn!(error = %err, "Failed to write mission descriptor");
        }
        for member in mission.members() {
            let mut member = member.clone();
            member.set_state(mission.state);
            if let Err(err) = member.write(store) {
                warn!(error = %err, "Failed to write batch member descriptor");
            }
        }
    }

    fn worker_command(&self, mission: &Mission) -> Result<Command> {
        let settings = self.settings();
        let mut command = Command::new(&settings.worker_program);
        command.args(&settings.worker_args);
        command
            .arg("-p")
            .arg(settings.presets.path_for(&mission.preset_name));
        for input in mission.inputs() {
            command.arg("-i").arg(input);
        }
        command
            .arg("-o")
            .arg(&mission.output_dir)
            .arg("-f")
            .arg(mission.output_format.as_str());
        if let Some(dir) = mission.mission_dir() {
            command.arg("--mission-dir").arg(dir);
        }
        if let Some(data_dir) = &settings.data_dir {
            command.arg("--data-dir").arg(data_dir);
        }
        if mission.skip_existing_files {
            command.arg("--skip-existing");
        }
        if mission.debug {
            command.arg("--debug");
        }
        if mission.is_batch() {
            command.arg("--batch");
        }

        command.stdin(Stdio::null());
        match mission.mission_dir() {
            Some(dir) => {
                let log = open_worker_log(dir)?;
                let log_err = log
                    .try_clone()
                    .context("failed to duplicate worker log handle")?;
                command.stdout(log).stderr(log_err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(command)
    }
}

/// Distinct progress directories a mission reports into: its own, then its batch members'.
pub(crate) fn progress_dirs(mission: &Mission) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in std::iter::once(mission.mission_dir())
        .chain(mission.members().iter().map(Mission::mission_dir))
        .flatten()
    {
        if !dirs.iter().any(|known| known == dir) {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs
}

fn open_worker_log(mission_dir: &Path) -> Result<std::fs::File> {
    let path = mission_dir.join(WORKER_LOG_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open worker log {}", path.display()))
}

/// One synthetic mission covering every input of `members`, writing into a shared
/// `batch_output` directory next to the first member's output directory.
fn merge_batch(members: Vec<Mission>) -> Option<Mission> {
    let first = members.first()?;
    let mut batch = first.clone();
    batch.input_dirs = members.iter().map(|mission| mission.input_dir.clone()).collect();
    batch.output_dir = first
        .output_dir
        .parent()
        .map(|parent| parent.join(scan::BATCH_OUTPUT_DIR_NAME))
        .unwrap_or_else(|| first.output_dir.join(scan::BATCH_OUTPUT_DIR_NAME));
    batch.clear_descriptor_path();
    for member in members {
        batch.add_member(member);
    }
    Some(batch)
}
