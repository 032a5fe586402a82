//! Admission control and reconciliation of separation missions.
//!
//! The scheduler owns the FIFO waiting queue and the bounded running set. A background
//! loop calls [`Scheduler::tick`] on a fixed cadence; each tick reconciles running missions
//! against process exit codes and output files, then backfills free slots.

mod launch;
mod reconcile;

use std::collections::{HashSet, VecDeque};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{self, AppConfig, ConcurrencyConfig};
use crate::fsutil;
use crate::mission::{Mission, MissionState};
use crate::preset::PresetCatalog;
use crate::progress::{ProgressPatch, ProgressStatus, ProgressStore};
use crate::scan;

pub use reconcile::TickReport;

/// How worker processes are launched and where the scheduler keeps its settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_program: PathBuf,
    /// Arguments placed before the worker flags.
    pub worker_args: Vec<String>,
    /// Forwarded to workers as `--data-dir`.
    pub data_dir: Option<PathBuf>,
    pub presets: PresetCatalog,
    pub concurrency_path: PathBuf,
    pub tick_interval: Duration,
}

impl SchedulerSettings {
    /// Settings for a scheduler hosted by the `stemflow` binary. Without a configured
    /// worker program the current executable is re-invoked as `stemflow worker`.
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let paths = config.resolved_paths(data_dir);
        let (worker_program, worker_args) = match &config.worker.program {
            Some(program) => (program.clone(), config.worker.args.clone()),
            None => {
                let exe = env::current_exe().context("failed to resolve current executable")?;
                let mut args = vec!["worker".to_string()];
                args.extend(config.worker.args.iter().cloned());
                (exe, args)
            }
        };

        Ok(Self {
            worker_program,
            worker_args,
            data_dir: Some(data_dir.to_path_buf()),
            presets: PresetCatalog::new(paths.presets_dir),
            concurrency_path: config::concurrency_config_path(data_dir),
            tick_interval: Duration::from_millis(config.scheduler.tick_interval_ms.max(50)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub thread_count: usize,
    pub batch_mode: bool,
    pub force_batch_mode: bool,
    pub waiting_count: usize,
    pub running_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobPhase {
    Waiting { position: usize },
    Running { pid: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub mission_dir: Option<PathBuf>,
    pub descriptor_path: Option<PathBuf>,
    pub input_dir: PathBuf,
    pub input_dirs: Vec<PathBuf>,
    pub preset_name: String,
    pub state: MissionState,
    #[serde(flatten)]
    pub phase: JobPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// `jobs` missions were queued: one, or one per sub-directory after fan-out.
    Queued { jobs: usize },
    /// The input directory held neither audio files nor sub-directories.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeleteOutcome {
    pub killed: usize,
    pub dequeued: usize,
    pub removed_dir: bool,
}

pub(crate) struct SchedulerState {
    pub(crate) waiting: VecDeque<Mission>,
    pub(crate) running: Vec<Mission>,
    pub(crate) thread_count: usize,
    pub(crate) batch_mode: bool,
    pub(crate) force_batch_mode: bool,
    /// Mission directories where at least one sub-job failed; the shared record is
    /// finalized as failed once the last sibling finishes.
    pub(crate) failed_dirs: HashSet<PathBuf>,
}

impl SchedulerState {
    /// Unfinished missions (batch members included) that report into `mission_dir`.
    /// A running mission already finalized from its outputs no longer counts, even while
    /// its process is still winding down.
    pub(crate) fn siblings_of(&self, mission_dir: &Path) -> usize {
        self.waiting
            .iter()
            .chain(self.running.iter())
            .filter(|mission| !mission.state.is_terminal())
            .filter(|mission| reports_into(mission, mission_dir))
            .count()
    }
}

pub(crate) fn reports_into(mission: &Mission, mission_dir: &Path) -> bool {
    mission.mission_dir() == Some(mission_dir)
        || mission
            .members()
            .iter()
            .any(|member| member.mission_dir() == Some(mission_dir))
}

struct SchedulerInner {
    settings: SchedulerSettings,
    store: Arc<ProgressStore>,
    state: Mutex<SchedulerState>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, store: Arc<ProgressStore>) -> Result<Self> {
        let concurrency = ConcurrencyConfig::load_or_create(&settings.concurrency_path)?;
        info!(
            thread_count = concurrency.thread_count,
            worker = %settings.worker_program.display(),
            "Scheduler initialized"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                settings,
                store,
                state: Mutex::new(SchedulerState {
                    waiting: VecDeque::new(),
                    running: Vec::new(),
                    thread_count: concurrency.thread_count,
                    batch_mode: false,
                    force_batch_mode: false,
                    failed_dirs: HashSet::new(),
                }),
            }),
        })
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the reconciliation loop. The returned handle completes once `token` is
    /// cancelled and any in-flight tick has finished.
    pub fn start(&self, token: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let interval = scheduler.inner.settings.tick_interval;
            info!(interval_ms = interval.as_millis() as u64, "Scheduler loop started");

            while !token.is_cancelled() {
                let started = Instant::now();
                let ticking = scheduler.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || ticking.tick()).await {
                    error!(error = %err, "Scheduler tick panicked");
                }

                let wait = interval.saturating_sub(started.elapsed());
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            info!("Scheduler loop stopped");
        })
    }

    /// Register a mission. Missions whose input holds sub-directories instead of audio
    /// files fan out into one sub-job per sub-directory, all sharing the parent's
    /// progress record; the parent itself is not queued.
    pub fn enqueue(&self, mut mission: Mission) -> Result<EnqueueOutcome> {
        let Some(mission_dir) = mission.derive_mission_dir().map(Path::to_path_buf) else {
            bail!(
                "mission for {} has neither a mission directory nor a descriptor path",
                mission.input_dir.display()
            );
        };
        let store = &self.inner.store;
        store.initialize(&mission_dir, &mission.input_dir, Some(&mission.preset_name))?;

        let listing = match scan::list_input_dir(&mission.input_dir) {
            Ok(listing) => listing,
            Err(err) => {
                self.mark_failed(&mut mission);
                return Err(err).with_context(|| {
                    format!("failed to list input directory {}", mission.input_dir.display())
                });
            }
        };

        if !listing.audio_files.is_empty() {
            let total = listing.audio_files.len() as u64;
            store.update(
                &mission_dir,
                &ProgressPatch::new().total_files(total).lock_total(),
            )?;
            mission.set_state(MissionState::Waiting);
            mission.write(store)?;

            info!(
                mission_dir = %mission_dir.display(),
                files = total,
                "Mission queued"
            );
            self.lock().waiting.push_back(mission);
            return Ok(EnqueueOutcome::Queued { jobs: 1 });
        }

        if listing.subdirs.is_empty() {
            warn!(
                mission_dir = %mission_dir.display(),
                input_dir = %mission.input_dir.display(),
                "Mission input holds no audio files or song folders; marking failed"
            );
            self.mark_failed(&mut mission);
            return Ok(EnqueueOutcome::Empty);
        }

        let mut subs = Vec::with_capacity(listing.subdirs.len());
        for subdir in &listing.subdirs {
            let name = subdir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let descriptor = mission_dir.join(format!("mission_{name}.json"));
            let mut sub = mission.sub_mission(subdir.clone(), descriptor);
            sub.set_state(MissionState::Waiting);
            sub.write(store)?;
            subs.push(sub);
        }

        let jobs = subs.len();
        store.update(
            &mission_dir,
            &ProgressPatch::new().total_files(jobs as u64).lock_total(),
        )?;
        mission.set_state(MissionState::Waiting);
        mission.write(store)?;

        info!(
            mission_dir = %mission_dir.display(),
            sub_jobs = jobs,
            "Mission fanned out into sub-jobs"
        );
        self.lock().waiting.extend(subs);
        Ok(EnqueueOutcome::Queued { jobs })
    }

    fn mark_failed(&self, mission: &mut Mission) {
        mission.set_state(MissionState::Failed);
        let store = &self.inner.store;
        if let Err(err) = mission.update_progress(store, None, None, Some(ProgressStatus::Failed)) {
            warn!(error = %err, "Failed to record mission failure in progress store");
        }
        if let Err(err) = mission.write(store) {
            warn!(error = %err, "Failed to write failed mission descriptor");
        }
    }

    /// Administrative delete: kill any running process tree, drop the mission from both
    /// queues, clear its progress and remove its directory.
    pub fn delete_job(&self, mission_dir: &Path) -> Result<DeleteOutcome> {
        let mut outcome = DeleteOutcome::default();
        let store = &self.inner.store;
        let mut state = self.lock();

        let mut index = 0;
        while index < state.running.len() {
            if !reports_into(&state.running[index], mission_dir) {
                index += 1;
                continue;
            }
            let mut mission = state.running.remove(index);
            if let Some(executor) = mission.executor_mut() {
                match executor.kill() {
                    Ok(()) => outcome.killed += 1,
                    Err(err) => error!(
                        mission_dir = %mission_dir.display(),
                        error = %err,
                        "Failed to kill mission process tree"
                    ),
                }
            }

            for member in mission.members() {
                let Some(member_dir) = member.mission_dir() else {
                    continue;
                };
                if member_dir == mission_dir || !member_dir.exists() {
                    continue;
                }
                let mut member = member.clone();
                member.set_state(MissionState::Terminated);
                if let Err(err) =
                    member.update_progress(store, None, None, Some(ProgressStatus::Terminated))
                {
                    warn!(error = %err, "Failed to mark batch member terminated");
                }
                if let Err(err) = member.write(store) {
                    warn!(error = %err, "Failed to write terminated batch member descriptor");
                }
            }
        }

        let before = state.waiting.len();
        state.waiting.retain(|mission| !reports_into(mission, mission_dir));
        outcome.dequeued = before - state.waiting.len();
        state.failed_dirs.remove(mission_dir);
        drop(state);

        store.clear(mission_dir)?;
        if outcome.killed > 0 {
            info!(
                mission_dir = %mission_dir.display(),
                "Process tree killed; accelerator memory is released with it"
            );
        }
        outcome.removed_dir = fsutil::remove_dir_all_if_exists(mission_dir)?;

        info!(
            mission_dir = %mission_dir.display(),
            killed = outcome.killed,
            dequeued = outcome.dequeued,
            removed_dir = outcome.removed_dir,
            "Mission deleted"
        );
        Ok(outcome)
    }

    /// Set and persist the concurrency limit. Returns the clamped value applied.
    pub fn set_concurrency(&self, thread_count: usize) -> Result<usize> {
        let applied = config::clamp_thread_count(thread_count);
        ConcurrencyConfig {
            thread_count: applied,
        }
        .save(&self.inner.settings.concurrency_path)?;
        self.lock().thread_count = applied;
        info!(requested = thread_count, applied, "Concurrency updated");
        Ok(applied)
    }

    pub fn set_batch_mode(&self, enabled: bool) {
        self.lock().batch_mode = enabled;
        info!(enabled, "Batch mode updated");
    }

    pub fn set_force_batch_mode(&self, enabled: bool) {
        self.lock().force_batch_mode = enabled;
        info!(enabled, "Force batch mode updated");
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        SchedulerStatus {
            thread_count: state.thread_count,
            batch_mode: state.batch_mode,
            force_batch_mode: state.force_batch_mode,
            waiting_count: state.waiting.len(),
            running_count: state.running.len(),
            total_count: state.waiting.len() + state.running.len(),
        }
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let state = self.lock();
        let snapshot = |mission: &Mission, phase: JobPhase| JobSnapshot {
            mission_dir: mission.mission_dir().map(Path::to_path_buf),
            descriptor_path: mission.descriptor_path().map(Path::to_path_buf),
            input_dir: mission.input_dir.clone(),
            input_dirs: mission.input_dirs.clone(),
            preset_name: mission.preset_name.clone(),
            state: mission.state,
            phase,
        };

        let running = state.running.iter().map(|mission| {
            snapshot(
                mission,
                JobPhase::Running {
                    pid: mission.executor().and_then(|executor| executor.pid()),
                },
            )
        });
        let waiting = state
            .waiting
            .iter()
            .enumerate()
            .map(|(position, mission)| snapshot(mission, JobPhase::Waiting { position }));
        running.chain(waiting).collect()
    }
}
