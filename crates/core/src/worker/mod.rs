//! The separation worker: the process the scheduler spawns once per mission.
//!
//! A worker loads a preset, resolves each step's model, runs the steps in order and
//! reports progress into the mission's `progress.json`. Its exit code is the only result
//! the scheduler reads: [`EXIT_SUCCESS`], [`EXIT_FAILURE`] or [`EXIT_CANCELLED`].

mod catalog;
mod pipeline;
mod runner;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use catalog::{ModelCatalog, ModelEntry, ModelResolver};
pub use pipeline::{Pipeline, PipelineOutcome, WorkerJob};
pub use runner::{
    route_stems, CommandStepRunner, StemRoutes, StepInput, StepOutcome, StepRequest, StepRunner,
};

use crate::config::AppConfig;
use crate::logging;
use crate::mission::{OutputFormat, DESCRIPTOR_FILE_NAME};
use crate::preset::PresetCatalog;
use crate::progress::ProgressStore;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Conventional shell code for an interrupted process.
pub const EXIT_CANCELLED: i32 = 130;

/// Levels above the first input directory searched for a mission descriptor.
const MISSION_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub preset: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub skip_existing: bool,
    pub debug: bool,
    pub batch: bool,
    pub mission_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed,
    Cancelled,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Success => EXIT_SUCCESS,
            WorkerExit::Failed => EXIT_FAILURE,
            WorkerExit::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Mission directory progress is reported into. An explicit directory wins; otherwise
/// the first input directory and its ancestors are searched, preferring one holding
/// `mission.json` over one holding only `mission_*.json`.
pub fn discover_mission_dir(explicit: Option<&Path>, inputs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    let start = inputs.first()?;
    let candidates: Vec<&Path> = start.ancestors().take(MISSION_SEARCH_DEPTH + 1).collect();

    if let Some(dir) = candidates
        .iter()
        .find(|dir| dir.join(DESCRIPTOR_FILE_NAME).is_file())
    {
        return Some(dir.to_path_buf());
    }
    candidates
        .iter()
        .find(|dir| has_sub_descriptor(dir))
        .map(|dir| dir.to_path_buf())
}

fn has_sub_descriptor(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(Result::ok).any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        name.starts_with("mission_") && name.ends_with(".json")
    })
}

/// Run the worker with the default collaborators built from `config`.
pub fn run(
    args: &WorkerArgs,
    config: &AppConfig,
    data_dir: &Path,
    cancel: &CancellationToken,
) -> WorkerExit {
    let paths = config.resolved_paths(data_dir);
    let catalog = match ModelCatalog::load(&paths.models_file) {
        Ok(catalog) => catalog,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Failed to load model catalog");
            return WorkerExit::Failed;
        }
    };
    let runner = CommandStepRunner::from_config(&config.separator);
    let store = ProgressStore::new()
        .with_presets(PresetCatalog::new(&paths.presets_dir))
        .with_log_dir(logging::log_dir(data_dir));

    run_with(args, &catalog, &runner, &store, &paths.cache_dir, cancel)
}

/// Run the worker against explicit collaborators.
pub fn run_with(
    args: &WorkerArgs,
    resolver: &dyn ModelResolver,
    runner: &dyn StepRunner,
    store: &ProgressStore,
    cache_dir: &Path,
    cancel: &CancellationToken,
) -> WorkerExit {
    let mission_dir = discover_mission_dir(args.mission_dir.as_deref(), &args.inputs);
    info!(
        preset = %args.preset.display(),
        inputs = args.inputs.len(),
        output_dir = %args.output_dir.display(),
        format = %args.format,
        mission_dir = ?mission_dir,
        skip_existing = args.skip_existing,
        batch = args.batch,
        "Worker started"
    );

    let job = WorkerJob {
        preset_path: args.preset.clone(),
        inputs: args.inputs.clone(),
        store_dir: args.output_dir.clone(),
        output_format: args.format,
        skip_existing: args.skip_existing,
        batch: args.batch,
        mission_dir,
        cache_dir: cache_dir.to_path_buf(),
    };

    match Pipeline::new(resolver, runner, store).run(&job, cancel) {
        Ok(PipelineOutcome::Completed { .. }) | Ok(PipelineOutcome::Skipped) => WorkerExit::Success,
        Ok(PipelineOutcome::Cancelled) => {
            info!("Worker cancelled by user");
            WorkerExit::Cancelled
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Preset inference failed");
            WorkerExit::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(WorkerExit::Success.code(), 0);
        assert_eq!(WorkerExit::Failed.code(), 1);
        assert_eq!(WorkerExit::Cancelled.code(), 130);
    }

    #[test]
    fn explicit_mission_dir_wins() {
        let found = discover_mission_dir(Some(Path::new("/m")), &[PathBuf::from("/x")]);
        assert_eq!(found, Some(PathBuf::from("/m")));
    }

    #[test]
    fn discovery_prefers_main_descriptor() {
        let temp = tempfile::tempdir().unwrap();
        let mission = temp.path().join("mission");
        let song = mission.join("inputs").join("song");
        fs::create_dir_all(&song).unwrap();
        fs::write(mission.join("mission.json"), "{}").unwrap();
        fs::write(mission.join("inputs").join("mission_song.json"), "{}").unwrap();

        let found = discover_mission_dir(None, &[song.clone()]);
        assert_eq!(found, Some(mission));

        fs::remove_file(temp.path().join("mission").join("mission.json")).unwrap();
        let found = discover_mission_dir(None, &[song]);
        assert_eq!(found, Some(temp.path().join("mission").join("inputs")));
    }

    #[test]
    fn discovery_stops_after_three_levels() {
        let temp = tempfile::tempdir().unwrap();
        let deep = temp.path().join("a").join("b").join("c").join("d");
        fs::create_dir_all(&deep).unwrap();
        fs::write(temp.path().join("mission.json"), "{}").unwrap();

        assert_eq!(discover_mission_dir(None, &[deep]), None);
        assert_eq!(discover_mission_dir(None, &[]), None);
    }

    #[test]
    fn missing_catalog_fails_the_worker() {
        let temp = tempfile::tempdir().unwrap();
        let args = WorkerArgs {
            preset: temp.path().join("preset.json"),
            inputs: vec![temp.path().join("in")],
            output_dir: temp.path().join("out"),
            format: OutputFormat::Wav,
            skip_existing: false,
            debug: false,
            batch: false,
            mission_dir: None,
        };
        let exit = run(&args, &AppConfig::default(), temp.path(), &CancellationToken::new());
        assert_eq!(exit, WorkerExit::Failed);
    }
}
