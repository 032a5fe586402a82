use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::{ModelEntry, ModelResolver};
use super::runner::{StemRoutes, StepInput, StepOutcome, StepRequest, StepRunner};
use crate::mission::OutputFormat;
use crate::preset::Preset;
use crate::progress::{ProgressPatch, ProgressStore};
use crate::scan;

/// One worker invocation, as received on the command line.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub preset_path: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub store_dir: PathBuf,
    pub output_format: OutputFormat,
    pub skip_existing: bool,
    pub batch: bool,
    pub mission_dir: Option<PathBuf>,
    /// Parent of the per-run temporary tree.
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineOutcome {
    Completed { time_cost: f64 },
    /// Every final output already existed, or there was no input audio.
    Skipped,
    Cancelled,
}

/// The audio files of one input directory that still need processing.
#[derive(Debug, Clone)]
struct Lane {
    name: String,
    files: Vec<PathBuf>,
}

/// Runs a preset's steps in order, feeding each step's forwarded stem into the next.
pub struct Pipeline<'a> {
    resolver: &'a dyn ModelResolver,
    runner: &'a dyn StepRunner,
    store: &'a ProgressStore,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        resolver: &'a dyn ModelResolver,
        runner: &'a dyn StepRunner,
        store: &'a ProgressStore,
    ) -> Self {
        Self {
            resolver,
            runner,
            store,
        }
    }

    pub fn run(&self, job: &WorkerJob, cancel: &CancellationToken) -> Result<PipelineOutcome> {
        let preset = Preset::load(&job.preset_path)?;
        debug!(
            preset = %job.preset_path.display(),
            version = ?preset.version,
            total_steps = preset.total_steps(),
            store_dir = %job.store_dir.display(),
            output_format = %job.output_format,
            "Loaded preset"
        );
        for (index, step) in preset.flow.iter().enumerate() {
            if index + 1 < preset.total_steps() && step.input_to_next.is_empty() {
                bail!(
                    "step {} ({}) forwards no stem to the next step",
                    index + 1,
                    step.model_name
                );
            }
        }
        let models = preset
            .flow
            .iter()
            .map(|step| self.resolver.resolve(step.model_type, &step.model_name))
            .collect::<Result<Vec<_>>>()?;

        fs::create_dir_all(&job.store_dir)
            .with_context(|| format!("failed to create {}", job.store_dir.display()))?;

        fs::create_dir_all(&job.cache_dir)
            .with_context(|| format!("failed to create {}", job.cache_dir.display()))?;
        let temp_root = tempfile::Builder::new()
            .prefix("preset_task_")
            .tempdir_in(&job.cache_dir)
            .with_context(|| format!("failed to create task dir in {}", job.cache_dir.display()))?;

        let result = self.run_in(job, &preset, &models, temp_root.path(), cancel);
        let temp_path = temp_root.path().to_path_buf();
        if let Err(err) = temp_root.close() {
            warn!(
                path = %temp_path.display(),
                error = %err,
                "Failed to remove temporary directory"
            );
        }
        result
    }

    fn run_in(
        &self,
        job: &WorkerJob,
        preset: &Preset,
        models: &[ModelEntry],
        temp_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let lanes = plan_lanes(job, preset, temp_root)?;
        if lanes.is_empty() {
            info!(
                store_dir = %job.store_dir.display(),
                "Skipping preset inference: every final output already exists"
            );
            return Ok(PipelineOutcome::Skipped);
        }

        let reporter = ProgressReporter {
            store: self.store,
            mission_dir: job.mission_dir.as_deref(),
            store_dir: &job.store_dir,
            outputs_per_song: preset.outputs_per_song() as u64,
        };

        info!(
            preset = %job.preset_path.display(),
            lanes = lanes.len(),
            batch = job.batch,
            "Starting preset inference process"
        );
        let started = Instant::now();

        if job.batch && lanes.len() > 1 {
            let outcome =
                self.run_steps(job, preset, models, &lanes, temp_root, &reporter, cancel)?;
            if outcome == StepOutcome::Cancelled {
                return Ok(PipelineOutcome::Cancelled);
            }
        } else {
            for (index, lane) in lanes.iter().enumerate() {
                let lane_root = if lanes.len() == 1 {
                    temp_root.to_path_buf()
                } else {
                    temp_root.join(format!("lane_{index}"))
                };
                let outcome = self.run_steps(
                    job,
                    preset,
                    models,
                    std::slice::from_ref(lane),
                    &lane_root,
                    &reporter,
                    cancel,
                )?;
                if outcome == StepOutcome::Cancelled {
                    return Ok(PipelineOutcome::Cancelled);
                }
            }
        }

        reporter.processed();
        let time_cost = started.elapsed().as_secs_f64();
        info!(
            "Preset: {} inference process completed, results saved to {}, time cost: {:.2}s",
            job.preset_path.display(),
            job.store_dir.display(),
            time_cost
        );
        Ok(PipelineOutcome::Completed { time_cost })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_steps(
        &self,
        job: &WorkerJob,
        preset: &Preset,
        models: &[ModelEntry],
        lanes: &[Lane],
        temp_root: &Path,
        reporter: &ProgressReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let total_steps = preset.total_steps();
        let mut current: Vec<Vec<PathBuf>> = lanes.iter().map(|lane| lane.files.clone()).collect();

        for (index, (step, model)) in preset.flow.iter().zip(models).enumerate() {
            let number = index + 1;
            let last = number == total_steps;
            let next_dirs: Vec<PathBuf> = lanes
                .iter()
                .enumerate()
                .map(|(lane_index, lane)| {
                    let step_dir = temp_root.join(format!("step_{number}_output"));
                    if last {
                        job.store_dir.clone()
                    } else if lanes.len() == 1 {
                        step_dir
                    } else {
                        step_dir.join(format!("{lane_index}_{}", lane.name))
                    }
                })
                .collect();

            let mut inputs = Vec::new();
            for (files, next_dir) in current.iter().zip(&next_dirs) {
                for file in files {
                    let mut routes = StemRoutes::new();
                    if !step.input_to_next.is_empty() {
                        routes
                            .entry(step.input_to_next.clone())
                            .or_default()
                            .push(next_dir.clone());
                    }
                    for stem in &step.output_to_storage {
                        let dirs = routes.entry(stem.clone()).or_default();
                        if !dirs.contains(&job.store_dir) {
                            dirs.push(job.store_dir.clone());
                        }
                    }
                    inputs.push(StepInput {
                        file: file.clone(),
                        routes,
                    });
                }
            }

            info!(
                step = number,
                inputs = inputs.len(),
                "Step {number}: Running inference using {}",
                model.name
            );
            reporter.step(number, 0);
            reporter.processed();

            let scratch = temp_root.join(format!("step_{number}_tmp"));
            let request = StepRequest {
                step: number,
                model,
                inputs: &inputs,
                output_format: job.output_format,
                scratch_dir: &scratch,
                skip_existing: job.skip_existing,
            };
            let outcome = self
                .runner
                .run_step(
                    &request,
                    &mut |done| {
                        reporter.step(number, done);
                        reporter.processed();
                    },
                    cancel,
                )
                .with_context(|| format!("step {number} ({}) failed", model.name))?;
            if outcome == StepOutcome::Cancelled {
                info!(step = number, "Inference cancelled; later steps skipped");
                return Ok(StepOutcome::Cancelled);
            }

            if !last {
                current = next_dirs
                    .iter()
                    .map(|dir| {
                        scan::list_input_dir(dir)
                            .map(|listing| listing.audio_files)
                            .unwrap_or_default()
                    })
                    .collect();
                if current.iter().all(Vec::is_empty) {
                    bail!(
                        "step {number} ({}) produced no {} stem for the next step",
                        model.name,
                        step.input_to_next
                    );
                }
            }
        }
        Ok(StepOutcome::Completed)
    }
}

/// Audio files per input directory. With skip-existing, inputs whose final output is
/// present are dropped; a partially complete directory has its missing originals copied
/// into an isolated temporary input set.
fn plan_lanes(job: &WorkerJob, preset: &Preset, temp_root: &Path) -> Result<Vec<Lane>> {
    let mut lanes = Vec::new();
    for (index, input_dir) in job.inputs.iter().enumerate() {
        let files = scan::list_input_dir(input_dir)
            .with_context(|| format!("failed to list input dir {}", input_dir.display()))?
            .audio_files;
        let name = input_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("input_{index}"));
        if files.is_empty() {
            warn!(input_dir = %input_dir.display(), "Input directory has no audio files");
            continue;
        }

        if !job.skip_existing || !preset.last_step_stores_outputs() {
            lanes.push(Lane { name, files });
            continue;
        }

        let missing: Vec<PathBuf> = files
            .iter()
            .filter(|file| !final_output_path(job, preset, file).exists())
            .cloned()
            .collect();
        if missing.is_empty() {
            info!(input_dir = %input_dir.display(), "All final outputs exist; skipping input");
            continue;
        }
        if missing.len() == files.len() {
            lanes.push(Lane { name, files });
            continue;
        }

        let temp_input = if job.inputs.len() == 1 {
            temp_root.join("temp_input")
        } else {
            temp_root.join("temp_input").join(format!("{index}_{name}"))
        };
        fs::create_dir_all(&temp_input)
            .with_context(|| format!("failed to create {}", temp_input.display()))?;
        let mut copies = Vec::with_capacity(missing.len());
        for file in &missing {
            let Some(file_name) = file.file_name() else {
                continue;
            };
            let target = temp_input.join(file_name);
            fs::copy(file, &target).with_context(|| {
                format!("failed to copy {} to {}", file.display(), target.display())
            })?;
            copies.push(target);
        }
        info!(
            input_dir = %input_dir.display(),
            missing = copies.len(),
            total = files.len(),
            "Processing only inputs with missing outputs"
        );
        lanes.push(Lane {
            name,
            files: copies,
        });
    }
    Ok(lanes)
}

fn final_output_path(job: &WorkerJob, preset: &Preset, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    job.store_dir.join(format!(
        "{}.{}",
        preset.final_file_stem(&stem),
        job.output_format.as_str()
    ))
}

/// Writes live progress into the mission's record. Failures are logged, never fatal.
struct ProgressReporter<'a> {
    store: &'a ProgressStore,
    mission_dir: Option<&'a Path>,
    store_dir: &'a Path,
    outputs_per_song: u64,
}

impl ProgressReporter<'_> {
    fn step(&self, step: usize, processed: usize) {
        let Some(dir) = self.mission_dir else {
            return;
        };
        if let Err(err) = self
            .store
            .update_step_progress(dir, step as u32, processed as u64)
        {
            warn!(mission_dir = %dir.display(), error = %err, "Failed to update step progress");
        }
    }

    /// Raise `processed_files` to the number of songs with outputs in the store dir.
    /// The count never moves backwards and never exceeds the total.
    fn processed(&self) {
        let Some(dir) = self.mission_dir else {
            return;
        };
        let songs = scan::count_output_files_recursive(self.store_dir) as u64
            / self.outputs_per_song.max(1);
        let record = match self.store.read(dir) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(mission_dir = %dir.display(), error = %err, "Failed to read progress");
                return;
            }
        };
        let processed = songs.min(record.total_files);
        if processed <= record.processed_files {
            return;
        }
        let patch = ProgressPatch::new().processed_files(processed);
        if let Err(err) = self.store.update(dir, &patch) {
            warn!(mission_dir = %dir.display(), error = %err, "Failed to update processed files");
        }
    }
}
