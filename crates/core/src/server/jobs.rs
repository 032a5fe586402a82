use std::fs;
use std::io::ErrorKind;
use std::path::{Path as StdPath, PathBuf};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppError, AppState};
use crate::mission::{
    Mission, MissionDescriptor, MissionProgress, MissionState, OutputFormat, DESCRIPTOR_FILE_NAME,
};
use crate::progress::{format_duration, ProgressRecord};
use crate::scheduler::{DeleteOutcome, EnqueueOutcome, JobPhase};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub owner: String,
    pub preset_name: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_true")]
    pub skip_existing_files: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub owner: String,
    pub mission: String,
    pub mission_dir: PathBuf,
    /// Queue entries created: 1, or one per input subdirectory.
    pub jobs: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub owner: String,
    pub mission: String,
    pub preset_name: String,
    pub state: MissionState,
    pub progress: MissionProgress,
    /// Where the scheduler holds the mission, absent once it has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<JobPhase>,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub owner: String,
    pub mission: String,
    pub descriptor: MissionDescriptor,
    pub progress: Option<ProgressRecord>,
    pub total_duration_secs: f64,
    pub processing_duration_secs: f64,
    pub total_duration: String,
    pub processing_duration: String,
    /// Where the scheduler holds the mission, absent once it has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<JobPhase>,
}

/// Owner and mission names become directory names, so only plain single segments pass.
fn validate_segment(kind: &str, value: &str) -> Result<(), AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed != value
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
    {
        return Err(AppError::BadRequest(format!("invalid {kind}: {value:?}")));
    }
    Ok(())
}

fn mission_dir_for(state: &AppState, owner: &str, mission: &str) -> Result<PathBuf, AppError> {
    validate_segment("owner", owner)?;
    validate_segment("mission", mission)?;
    Ok(state.inner.missions_dir.join(owner).join(mission))
}

/// The scheduler's view of a mission, if it is queued or running.
fn phase_for(state: &AppState, mission_dir: &StdPath) -> Option<JobPhase> {
    state
        .inner
        .scheduler
        .jobs()
        .into_iter()
        .find(|job| job.mission_dir.as_deref() == Some(mission_dir))
        .map(|job| job.phase)
}

fn fresh_mission_name(owner_dir: &StdPath) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    if !owner_dir.join(&stamp).exists() {
        return stamp;
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp}_{}", &suffix[..6])
}

pub(super) async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    validate_segment("owner", &payload.owner)?;
    if payload.preset_name.trim().is_empty() {
        return Err(AppError::BadRequest("preset_name is required".to_string()));
    }
    let preset_path = state.inner.presets.path_for(&payload.preset_name);
    if !preset_path.is_file() {
        return Err(AppError::BadRequest(format!(
            "preset not found: {}",
            payload.preset_name
        )));
    }
    if !payload.input_path.is_dir() {
        return Err(AppError::BadRequest(format!(
            "input path is not a directory: {}",
            payload.input_path.display()
        )));
    }

    let owner_dir = state.inner.missions_dir.join(&payload.owner);
    let mission_name = fresh_mission_name(&owner_dir);
    let mission_dir = owner_dir.join(&mission_name);
    fs::create_dir_all(&owner_dir).map_err(|err| {
        AppError::Internal(format!("failed to create {}: {err}", owner_dir.display()))
    })?;
    match fs::create_dir(&mission_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(AppError::Conflict(format!(
                "mission already exists: {}/{mission_name}",
                payload.owner
            )))
        }
        Err(err) => {
            return Err(AppError::Internal(format!(
                "failed to create mission dir {}: {err}",
                mission_dir.display()
            )))
        }
    }

    let mut mission = Mission::new(
        payload.input_path,
        payload.output_path,
        payload.preset_name,
    )
    .with_descriptor_path(mission_dir.join(DESCRIPTOR_FILE_NAME));
    mission.output_format = payload.output_format;
    mission.skip_existing_files = payload.skip_existing_files;

    let jobs = match state.inner.scheduler.enqueue(mission)? {
        EnqueueOutcome::Queued { jobs } => jobs,
        EnqueueOutcome::Empty => {
            return Err(AppError::BadRequest(
                "input directory contains no audio files or subdirectories".to_string(),
            ))
        }
    };

    info!(
        owner = %payload.owner,
        mission = %mission_name,
        jobs,
        "Mission submitted"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            owner: payload.owner,
            mission: mission_name,
            mission_dir,
            jobs,
        }),
    ))
}

pub(super) async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSummary>>, AppError> {
    let owners = match &query.owner {
        Some(owner) => {
            validate_segment("owner", owner)?;
            vec![owner.clone()]
        }
        None => subdirectory_names(&state.inner.missions_dir),
    };

    let snapshots = state.inner.scheduler.jobs();
    let mut summaries = Vec::new();
    for owner in owners {
        let owner_dir = state.inner.missions_dir.join(&owner);
        for mission in subdirectory_names(&owner_dir) {
            let mission_dir = owner_dir.join(&mission);
            let descriptor_path = mission_dir.join(DESCRIPTOR_FILE_NAME);
            let descriptor = match MissionDescriptor::load(&descriptor_path) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(
                        mission_dir = %mission_dir.display(),
                        error = %format!("{err:#}"),
                        "Skipping unreadable mission"
                    );
                    continue;
                }
            };
            let progress = match state.inner.store.read(&mission_dir) {
                Ok(Some(record)) => MissionProgress::from(&record),
                _ => descriptor.progress,
            };
            let phase = snapshots
                .iter()
                .find(|job| job.mission_dir.as_deref() == Some(mission_dir.as_path()))
                .map(|job| job.phase);
            summaries.push(JobSummary {
                owner: owner.clone(),
                mission,
                preset_name: descriptor.preset_name,
                state: descriptor.state,
                progress,
                queue: phase,
            });
        }
    }
    Ok(Json(summaries))
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Path((owner, mission)): Path<(String, String)>,
) -> Result<Json<JobDetail>, AppError> {
    let mission_dir = mission_dir_for(&state, &owner, &mission)?;
    let descriptor_path = mission_dir.join(DESCRIPTOR_FILE_NAME);
    if !descriptor_path.is_file() {
        return Err(AppError::NotFound(format!("mission not found: {owner}/{mission}")));
    }
    let descriptor = MissionDescriptor::load(&descriptor_path)?;

    let store = &state.inner.store;
    let progress = store.read(&mission_dir)?;
    let total = store.total_duration(&mission_dir)?;
    let processing = store.processing_duration(&mission_dir)?;

    Ok(Json(JobDetail {
        queue: phase_for(&state, &mission_dir),
        owner,
        mission,
        descriptor,
        progress,
        total_duration_secs: total,
        processing_duration_secs: processing,
        total_duration: format_duration(total),
        processing_duration: format_duration(processing),
    }))
}

pub(super) async fn delete_job(
    State(state): State<AppState>,
    Path((owner, mission)): Path<(String, String)>,
) -> Result<Json<DeleteOutcome>, AppError> {
    let mission_dir = mission_dir_for(&state, &owner, &mission)?;
    let known = mission_dir.exists() || phase_for(&state, &mission_dir).is_some();
    if !known {
        return Err(AppError::NotFound(format!("mission not found: {owner}/{mission}")));
    }
    let outcome = state.inner.scheduler.delete_job(&mission_dir)?;
    Ok(Json(outcome))
}

fn subdirectory_names(dir: &StdPath) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}
