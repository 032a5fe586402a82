use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::executor::CommandExecutor;
use crate::fsutil::{self, JsonRead};
use crate::progress::{ProgressPatch, ProgressRecord, ProgressStatus, ProgressStore};

pub const DESCRIPTOR_FILE_NAME: &str = "mission.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Wav,
    Mp3,
    Flac,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Flac => "flac",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(OutputFormat::Wav),
            "mp3" => Ok(OutputFormat::Mp3),
            "flac" => Ok(OutputFormat::Flac),
            other => bail!("unsupported output format: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    #[default]
    Waiting,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl MissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            MissionState::Waiting => "waiting",
            MissionState::Running => "running",
            MissionState::Completed => "completed",
            MissionState::Failed => "failed",
            MissionState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionState::Completed | MissionState::Failed | MissionState::Terminated
        )
    }

    pub fn progress_status(self) -> ProgressStatus {
        match self {
            MissionState::Waiting => ProgressStatus::Waiting,
            MissionState::Running => ProgressStatus::Running,
            MissionState::Completed => ProgressStatus::Completed,
            MissionState::Failed => ProgressStatus::Failed,
            MissionState::Terminated => ProgressStatus::Terminated,
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MissionProgress {
    #[serde(default)]
    pub processed_files: u64,
    #[serde(default)]
    pub total_files: u64,
}

impl From<&ProgressRecord> for MissionProgress {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            processed_files: record.processed_files,
            total_files: record.total_files,
        }
    }
}

fn default_skip_existing() -> bool {
    true
}

/// JSON mirror of a mission, written next to its progress file so other processes can
/// observe it without talking to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionDescriptor {
    pub input_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub preset_name: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_skip_existing")]
    pub skip_existing_files: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub state: MissionState,
    #[serde(default)]
    pub progress: MissionProgress,
}

impl MissionDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        match fsutil::read_json::<MissionDescriptor>(path)? {
            JsonRead::Parsed(descriptor) => Ok(descriptor),
            JsonRead::Missing => bail!("mission descriptor not found: {}", path.display()),
            JsonRead::Corrupt(err) => Err(err)
                .with_context(|| format!("invalid mission descriptor: {}", path.display())),
        }
    }
}

/// One unit of separation work.
///
/// `mission_dir` is assigned at most once, normally from the parent of the descriptor
/// path when the mission is handed to the scheduler.
#[derive(Debug)]
pub struct Mission {
    pub input_dir: PathBuf,
    /// Inputs of a merged batch. Empty for ordinary missions.
    pub input_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub preset_name: String,
    pub output_format: OutputFormat,
    pub skip_existing_files: bool,
    pub state: MissionState,
    pub running: bool,
    pub debug: bool,
    descriptor_path: Option<PathBuf>,
    mission_dir: Option<PathBuf>,
    executor: Option<CommandExecutor>,
    members: Vec<Mission>,
}

impl Clone for Mission {
    /// Copies every setting. The executor is never shared between copies.
    fn clone(&self) -> Self {
        Self {
            input_dir: self.input_dir.clone(),
            input_dirs: self.input_dirs.clone(),
            output_dir: self.output_dir.clone(),
            preset_name: self.preset_name.clone(),
            output_format: self.output_format,
            skip_existing_files: self.skip_existing_files,
            state: self.state,
            running: self.running,
            debug: self.debug,
            descriptor_path: self.descriptor_path.clone(),
            mission_dir: self.mission_dir.clone(),
            executor: None,
            members: self.members.clone(),
        }
    }
}

impl Mission {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        preset_name: impl Into<String>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            input_dirs: Vec::new(),
            output_dir: output_dir.into(),
            preset_name: preset_name.into(),
            output_format: OutputFormat::default(),
            skip_existing_files: true,
            state: MissionState::Waiting,
            running: false,
            debug: false,
            descriptor_path: None,
            mission_dir: None,
            executor: None,
            members: Vec::new(),
        }
    }

    pub fn from_descriptor(path: &Path) -> Result<Self> {
        let descriptor = MissionDescriptor::load(path)?;
        let mut mission = Mission::new(
            descriptor.input_dir,
            descriptor.output_dir,
            descriptor.preset_name,
        );
        mission.input_dirs = descriptor.input_dirs;
        mission.output_format = descriptor.output_format;
        mission.skip_existing_files = descriptor.skip_existing_files;
        mission.debug = descriptor.debug;
        mission.set_state(descriptor.state);
        mission.descriptor_path = Some(path.to_path_buf());
        Ok(mission)
    }

    pub fn with_descriptor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_path = Some(path.into());
        self
    }

    pub fn descriptor_path(&self) -> Option<&Path> {
        self.descriptor_path.as_deref()
    }

    pub fn mission_dir(&self) -> Option<&Path> {
        self.mission_dir.as_deref()
    }

    /// Assign the mission directory. Refuses to change an already assigned one.
    pub fn assign_mission_dir(&mut self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        match &self.mission_dir {
            Some(existing) if *existing == dir => true,
            Some(existing) => {
                warn!(
                    existing = %existing.display(),
                    requested = %dir.display(),
                    "Mission directory already assigned"
                );
                false
            }
            None => {
                self.mission_dir = Some(dir);
                true
            }
        }
    }

    /// Assign `mission_dir` from the descriptor location if not yet set.
    pub fn derive_mission_dir(&mut self) -> Option<&Path> {
        if self.mission_dir.is_none() {
            if let Some(parent) = self.descriptor_path.as_deref().and_then(Path::parent) {
                self.mission_dir = Some(parent.to_path_buf());
            }
        }
        self.mission_dir.as_deref()
    }

    /// Copy of this mission reading from `input_dir`, persisted at `descriptor_path` and
    /// sharing this mission's progress directory.
    pub fn sub_mission(&self, input_dir: PathBuf, descriptor_path: PathBuf) -> Mission {
        let mut sub = self.clone();
        sub.input_dir = input_dir;
        sub.input_dirs.clear();
        sub.members.clear();
        sub.descriptor_path = Some(descriptor_path);
        sub
    }

    pub fn set_state(&mut self, state: MissionState) {
        self.state = state;
        self.running = state == MissionState::Running;
    }

    pub fn is_batch(&self) -> bool {
        !self.input_dirs.is_empty()
    }

    /// Every input directory the worker should read.
    pub fn inputs(&self) -> Vec<&Path> {
        if self.input_dirs.is_empty() {
            vec![self.input_dir.as_path()]
        } else {
            self.input_dirs.iter().map(PathBuf::as_path).collect()
        }
    }

    pub fn executor(&self) -> Option<&CommandExecutor> {
        self.executor.as_ref()
    }

    pub fn executor_mut(&mut self) -> Option<&mut CommandExecutor> {
        self.executor.as_mut()
    }

    /// The mission's executor, created on first use.
    pub fn ensure_executor(&mut self) -> &mut CommandExecutor {
        self.executor.get_or_insert_with(CommandExecutor::new)
    }

    /// Missions merged into this batch.
    pub fn members(&self) -> &[Mission] {
        &self.members
    }

    pub fn add_member(&mut self, mut member: Mission) {
        member.executor = None;
        member.members.clear();
        self.members.push(member);
    }

    pub fn clear_descriptor_path(&mut self) {
        self.descriptor_path = None;
    }

    pub fn descriptor(&self, progress: MissionProgress) -> MissionDescriptor {
        MissionDescriptor {
            input_dir: self.input_dir.clone(),
            input_dirs: self.input_dirs.clone(),
            output_dir: self.output_dir.clone(),
            preset_name: self.preset_name.clone(),
            output_format: self.output_format,
            skip_existing_files: self.skip_existing_files,
            debug: self.debug,
            state: self.state,
            progress,
        }
    }

    /// Serialize the mission, with the latest progress summary, to its descriptor file.
    pub fn write(&self, store: &ProgressStore) -> Result<()> {
        let Some(path) = self.descriptor_path.as_deref() else {
            debug!(
                input_dir = %self.input_dir.display(),
                "Mission has no descriptor path, skipping write"
            );
            return Ok(());
        };

        let progress = match self.mission_dir.as_deref() {
            Some(dir) => store
                .read(dir)?
                .map(|record| MissionProgress::from(&record))
                .unwrap_or_default(),
            None => MissionProgress::default(),
        };

        fsutil::write_json_atomic(path, &self.descriptor(progress))
    }

    /// Forward the provided fields to the progress store. No-op without a mission directory.
    pub fn update_progress(
        &self,
        store: &ProgressStore,
        processed_files: Option<u64>,
        total_files: Option<u64>,
        status: Option<ProgressStatus>,
    ) -> Result<()> {
        let Some(dir) = self.mission_dir.as_deref() else {
            return Ok(());
        };
        let patch = ProgressPatch {
            processed_files,
            total_files,
            status,
            ..ProgressPatch::default()
        };
        if patch.is_empty() {
            return Ok(());
        }
        store.update(dir, &patch)?;
        Ok(())
    }
}

/// Rewrite the `state` (and optionally `progress`) of a descriptor on disk, keeping every
/// other field as written. Returns `false` when the descriptor does not exist.
pub fn update_descriptor_state(
    path: &Path,
    state: MissionState,
    progress: Option<MissionProgress>,
) -> Result<bool> {
    let mut document = match fsutil::read_json::<Value>(path)? {
        JsonRead::Parsed(Value::Object(map)) => map,
        JsonRead::Parsed(_) | JsonRead::Corrupt(_) => {
            warn!(path = %path.display(), "Mission descriptor unreadable, leaving it untouched");
            return Ok(false);
        }
        JsonRead::Missing => return Ok(false),
    };

    document.insert("state".to_string(), Value::String(state.as_str().to_string()));
    if let Some(progress) = progress {
        document.insert(
            "progress".to_string(),
            serde_json::to_value(progress).context("failed to encode mission progress")?,
        );
    }
    fsutil::write_json_atomic(path, &Value::Object(document))?;
    Ok(true)
}

/// State recorded in a descriptor, if it can be read.
pub fn read_descriptor_state(path: &Path) -> Option<MissionState> {
    #[derive(Deserialize)]
    struct StateOnly {
        state: MissionState,
    }
    match fsutil::read_json::<StateOnly>(path) {
        Ok(JsonRead::Parsed(doc)) => Some(doc.state),
        _ => None,
    }
}
