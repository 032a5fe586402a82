use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{
    duration, progress_path, reconcile, ConsistencyEvidence, DescriptorHints, FileDetail,
    ProgressPatch, ProgressRecord, ProgressStatus, StepProgress,
};
use crate::fsutil::{self, JsonRead};
use crate::preset::{Preset, PresetCatalog};
use crate::scan;

const CACHE_TTL: Duration = Duration::from_secs(30);
const DESCRIPTOR_FILE_NAME: &str = "mission.json";

struct CachedRecord {
    record: ProgressRecord,
    cached_at: SystemTime,
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<PathBuf, CachedRecord>,
}

/// File-backed progress records keyed by mission directory, with a short-lived read cache.
///
/// One coarse lock serializes every operation of a store instance. Other processes
/// coordinate through the atomically replaced `progress.json` files alone.
pub struct ProgressStore {
    presets: Option<PresetCatalog>,
    log_dir: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        Self {
            presets: None,
            log_dir: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Presets used to size step progress and to derive outputs per song.
    pub fn with_presets(mut self, presets: PresetCatalog) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Directory holding worker logs, scanned for `time cost` lines.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a fresh `waiting` record estimating the total from `input_dir`.
    pub fn initialize(
        &self,
        mission_dir: &Path,
        input_dir: &Path,
        preset_name: Option<&str>,
    ) -> Result<ProgressRecord> {
        let total = match scan::list_input_dir(input_dir) {
            Ok(listing) => listing.song_count() as u64,
            Err(err) => {
                warn!(
                    input_dir = %input_dir.display(),
                    error = %err,
                    "Cannot list input directory"
                );
                0
            }
        };

        let now = Utc::now();
        let mut record = ProgressRecord::new(total, now);

        if let Some(preset) = preset_name.and_then(|name| self.load_preset(name)) {
            if preset.total_steps() > 1 {
                record.step_progress = preset
                    .flow
                    .iter()
                    .enumerate()
                    .map(|(index, step)| {
                        (
                            index as u32 + 1,
                            StepProgress {
                                name: step.model_name.clone(),
                                processed: 0,
                                total: record.total_files,
                            },
                        )
                    })
                    .collect::<BTreeMap<_, _>>();
                record.total_steps = Some(preset.total_steps() as u32);
            }
        }

        let mut state = self.lock();
        self.persist_locked(&mut state, mission_dir, &record)?;
        info!(
            mission_dir = %mission_dir.display(),
            total_files = record.total_files,
            steps = record.step_progress.len(),
            "Progress initialized"
        );
        Ok(record)
    }

    /// Current record, or `None` when absent or corrupt (a corrupt file is deleted).
    pub fn read(&self, mission_dir: &Path) -> Result<Option<ProgressRecord>> {
        let mut state = self.lock();
        self.load_locked(&mut state, mission_dir)
    }

    /// Merge `patch` into the stored record. Returns `None` when no record exists.
    pub fn update(
        &self,
        mission_dir: &Path,
        patch: &ProgressPatch,
    ) -> Result<Option<ProgressRecord>> {
        let mut state = self.lock();
        let Some(mut record) = self.load_locked(&mut state, mission_dir)? else {
            debug!(mission_dir = %mission_dir.display(), "No progress record to update");
            return Ok(None);
        };
        record.apply(patch, Utc::now());
        self.persist_locked(&mut state, mission_dir, &record)?;
        Ok(Some(record))
    }

    /// Set `processed` of one 1-based step. Returns whether the step exists.
    pub fn update_step_progress(
        &self,
        mission_dir: &Path,
        step_index: u32,
        processed: u64,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(mut record) = self.load_locked(&mut state, mission_dir)? else {
            return Ok(false);
        };
        let Some(step) = record.step_progress.get_mut(&step_index) else {
            return Ok(false);
        };
        step.processed = processed;
        record.last_update = Utc::now();
        self.persist_locked(&mut state, mission_dir, &record)?;
        Ok(true)
    }

    /// Record the status of one input file. `completed` files also bump `processed_files`.
    pub fn update_file_progress(
        &self,
        mission_dir: &Path,
        file: &Path,
        status: &str,
    ) -> Result<Option<ProgressRecord>> {
        let mut state = self.lock();
        let Some(mut record) = self.load_locked(&mut state, mission_dir)? else {
            return Ok(None);
        };

        let now = Utc::now();
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string_lossy().into_owned());

        if status == "completed" {
            record.processed_files += 1;
        }
        match record
            .details
            .iter_mut()
            .find(|detail| detail.file_name == file_name)
        {
            Some(detail) => {
                detail.status = status.to_string();
                detail.update_time = now;
            }
            None => record.details.push(FileDetail {
                file_name,
                status: status.to_string(),
                update_time: now,
            }),
        }
        record.last_update = now;
        self.persist_locked(&mut state, mission_dir, &record)?;
        Ok(Some(record))
    }

    /// Administrative override of a (possibly locked) total. The total stays locked.
    pub fn reset_total_files(
        &self,
        mission_dir: &Path,
        total: u64,
    ) -> Result<Option<ProgressRecord>> {
        let mut state = self.lock();
        let Some(mut record) = self.load_locked(&mut state, mission_dir)? else {
            return Ok(None);
        };
        info!(
            mission_dir = %mission_dir.display(),
            from = record.total_files,
            to = total,
            "Resetting total files"
        );
        record.total_files = total;
        record.total_files_locked = true;
        record.last_update = Utc::now();
        self.persist_locked(&mut state, mission_dir, &record)?;
        Ok(Some(record))
    }

    pub fn total_duration(&self, mission_dir: &Path) -> Result<f64> {
        Ok(self
            .read(mission_dir)?
            .map(|record| duration::total_duration(&record, Utc::now()))
            .unwrap_or(0.0))
    }

    /// Processing time, preferring the worker's own `time cost` log line over timestamps.
    pub fn processing_duration(&self, mission_dir: &Path) -> Result<f64> {
        let hints = read_hints(mission_dir);

        if let Some(log_dir) = &self.log_dir {
            let output_dir = hints.output_dir.clone().or_else(|| {
                let default = mission_dir.join(scan::OUTPUTS_DIR_NAME);
                default.exists().then_some(default)
            });
            if let Some(output_dir) = output_dir {
                if let Some(secs) = duration::scan_logs_for_time_cost(log_dir, &output_dir) {
                    return Ok(secs);
                }
            }
        }

        let Some(mut record) = self.read(mission_dir)? else {
            return Ok(0.0);
        };

        if record.processing_start_time.is_none()
            && matches!(hints.state.as_deref(), Some("running" | "completed"))
        {
            if let Some(started) = descriptor_mtime(mission_dir) {
                let patch = ProgressPatch::new().processing_start_time(started);
                if let Some(updated) = self.update(mission_dir, &patch)? {
                    record = updated;
                }
            }
        }

        Ok(duration::processing_duration(&record, Utc::now()))
    }

    /// Remove the durable record and its cache entry. Missing records are fine.
    pub fn clear(&self, mission_dir: &Path) -> Result<()> {
        let mut state = self.lock();
        state.cache.remove(mission_dir);
        if fsutil::remove_file_if_exists(&progress_path(mission_dir))? {
            info!(mission_dir = %mission_dir.display(), "Progress cleared");
        }
        Ok(())
    }

    fn load_locked(
        &self,
        state: &mut StoreState,
        mission_dir: &Path,
    ) -> Result<Option<ProgressRecord>> {
        let path = progress_path(mission_dir);

        if let Some(cached) = state.cache.get(mission_dir) {
            if cache_is_fresh(cached, &path) {
                return Ok(Some(cached.record.clone()));
            }
        }

        let record = match fsutil::read_json::<ProgressRecord>(&path)? {
            JsonRead::Parsed(record) => record,
            JsonRead::Missing => {
                state.cache.remove(mission_dir);
                return Ok(None);
            }
            JsonRead::Corrupt(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt progress file, removing");
                state.cache.remove(mission_dir);
                fsutil::remove_file_if_exists(&path)?;
                return Ok(None);
            }
        };

        if record.status != ProgressStatus::Running {
            cache_insert(state, mission_dir, record.clone());
            return Ok(Some(record));
        }

        let evidence = self.gather_evidence(mission_dir);
        let checked = reconcile(&record, &evidence, Utc::now());
        if checked != record {
            debug!(
                mission_dir = %mission_dir.display(),
                processed = checked.processed_files,
                total = checked.total_files,
                status = ?checked.status,
                "Progress reconciled with output evidence"
            );
            self.persist_locked(state, mission_dir, &checked)?;
        } else {
            cache_insert(state, mission_dir, checked.clone());
        }
        Ok(Some(checked))
    }

    fn persist_locked(
        &self,
        state: &mut StoreState,
        mission_dir: &Path,
        record: &ProgressRecord,
    ) -> Result<()> {
        fsutil::write_json_atomic(&progress_path(mission_dir), record)?;
        cache_insert(state, mission_dir, record.clone());
        Ok(())
    }

    fn gather_evidence(&self, mission_dir: &Path) -> ConsistencyEvidence {
        let hints = read_hints(mission_dir);
        let primary = hints
            .output_dir
            .clone()
            .unwrap_or_else(|| mission_dir.join(scan::OUTPUTS_DIR_NAME));

        let outputs_per_song = hints
            .preset_name
            .as_deref()
            .and_then(|name| self.load_preset(name))
            .map(|preset| preset.outputs_per_song())
            .unwrap_or(1);

        ConsistencyEvidence {
            descriptor_completed: hints.state.as_deref() == Some("completed"),
            output_files: scan::count_mission_outputs(mission_dir, Some(&primary)) as u64,
            outputs_per_song: outputs_per_song as u64,
            counted_total: count_input_songs_with(mission_dir, &hints),
        }
    }

    fn load_preset(&self, name: &str) -> Option<Preset> {
        let catalog = self.presets.as_ref()?;
        match catalog.load(name) {
            Ok(preset) => Some(preset),
            Err(err) => {
                debug!(preset = name, error = %err, "Preset unavailable for progress sizing");
                None
            }
        }
    }
}

/// Songs a mission covers: uploaded `inputs/` entries first, then the descriptor's
/// `input_dir`. Defaults to 1 when nothing can be counted.
pub fn count_input_songs(mission_dir: &Path) -> u64 {
    count_input_songs_with(mission_dir, &read_hints(mission_dir))
}

fn count_input_songs_with(mission_dir: &Path, hints: &DescriptorHints) -> u64 {
    if let Ok(listing) = scan::list_input_dir(&mission_dir.join(scan::INPUTS_DIR_NAME)) {
        let count = listing.song_count();
        if count > 0 {
            return count as u64;
        }
    }
    if let Some(input_dir) = &hints.input_dir {
        if let Ok(listing) = scan::list_input_dir(input_dir) {
            let count = listing.song_count();
            if count > 0 {
                return count as u64;
            }
        }
    }
    1
}

fn cache_insert(state: &mut StoreState, mission_dir: &Path, record: ProgressRecord) {
    state.cache.insert(
        mission_dir.to_path_buf(),
        CachedRecord {
            record,
            cached_at: SystemTime::now(),
        },
    );
}

fn cache_is_fresh(cached: &CachedRecord, path: &Path) -> bool {
    let young = cached
        .cached_at
        .elapsed()
        .map(|age| age < CACHE_TTL)
        .unwrap_or(false);
    if !young {
        return false;
    }
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .is_ok_and(|modified| modified <= cached.cached_at)
}

fn read_hints(mission_dir: &Path) -> DescriptorHints {
    match fsutil::read_json::<DescriptorHints>(&mission_dir.join(DESCRIPTOR_FILE_NAME)) {
        Ok(JsonRead::Parsed(hints)) => hints,
        Ok(JsonRead::Missing) => DescriptorHints::default(),
        Ok(JsonRead::Corrupt(err)) => {
            debug!(
                mission_dir = %mission_dir.display(),
                error = %err,
                "Unreadable mission descriptor"
            );
            DescriptorHints::default()
        }
        Err(err) => {
            debug!(
                mission_dir = %mission_dir.display(),
                error = %err,
                "Cannot read mission descriptor"
            );
            DescriptorHints::default()
        }
    }
}

fn descriptor_mtime(mission_dir: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(mission_dir.join(DESCRIPTOR_FILE_NAME))
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TWO_STEP: &str = r#"{"flow": [
        {"model_type": "msst_models", "model_name": "vocals_v1", "input_to_next": "vocals", "output_to_storage": ["instrumental"]},
        {"model_type": "uvr_vr_models", "model_name": "dereverb", "input_to_next": "dry", "output_to_storage": ["dry"]}
    ]}"#;

    fn write_audio(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).expect("mkdir");
        for name in names {
            fs::write(dir.join(name), b"").expect("write audio");
        }
    }

    #[test]
    fn initialize_counts_files_and_sizes_steps() {
        let root = tempdir().expect("tempdir");
        let presets = root.path().join("presets");
        fs::create_dir_all(&presets).expect("mkdir");
        fs::write(presets.join("chain.json"), TWO_STEP).expect("write preset");
        let mission = root.path().join("mission");
        let input = mission.join("inputs");
        write_audio(&input, &["a.wav", "b.mp3", "c.ogg"]);

        let store = ProgressStore::new().with_presets(PresetCatalog::new(&presets));
        let record = store
            .initialize(&mission, &input, Some("chain.json"))
            .expect("initialize");

        assert_eq!(record.total_files, 3);
        assert_eq!(record.status, ProgressStatus::Waiting);
        assert!(!record.total_files_locked);
        assert_eq!(record.total_steps, Some(2));
        assert_eq!(record.step_progress[&1].name, "vocals_v1");
        assert_eq!(record.step_progress[&2].total, 3);
        assert!(progress_path(&mission).exists());
    }

    #[test]
    fn initialize_counts_subdirectories_with_floor_of_one() {
        let root = tempdir().expect("tempdir");
        let mission = root.path().join("m");
        let input = mission.join("inputs");
        fs::create_dir_all(input.join("song1")).expect("mkdir");
        fs::create_dir_all(input.join("song2")).expect("mkdir");

        let store = ProgressStore::new();
        assert_eq!(
            store.initialize(&mission, &input, None).expect("init").total_files,
            2
        );

        let empty = root.path().join("empty");
        fs::create_dir_all(&empty).expect("mkdir");
        let record = store.initialize(&empty, &empty, None).expect("init");
        assert_eq!(record.total_files, 1);
        assert!(record.step_progress.is_empty());
    }

    #[test]
    fn corrupt_record_is_removed_and_can_be_reinitialized() {
        let root = tempdir().expect("tempdir");
        let mission = root.path().to_path_buf();
        let store = ProgressStore::new();
        fs::write(progress_path(&mission), b"{ not json").expect("write corrupt");

        assert_eq!(store.read(&mission).expect("read"), None);
        assert!(!progress_path(&mission).exists());

        let record = store.initialize(&mission, &mission, None).expect("init");
        assert_eq!(store.read(&mission).expect("read"), Some(record));
    }

    #[test]
    fn update_respects_lock_and_reset_overrides_it() {
        let root = tempdir().expect("tempdir");
        let mission = root.path().to_path_buf();
        let store = ProgressStore::new();
        store.initialize(&mission, &mission, None).expect("init");

        store
            .update(&mission, &ProgressPatch::new().total_files(4).lock_total())
            .expect("lock");
        let record = store
            .update(&mission, &ProgressPatch::new().total_files(9))
            .expect("update")
            .expect("record");
        assert_eq!(record.total_files, 4);
        assert!(record.total_files_locked);

        let reset = store
            .reset_total_files(&mission, 6)
            .expect("reset")
            .expect("record");
        assert_eq!(reset.total_files, 6);
        assert!(reset.total_files_locked);
    }

    #[test]
    fn update_without_record_is_a_no_op() {
        let root = tempdir().expect("tempdir");
        let store = ProgressStore::new();
        let result = store
            .update(root.path(), &ProgressPatch::new().processed_files(1))
            .expect("update");
        assert!(result.is_none());
        assert!(!progress_path(root.path()).exists());
    }

    #[test]
    fn out_of_band_write_invalidates_cache() {
        let root = tempdir().expect("tempdir");
        let mission = root.path().to_path_buf();
        let store = ProgressStore::new();
        let mut record = store.initialize(&mission, &mission, None).expect("init");
        assert_eq!(store.read(&mission).expect("read"), Some(record.clone()));

        record.processed_files = 1;
        record.status = ProgressStatus::Failed;
        let path = progress_path(&mission);
        fs::write(&path, serde_json::to_vec(&record).expect("encode")).expect("write");
        fs::File::options()
            .write(true)
            .open(&path)
            .expect("open")
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .expect("set mtime");

        let seen = store.read(&mission).expect("read").expect("record");
        assert_eq!(seen.status, ProgressStatus::Failed);
        assert_eq!(seen.processed_files, 1);
    }

    #[test]
    fn running_record_completes_from_output_evidence() {
        let root = tempdir().expect("tempdir");
        let presets = root.path().join("presets");
        fs::create_dir_all(&presets).expect("mkdir");
        fs::write(presets.join("chain.json"), TWO_STEP).expect("write preset");

        let mission = root.path().join("mission");
        let input = mission.join("inputs");
        write_audio(&input, &["a.wav", "b.wav"]);
        fs::write(
            mission.join(DESCRIPTOR_FILE_NAME),
            r#"{"preset_name": "chain.json", "state": "running"}"#,
        )
        .expect("write descriptor");

        let store = ProgressStore::new().with_presets(PresetCatalog::new(&presets));
        store
            .initialize(&mission, &input, Some("chain.json"))
            .expect("init");
        store
            .update(
                &mission,
                &ProgressPatch::new()
                    .status(ProgressStatus::Running)
                    .total_files(2)
                    .lock_total(),
            )
            .expect("running");

        write_audio(
            &mission.join("outputs"),
            &["a_instrumental.wav", "a_vocals_dry.wav", "b_instrumental.wav"],
        );
        let fresh = ProgressStore::new().with_presets(PresetCatalog::new(&presets));
        let partial = fresh.read(&mission).expect("read").expect("record");
        assert_eq!(partial.status, ProgressStatus::Running);
        assert_eq!(partial.processed_files, 1);

        write_audio(&mission.join("outputs"), &["b_vocals_dry.wav"]);
        let fresh = ProgressStore::new().with_presets(PresetCatalog::new(&presets));
        let done = fresh.read(&mission).expect("read").expect("record");
        assert_eq!(done.status, ProgressStatus::Completed);
        assert_eq!(done.processed_files, 2);
        let end_time = done.end_time.expect("end time");

        let again = ProgressStore::new()
            .with_presets(PresetCatalog::new(&presets))
            .read(&mission)
            .expect("read")
            .expect("record");
        assert_eq!(again.end_time, Some(end_time));
    }

    #[test]
    fn step_and_file_progress() {
        let root = tempdir().expect("tempdir");
        let presets = root.path().join("presets");
        fs::create_dir_all(&presets).expect("mkdir");
        fs::write(presets.join("chain.json"), TWO_STEP).expect("write preset");
        let mission = root.path().join("mission");
        write_audio(&mission, &["x.wav"]);

        let store = ProgressStore::new().with_presets(PresetCatalog::new(&presets));
        store
            .initialize(&mission, &mission, Some("chain"))
            .expect("init");

        assert!(store.update_step_progress(&mission, 2, 1).expect("step"));
        assert!(!store.update_step_progress(&mission, 3, 1).expect("step"));

        store
            .update_file_progress(&mission, &mission.join("x.wav"), "processing")
            .expect("file");
        let record = store
            .update_file_progress(&mission, &mission.join("x.wav"), "completed")
            .expect("file")
            .expect("record");

        assert_eq!(record.step_progress[&2].processed, 1);
        assert_eq!(record.step_progress[&1].processed, 0);
        assert_eq!(record.processed_files, 1);
        assert_eq!(record.details.len(), 1);
        assert_eq!(record.details[0].status, "completed");
    }

    #[test]
    fn processing_duration_prefers_log_time_cost() {
        let root = tempdir().expect("tempdir");
        let logs = root.path().join("logs");
        fs::create_dir_all(&logs).expect("mkdir");
        let mission = root.path().join("mission");
        let outputs = mission.join("outputs");
        fs::create_dir_all(&outputs).expect("mkdir");
        fs::write(
            logs.join("stemflow.log"),
            format!(
                "Preset: p inference process completed, results saved to {}, time cost: 17.25s\n",
                outputs.display()
            ),
        )
        .expect("write log");

        let store = ProgressStore::new().with_log_dir(&logs);
        store.initialize(&mission, &mission, None).expect("init");
        assert_eq!(store.processing_duration(&mission).expect("duration"), 17.25);
    }

    #[test]
    fn processing_start_falls_back_to_descriptor_mtime() {
        let root = tempdir().expect("tempdir");
        let mission = root.path().to_path_buf();
        let store = ProgressStore::new();
        store.initialize(&mission, &mission, None).expect("init");
        fs::write(
            mission.join(DESCRIPTOR_FILE_NAME),
            r#"{"state": "completed"}"#,
        )
        .expect("write descriptor");

        store.processing_duration(&mission).expect("duration");
        let record = store.read(&mission).expect("read").expect("record");
        assert!(record.processing_start_time.is_some());
    }

    #[test]
    fn record_removed_by_another_process_is_not_served_from_cache() {
        let root = tempdir().expect("tempdir");
        let store = ProgressStore::new();
        store.initialize(root.path(), root.path(), None).expect("init");
        assert!(store.read(root.path()).expect("read").is_some());

        fs::remove_file(progress_path(root.path())).expect("remove");
        assert_eq!(store.read(root.path()).expect("read"), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let root = tempdir().expect("tempdir");
        let store = ProgressStore::new();
        store.initialize(root.path(), root.path(), None).expect("init");

        store.clear(root.path()).expect("clear");
        store.clear(root.path()).expect("clear again");
        assert_eq!(store.read(root.path()).expect("read"), None);
    }
}
