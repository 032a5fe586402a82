use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Model family a preset step runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// General multi-stem spectrogram/waveform separators.
    #[serde(rename = "msst_models", alias = "MSST_Models")]
    Msst,
    /// Single-purpose vocal-removal models with a primary and a secondary stem.
    #[serde(rename = "uvr_vr_models", alias = "UVR_VR_Models")]
    UvrVr,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Msst => "msst_models",
            ModelType::UvrVr => "uvr_vr_models",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresetStep {
    pub model_type: ModelType,
    pub model_name: String,
    /// Stem fed into the next step. Empty on a terminal step.
    #[serde(default)]
    pub input_to_next: String,
    /// Stems written straight into the job's output directory.
    #[serde(default)]
    pub output_to_storage: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(alias = "steps")]
    pub flow: Vec<PresetStep>,
}

impl Preset {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read preset: {}", path.display()))?;
        let preset: Preset = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse preset: {}", path.display()))?;
        if preset.flow.is_empty() {
            bail!("preset has no steps: {}", path.display());
        }
        Ok(preset)
    }

    pub fn total_steps(&self) -> usize {
        self.flow.len()
    }

    /// Number of output files one input song produces across every step, at least 1.
    pub fn outputs_per_song(&self) -> usize {
        self.flow
            .iter()
            .map(|step| step.output_to_storage.len())
            .sum::<usize>()
            .max(1)
    }

    /// File stem of the last forwarded stem for `input_stem`: every step's
    /// `input_to_next` appended with an underscore.
    pub fn final_file_stem(&self, input_stem: &str) -> String {
        let mut name = input_stem.to_string();
        for step in &self.flow {
            if !step.input_to_next.is_empty() {
                name.push('_');
                name.push_str(&step.input_to_next);
            }
        }
        name
    }

    /// Whether the final step writes anything to storage. Skip-existing only applies then.
    pub fn last_step_stores_outputs(&self) -> bool {
        self.flow
            .last()
            .map(|step| !step.output_to_storage.is_empty())
            .unwrap_or(false)
    }
}

/// Named presets stored as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    dir: PathBuf,
}

impl PresetCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a preset name to its file. Absolute paths pass through and `.json` is appended
    /// when missing.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        let with_ext = if candidate.extension().is_some_and(|ext| ext == "json") {
            candidate.to_path_buf()
        } else {
            PathBuf::from(format!("{name}.json"))
        };
        if with_ext.is_absolute() {
            with_ext
        } else {
            self.dir.join(with_ext)
        }
    }

    pub fn load(&self, name: &str) -> Result<Preset> {
        Preset::load(&self.path_for(name))
    }

    /// Preset file names (with extension), sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list presets in {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    if name != "models.json" {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const THREE_STEP: &str = r#"{
        "version": "1.0.0",
        "flow": [
            {"model_type": "msst_models", "model_name": "vocal_model", "input_to_next": "vocals", "output_to_storage": ["instrumental"]},
            {"model_type": "UVR_VR_Models", "model_name": "dereverb", "input_to_next": "noreverb", "output_to_storage": ["reverb"]},
            {"model_type": "MSST_Models", "model_name": "denoise", "input_to_next": "dry", "output_to_storage": ["dry", "noise"]}
        ]
    }"#;

    #[test]
    fn parses_both_model_type_spellings() {
        let preset: Preset = serde_json::from_str(THREE_STEP).expect("parse");
        assert_eq!(preset.total_steps(), 3);
        assert_eq!(preset.flow[0].model_type, ModelType::Msst);
        assert_eq!(preset.flow[1].model_type, ModelType::UvrVr);
        assert_eq!(preset.flow[2].model_type, ModelType::Msst);
    }

    #[test]
    fn steps_is_accepted_as_flow_alias() {
        let preset: Preset = serde_json::from_str(
            r#"{"steps": [{"model_type": "msst_models", "model_name": "m"}]}"#,
        )
        .expect("parse");
        assert_eq!(preset.total_steps(), 1);
        assert!(preset.flow[0].output_to_storage.is_empty());
        assert_eq!(preset.outputs_per_song(), 1);
    }

    #[test]
    fn derived_values() {
        let preset: Preset = serde_json::from_str(THREE_STEP).expect("parse");
        assert_eq!(preset.outputs_per_song(), 4);
        assert_eq!(preset.final_file_stem("song"), "song_vocals_noreverb_dry");
        assert!(preset.last_step_stores_outputs());
    }

    #[test]
    fn catalog_resolves_and_lists_presets() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("karaoke.json"), THREE_STEP).expect("write");
        fs::write(dir.path().join("models.json"), "{}").expect("write");
        fs::write(dir.path().join("readme.txt"), "").expect("write");

        let catalog = PresetCatalog::new(dir.path());
        assert_eq!(catalog.path_for("karaoke"), dir.path().join("karaoke.json"));
        assert_eq!(catalog.path_for("karaoke.json"), dir.path().join("karaoke.json"));
        assert_eq!(catalog.list().expect("list"), vec!["karaoke.json".to_string()]);
        assert_eq!(catalog.load("karaoke").expect("load").total_steps(), 3);
    }

    #[test]
    fn empty_flow_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.json");
        fs::write(&path, r#"{"flow": []}"#).expect("write");
        assert!(Preset::load(&path).is_err());
    }
}
