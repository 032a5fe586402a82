//! Directory scanning helpers shared by the scheduler, the progress store and the worker.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions accepted as separation inputs.
pub const INPUT_AUDIO_EXTENSIONS: [&str; 6] = ["wav", "flac", "mp3", "m4a", "aac", "ogg"];

/// Extensions the worker can produce.
pub const OUTPUT_AUDIO_EXTENSIONS: [&str; 3] = ["wav", "flac", "mp3"];

pub const INPUTS_DIR_NAME: &str = "inputs";
pub const OUTPUTS_DIR_NAME: &str = "outputs";
pub const BATCH_OUTPUT_DIR_NAME: &str = "batch_output";

/// Immediate contents of an input directory, split into audio files and subdirectories.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InputListing {
    pub audio_files: Vec<PathBuf>,
    pub subdirs: Vec<PathBuf>,
}

impl InputListing {
    /// Number of logical songs: direct audio files count individually, otherwise each
    /// subdirectory counts as one.
    pub fn song_count(&self) -> usize {
        if self.audio_files.is_empty() {
            self.subdirs.len()
        } else {
            self.audio_files.len()
        }
    }
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|candidate| *candidate == ext)
        })
        .unwrap_or(false)
}

pub fn is_input_audio(path: &Path) -> bool {
    has_extension(path, &INPUT_AUDIO_EXTENSIONS)
}

pub fn is_output_audio(path: &Path) -> bool {
    has_extension(path, &OUTPUT_AUDIO_EXTENSIONS)
}

/// List the direct audio files and subdirectories of `dir`, both sorted by name.
pub fn list_input_dir(dir: &Path) -> io::Result<InputListing> {
    let mut listing = InputListing::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            listing.subdirs.push(path);
        } else if file_type.is_file() && is_input_audio(&path) {
            listing.audio_files.push(path);
        }
    }
    listing.audio_files.sort();
    listing.subdirs.sort();
    Ok(listing)
}

/// Count direct output-audio files in `dir`. A missing directory counts as zero.
pub fn count_output_files(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| is_output_audio(&entry.path()))
        .count()
}

/// Count output-audio files anywhere below `dir`.
pub fn count_output_files_recursive(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => total += count_output_files_recursive(&path),
            Ok(t) if t.is_file() && is_output_audio(&path) => total += 1,
            _ => {}
        }
    }
    total
}

/// Every location a mission's outputs may land in: its primary output directory, the
/// merged-batch output directory and each uploaded sub-song's own `outputs` directory.
pub fn mission_output_dirs(mission_dir: &Path, primary: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(primary) = primary {
        push(primary.to_path_buf());
    }
    push(mission_dir.join(BATCH_OUTPUT_DIR_NAME));

    if let Ok(entries) = fs::read_dir(mission_dir.join(INPUTS_DIR_NAME)) {
        let mut subdirs: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.path().join(OUTPUTS_DIR_NAME))
            .collect();
        subdirs.sort();
        for dir in subdirs {
            push(dir);
        }
    }

    dirs
}

/// Total output-audio files across [`mission_output_dirs`].
pub fn count_mission_outputs(mission_dir: &Path, primary: Option<&Path>) -> usize {
    mission_output_dirs(mission_dir, primary)
        .iter()
        .map(|dir| count_output_files(dir))
        .sum()
}
