use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::ModelEntry;
use crate::config::SeparatorConfig;
use crate::executor::{CommandExecutor, ProcessPoll};
use crate::fsutil;
use crate::mission::OutputFormat;
use crate::scan;

/// Stem name to every directory that stem is copied into.
pub type StemRoutes = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInput {
    pub file: PathBuf,
    pub routes: StemRoutes,
}

impl StepInput {
    pub fn file_stem(&self) -> String {
        self.file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Where `stem` of this input lands inside `dir`.
    pub fn output_path(&self, dir: &Path, stem: &str, format: OutputFormat) -> PathBuf {
        dir.join(format!("{}_{stem}.{}", self.file_stem(), format.as_str()))
    }
}

pub struct StepRequest<'a> {
    /// 1-based step index.
    pub step: usize,
    pub model: &'a ModelEntry,
    pub inputs: &'a [StepInput],
    pub output_format: OutputFormat,
    pub scratch_dir: &'a Path,
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Cancelled,
}

/// Runs one preset step over a set of input files.
///
/// `on_file_done` receives the number of inputs finished so far in this step. A runner
/// that observes `cancel` returns [`StepOutcome::Cancelled`] instead of an error.
pub trait StepRunner: Send + Sync {
    fn run_step(
        &self,
        request: &StepRequest<'_>,
        on_file_done: &mut dyn FnMut(usize),
        cancel: &CancellationToken,
    ) -> Result<StepOutcome>;
}

/// Invokes an external separator once per input file, then copies the produced stems to
/// their routed directories.
#[derive(Debug, Clone)]
pub struct CommandStepRunner {
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandStepRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(config: &SeparatorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn command_for(
        &self,
        model: &ModelEntry,
        input: &Path,
        output_dir: &Path,
        format: OutputFormat,
    ) -> Command {
        let input = input.to_string_lossy();
        let output_dir = output_dir.to_string_lossy();
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            command.arg(
                arg.replace("{model}", &model.name)
                    .replace("{model_type}", model.model_type.as_str())
                    .replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
                    .replace("{format}", format.as_str()),
            );
        }
        command.stdin(Stdio::null());
        command
    }

    fn separate_one(
        &self,
        request: &StepRequest<'_>,
        input: &StepInput,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        fs::create_dir_all(scratch)
            .with_context(|| format!("failed to create scratch dir {}", scratch.display()))?;

        let mut command =
            self.command_for(request.model, &input.file, scratch, request.output_format);
        let mut executor = CommandExecutor::new();
        executor
            .start(&mut command)
            .with_context(|| format!("failed to start separator {}", self.program.display()))?;

        loop {
            match executor.poll() {
                ProcessPoll::Running => {
                    if cancel.is_cancelled() {
                        info!(
                            input = %input.file.display(),
                            "Cancellation requested; stopping separator"
                        );
                        executor.kill()?;
                        return Ok(StepOutcome::Cancelled);
                    }
                    thread::sleep(self.poll_interval);
                }
                ProcessPoll::Exited(Some(0)) => break,
                ProcessPoll::Exited(code) => bail!(
                    "separator exited with {} for {}",
                    code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}")),
                    input.file.display()
                ),
                ProcessPoll::NotStarted => bail!("separator process was not started"),
            }
        }

        route_stems(scratch, input, request.model, request.output_format)?;
        Ok(StepOutcome::Completed)
    }
}

impl StepRunner for CommandStepRunner {
    fn run_step(
        &self,
        request: &StepRequest<'_>,
        on_file_done: &mut dyn FnMut(usize),
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        info!(
            step = request.step,
            model = %request.model.name,
            inputs = request.inputs.len(),
            "Running separation step"
        );

        for (index, input) in request.inputs.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }

            if request.skip_existing && outputs_exist(input, request.output_format) {
                debug!(input = %input.file.display(), "Routed outputs already exist; skipping");
                on_file_done(index + 1);
                continue;
            }

            let scratch = request.scratch_dir.join(format!("{index:04}"));
            let outcome = self.separate_one(request, input, &scratch, cancel);
            if let Err(err) = fsutil::remove_dir_all_if_exists(&scratch) {
                warn!(scratch = %scratch.display(), error = %err, "Failed to remove scratch dir");
            }
            if outcome? == StepOutcome::Cancelled {
                return Ok(StepOutcome::Cancelled);
            }
            on_file_done(index + 1);
        }
        Ok(StepOutcome::Completed)
    }
}

fn outputs_exist(input: &StepInput, format: OutputFormat) -> bool {
    input.routes.iter().all(|(stem, dirs)| {
        dirs.iter()
            .all(|dir| input.output_path(dir, stem, format).exists())
    })
}

/// Copy each routed stem produced in `scratch` to its destinations. A produced file
/// belongs to a stem when its name equals the stem or ends with `_<stem>`.
pub fn route_stems(
    scratch: &Path,
    input: &StepInput,
    model: &ModelEntry,
    format: OutputFormat,
) -> Result<usize> {
    let mut produced: Vec<PathBuf> = fs::read_dir(scratch)
        .with_context(|| format!("failed to read separator output {}", scratch.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && scan::is_output_audio(path))
        .collect();
    produced.sort();

    let mut copied = 0;
    for (stem, dirs) in &input.routes {
        if !model.has_stem(stem) {
            bail!("model {} has no stem named {stem}", model.name);
        }
        let Some(source) = produced.iter().find(|path| file_matches_stem(path, stem)) else {
            bail!(
                "separator produced no {stem} stem for {}",
                input.file.display()
            );
        };
        for dir in dirs {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let target = input.output_path(dir, stem, format);
            fs::copy(source, &target).with_context(|| {
                format!("failed to copy {} to {}", source.display(), target.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn file_matches_stem(path: &Path, stem: &str) -> bool {
    let Some(name) = path.file_stem().map(|name| name.to_string_lossy().to_lowercase()) else {
        return false;
    };
    let stem = stem.to_lowercase();
    name == stem || name.ends_with(&format!("_{stem}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::ModelType;

    fn model() -> ModelEntry {
        ModelEntry {
            name: "kim_vocals".to_string(),
            model_type: ModelType::Msst,
            stems: vec!["vocals".to_string(), "other".to_string()],
        }
    }

    fn input(file: &Path, routes: &[(&str, &Path)]) -> StepInput {
        let mut map = StemRoutes::new();
        for (stem, dir) in routes {
            map.entry(stem.to_string()).or_default().push(dir.to_path_buf());
        }
        StepInput {
            file: file.to_path_buf(),
            routes: map,
        }
    }

    #[test]
    fn stems_match_by_name_or_suffix() {
        assert!(file_matches_stem(Path::new("/x/vocals.wav"), "vocals"));
        assert!(file_matches_stem(Path::new("/x/song_Vocals.wav"), "vocals"));
        assert!(!file_matches_stem(Path::new("/x/song_other.wav"), "vocals"));
    }

    #[test]
    fn route_stems_copies_only_routed_stems() {
        let temp = tempfile::tempdir().unwrap();
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("song_vocals.wav"), b"v").unwrap();
        fs::write(scratch.join("song_other.wav"), b"o").unwrap();
        let store = temp.path().join("store");
        let next = temp.path().join("next");

        let step_input = input(
            &temp.path().join("song.flac"),
            &[("vocals", &next), ("other", &store)],
        );
        let copied = route_stems(&scratch, &step_input, &model(), OutputFormat::Wav).unwrap();

        assert_eq!(copied, 2);
        assert!(next.join("song_vocals.wav").exists());
        assert!(store.join("song_other.wav").exists());
        assert!(!store.join("song_vocals.wav").exists());
    }

    #[test]
    fn route_stems_fails_when_stem_missing() {
        let temp = tempfile::tempdir().unwrap();
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let store = temp.path().join("store");
        let step_input = input(&temp.path().join("song.wav"), &[("vocals", &store)]);
        assert!(route_stems(&scratch, &step_input, &model(), OutputFormat::Wav).is_err());
    }

    #[test]
    fn command_template_substitutes_placeholders() {
        let runner = CommandStepRunner::new(
            "separate",
            vec![
                "--model={model}".to_string(),
                "{model_type}".to_string(),
                "{input}".to_string(),
                "{output_dir}".to_string(),
                "{format}".to_string(),
            ],
        );
        let command = runner.command_for(
            &model(),
            Path::new("/in/a.wav"),
            Path::new("/tmp/out"),
            OutputFormat::Flac,
        );
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["--model=kim_vocals", "msst_models", "/in/a.wav", "/tmp/out", "flac"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn runs_fake_separator_per_input() {
        let temp = tempfile::tempdir().unwrap();
        let store = temp.path().join("store");
        let inputs: Vec<StepInput> = ["a.wav", "b.wav"]
            .iter()
            .map(|name| {
                let file = temp.path().join(name);
                fs::write(&file, b"x").unwrap();
                input(&file, &[("vocals", &store)])
            })
            .collect();

        let runner = CommandStepRunner::new(
            "sh",
            vec![
                "-c".to_string(),
                "touch \"$1/vocals.wav\" \"$1/other.wav\"".to_string(),
                "separate".to_string(),
                "{output_dir}".to_string(),
            ],
        )
        .with_poll_interval(Duration::from_millis(10));

        let model = model();
        let scratch = temp.path().join("scratch");
        let request = StepRequest {
            step: 1,
            model: &model,
            inputs: &inputs,
            output_format: OutputFormat::Wav,
            scratch_dir: &scratch,
            skip_existing: false,
        };
        let mut done = Vec::new();
        let outcome = runner
            .run_step(&request, &mut |count| done.push(count), &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(done, vec![1, 2]);
        assert!(store.join("a_vocals.wav").exists());
        assert!(store.join("b_vocals.wav").exists());
        assert!(!scratch.join("0000").exists());
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_token_stops_before_next_input() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a.wav");
        fs::write(&file, b"x").unwrap();
        let inputs = vec![input(&file, &[("vocals", temp.path())])];
        let runner = CommandStepRunner::new("sh", vec!["-c".to_string(), "exit 1".to_string()]);
        let model = model();
        let scratch = temp.path().join("scratch");
        let request = StepRequest {
            step: 1,
            model: &model,
            inputs: &inputs,
            output_format: OutputFormat::Wav,
            scratch_dir: &scratch,
            skip_existing: false,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner.run_step(&request, &mut |_| {}, &cancel).unwrap();
        assert_eq!(outcome, StepOutcome::Cancelled);
    }
}
