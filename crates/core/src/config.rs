use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fsutil::{self, JsonRead};

const CONFIG_FILE_NAME: &str = "config.toml";
const CONCURRENCY_FILE_NAME: &str = "config.json";
const ENV_DATA_DIR: &str = "STEMFLOW_DATA_DIR";

pub const MIN_THREAD_COUNT: usize = 1;
pub const MAX_THREAD_COUNT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub separator: SeparatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub presets_dir: PathBuf,
    pub models_file: PathBuf,
    pub cache_dir: PathBuf,
    pub missions_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

/// How the scheduler launches worker processes. Without a `program` the current
/// executable is re-invoked with the `worker` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Per-step model runner used by the default worker backend.
///
/// Placeholders in `args`: `{model}`, `{model_type}`, `{input}`, `{output_dir}`, `{format}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeparatorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            presets_dir: PathBuf::from("presets"),
            models_file: PathBuf::from("presets/models.json"),
            cache_dir: PathBuf::from("cache"),
            missions_dir: PathBuf::from("missions"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7860,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
        }
    }
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("separate"),
            args: [
                "--model",
                "{model}",
                "--model-type",
                "{model_type}",
                "--input",
                "{input}",
                "--output-dir",
                "{output_dir}",
                "--format",
                "{format}",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl AppConfig {
    /// Read `config.toml`. A missing or blank file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read config {}", path.display()));
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&raw).with_context(|| format!("invalid config TOML in {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let encoded = toml::to_string_pretty(self).context("cannot encode config as TOML")?;
        fsutil::write_atomic(path, encoded.as_bytes())
    }

    /// Absolute locations of every configured path, resolved against `data_dir`.
    pub fn resolved_paths(&self, data_dir: &Path) -> PathsConfig {
        PathsConfig {
            presets_dir: resolve_relative_to(data_dir, &self.paths.presets_dir),
            models_file: resolve_relative_to(data_dir, &self.paths.models_file),
            cache_dir: resolve_relative_to(data_dir, &self.paths.cache_dir),
            missions_dir: resolve_relative_to(data_dir, &self.paths.missions_dir),
        }
    }
}

/// Concurrency settings persisted in `<data_dir>/config.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    pub thread_count: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            thread_count: MIN_THREAD_COUNT,
        }
    }
}

pub fn clamp_thread_count(requested: usize) -> usize {
    requested.clamp(MIN_THREAD_COUNT, MAX_THREAD_COUNT)
}

impl ConcurrencyConfig {
    /// Load the concurrency file, creating it with defaults when absent. Corrupt
    /// files are replaced with defaults; out-of-range values are clamped.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let loaded = match fsutil::read_json::<ConcurrencyConfig>(path)? {
            JsonRead::Parsed(config) => Some(config),
            JsonRead::Missing => None,
            JsonRead::Corrupt(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Corrupt concurrency config, resetting"
                );
                None
            }
        };

        match loaded {
            Some(config) => Ok(Self {
                thread_count: clamp_thread_count(config.thread_count),
            }),
            None => {
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }
        fsutil::write_json_atomic(path, self)
    }
}

/// Data directory: the `--data-dir` flag, else `STEMFLOW_DATA_DIR`, else `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(ENV_DATA_DIR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn concurrency_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONCURRENCY_FILE_NAME)
}

/// First-run setup: create the data directory, write a default `config.toml` if there
/// is none, and create the configured presets, cache and missions directories.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    let config = if cfg_path.exists() {
        AppConfig::load_from_path(&cfg_path)?
    } else {
        let config = AppConfig::default();
        config.save_to_path(&cfg_path)?;
        config
    };

    let paths = config.resolved_paths(data_dir);
    for dir in [&paths.presets_dir, &paths.cache_dir, &paths.missions_dir] {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }
    Ok(())
}

/// `path` itself when absolute, otherwise `base/path`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.presets_dir, PathBuf::from("presets"));
        assert_eq!(cfg.paths.models_file, PathBuf::from("presets/models.json"));
        assert_eq!(cfg.paths.cache_dir, PathBuf::from("cache"));
        assert_eq!(cfg.paths.missions_dir, PathBuf::from("missions"));

        assert_eq!(cfg.server.port, 7860);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.scheduler.tick_interval_ms, 2000);
        assert!(cfg.worker.program.is_none());
        assert!(cfg.separator.args.iter().any(|arg| arg == "{input}"));
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.worker.program = Some(PathBuf::from("/opt/stemflow/bin/stemflow"));
        original.worker.args = vec!["--quiet".to_string()];
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let decoded: AppConfig =
            toml::from_str("[scheduler]\ntick_interval_ms = 250\n").expect("parse");
        assert_eq!(decoded.scheduler.tick_interval_ms, 250);
        assert_eq!(decoded.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("config.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_and_default_resolution() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn first_run_lays_out_the_data_dir() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("data");
        initialize_data_dir(&root).expect("initialize data dir");

        assert!(root.join("config.toml").is_file());
        for dir in ["presets", "cache", "missions"] {
            assert!(root.join(dir).is_dir(), "{dir} missing");
        }
    }

    #[test]
    fn existing_config_is_kept_and_its_paths_are_created() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom = "[paths]\nmissions_dir = \"jobs\"\n";
        fs::write(&cfg_path, custom).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        assert_eq!(fs::read_to_string(&cfg_path).expect("read config"), custom);
        assert!(temp.path().join("jobs").is_dir());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[server\nport = ").expect("write");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config TOML"));
    }

    #[test]
    fn resolved_paths_join_relative_entries() {
        let mut cfg = AppConfig::default();
        cfg.paths.cache_dir = PathBuf::from("/abs/cache");
        let resolved = cfg.resolved_paths(Path::new("/base"));
        assert_eq!(resolved.presets_dir, PathBuf::from("/base/presets"));
        assert_eq!(resolved.cache_dir, PathBuf::from("/abs/cache"));
    }

    #[test]
    fn concurrency_config_is_created_and_clamped() {
        let temp = tempdir().expect("tempdir");
        let path = concurrency_config_path(temp.path());

        let created = ConcurrencyConfig::load_or_create(&path).expect("create");
        assert_eq!(created.thread_count, 1);
        assert!(path.exists());

        fs::write(&path, br#"{"thread_count": 64}"#).expect("write");
        let clamped = ConcurrencyConfig::load_or_create(&path).expect("load");
        assert_eq!(clamped.thread_count, MAX_THREAD_COUNT);

        fs::write(&path, b"not json").expect("write");
        let reset = ConcurrencyConfig::load_or_create(&path).expect("reset");
        assert_eq!(reset, ConcurrencyConfig::default());
    }

    #[test]
    fn clamp_thread_count_bounds() {
        assert_eq!(clamp_thread_count(0), 1);
        assert_eq!(clamp_thread_count(4), 4);
        assert_eq!(clamp_thread_count(11), 10);
    }
}
