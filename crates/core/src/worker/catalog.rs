use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::preset::ModelType;

/// A model a preset step can run, with the stems it writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    pub model_type: ModelType,
    /// Stem names in model order. Vocal-removal models list primary then secondary.
    pub stems: Vec<String>,
}

impl ModelEntry {
    pub fn has_stem(&self, stem: &str) -> bool {
        self.stems.iter().any(|known| known.eq_ignore_ascii_case(stem))
    }
}

/// Turns a preset step's model reference into something runnable.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, model_type: ModelType, model_name: &str) -> Result<ModelEntry>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

/// Models listed in `models.json`.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    source: Option<PathBuf>,
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        Self {
            source: None,
            entries,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model catalog: {}", path.display()))?;
        let mut catalog = Self::default();
        catalog.load_json(&raw)?;
        catalog.source = Some(path.to_path_buf());
        Ok(catalog)
    }

    /// Merge entries from JSON. Names already present are kept as they are.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: CatalogFile =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded.models {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }
}

impl ModelResolver for ModelCatalog {
    fn resolve(&self, model_type: ModelType, model_name: &str) -> Result<ModelEntry> {
        let Some(entry) = self.get(model_name) else {
            match &self.source {
                Some(source) => bail!("model {model_name} not found in {}", source.display()),
                None => bail!("model {model_name} not found"),
            }
        };
        if entry.model_type != model_type {
            bail!(
                "model {model_name} is a {} model, preset step expects {model_type}",
                entry.model_type
            );
        }
        if entry.model_type == ModelType::UvrVr && entry.stems.len() != 2 {
            bail!(
                "vocal-removal model {model_name} must declare exactly two stems, found {}",
                entry.stems.len()
            );
        }
        if entry.stems.is_empty() {
            bail!("model {model_name} declares no stems");
        }
        Ok(entry.clone())
    }
}
