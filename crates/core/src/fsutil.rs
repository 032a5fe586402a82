use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of reading a JSON document that other processes may rewrite at any time.
#[derive(Debug)]
pub enum JsonRead<T> {
    Missing,
    Corrupt(serde_json::Error),
    Parsed(T),
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode JSON for {}", path.display()))?;
    write_atomic(path, &encoded)
}

/// Atomically replace `path` with `contents`.
///
/// The bytes go to a unique sibling file first, which is then renamed over the target,
/// so concurrent readers observe either the previous or the new document.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path has no parent directory: {}", path.display()))?;

    let staging = staging_path(path);
    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&staging)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&staging);
        return Err(err).with_context(|| {
            format!(
                "failed to write staging file {} under {}",
                staging.display(),
                parent.display()
            )
        });
    }

    if let Err(err) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(err)
            .with_context(|| format!("failed to move staged file into {}", path.display()));
    }

    Ok(())
}

/// Read a JSON document, separating "absent" and "unparseable" from real I/O failures.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<JsonRead<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JsonRead::Missing),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(parsed) => Ok(JsonRead::Parsed(parsed)),
        Err(err) => Ok(JsonRead::Corrupt(err)),
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{file_name}.{}.tmp", &suffix[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn atomic_write_replaces_document_and_leaves_no_staging_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");

        write_json_atomic(&path, &Doc { value: 1 }).expect("first write");
        write_json_atomic(&path, &Doc { value: 2 }).expect("second write");

        match read_json::<Doc>(&path).expect("read") {
            JsonRead::Parsed(doc) => assert_eq!(doc, Doc { value: 2 }),
            other => panic!("expected parsed document, got {other:?}"),
        }

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_json_distinguishes_missing_and_corrupt() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            read_json::<Doc>(&missing).expect("read missing"),
            JsonRead::Missing
        ));

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, b"{\"value\": ").expect("write corrupt");
        assert!(matches!(
            read_json::<Doc>(&corrupt).expect("read corrupt"),
            JsonRead::Corrupt(_)
        ));
    }

    #[test]
    fn removals_are_idempotent() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("a.json");
        fs::write(&file, b"{}").expect("write");

        assert!(remove_file_if_exists(&file).expect("remove"));
        assert!(!remove_file_if_exists(&file).expect("remove again"));

        let sub = dir.path().join("sub");
        fs::create_dir_all(sub.join("nested")).expect("mkdir");
        assert!(remove_dir_all_if_exists(&sub).expect("remove dir"));
        assert!(!remove_dir_all_if_exists(&sub).expect("remove dir again"));
    }
}
