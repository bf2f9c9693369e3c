//! Atomic JSON persistence for manifests, checkpoints and result artifacts.
//!
//! All writers go through a `.tmp` sibling and a rename so a crashed run never
//! leaves a half-written manifest behind. Write failures caused by a full disk
//! surface as [`PipelineError::ResourceExhausted`].

use crate::error::PipelineError;
use std::path::Path;

/// Atomically write pretty-printed JSON to `path`, replacing any existing file.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PipelineError::from_write_failure)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(PipelineError::from_write_failure)?;
    std::fs::rename(&tmp, path).map_err(PipelineError::from_write_failure)?;
    Ok(())
}

/// Write JSON to `path` only if nothing exists there yet.
///
/// Evaluation artifacts are write-once; a second run must pick a new path.
pub fn write_new_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), PipelineError> {
    if path.exists() {
        return Err(PipelineError::invalid_input(format!(
            "refusing to overwrite existing artifact {}",
            path.display()
        )));
    }
    atomic_write_json(path, data)
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, PipelineError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Manifest {
        model: String,
        epoch: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        let data = Manifest {
            model: "kobart".into(),
            epoch: 3,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Manifest> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("flant5").join("run.json");
        atomic_write_json(&path, &"x").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let loaded: Option<Manifest> = load_json(Path::new("/nonexistent/run.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_write_new_json_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.json");
        write_new_json(&path, &1).unwrap();
        let err = write_new_json(&path, &2).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        let kept: Option<i32> = load_json(&path).unwrap();
        assert_eq!(kept, Some(1));
    }
}
