//! Checkpoint management for training runs.
//!
//! Each run directory carries a `checkpoints.json` manifest. Entries record a
//! SHA-256 over the checkpoint directory's files so evaluation can detect a
//! checkpoint that changed after training.

use crate::error::PipelineError;
use crate::persistence::{atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "checkpoints.json";

/// A saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub epoch: usize,
    pub loss: f64,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Tracks the checkpoints of one run and enforces `save_total_limit`.
pub struct CheckpointManager {
    run_dir: PathBuf,
    run_id: String,
    save_total_limit: usize,
}

impl CheckpointManager {
    pub fn new(run_dir: PathBuf, run_id: impl Into<String>, save_total_limit: usize) -> Self {
        Self {
            run_dir,
            run_id: run_id.into(),
            save_total_limit: save_total_limit.max(1),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }

    /// Checkpoints in save order.
    pub fn list(&self) -> Result<Vec<Checkpoint>, PipelineError> {
        Ok(load_json(&self.manifest_path())?.unwrap_or_default())
    }

    /// Lowest-loss checkpoint.
    pub fn best(&self) -> Result<Option<Checkpoint>, PipelineError> {
        Ok(best_of(&self.list()?).cloned())
    }

    /// Record a checkpoint whose files are already in `path`.
    ///
    /// Prunes the oldest entries (and their directories) beyond the limit,
    /// never the best one.
    pub fn register(&self, epoch: usize, loss: f64, path: &Path) -> Result<Checkpoint, PipelineError> {
        if !path.is_dir() {
            return Err(PipelineError::checkpoint(format!(
                "checkpoint directory {} was not written",
                path.display()
            )));
        }
        let (hash, size_bytes) = hash_dir(path)?;

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            epoch,
            loss,
            path: path.to_path_buf(),
            hash,
            size_bytes,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.push(checkpoint.clone());

        while checkpoints.len() > self.save_total_limit {
            let best_id = best_of(&checkpoints).map(|c| c.id.clone());
            let Some(victim) = checkpoints.iter().position(|c| Some(&c.id) != best_id.as_ref()) else {
                break;
            };
            let removed = checkpoints.remove(victim);
            if removed.path.exists() {
                std::fs::remove_dir_all(&removed.path).map_err(|e| {
                    PipelineError::checkpoint(format!("failed to prune {}: {e}", removed.path.display()))
                })?;
            }
            debug!(epoch = removed.epoch, path = %removed.path.display(), "Pruned checkpoint");
        }

        atomic_write_json(&self.manifest_path(), &checkpoints)?;
        info!(epoch, loss, path = %path.display(), "Saved checkpoint");
        Ok(checkpoint)
    }

    /// Check `dir` against the manifest of the run directory that holds it.
    ///
    /// `None` when no manifest there records the checkpoint, e.g. for a run's
    /// `final` directory or a copied checkpoint.
    pub fn verify_saved(dir: &Path) -> Result<Option<bool>, PipelineError> {
        let (Some(run_dir), Some(name)) = (dir.parent(), dir.file_name()) else {
            return Ok(None);
        };
        let recorded: Vec<Checkpoint> = load_json(&run_dir.join(MANIFEST_FILE))?.unwrap_or_default();
        let Some(checkpoint) = recorded.iter().find(|c| c.path.file_name() == Some(name)) else {
            return Ok(None);
        };
        if !dir.is_dir() {
            return Ok(Some(false));
        }
        Ok(Some(hash_dir(dir)?.0 == checkpoint.hash))
    }
}

fn best_of(checkpoints: &[Checkpoint]) -> Option<&Checkpoint> {
    checkpoints
        .iter()
        .filter(|c| c.loss.is_finite())
        .min_by(|a, b| a.loss.partial_cmp(&b.loss).unwrap_or(std::cmp::Ordering::Equal))
}

/// SHA-256 over relative paths and contents of every file under `dir`, plus total size.
/// Symlinks are skipped.
pub fn hash_dir(dir: &Path) -> Result<(String, u64), PipelineError> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for rel in &files {
        let bytes = std::fs::read(dir.join(rel))?;
        size += bytes.len() as u64;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PipelineError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}
