//! Checkpoint files on disk.
//!
//! Checkpoints are pretty-printed JSON written through a `.tmp` sibling and
//! renamed into place, so a crash never leaves a half-written `.ckpt`.
//! `ModelCheckpoint` keeps a `checkpoints.json` manifest of what it retained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{EmberError, Result};
use crate::metrics::Metrics;

/// Name of the manifest file kept next to the checkpoints.
pub const MANIFEST_FILE: &str = "checkpoints.json";

/// Everything needed to resume a model and its trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub epoch: usize,
    pub global_step: usize,
    pub state_dict: serde_json::Value,
    #[serde(default)]
    pub hparams: serde_json::Value,
    #[serde(default)]
    pub callback_metrics: Metrics,
    #[serde(default)]
    pub best_model_score: Option<f64>,
    pub ember_version: String,
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    pub fn new(epoch: usize, global_step: usize, state_dict: serde_json::Value) -> Self {
        Self {
            epoch,
            global_step,
            state_dict,
            hparams: serde_json::Value::Null,
            callback_metrics: Metrics::new(),
            best_model_score: None,
            ember_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Manifest entry for a checkpoint written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub epoch: usize,
    /// Monitored value at save time, when one was available.
    pub score: Option<f64>,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write a checkpoint and describe what was written.
pub fn save_checkpoint(
    path: &Path,
    checkpoint: &CheckpointFile,
    score: Option<f64>,
) -> Result<CheckpointRecord> {
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    atomic_write(path, &bytes)
        .map_err(|e| EmberError::checkpoint(path, format!("write failed: {e}")))?;

    let hash = format!("{:x}", Sha256::digest(&bytes));
    Ok(CheckpointRecord {
        id: uuid::Uuid::new_v4().to_string(),
        epoch: checkpoint.epoch,
        score,
        path: path.to_path_buf(),
        hash,
        size_bytes: bytes.len() as u64,
        created_at: checkpoint.created_at,
    })
}

/// Read a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint(path: &Path) -> Result<CheckpointFile> {
    if !path.exists() {
        return Err(EmberError::checkpoint(path, "file does not exist"));
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| EmberError::checkpoint(path, format!("invalid checkpoint: {e}")))
}

/// Replace the manifest in `dir` with `records`.
pub fn write_manifest(dir: &Path, records: &[CheckpointRecord]) -> Result<()> {
    let json = serde_json::to_vec_pretty(records)?;
    atomic_write(&dir.join(MANIFEST_FILE), &json)
}

/// Manifest entries in `dir`; empty when no manifest exists yet.
pub fn read_manifest(dir: &Path) -> Result<Vec<CheckpointRecord>> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("epoch=2.ckpt");

        let mut ckpt = CheckpointFile::new(2, 40, serde_json::json!({ "bias": 1.0 }));
        ckpt.callback_metrics.insert("val_loss".into(), 0.25);

        let record = save_checkpoint(&path, &ckpt, Some(0.25)).unwrap();
        assert_eq!(record.epoch, 2);
        assert_eq!(record.score, Some(0.25));
        assert_eq!(record.hash.len(), 64);
        assert_eq!(record.size_bytes, std::fs::metadata(&path).unwrap().len());
        assert!(!path.with_extension("tmp").exists());

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded, ckpt);
    }

    #[test]
    fn test_load_missing_is_checkpoint_error() {
        let err = load_checkpoint(Path::new("/nonexistent/epoch=0.ckpt")).unwrap_err();
        assert!(matches!(err, EmberError::Checkpoint { .. }));
    }

    #[test]
    fn test_load_garbage_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ckpt");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_checkpoint(&path),
            Err(EmberError::Checkpoint { .. })
        ));
    }

    #[test]
    fn test_manifest_roundtrip_and_absent() {
        let dir = TempDir::new().unwrap();
        assert!(read_manifest(dir.path()).unwrap().is_empty());

        let ckpt = CheckpointFile::new(0, 1, serde_json::Value::Null);
        let record = save_checkpoint(&dir.path().join("a.ckpt"), &ckpt, None).unwrap();
        write_manifest(dir.path(), std::slice::from_ref(&record)).unwrap();
        assert_eq!(read_manifest(dir.path()).unwrap(), vec![record]);
    }
}
