//! Versioned experiment logger writing JSON files under the root directory.
//!
//! Layout: `<save_dir>/<name>/version_<n>/{hparams.json, metrics.jsonl}`.
//! Each run claims the next free version number.

use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::metrics::Metrics;

pub const DEFAULT_LOGGER_NAME: &str = "ember_logs";
const METRICS_FILE: &str = "metrics.jsonl";
const HPARAMS_FILE: &str = "hparams.json";

#[derive(Debug, Clone)]
pub struct ExperimentLogger {
    save_dir: PathBuf,
    name: String,
    version: usize,
}

impl ExperimentLogger {
    /// Create a logger that claims the next free version under `save_dir/name`.
    pub fn new(save_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let save_dir = save_dir.into();
        let name = name.into();
        let version = next_version(&save_dir.join(&name));
        Self {
            save_dir,
            name,
            version,
        }
    }

    pub fn with_version(mut self, version: usize) -> Self {
        self.version = version;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> usize {
        self.version
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.save_dir
            .join(&self.name)
            .join(format!("version_{}", self.version))
    }

    pub fn log_hyperparams(&self, hparams: &Value) -> Result<()> {
        let dir = self.log_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(HPARAMS_FILE), serde_json::to_vec_pretty(hparams)?)?;
        Ok(())
    }

    /// Append one row: `{"step": <step>, <metric>: <value>, ...}`.
    pub fn log_metrics(&self, step: usize, metrics: &Metrics) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let dir = self.log_dir();
        std::fs::create_dir_all(&dir)?;

        let mut row = Map::new();
        row.insert("step".into(), Value::from(step));
        for (key, value) in metrics {
            row.insert(key.clone(), Value::from(*value));
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(METRICS_FILE))?;
        serde_json::to_writer(&mut file, &Value::Object(row))?;
        file.write_all(b"\n")?;
        debug!(step, keys = metrics.len(), "Logged metrics row");
        Ok(())
    }

    /// Rows written so far, in order.
    pub fn read_metrics(&self) -> Result<Vec<Map<String, Value>>> {
        let path = self.log_dir().join(METRICS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}

fn next_version(root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("version_"))
                .and_then(|v| v.parse::<usize>().ok())
        })
        .max()
        .map_or(0, |v| v + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_versions_increment() {
        let dir = TempDir::new().unwrap();
        let first = ExperimentLogger::new(dir.path(), DEFAULT_LOGGER_NAME);
        assert_eq!(first.version(), 0);
        first.log_hyperparams(&serde_json::json!({ "lr": 0.1 })).unwrap();

        let second = ExperimentLogger::new(dir.path(), DEFAULT_LOGGER_NAME);
        assert_eq!(second.version(), 1);
        assert_eq!(
            second.log_dir(),
            dir.path().join("ember_logs").join("version_1")
        );
    }

    #[test]
    fn test_metrics_rows_append() {
        let dir = TempDir::new().unwrap();
        let logger = ExperimentLogger::new(dir.path(), "exp");
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), 0.5);
        logger.log_metrics(10, &metrics).unwrap();
        metrics.insert("loss".into(), 0.25);
        logger.log_metrics(20, &metrics).unwrap();
        logger.log_metrics(30, &Metrics::new()).unwrap();

        let rows = logger.read_metrics().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["step"], 20);
        assert_eq!(rows[1]["loss"], 0.25);
    }

    #[test]
    fn test_non_version_dirs_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("exp").join("version_4")).unwrap();
        std::fs::create_dir_all(dir.path().join("exp").join("notes")).unwrap();
        assert_eq!(ExperimentLogger::new(dir.path(), "exp").version(), 5);
    }
}
