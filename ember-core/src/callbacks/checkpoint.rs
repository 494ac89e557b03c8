//! Checkpoint callback that saves model state and keeps the best `k` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::monitor::MonitorMode;
use super::traits::Callback;
use crate::error::{EmberError, Result};
use crate::metrics::Metrics;
use crate::model::Model;
use crate::persistence::{self, CheckpointFile, CheckpointRecord};
use crate::trainer::TrainerState;

const DEFAULT_FILENAME: &str = "{epoch}";
const EXTENSION: &str = "ckpt";

/// Saves a checkpoint after validation, or after each epoch when the run has no validation.
///
/// An existing directory passed as `filepath` becomes the checkpoint
/// directory. Any other path is split into its parent directory and a file
/// stem, which becomes the filename template. `None` leaves the directory
/// unset so the trainer can assign its `ckpt_path`.
///
/// The filename template substitutes `{epoch}` and any callback metric, e.g.
/// `"{epoch}-{val_loss:.2}"` becomes `epoch=3-val_loss=0.12`.
#[derive(Clone, Debug)]
pub struct ModelCheckpoint {
    dirpath: Option<PathBuf>,
    filename: String,
    monitor: String,
    /// Keep this many best checkpoints. `-1` keeps all, `0` keeps none.
    save_top_k: i64,
    mode: MonitorMode,
    /// Epochs between checks.
    period: usize,
    prefix: String,
    verbose: bool,
    epoch_last_check: Option<usize>,
    best_k_models: BTreeMap<PathBuf, f64>,
    records: Vec<CheckpointRecord>,
    best_model_path: Option<PathBuf>,
    best_model_score: Option<f64>,
    last_saved_epoch: Option<usize>,
}

impl ModelCheckpoint {
    pub fn new(filepath: Option<PathBuf>) -> Self {
        let (dirpath, filename) = match filepath {
            None => (None, DEFAULT_FILENAME.to_string()),
            Some(path) if path.is_dir() => {
                (Some(path), DEFAULT_FILENAME.to_string())
            }
            Some(path) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
                (path.parent().map(Path::to_path_buf), stem)
            }
        };
        let monitor = "val_loss".to_string();
        let checkpoint = Self {
            dirpath,
            filename,
            mode: MonitorMode::Auto.resolve(&monitor),
            monitor,
            save_top_k: 1,
            period: 1,
            prefix: String::new(),
            verbose: false,
            epoch_last_check: None,
            best_k_models: BTreeMap::new(),
            records: Vec::new(),
            best_model_path: None,
            best_model_score: None,
            last_saved_epoch: None,
        };
        if let Some(dir) = &checkpoint.dirpath {
            warn_if_not_empty(dir);
        }
        checkpoint
    }

    pub fn with_monitor(mut self, monitor: impl Into<String>) -> Self {
        self.monitor = monitor.into();
        self.mode = MonitorMode::Auto.resolve(&self.monitor);
        self
    }

    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode.resolve(&self.monitor);
        self
    }

    pub fn with_save_top_k(mut self, save_top_k: i64) -> Self {
        self.save_top_k = save_top_k;
        self
    }

    pub fn with_period(mut self, period: usize) -> Self {
        self.period = period.max(1);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn dirpath(&self) -> Option<&Path> {
        self.dirpath.as_deref()
    }

    /// Assign the directory. Called by the trainer when none was given.
    pub fn set_dirpath(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        warn_if_not_empty(&dir);
        self.dirpath = Some(dir);
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn save_top_k(&self) -> i64 {
        self.save_top_k
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.best_model_path.as_deref()
    }

    pub fn best_model_score(&self) -> Option<f64> {
        self.best_model_score
    }

    pub fn last_saved_epoch(&self) -> Option<usize> {
        self.last_saved_epoch
    }

    /// Checkpoints currently retained on disk, oldest first.
    pub fn kept_checkpoints(&self) -> &[CheckpointRecord] {
        &self.records
    }

    /// Render the checkpoint path for `epoch`, with an optional `-v{n}` suffix.
    pub fn format_checkpoint_name(
        &self,
        epoch: usize,
        metrics: &Metrics,
        version: Option<usize>,
    ) -> PathBuf {
        let mut name = format!("{}{}", self.prefix, render_template(&self.filename, epoch, metrics));
        if let Some(v) = version {
            name.push_str(&format!("-v{v}"));
        }
        name.push('.');
        name.push_str(EXTENSION);
        match &self.dirpath {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn next_free_path(&self, epoch: usize, metrics: &Metrics) -> PathBuf {
        let mut path = self.format_checkpoint_name(epoch, metrics, None);
        let mut version = 0;
        while path.is_file() {
            path = self.format_checkpoint_name(epoch, metrics, Some(version));
            version += 1;
        }
        path
    }

    fn check_monitor_top_k(&self, current: f64) -> bool {
        if self.save_top_k == 0 {
            return false;
        }
        if (self.best_k_models.len() as i64) < self.save_top_k {
            return true;
        }
        match self.kth_best() {
            Some((_, kth)) => self.mode.improves(current, kth, 0.0),
            None => true,
        }
    }

    /// Worst of the kept scores.
    fn kth_best(&self) -> Option<(PathBuf, f64)> {
        let worse = |a: f64, b: f64| match self.mode {
            MonitorMode::Max => a < b,
            _ => a > b,
        };
        self.best_k_models
            .iter()
            .fold(None, |acc: Option<(&PathBuf, f64)>, (path, &score)| match acc {
                Some((_, s)) if !worse(score, s) => acc,
                _ => Some((path, score)),
            })
            .map(|(p, s)| (p.clone(), s))
    }

    fn best_of_k(&self) -> Option<(PathBuf, f64)> {
        let better = |a: f64, b: f64| self.mode.improves(a, b, 0.0);
        self.best_k_models
            .iter()
            .fold(None, |acc: Option<(&PathBuf, f64)>, (path, &score)| match acc {
                Some((_, s)) if !better(score, s) => acc,
                _ => Some((path, score)),
            })
            .map(|(p, s)| (p.clone(), s))
    }

    /// Save if this epoch is due and the monitored value qualifies.
    ///
    /// Returns the path written, if any.
    pub fn save_if_due(
        &mut self,
        trainer: &TrainerState,
        model: &dyn Model,
    ) -> Result<Option<PathBuf>> {
        if trainer.running_sanity_check || trainer.testing {
            return Ok(None);
        }
        let epoch = trainer.current_epoch;
        if let Some(last) = self.epoch_last_check
            && epoch.saturating_sub(last) < self.period
        {
            return Ok(None);
        }
        self.epoch_last_check = Some(epoch);

        let Some(dir) = self.dirpath.clone() else {
            return Err(EmberError::checkpoint(
                PathBuf::new(),
                "checkpoint directory was never resolved",
            ));
        };

        let metrics = &trainer.callback_metrics;
        let filepath = self.next_free_path(epoch, metrics);

        if self.save_top_k == -1 {
            let score = metrics.get(&self.monitor).copied();
            if self.verbose {
                info!("Epoch {epoch:05}: saving model to {}", filepath.display());
            }
            let best_after = match (score, self.best_model_score) {
                (Some(s), Some(best)) if !self.mode.improves(s, best, 0.0) => Some(best),
                (Some(s), _) => Some(s),
                (None, best) => best,
            };
            self.write(&dir, &filepath, trainer, model, score, best_after)?;
            if let Some(score) = score
                && self
                    .best_model_score
                    .is_none_or(|best| self.mode.improves(score, best, 0.0))
            {
                self.best_model_score = Some(score);
                self.best_model_path = Some(filepath.clone());
            }
            if self.best_model_path.is_none() {
                self.best_model_path = Some(filepath.clone());
            }
            return Ok(Some(filepath));
        }

        let Some(&current) = metrics.get(&self.monitor) else {
            warn!(
                monitor = %self.monitor,
                "Can save best model only with {} available, skipping", self.monitor
            );
            return Ok(None);
        };

        if !self.check_monitor_top_k(current) {
            if self.verbose {
                info!(
                    "Epoch {epoch:05}: {} was not in top {}",
                    self.monitor, self.save_top_k
                );
            }
            return Ok(None);
        }

        let best_after = match self.best_model_score {
            Some(best) if !self.mode.improves(current, best, 0.0) => best,
            _ => current,
        };
        if self.verbose {
            info!(
                "Epoch {epoch:05}: {} reached {current:.5} (best {best_after:.5}), saving model to {}",
                self.monitor,
                filepath.display()
            );
        }
        self.write(&dir, &filepath, trainer, model, Some(current), Some(best_after))?;

        // Retention only changes once the file is on disk.
        let mut evicted = None;
        if self.best_k_models.len() as i64 == self.save_top_k
            && let Some((path, _)) = self.kth_best()
        {
            self.best_k_models.remove(&path);
            evicted = Some(path);
        }
        self.best_k_models.insert(filepath.clone(), current);
        if let Some((path, score)) = self.best_of_k() {
            self.best_model_path = Some(path);
            self.best_model_score = Some(score);
        }

        if let Some(path) = evicted
            && path != filepath
        {
            self.remove(&dir, &path)?;
        }
        Ok(Some(filepath))
    }

    fn write(
        &mut self,
        dir: &Path,
        filepath: &Path,
        trainer: &TrainerState,
        model: &dyn Model,
        score: Option<f64>,
        best_model_score: Option<f64>,
    ) -> Result<()> {
        let mut file =
            CheckpointFile::new(trainer.current_epoch, trainer.global_step, model.state_dict());
        file.hparams = model.hparams();
        file.callback_metrics = trainer.callback_metrics.clone();
        file.best_model_score = best_model_score;

        let record = persistence::save_checkpoint(filepath, &file, score)?;
        debug!(path = %filepath.display(), hash = %record.hash, "Checkpoint written");
        self.records.push(record);
        self.last_saved_epoch = Some(trainer.current_epoch);
        persistence::write_manifest(dir, &self.records)
    }

    fn remove(&mut self, dir: &Path, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        self.records.retain(|r| r.path != path);
        persistence::write_manifest(dir, &self.records)
    }
}

/// Saving is driven by the trainer through [`ModelCheckpoint::save_if_due`],
/// so a checkpoint registered as a callback is moved into the trainer's
/// checkpoint slot rather than dispatched like the others.
impl Callback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }
}

fn warn_if_not_empty(dir: &Path) {
    if let Ok(mut entries) = std::fs::read_dir(dir)
        && entries.next().is_some()
    {
        warn!(
            dir = %dir.display(),
            "Checkpoint directory exists and is not empty; files may be overwritten"
        );
    }
}

/// Substitute `{epoch}` and `{metric}` / `{metric:.N}` placeholders as `name=value`.
fn render_template(template: &str, epoch: usize, metrics: &Metrics) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let field = &rest[open + 1..open + close];
        let (key, precision) = match field.split_once(':') {
            Some((key, spec)) => (
                key,
                spec.trim_start_matches('.')
                    .trim_end_matches('f')
                    .parse::<usize>()
                    .ok(),
            ),
            None => (field, None),
        };
        if key == "epoch" {
            out.push_str(&format!("epoch={epoch}"));
        } else {
            let value = metrics.get(key).copied().unwrap_or(0.0);
            match precision {
                Some(p) => out.push_str(&format!("{key}={value:.p$}")),
                None => out.push_str(&format!("{key}={value}")),
            }
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Batch, DataLoader, Sample};
    use crate::metrics::StepOutput;
    use tempfile::TempDir;

    struct Fixed;
    impl Model for Fixed {
        fn training_step(&mut self, _: &Batch, _: usize) -> Result<StepOutput> {
            Ok(StepOutput::with_loss(1.0))
        }
        fn train_dataloader(&self) -> DataLoader {
            DataLoader::new(Vec::<Sample>::new(), 1)
        }
        fn state_dict(&self) -> serde_json::Value {
            serde_json::json!({ "w": 1 })
        }
    }

    fn state(epoch: usize, val_loss: f64) -> TrainerState {
        let mut state = TrainerState {
            current_epoch: epoch,
            validation_enabled: true,
            ..Default::default()
        };
        state.callback_metrics.insert("val_loss".into(), val_loss);
        state
    }

    #[test]
    fn test_none_filepath_leaves_dir_unset() {
        let cb = ModelCheckpoint::new(None);
        assert!(cb.dirpath().is_none());
        assert_eq!(cb.monitor(), "val_loss");
        assert_eq!(cb.save_top_k(), 1);
    }

    #[test]
    fn test_file_path_splits_into_dir_and_stem() {
        let dir = TempDir::new().unwrap();
        let cb = ModelCheckpoint::new(Some(dir.path().join("weights.ckpt")));
        assert_eq!(cb.dirpath(), Some(dir.path()));
        let name = cb.format_checkpoint_name(0, &Metrics::new(), None);
        assert_eq!(name, dir.path().join("weights.ckpt"));
    }

    #[test]
    fn test_missing_path_without_extension_splits_too() {
        let dir = TempDir::new().unwrap();
        let cb = ModelCheckpoint::new(Some(dir.path().join("not_yet")));
        assert_eq!(cb.dirpath(), Some(dir.path()));
        assert_eq!(
            cb.format_checkpoint_name(2, &Metrics::new(), None),
            dir.path().join("not_yet.ckpt")
        );
    }

    #[test]
    fn test_existing_dir_becomes_dirpath() {
        let dir = TempDir::new().unwrap();
        let cb = ModelCheckpoint::new(Some(dir.path().to_path_buf()));
        assert_eq!(cb.dirpath(), Some(dir.path()));
        assert_eq!(
            cb.format_checkpoint_name(2, &Metrics::new(), None),
            dir.path().join("epoch=2.ckpt")
        );
    }

    #[test]
    fn test_failed_write_keeps_previous_best() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None);
        cb.set_dirpath(dir.path());
        cb.save_if_due(&state(0, 0.5), &Fixed).unwrap();
        let first = dir.path().join("epoch=0.ckpt");

        // A regular file where the directory should be makes the write fail.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "x").unwrap();
        cb.set_dirpath(blocked.join("sub"));
        assert!(cb.save_if_due(&state(1, 0.1), &Fixed).is_err());

        assert!(first.exists());
        assert_eq!(cb.best_model_path(), Some(first.as_path()));
        assert_eq!(cb.best_model_score(), Some(0.5));
        assert_eq!(cb.kept_checkpoints().len(), 1);
    }

    #[test]
    fn test_format_checkpoint_name() {
        let mut cb = ModelCheckpoint::new(None).with_prefix("run_");
        cb.set_dirpath("/ckpts");
        let mut metrics = Metrics::new();
        metrics.insert("val_loss".into(), 0.123456);
        assert_eq!(
            cb.format_checkpoint_name(3, &metrics, None),
            PathBuf::from("/ckpts/run_epoch=3.ckpt")
        );
        assert_eq!(
            cb.format_checkpoint_name(3, &metrics, Some(1)),
            PathBuf::from("/ckpts/run_epoch=3-v1.ckpt")
        );

        cb.filename = "{epoch}-{val_loss:.2f}".into();
        assert_eq!(
            cb.format_checkpoint_name(4, &metrics, None),
            PathBuf::from("/ckpts/run_epoch=4-val_loss=0.12.ckpt")
        );
    }

    #[test]
    fn test_top_1_keeps_only_best() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None);
        cb.set_dirpath(dir.path());

        cb.save_if_due(&state(0, 0.5), &Fixed).unwrap();
        cb.save_if_due(&state(1, 0.3), &Fixed).unwrap();
        let skipped = cb.save_if_due(&state(2, 0.9), &Fixed).unwrap();

        assert!(skipped.is_none());
        assert!(!dir.path().join("epoch=0.ckpt").exists());
        assert!(dir.path().join("epoch=1.ckpt").exists());
        assert_eq!(cb.best_model_path(), Some(dir.path().join("epoch=1.ckpt").as_path()));
        assert_eq!(cb.best_model_score(), Some(0.3));
        assert_eq!(cb.kept_checkpoints().len(), 1);
        assert_eq!(persistence::read_manifest(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_save_all_ignores_monitor() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None).with_save_top_k(-1);
        cb.set_dirpath(dir.path());

        let mut no_metric = TrainerState::default();
        for epoch in 0..3 {
            no_metric.current_epoch = epoch;
            cb.save_if_due(&no_metric, &Fixed).unwrap();
        }
        assert_eq!(cb.kept_checkpoints().len(), 3);
        assert!(dir.path().join("epoch=2.ckpt").exists());
    }

    #[test]
    fn test_missing_monitor_skips() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None);
        cb.set_dirpath(dir.path());
        let saved = cb.save_if_due(&TrainerState::default(), &Fixed).unwrap();
        assert!(saved.is_none());
        assert!(cb.kept_checkpoints().is_empty());
    }

    #[test]
    fn test_period_skips_epochs() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None)
            .with_save_top_k(-1)
            .with_period(2);
        cb.set_dirpath(dir.path());
        for epoch in 0..5 {
            cb.save_if_due(&state(epoch, 1.0), &Fixed).unwrap();
        }
        let epochs: Vec<_> = cb.kept_checkpoints().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![0, 2, 4]);
    }

    #[test]
    fn test_existing_file_gets_version_suffix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("epoch=0.ckpt"), "old").unwrap();
        let mut cb = ModelCheckpoint::new(None).with_save_top_k(-1);
        cb.set_dirpath(dir.path());
        let saved = cb.save_if_due(&state(0, 1.0), &Fixed).unwrap();
        assert_eq!(saved, Some(dir.path().join("epoch=0-v0.ckpt")));
    }

    #[test]
    fn test_unresolved_dir_is_error() {
        let mut cb = ModelCheckpoint::new(None);
        assert!(cb.save_if_due(&state(0, 1.0), &Fixed).is_err());
    }

    #[test]
    fn test_sanity_check_never_saves() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(None);
        cb.set_dirpath(dir.path());
        let mut s = state(0, 0.1);
        s.running_sanity_check = true;
        assert!(cb.save_if_due(&s, &Fixed).unwrap().is_none());
    }
}
