//! Training result types

use std::path::PathBuf;

use crate::metrics::{Metrics, MetricsHistory};

/// Result of a `fit` run
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Epochs run by this call
    pub epochs_completed: usize,
    /// Index of the last epoch that ran
    pub final_epoch: usize,
    pub global_step: usize,
    /// Whether a callback stopped training before `max_epochs`
    pub stopped_early: bool,
    pub best_model_path: Option<PathBuf>,
    pub ckpt_path: PathBuf,
    pub callback_metrics: Metrics,
    pub history: MetricsHistory,
    /// Wall-clock time of the run in seconds
    pub elapsed_secs: f64,
}

impl FitResult {
    pub fn final_loss(&self) -> Option<f64> {
        self.history.last_loss()
    }
}
