//! Trainer state shared read-only with callbacks

use std::path::PathBuf;

use crate::metrics::{Metrics, MetricsHistory};

/// Everything the training loop tracks between hooks.
///
/// Callbacks receive this by shared reference. The trainer is the only writer.
#[derive(Clone, Debug, Default)]
pub struct TrainerState {
    /// Current epoch (0-indexed)
    pub current_epoch: usize,
    pub max_epochs: usize,
    pub min_epochs: usize,
    /// Optimizer steps taken across all epochs
    pub global_step: usize,
    /// Index of the batch being processed in the current phase
    pub batch_idx: usize,
    pub num_training_batches: usize,
    pub num_val_batches: usize,
    pub num_test_batches: usize,
    pub default_root_dir: PathBuf,
    /// Directory checkpoints are written to
    pub ckpt_path: PathBuf,
    /// Versioned experiment directory, when the logger is enabled
    pub log_dir: Option<PathBuf>,
    /// Set when a callback asked training to stop
    pub should_stop: bool,
    /// True while `Trainer::test` runs
    pub testing: bool,
    /// True while the pre-training sanity check runs
    pub running_sanity_check: bool,
    /// This run has a validation loop
    pub validation_enabled: bool,
    /// Latest metrics visible to monitoring callbacks
    pub callback_metrics: Metrics,
    pub history: MetricsHistory,
}

impl TrainerState {
    /// Whether `epoch` is one on which validation runs.
    pub fn is_val_epoch(&self, epoch: usize, every_n: usize) -> bool {
        self.validation_enabled && (epoch + 1).is_multiple_of(every_n.max(1))
    }
}
