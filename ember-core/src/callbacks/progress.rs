//! Progress reporting through `tracing`.

use tracing::info;

use super::traits::{Callback, CallbackAction};
use crate::model::Model;
use crate::trainer::TrainerState;

/// Logs the running loss every `refresh_rate` batches and a summary per epoch.
#[derive(Clone, Debug)]
pub struct ProgressLogger {
    refresh_rate: usize,
    batches_seen: usize,
}

impl ProgressLogger {
    pub fn new(refresh_rate: usize) -> Self {
        Self {
            refresh_rate: refresh_rate.max(1),
            batches_seen: 0,
        }
    }

    pub fn refresh_rate(&self) -> usize {
        self.refresh_rate
    }
}

impl Callback for ProgressLogger {
    fn on_epoch_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {
        self.batches_seen = 0;
    }

    fn on_batch_end(&mut self, trainer: &TrainerState, _model: &dyn Model) -> CallbackAction {
        self.batches_seen += 1;
        if self.batches_seen.is_multiple_of(self.refresh_rate) {
            info!(
                epoch = trainer.current_epoch,
                batch = self.batches_seen,
                total = trainer.num_training_batches,
                loss = trainer.callback_metrics.get("loss").copied().unwrap_or(f64::NAN),
                "Training"
            );
        }
        CallbackAction::Continue
    }

    fn on_epoch_end(&mut self, trainer: &TrainerState, _model: &dyn Model) -> CallbackAction {
        let metrics = trainer
            .callback_metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(epoch = trainer.current_epoch, "Epoch complete: {metrics}");
        CallbackAction::Continue
    }

    fn on_test_end(&mut self, trainer: &TrainerState, _model: &dyn Model) {
        info!(batches = trainer.num_test_batches, "Testing complete");
    }

    fn name(&self) -> &'static str {
        "ProgressLogger"
    }
}
