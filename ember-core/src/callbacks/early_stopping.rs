//! Early stopping callback to halt training when a monitored metric plateaus

use tracing::{info, warn};

use super::monitor::MonitorMode;
use super::traits::{Callback, CallbackAction};
use crate::error::{EmberError, Result};
use crate::model::Model;
use crate::trainer::TrainerState;

/// Stops training when `monitor` has not improved for `patience` checks.
///
/// The check runs after each validation pass. When the run has no
/// validation (the model defines no val dataloader, or `val_percent_check`
/// is zero) it runs at the end of every training epoch against the training
/// callback metrics instead.
///
/// # Example
///
/// ```rust
/// use ember_core::callbacks::EarlyStopping;
///
/// // Watch a training metric, require an improvement of at least 0.1
/// let stopping = EarlyStopping::new("my_train_metric").with_min_delta(0.1);
/// assert_eq!(stopping.patience(), 3);
/// ```
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    monitor: String,
    min_delta: f64,
    patience: usize,
    mode: MonitorMode,
    /// Missing monitor keys are errors rather than warnings.
    strict: bool,
    verbose: bool,
    best: f64,
    pub(crate) wait: usize,
    stopped_epoch: Option<usize>,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new("val_loss")
    }
}

impl EarlyStopping {
    pub fn new(monitor: impl Into<String>) -> Self {
        let monitor = monitor.into();
        let mode = MonitorMode::Auto.resolve(&monitor);
        Self {
            monitor,
            min_delta: 0.0,
            patience: 3,
            mode,
            strict: true,
            verbose: false,
            best: mode.initial_best(),
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_mode(mut self, mode: MonitorMode) -> Self {
        self.mode = mode.resolve(&self.monitor);
        self.best = self.mode.initial_best();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn wait(&self) -> usize {
        self.wait
    }

    /// Epoch at which the stop was requested, if any.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn reset(&mut self) {
        self.best = self.mode.initial_best();
        self.wait = 0;
        self.stopped_epoch = None;
    }

    /// Compare the monitored metric against the best seen so far.
    ///
    /// Returns `Stop` once `wait` reaches `patience`. A missing metric is an
    /// error in strict mode and a no-op otherwise.
    pub fn check(&mut self, trainer: &TrainerState) -> Result<CallbackAction> {
        let Some(&current) = trainer.callback_metrics.get(&self.monitor) else {
            if self.strict {
                return Err(EmberError::metric_not_found(
                    &self.monitor,
                    trainer.callback_metrics.keys(),
                ));
            }
            if self.verbose {
                warn!(
                    monitor = %self.monitor,
                    "Early stopping conditioned on a metric that is not available, skipping"
                );
            }
            return Ok(CallbackAction::Continue);
        };

        if self.mode.improves(current, self.best, self.min_delta) {
            self.best = current;
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(trainer.current_epoch);
            info!(
                monitor = %self.monitor,
                best = self.best,
                patience = self.patience,
                epoch = trainer.current_epoch,
                "Early stopping triggered"
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }

    /// Run the check for the current phase of the loop.
    ///
    /// `after_validation` is true when called from the end of a validation pass.
    pub(crate) fn check_phase(
        &mut self,
        trainer: &TrainerState,
        after_validation: bool,
    ) -> Result<CallbackAction> {
        if trainer.running_sanity_check || after_validation != trainer.validation_enabled {
            return Ok(CallbackAction::Continue);
        }
        self.check(trainer)
    }
}

/// The check itself is run by the trainer through `check_phase` so a strict
/// failure reaches the caller. Registered as a callback, a stopper is moved
/// into the trainer's early-stopping slot.
impl Callback for EarlyStopping {
    fn on_train_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {
        if let Some(epoch) = self.stopped_epoch
            && self.verbose
        {
            info!("Epoch {:05}: early stopping", epoch + 1);
        }
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}
