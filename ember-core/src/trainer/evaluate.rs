//! Sanity check, validation and test loops

use tracing::{debug, info};

use super::core::Trainer;
use crate::callbacks::{CallbackAction, Hook};
use crate::data::{DataLoader, limit_batches};
use crate::error::{EmberError, Result};
use crate::metrics::{Metrics, StepOutput};
use crate::model::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalPhase {
    Validation,
    Test,
}

impl EvalPhase {
    fn batch_hooks(self) -> (Hook, Hook) {
        match self {
            EvalPhase::Validation => (Hook::ValidationBatchStart, Hook::ValidationBatchEnd),
            EvalPhase::Test => (Hook::TestBatchStart, Hook::TestBatchEnd),
        }
    }
}

impl Trainer {
    /// Run up to `max_batches` evaluation steps, firing the phase's batch hooks.
    fn evaluate_batches(
        &mut self,
        model: &mut dyn Model,
        loader: &DataLoader,
        max_batches: usize,
        phase: EvalPhase,
    ) -> Result<Vec<StepOutput>> {
        let (start_hook, end_hook) = phase.batch_hooks();
        let batches = loader.batches(&mut self.rng);
        let mut outputs = Vec::with_capacity(max_batches.min(batches.len()));

        for (batch_idx, batch) in batches.iter().take(max_batches).enumerate() {
            self.state.batch_idx = batch_idx;
            self.fire(start_hook, &*model);
            let output = match phase {
                EvalPhase::Validation => model.validation_step(batch, batch_idx)?,
                EvalPhase::Test => model.test_step(batch, batch_idx)?,
            };
            outputs.push(output);
            self.fire(end_hook, &*model);
        }
        Ok(outputs)
    }

    /// A few validation batches before training, to fail fast on a broken
    /// validation step. Results are discarded.
    pub(crate) fn run_sanity_check(
        &mut self,
        model: &mut dyn Model,
        loader: &DataLoader,
    ) -> Result<()> {
        let steps = self.config.num_sanity_val_steps.min(loader.num_batches());
        debug!(steps, "Running sanity check");

        self.state.running_sanity_check = true;
        self.fire(Hook::SanityCheckStart, &*model);
        let outcome = self
            .evaluate_batches(model, loader, steps, EvalPhase::Validation)
            .map(|outputs| model.validation_epoch_end(&outputs));
        self.fire(Hook::SanityCheckEnd, &*model);
        self.state.running_sanity_check = false;

        outcome.map(|_| ())
    }

    /// Validation pass inside `fit`, followed by checkpointing and early stopping.
    pub(crate) fn run_validation(
        &mut self,
        model: &mut dyn Model,
        loader: &DataLoader,
    ) -> Result<Metrics> {
        let metrics = self.validation_pass(model, loader)?;

        if let Some(cb) = self.checkpoint_callback.as_mut() {
            cb.save_if_due(&self.state, &*model)?;
        }
        if let Some(es) = self.early_stop_callback.as_mut() {
            let action = es.check_phase(&self.state, true)?;
            if action == CallbackAction::Stop {
                self.state.should_stop = true;
            }
        }
        Ok(metrics)
    }

    fn validation_pass(&mut self, model: &mut dyn Model, loader: &DataLoader) -> Result<Metrics> {
        self.fire(Hook::ValidationStart, &*model);
        let outputs =
            self.evaluate_batches(model, loader, self.state.num_val_batches, EvalPhase::Validation)?;
        let metrics = model.validation_epoch_end(&outputs);
        self.state
            .callback_metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));

        let action = self.fire(Hook::ValidationEnd, &*model);
        if action == CallbackAction::Stop {
            self.state.should_stop = true;
        }
        debug!(epoch = self.state.current_epoch, ?metrics, "Validation complete");
        Ok(metrics)
    }

    /// Run one validation pass outside of `fit`.
    ///
    /// Fires the validation hooks only. Neither checkpointing nor early
    /// stopping runs.
    pub fn validate(&mut self, model: &mut dyn Model) -> Result<Metrics> {
        let Some(loader) = model.val_dataloader() else {
            return Err(EmberError::MissingDataloader { phase: "validation" });
        };
        let (_, val_pct, _) = self.config.effective_percents();
        self.state.num_val_batches = limit_batches(loader.num_batches(), val_pct);
        self.state.validation_enabled = self.state.num_val_batches > 0;
        self.validation_pass(model, &loader)
    }

    /// Evaluate `model` on its test dataloader.
    ///
    /// Only the test hooks fire: `on_test_start`, the test batch hooks and
    /// `on_test_end`.
    pub fn test(&mut self, model: &mut dyn Model) -> Result<Metrics> {
        let Some(loader) = model.test_dataloader() else {
            return Err(EmberError::MissingDataloader { phase: "test" });
        };
        let (_, _, test_pct) = self.config.effective_percents();
        self.state.num_test_batches = limit_batches(loader.num_batches(), test_pct);

        self.state.testing = true;
        self.fire(Hook::TestStart, &*model);
        let outcome = self
            .evaluate_batches(model, &loader, self.state.num_test_batches, EvalPhase::Test)
            .map(|outputs| model.test_epoch_end(&outputs));
        let metrics = match outcome {
            Ok(metrics) => metrics,
            Err(e) => {
                self.state.testing = false;
                return Err(e);
            }
        };
        self.state
            .callback_metrics
            .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(logger) = &self.logger {
            logger.log_metrics(self.state.global_step, &metrics)?;
        }
        self.fire(Hook::TestEnd, &*model);
        self.state.testing = false;

        info!(batches = self.state.num_test_batches, ?metrics, "Test complete");
        Ok(metrics)
    }
}
