//! The training loop

use std::time::Instant;

use tracing::{debug, info, warn};

use super::core::Trainer;
use super::result::FitResult;
use crate::callbacks::{CallbackAction, Hook};
use crate::data::{DataLoader, limit_batches};
use crate::error::{EmberError, Result};
use crate::metrics::Metrics;
use crate::model::Model;

/// How a training epoch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochExit {
    Completed,
    /// The model or a callback skipped the rest of the epoch.
    Skipped,
    /// A callback asked to stop from `on_batch_end`.
    Interrupted,
}

impl Trainer {
    /// Fire `hook` on user callbacks, then on built-in observers.
    pub(crate) fn fire(&mut self, hook: Hook, model: &dyn Model) -> CallbackAction {
        let action = self.callbacks.dispatch(hook, &self.state, model);
        action.merge(self.builtins.dispatch(hook, &self.state, model))
    }

    fn request_stop(&mut self, action: CallbackAction, hook: Hook) {
        if action == CallbackAction::Stop && !self.state.should_stop {
            debug!(hook = hook.as_str(), epoch = self.state.current_epoch, "Stop requested");
            self.state.should_stop = true;
        }
    }

    fn max_steps_reached(&self) -> bool {
        self.config
            .max_steps
            .is_some_and(|max| self.state.global_step >= max)
    }

    /// Train `model` until `max_epochs`, `max_steps`, or a stop request.
    pub fn fit(&mut self, model: &mut dyn Model) -> Result<FitResult> {
        let started = Instant::now();
        self.state.testing = false;
        self.state.should_stop = false;

        let train_loader = model.train_dataloader();
        let (train_pct, val_pct, _) = self.config.effective_percents();
        self.state.num_training_batches = limit_batches(train_loader.num_batches(), train_pct);
        if self.state.num_training_batches == 0 {
            return Err(EmberError::config(format!(
                "train dataloader yields no batches ({} samples, train_percent_check = {train_pct})",
                train_loader.num_samples()
            )));
        }

        let val_loader = model.val_dataloader();
        self.state.num_val_batches = val_loader
            .as_ref()
            .map_or(0, |loader| limit_batches(loader.num_batches(), val_pct));
        self.state.validation_enabled = self.state.num_val_batches > 0;

        if let Some(logger) = &self.logger {
            let hparams = model.hparams();
            if !hparams.is_null() {
                logger.log_hyperparams(&hparams)?;
            }
        }

        if let Some(loader) = val_loader.as_ref().filter(|_| self.state.validation_enabled)
            && self.config.num_sanity_val_steps > 0
        {
            self.run_sanity_check(model, loader)?;
        }

        info!(
            model = model.name(),
            max_epochs = self.config.max_epochs,
            train_batches = self.state.num_training_batches,
            val_batches = self.state.num_val_batches,
            start_epoch = self.state.current_epoch,
            "Starting training"
        );

        model.on_train_start();
        self.fire(Hook::TrainStart, &*model);

        let start_epoch = self.state.current_epoch;
        let mut epochs_completed = 0;
        let mut stopped_early = false;

        for epoch in start_epoch..self.config.max_epochs {
            self.state.current_epoch = epoch;
            self.run_training_epoch(model, &train_loader, val_loader.as_ref())?;
            epochs_completed += 1;

            if self.state.should_stop {
                if epoch + 1 >= self.config.min_epochs {
                    stopped_early = epoch + 1 < self.config.max_epochs;
                    info!(epoch, "Training stopped by callback");
                    break;
                }
                debug!(
                    epoch,
                    min_epochs = self.config.min_epochs,
                    "Stop request ignored before min_epochs"
                );
                self.state.should_stop = false;
            }

            if self.max_steps_reached() {
                info!(global_step = self.state.global_step, "Reached max_steps");
                break;
            }
        }

        model.on_train_end();
        self.fire(Hook::TrainEnd, &*model);
        if let Some(es) = self.early_stop_callback.as_mut() {
            crate::callbacks::Callback::on_train_end(es, &self.state, &*model);
        }

        let result = FitResult {
            epochs_completed,
            final_epoch: self.state.current_epoch,
            global_step: self.state.global_step,
            stopped_early,
            best_model_path: self.best_model_path(),
            ckpt_path: self.state.ckpt_path.clone(),
            callback_metrics: self.state.callback_metrics.clone(),
            history: self.state.history.clone(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            epochs = result.epochs_completed,
            global_step = result.global_step,
            stopped_early = result.stopped_early,
            elapsed_secs = result.elapsed_secs,
            "Training complete"
        );
        Ok(result)
    }

    fn run_training_epoch(
        &mut self,
        model: &mut dyn Model,
        train_loader: &DataLoader,
        val_loader: Option<&DataLoader>,
    ) -> Result<()> {
        let epoch = self.state.current_epoch;
        let batches = train_loader.batches(&mut self.rng);

        model.on_epoch_start();
        self.fire(Hook::EpochStart, &*model);

        let mut losses = Vec::with_capacity(self.state.num_training_batches);
        let mut exit = EpochExit::Completed;

        for (batch_idx, batch) in batches
            .iter()
            .take(self.state.num_training_batches)
            .enumerate()
        {
            self.state.batch_idx = batch_idx;
            self.fire(Hook::BatchStart, &*model);
            if model.on_batch_start(batch) == CallbackAction::SkipEpoch {
                debug!(epoch, batch_idx, "Model skipped the rest of the epoch");
                exit = EpochExit::Skipped;
                break;
            }

            let output = model.training_step(batch, batch_idx)?;
            model.optimizer_step(epoch, batch_idx);
            self.state.global_step += 1;

            if let Some(loss) = output.loss {
                losses.push(loss);
            }
            self.state.callback_metrics.extend(output.callback_metrics());

            if let Some(logger) = &self.logger
                && self
                    .state
                    .global_step
                    .is_multiple_of(self.config.row_log_interval)
            {
                logger.log_metrics(self.state.global_step, &output.log)?;
            }

            let action = self.fire(Hook::BatchEnd, &*model);
            self.request_stop(action, Hook::BatchEnd);
            if self.state.should_stop {
                exit = EpochExit::Interrupted;
                break;
            }
            if action == CallbackAction::SkipEpoch {
                debug!(epoch, batch_idx, "Callback skipped the rest of the epoch");
                exit = EpochExit::Skipped;
                break;
            }
            if self.max_steps_reached() {
                break;
            }
        }

        let val_metrics = match val_loader {
            Some(loader)
                if exit == EpochExit::Completed
                    && self
                        .state
                        .is_val_epoch(epoch, self.config.check_val_every_n_epoch) =>
            {
                Some(self.run_validation(model, loader)?)
            }
            _ => None,
        };

        if losses.is_empty() {
            warn!(epoch, "No training loss recorded this epoch");
        } else {
            let epoch_loss = losses.iter().sum::<f64>() / losses.len() as f64;
            self.state
                .history
                .record_epoch(epoch, epoch_loss, val_metrics.as_ref());
        }

        model.on_epoch_end();
        let action = self.fire(Hook::EpochEnd, &*model);
        self.request_stop(action, Hook::EpochEnd);

        if !self.state.validation_enabled {
            if let Some(cb) = self.checkpoint_callback.as_mut() {
                cb.save_if_due(&self.state, &*model)?;
            }
            if let Some(es) = self.early_stop_callback.as_mut() {
                let action = es.check_phase(&self.state, false)?;
                self.request_stop(action, Hook::EpochEnd);
            }
        }

        self.log_epoch_metrics(epoch)
    }

    fn log_epoch_metrics(&self, epoch: usize) -> Result<()> {
        let Some(logger) = &self.logger else {
            return Ok(());
        };
        let mut row: Metrics = self.state.callback_metrics.clone();
        row.insert("epoch".to_string(), epoch as f64);
        logger.log_metrics(self.state.global_step, &row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{Callback, HookTrace};
    use crate::config::TrainerConfig;
    use crate::data::{Batch, Sample};
    use crate::metrics::StepOutput;
    use crate::model::{LinearHparams, LinearRegression};
    use crate::trainer::TrainerState;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_epochs: usize) -> TrainerConfig {
        TrainerConfig {
            progress_bar_refresh_rate: 0,
            ..TrainerConfig::default()
        }
        .with_root_dir(dir.path())
        .with_max_epochs(max_epochs)
        .with_seed(7)
    }

    fn small_model() -> LinearRegression {
        LinearRegression::new(LinearHparams {
            num_samples: 64,
            batch_size: 8,
            ..LinearHparams::default()
        })
    }

    /// Training-only model with a fixed number of batches.
    struct Counting {
        batches: usize,
    }

    impl Model for Counting {
        fn training_step(&mut self, _: &Batch, batch_idx: usize) -> Result<StepOutput> {
            Ok(StepOutput::with_loss(1.0 / (batch_idx + 1) as f64))
        }
        fn train_dataloader(&self) -> DataLoader {
            let samples: Vec<Sample> = (0..self.batches)
                .map(|i| Sample::new(vec![i as f64], 0.0))
                .collect();
            DataLoader::new(samples, 1)
        }
    }

    struct SkipFrom(usize);

    impl Model for SkipFrom {
        fn training_step(&mut self, _: &Batch, _: usize) -> Result<StepOutput> {
            Ok(StepOutput::with_loss(1.0))
        }
        fn train_dataloader(&self) -> DataLoader {
            let samples: Vec<Sample> = (0..4).map(|i| Sample::new(vec![i as f64], 0.0)).collect();
            DataLoader::new(samples, 1)
        }
        fn on_batch_start(&mut self, batch: &Batch) -> CallbackAction {
            if batch.features[0][0] as usize >= self.0 {
                CallbackAction::SkipEpoch
            } else {
                CallbackAction::Continue
            }
        }
    }

    struct StopAfter(usize);

    impl Callback for StopAfter {
        fn on_epoch_end(&mut self, trainer: &TrainerState, _: &dyn Model) -> CallbackAction {
            if trainer.current_epoch + 1 >= self.0 {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            }
        }
    }

    #[test]
    fn test_runs_all_epochs() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(config(&dir, 3), Vec::new()).unwrap();
        let mut model = small_model();
        let result = trainer.fit(&mut model).unwrap();

        assert_eq!(result.epochs_completed, 3);
        assert_eq!(result.final_epoch, 2);
        assert!(!result.stopped_early);
        assert_eq!(result.global_step, 3 * trainer.state().num_training_batches);
        assert_eq!(result.history.loss_history.len(), 3);
        assert!(result.callback_metrics.contains_key("val_loss"));
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(config(&dir, 20), Vec::new()).unwrap();
        let mut model = small_model();
        let result = trainer.fit(&mut model).unwrap();
        let history = &result.history.loss_history;
        assert!(history[history.len() - 1] < history[0]);
    }

    #[test]
    fn test_callback_stop_honours_min_epochs() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 10);
        cfg.min_epochs = 4;
        let mut trainer = Trainer::builder()
            .config(cfg)
            .callback(StopAfter(1))
            .build()
            .unwrap();
        let result = trainer.fit(&mut small_model()).unwrap();
        assert!(result.stopped_early);
        assert_eq!(result.epochs_completed, 4);
    }

    #[test]
    fn test_max_steps_caps_training() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 100);
        cfg.max_steps = Some(5);
        let mut trainer = Trainer::new(cfg, Vec::new()).unwrap();
        let result = trainer.fit(&mut Counting { batches: 3 }).unwrap();
        assert_eq!(result.global_step, 5);
        assert_eq!(result.epochs_completed, 2);
    }

    #[test]
    fn test_skip_epoch_from_model() {
        let dir = TempDir::new().unwrap();
        let trace = HookTrace::new();
        let mut trainer = Trainer::builder()
            .config(config(&dir, 2))
            .callback(trace.clone())
            .build()
            .unwrap();
        let result = trainer.fit(&mut SkipFrom(2)).unwrap();

        assert_eq!(result.global_step, 4);
        assert_eq!(trace.count(Hook::BatchEnd), 4);
        // The skipped batch still saw on_batch_start.
        assert_eq!(trace.count(Hook::BatchStart), 6);
        assert_eq!(trace.count(Hook::EpochEnd), 2);
    }

    #[test]
    fn test_train_percent_limits_batches() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1);
        cfg.train_percent_check = 0.5;
        let mut trainer = Trainer::new(cfg, Vec::new()).unwrap();
        let result = trainer.fit(&mut Counting { batches: 10 }).unwrap();
        assert_eq!(result.global_step, 5);
    }

    #[test]
    fn test_no_training_batches_is_error() {
        let dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(config(&dir, 1), Vec::new()).unwrap();
        let err = trainer.fit(&mut Counting { batches: 0 }).unwrap_err();
        assert!(matches!(err, EmberError::Config(_)));
    }

    #[test]
    fn test_logger_rows_and_hparams() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 2);
        cfg.row_log_interval = 2;
        let mut trainer = Trainer::new(cfg, Vec::new()).unwrap();
        trainer.fit(&mut small_model()).unwrap();

        let logger = trainer.logger().unwrap();
        assert!(logger.log_dir().join("hparams.json").is_file());
        let rows = logger.read_metrics().unwrap();
        assert!(rows.iter().any(|r| r.contains_key("train_loss")));
        assert_eq!(rows.iter().filter(|r| r.contains_key("epoch")).count(), 2);
    }
}
