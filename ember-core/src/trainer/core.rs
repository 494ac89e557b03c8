//! Trainer construction, accessors and checkpoint restore

use std::any::Any;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use tracing::{debug, info};

use super::state::TrainerState;
use crate::callbacks::{Callback, CallbackManager, EarlyStopping, ModelCheckpoint, ProgressLogger};
use crate::config::TrainerConfig;
use crate::data::seeded_rng;
use crate::error::{EmberError, Result};
use crate::logger::{DEFAULT_LOGGER_NAME, ExperimentLogger};
use crate::metrics::Metrics;
use crate::model::Model;
use crate::persistence;

/// Drives a [`Model`] through fit, validation and test loops and dispatches
/// lifecycle hooks to callbacks.
///
/// User callbacks live in [`Trainer::callbacks`]. The checkpoint and
/// early-stopping callbacks occupy dedicated slots so the loop can act on
/// their results.
pub struct Trainer {
    pub(crate) config: TrainerConfig,
    pub(crate) state: TrainerState,
    pub(crate) callbacks: CallbackManager,
    /// Built-in observers such as the progress logger.
    pub(crate) builtins: CallbackManager,
    pub(crate) checkpoint_callback: Option<ModelCheckpoint>,
    pub(crate) early_stop_callback: Option<EarlyStopping>,
    pub(crate) logger: Option<ExperimentLogger>,
    pub(crate) rng: StdRng,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.names())
            .field("checkpoint_callback", &self.checkpoint_callback)
            .field("early_stop_callback", &self.early_stop_callback)
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

enum CheckpointChoice {
    FromConfig,
    Custom(ModelCheckpoint),
    Disabled,
}

/// Builder for [`Trainer`].
pub struct TrainerBuilder {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    early_stop: Option<EarlyStopping>,
    checkpoint: CheckpointChoice,
}

impl Default for TrainerBuilder {
    fn default() -> Self {
        Self {
            config: TrainerConfig::default(),
            callbacks: Vec::new(),
            early_stop: None,
            checkpoint: CheckpointChoice::FromConfig,
        }
    }
}

impl TrainerBuilder {
    pub fn config(mut self, config: TrainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn callback<C: Callback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn callbacks(mut self, callbacks: Vec<Box<dyn Callback>>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    pub fn early_stop_callback(mut self, early_stop: EarlyStopping) -> Self {
        self.early_stop = Some(early_stop);
        self
    }

    pub fn checkpoint_callback(mut self, checkpoint: ModelCheckpoint) -> Self {
        self.checkpoint = CheckpointChoice::Custom(checkpoint);
        self
    }

    pub fn without_checkpointing(mut self) -> Self {
        self.checkpoint = CheckpointChoice::Disabled;
        self
    }

    /// Build the trainer.
    ///
    /// A `ModelCheckpoint` or `EarlyStopping` found among the callbacks takes
    /// the matching dedicated slot. It replaces the config default and is kept
    /// by `without_checkpointing`, but passing one both ways is an error.
    pub fn build(mut self) -> Result<Trainer> {
        let listed_checkpoint = take_callback::<ModelCheckpoint>(&mut self.callbacks)?;
        let listed_early_stop = take_callback::<EarlyStopping>(&mut self.callbacks)?;

        let checkpoint = match (self.checkpoint, listed_checkpoint) {
            (CheckpointChoice::Custom(_), Some(_)) => {
                return Err(EmberError::config(
                    "ModelCheckpoint given both as checkpoint_callback and in callbacks",
                ));
            }
            (CheckpointChoice::Custom(cb), None) | (_, Some(cb)) => Some(cb),
            (CheckpointChoice::FromConfig, None) if self.config.checkpoint_callback => {
                Some(ModelCheckpoint::new(None))
            }
            (CheckpointChoice::FromConfig | CheckpointChoice::Disabled, None) => None,
        };
        let early_stop = match (self.early_stop, listed_early_stop) {
            (Some(_), Some(_)) => {
                return Err(EmberError::config(
                    "EarlyStopping given both as early_stop_callback and in callbacks",
                ));
            }
            (Some(es), None) | (None, Some(es)) => Some(es),
            (None, None) => self
                .config
                .early_stop_callback
                .then(|| EarlyStopping::default().verbose(true)),
        };
        Trainer::assemble(self.config, self.callbacks, checkpoint, early_stop)
    }
}

/// Remove the callback of type `T` from `callbacks`, if present.
fn take_callback<T: Callback>(callbacks: &mut Vec<Box<dyn Callback>>) -> Result<Option<T>> {
    let mut found = None;
    let mut rest = Vec::with_capacity(callbacks.len());
    for cb in callbacks.drain(..) {
        let callback: &dyn Callback = &*cb;
        let any: &dyn Any = callback;
        if !any.is::<T>() {
            rest.push(cb);
            continue;
        }
        let name = cb.name();
        let boxed: Box<dyn Any> = cb;
        if let Ok(typed) = boxed.downcast::<T>()
            && found.replace(*typed).is_some()
        {
            return Err(EmberError::config(format!(
                "more than one {name} in callbacks"
            )));
        }
    }
    *callbacks = rest;
    Ok(found)
}

impl Trainer {
    /// Create a trainer with the given user callbacks.
    ///
    /// Default checkpoint and early-stopping callbacks are installed as the
    /// config asks. `on_init_start` and `on_init_end` fire before this returns.
    pub fn new(config: TrainerConfig, callbacks: Vec<Box<dyn Callback>>) -> Result<Self> {
        Self::builder().config(config).callbacks(callbacks).build()
    }

    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    fn assemble(
        config: TrainerConfig,
        callbacks: Vec<Box<dyn Callback>>,
        checkpoint_callback: Option<ModelCheckpoint>,
        early_stop_callback: Option<EarlyStopping>,
    ) -> Result<Self> {
        config.validate()?;

        let default_root_dir = config.root_dir();
        let mut state = TrainerState {
            max_epochs: config.max_epochs,
            min_epochs: config.min_epochs,
            default_root_dir: default_root_dir.clone(),
            ..Default::default()
        };

        let mut manager = CallbackManager::new();
        for cb in callbacks {
            manager.add_boxed(cb);
        }
        manager.on_init_start(&state);

        let logger = if config.logger {
            let logger = ExperimentLogger::new(&default_root_dir, DEFAULT_LOGGER_NAME);
            // Claim the version directory now so concurrent trainers do not share it.
            std::fs::create_dir_all(logger.log_dir())?;
            state.log_dir = Some(logger.log_dir());
            Some(logger)
        } else {
            None
        };

        state.ckpt_path = match &logger {
            Some(logger) => logger.log_dir().join("checkpoints"),
            None => default_root_dir.join("checkpoints"),
        };

        let mut checkpoint_callback = checkpoint_callback;
        if let Some(cb) = checkpoint_callback.as_mut() {
            match cb.dirpath() {
                Some(dir) => state.ckpt_path = dir.to_path_buf(),
                None => cb.set_dirpath(state.ckpt_path.clone()),
            }
        }

        let mut builtins = CallbackManager::new();
        if config.progress_bar_refresh_rate > 0 {
            builtins.add(ProgressLogger::new(config.progress_bar_refresh_rate));
        }
        let rng = seeded_rng(config.seed);

        debug!(
            root = %default_root_dir.display(),
            ckpt_path = %state.ckpt_path.display(),
            callbacks = manager.len(),
            checkpointing = checkpoint_callback.is_some(),
            early_stopping = early_stop_callback.is_some(),
            "Trainer initialised"
        );

        manager.on_init_end(&state);

        Ok(Self {
            config,
            state,
            callbacks: manager,
            builtins,
            checkpoint_callback,
            early_stop_callback,
            logger,
            rng,
        })
    }

    /// User callbacks, in registration order.
    pub fn callbacks(&self) -> &CallbackManager {
        &self.callbacks
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn current_epoch(&self) -> usize {
        self.state.current_epoch
    }

    pub fn max_epochs(&self) -> usize {
        self.state.max_epochs
    }

    pub fn global_step(&self) -> usize {
        self.state.global_step
    }

    pub fn default_root_dir(&self) -> &Path {
        &self.state.default_root_dir
    }

    /// Directory checkpoints are written to.
    pub fn ckpt_path(&self) -> &Path {
        &self.state.ckpt_path
    }

    pub fn callback_metrics(&self) -> &Metrics {
        &self.state.callback_metrics
    }

    pub fn checkpoint_callback(&self) -> Option<&ModelCheckpoint> {
        self.checkpoint_callback.as_ref()
    }

    pub fn early_stop_callback(&self) -> Option<&EarlyStopping> {
        self.early_stop_callback.as_ref()
    }

    pub fn logger(&self) -> Option<&ExperimentLogger> {
        self.logger.as_ref()
    }

    /// Load a checkpoint into `model` and resume after its epoch.
    pub fn restore(&mut self, path: &Path, model: &mut dyn Model) -> Result<()> {
        let file = persistence::load_checkpoint(path)?;
        model.load_state_dict(file.state_dict)?;
        self.state.current_epoch = file.epoch + 1;
        self.state.global_step = file.global_step;
        self.state.callback_metrics = file.callback_metrics;
        info!(
            path = %path.display(),
            epoch = file.epoch,
            global_step = file.global_step,
            "Restored checkpoint"
        );
        Ok(())
    }

    pub(crate) fn best_model_path(&self) -> Option<PathBuf> {
        self.checkpoint_callback
            .as_ref()
            .and_then(|cb| cb.best_model_path().map(Path::to_path_buf))
    }
}
