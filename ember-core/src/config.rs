//! Configuration system for Ember.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> environment -> explicit overrides. Configuration is loaded from
//! `~/.config/ember/config.toml` and/or `.ember/config.toml` in the workspace.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EmberError, Result};

/// Options controlling a [`Trainer`](crate::trainer::Trainer) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Stop training once this many epochs have run.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Early stopping is ignored until this many epochs have run.
    #[serde(default = "default_min_epochs")]
    pub min_epochs: usize,
    /// Optional cap on optimizer steps across all epochs.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Fraction of training batches used each epoch.
    #[serde(default = "default_percent")]
    pub train_percent_check: f64,
    /// Fraction of validation batches used per validation run.
    #[serde(default = "default_percent")]
    pub val_percent_check: f64,
    /// Fraction of test batches used by `test`.
    #[serde(default = "default_percent")]
    pub test_percent_check: f64,
    /// When positive, replaces all three percent checks.
    #[serde(default)]
    pub overfit_pct: f64,
    /// Validation batches run before the first epoch.
    #[serde(default = "default_sanity_steps")]
    pub num_sanity_val_steps: usize,
    /// Run validation every N epochs.
    #[serde(default = "default_one")]
    pub check_val_every_n_epoch: usize,
    /// Batches between progress lines (0 disables progress output).
    #[serde(default = "default_one")]
    pub progress_bar_refresh_rate: usize,
    /// Steps between experiment logger rows.
    #[serde(default = "default_row_log_interval")]
    pub row_log_interval: usize,
    /// Root for logs and checkpoints (current directory when unset).
    #[serde(default)]
    pub default_root_dir: Option<PathBuf>,
    /// Write metrics and hyperparameters through the experiment logger.
    #[serde(default = "default_true")]
    pub logger: bool,
    /// Install a default `ModelCheckpoint`.
    #[serde(default = "default_true")]
    pub checkpoint_callback: bool,
    /// Install a default `EarlyStopping` monitoring `val_loss`.
    #[serde(default)]
    pub early_stop_callback: bool,
    /// Seed for shuffling and model initialisation.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            min_epochs: default_min_epochs(),
            max_steps: None,
            train_percent_check: default_percent(),
            val_percent_check: default_percent(),
            test_percent_check: default_percent(),
            overfit_pct: 0.0,
            num_sanity_val_steps: default_sanity_steps(),
            check_val_every_n_epoch: default_one(),
            progress_bar_refresh_rate: default_one(),
            row_log_interval: default_row_log_interval(),
            default_root_dir: None,
            logger: true,
            checkpoint_callback: true,
            early_stop_callback: false,
            seed: None,
        }
    }
}

fn default_max_epochs() -> usize {
    1000
}

fn default_min_epochs() -> usize {
    1
}

fn default_percent() -> f64 {
    1.0
}

fn default_sanity_steps() -> usize {
    5
}

fn default_one() -> usize {
    1
}

fn default_row_log_interval() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl TrainerConfig {
    /// Reject values the training loop cannot honour.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("train_percent_check", self.train_percent_check),
            ("val_percent_check", self.val_percent_check),
            ("test_percent_check", self.test_percent_check),
            ("overfit_pct", self.overfit_pct),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EmberError::config(format!(
                    "`{name}` must be in the range [0.0, 1.0], got {value}"
                )));
            }
        }
        if self.check_val_every_n_epoch == 0 {
            return Err(EmberError::config(
                "`check_val_every_n_epoch` must be at least 1",
            ));
        }
        if self.max_epochs == 0 {
            return Err(EmberError::config("`max_epochs` must be at least 1"));
        }
        if self.min_epochs > self.max_epochs {
            return Err(EmberError::config(format!(
                "`min_epochs` ({}) must not exceed `max_epochs` ({})",
                self.min_epochs, self.max_epochs
            )));
        }
        if self.row_log_interval == 0 {
            return Err(EmberError::config("`row_log_interval` must be at least 1"));
        }
        Ok(())
    }

    /// Percent checks after applying `overfit_pct`: (train, val, test).
    pub fn effective_percents(&self) -> (f64, f64, f64) {
        if self.overfit_pct > 0.0 {
            (self.overfit_pct, self.overfit_pct, self.overfit_pct)
        } else {
            (
                self.train_percent_check,
                self.val_percent_check,
                self.test_percent_check,
            )
        }
    }

    /// Root directory for logs and checkpoints.
    pub fn root_dir(&self) -> PathBuf {
        self.default_root_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_root_dir = Some(dir.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Values that replace individual [`TrainerConfig`] fields.
///
/// Only the fields that are set take part in layering, so everything else
/// still comes from the files and environment below.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_root_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_callback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop_callback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_bar_refresh_rate: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ConfigOverrides {
    /// Write the set fields into `config`.
    pub fn apply(&self, mut config: TrainerConfig) -> TrainerConfig {
        if let Some(v) = self.max_epochs {
            config.max_epochs = v;
        }
        if let Some(v) = self.min_epochs {
            config.min_epochs = v;
        }
        if let Some(v) = self.max_steps {
            config.max_steps = Some(v);
        }
        if let Some(v) = &self.default_root_dir {
            config.default_root_dir = Some(v.clone());
        }
        if let Some(v) = self.logger {
            config.logger = v;
        }
        if let Some(v) = self.checkpoint_callback {
            config.checkpoint_callback = v;
        }
        if let Some(v) = self.early_stop_callback {
            config.early_stop_callback = v;
        }
        if let Some(v) = self.progress_bar_refresh_rate {
            config.progress_bar_refresh_rate = v;
        }
        if let Some(v) = self.seed {
            config.seed = Some(v);
        }
        config
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `EMBER_`)
/// 3. Workspace-local config (`.ember/config.toml`)
/// 4. User config (`~/.config/ember/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> std::result::Result<TrainerConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TrainerConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "ember", "ember") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ember").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // EMBER_MAX_EPOCHS, EMBER_DEFAULT_ROOT_DIR, ...
    figment = figment.merge(Env::prefixed("EMBER_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load configuration from an explicit TOML file, skipping the user and workspace layers.
pub fn load_config_file(path: &Path) -> std::result::Result<TrainerConfig, Box<figment::Error>> {
    Figment::from(Serialized::defaults(TrainerConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("EMBER_").split("__"))
        .extract()
        .map_err(Box::new)
}
