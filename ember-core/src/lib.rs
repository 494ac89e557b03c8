//! # ember-core: training loop with lifecycle callbacks
//!
//! This crate provides the [`Trainer`] that drives a [`Model`] through
//! fitting, validation and testing, and the callback system observing it:
//!
//! - **Callbacks**: every lifecycle hook, dispatched in registration order
//! - **Early stopping**: stop when a monitored metric stops improving
//! - **Checkpointing**: keep the best `k` checkpoints by a monitored metric
//! - **Experiment logging**: versioned hyperparameter and metric files

// Foundation
pub mod config;
pub mod error;

// Data and models
pub mod data;
pub mod metrics;
pub mod model;

// Training loop
pub mod callbacks;
pub mod trainer;

// Output
pub mod logger;
pub mod persistence;

// Re-exports
pub use callbacks::{Callback, CallbackAction, EarlyStopping, Hook, ModelCheckpoint};
pub use config::{ConfigOverrides, TrainerConfig, load_config};
pub use error::{EmberError, Result};
pub use metrics::{Metrics, StepOutput};
pub use model::Model;
pub use trainer::{FitResult, Trainer, TrainerBuilder, TrainerState};
