//! Core traits and types for the callback system
//!
//! - `Hook` - every lifecycle point the trainer announces
//! - `CallbackAction` - what a callback asks the trainer to do next
//! - `Callback` - the trait all callbacks implement

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::model::Model;
use crate::trainer::TrainerState;

/// Lifecycle points at which the trainer invokes callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    InitStart,
    InitEnd,
    SanityCheckStart,
    SanityCheckEnd,
    TrainStart,
    TrainEnd,
    EpochStart,
    EpochEnd,
    BatchStart,
    BatchEnd,
    ValidationStart,
    ValidationEnd,
    ValidationBatchStart,
    ValidationBatchEnd,
    TestStart,
    TestEnd,
    TestBatchStart,
    TestBatchEnd,
}

impl Hook {
    pub const ALL: [Hook; 18] = [
        Hook::InitStart,
        Hook::InitEnd,
        Hook::SanityCheckStart,
        Hook::SanityCheckEnd,
        Hook::TrainStart,
        Hook::TrainEnd,
        Hook::EpochStart,
        Hook::EpochEnd,
        Hook::BatchStart,
        Hook::BatchEnd,
        Hook::ValidationStart,
        Hook::ValidationEnd,
        Hook::ValidationBatchStart,
        Hook::ValidationBatchEnd,
        Hook::TestStart,
        Hook::TestEnd,
        Hook::TestBatchStart,
        Hook::TestBatchEnd,
    ];

    /// The callback method name for this hook.
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::InitStart => "on_init_start",
            Hook::InitEnd => "on_init_end",
            Hook::SanityCheckStart => "on_sanity_check_start",
            Hook::SanityCheckEnd => "on_sanity_check_end",
            Hook::TrainStart => "on_train_start",
            Hook::TrainEnd => "on_train_end",
            Hook::EpochStart => "on_epoch_start",
            Hook::EpochEnd => "on_epoch_end",
            Hook::BatchStart => "on_batch_start",
            Hook::BatchEnd => "on_batch_end",
            Hook::ValidationStart => "on_validation_start",
            Hook::ValidationEnd => "on_validation_end",
            Hook::ValidationBatchStart => "on_validation_batch_start",
            Hook::ValidationBatchEnd => "on_validation_batch_end",
            Hook::TestStart => "on_test_start",
            Hook::TestEnd => "on_test_end",
            Hook::TestBatchStart => "on_test_batch_start",
            Hook::TestBatchEnd => "on_test_batch_end",
        }
    }

    pub fn is_test_phase(&self) -> bool {
        matches!(
            self,
            Hook::TestStart | Hook::TestEnd | Hook::TestBatchStart | Hook::TestBatchEnd
        )
    }

    pub fn is_validation_phase(&self) -> bool {
        matches!(
            self,
            Hook::ValidationStart
                | Hook::ValidationEnd
                | Hook::ValidationBatchStart
                | Hook::ValidationBatchEnd
        )
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action to take after a callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Continue training normally
    Continue,
    /// Stop training once the current epoch finishes
    Stop,
    /// Skip rest of current epoch
    SkipEpoch,
}

impl CallbackAction {
    /// Combine two actions; `Stop` outranks `SkipEpoch`, which outranks `Continue`.
    pub fn merge(self, other: CallbackAction) -> CallbackAction {
        match (self, other) {
            (CallbackAction::Stop, _) | (_, CallbackAction::Stop) => CallbackAction::Stop,
            (CallbackAction::SkipEpoch, _) | (_, CallbackAction::SkipEpoch) => {
                CallbackAction::SkipEpoch
            }
            _ => CallbackAction::Continue,
        }
    }
}

/// Trait for trainer callbacks
///
/// Implement this trait to hook into the trainer lifecycle. All methods have
/// default no-op implementations, so you only need to implement the
/// events you care about. Hooks receive the trainer's state read-only and,
/// outside of construction, the model being trained.
///
/// [`EarlyStopping`](super::EarlyStopping) and
/// [`ModelCheckpoint`](super::ModelCheckpoint) may also be registered here.
/// The trainer moves them into its dedicated slots at construction.
pub trait Callback: Any + Send {
    /// Called when trainer construction begins.
    fn on_init_start(&mut self, _trainer: &TrainerState) {}

    /// Called when trainer construction is complete.
    fn on_init_end(&mut self, _trainer: &TrainerState) {}

    fn on_sanity_check_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_sanity_check_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    /// Called once before the first epoch of `fit`.
    fn on_train_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    /// Called once after the last epoch of `fit`, including early-stopped runs.
    fn on_train_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_epoch_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_epoch_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_batch_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_batch_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_validation_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_validation_end(
        &mut self,
        _trainer: &TrainerState,
        _model: &dyn Model,
    ) -> CallbackAction {
        CallbackAction::Continue
    }

    fn on_validation_batch_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_validation_batch_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_test_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_test_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_test_batch_start(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    fn on_test_batch_end(&mut self, _trainer: &TrainerState, _model: &dyn Model) {}

    /// Get callback name for logging
    fn name(&self) -> &'static str {
        "Callback"
    }
}
