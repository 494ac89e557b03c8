//! Callback system for trainer lifecycle events
//!
//! Provides extensible hooks for every point of the training loop:
//! - `on_init_start` / `on_init_end` during trainer construction
//! - `on_sanity_check_start` / `on_sanity_check_end`
//! - `on_train_start` / `on_train_end`
//! - `on_epoch_start` / `on_epoch_end`
//! - `on_batch_start` / `on_batch_end`
//! - `on_validation_start` / `on_validation_end` and their per-batch hooks
//! - `on_test_start` / `on_test_end` and their per-batch hooks
//!
//! # Example
//!
//! ```rust
//! use ember_core::callbacks::{Callback, CallbackAction};
//! use ember_core::{Model, TrainerState};
//!
//! struct PrintCallback;
//!
//! impl Callback for PrintCallback {
//!     fn on_epoch_end(&mut self, trainer: &TrainerState, _model: &dyn Model) -> CallbackAction {
//!         println!("Epoch {} finished", trainer.current_epoch);
//!         CallbackAction::Continue
//!     }
//! }
//! ```

mod checkpoint;
mod early_stopping;
mod manager;
mod monitor;
mod progress;
mod trace;
mod traits;

pub use checkpoint::ModelCheckpoint;
pub use early_stopping::EarlyStopping;
pub use manager::CallbackManager;
pub use monitor::MonitorMode;
pub use progress::ProgressLogger;
pub use trace::HookTrace;
pub use traits::{Callback, CallbackAction, Hook};
