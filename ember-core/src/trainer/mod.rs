//! Trainer: owns the loop, the lifecycle state and the callbacks that observe it.
//!
//! `fit` runs the sanity check, the training epochs with their validation
//! passes, and the checkpoint and early-stopping callbacks. `test` and
//! `validate` run a single evaluation pass.

mod core;
mod evaluate;
mod fit;
mod result;
mod state;

pub use self::core::{Trainer, TrainerBuilder};
pub use result::FitResult;
pub use state::TrainerState;
