//! A callback that records the order in which hooks fire.

use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{Callback, CallbackAction, Hook};
use crate::model::Model;
use crate::trainer::TrainerState;

/// Appends every hook it receives to a shared log.
///
/// Clone the handle from [`HookTrace::log`] before handing the callback to a
/// trainer; the trainer owns the callback, the handle stays readable.
#[derive(Clone, Debug, Default)]
pub struct HookTrace {
    log: Arc<Mutex<Vec<Hook>>>,
}

impl HookTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<Vec<Hook>>> {
        Arc::clone(&self.log)
    }

    /// Recorded hooks so far.
    pub fn hooks(&self) -> Vec<Hook> {
        self.lock().clone()
    }

    pub fn count(&self, hook: Hook) -> usize {
        self.lock().iter().filter(|h| **h == hook).count()
    }

    pub fn contains(&self, hook: Hook) -> bool {
        self.lock().contains(&hook)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Hook>> {
        // A poisoned log still holds every hook recorded before the panic.
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, hook: Hook) {
        self.lock().push(hook);
    }
}

impl Callback for HookTrace {
    fn on_init_start(&mut self, _: &TrainerState) {
        self.record(Hook::InitStart);
    }

    fn on_init_end(&mut self, _: &TrainerState) {
        self.record(Hook::InitEnd);
    }

    fn on_sanity_check_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::SanityCheckStart);
    }

    fn on_sanity_check_end(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::SanityCheckEnd);
    }

    fn on_train_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TrainStart);
    }

    fn on_train_end(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TrainEnd);
    }

    fn on_epoch_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::EpochStart);
    }

    fn on_epoch_end(&mut self, _: &TrainerState, _: &dyn Model) -> CallbackAction {
        self.record(Hook::EpochEnd);
        CallbackAction::Continue
    }

    fn on_batch_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::BatchStart);
    }

    fn on_batch_end(&mut self, _: &TrainerState, _: &dyn Model) -> CallbackAction {
        self.record(Hook::BatchEnd);
        CallbackAction::Continue
    }

    fn on_validation_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::ValidationStart);
    }

    fn on_validation_end(&mut self, _: &TrainerState, _: &dyn Model) -> CallbackAction {
        self.record(Hook::ValidationEnd);
        CallbackAction::Continue
    }

    fn on_validation_batch_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::ValidationBatchStart);
    }

    fn on_validation_batch_end(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::ValidationBatchEnd);
    }

    fn on_test_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TestStart);
    }

    fn on_test_end(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TestEnd);
    }

    fn on_test_batch_start(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TestBatchStart);
    }

    fn on_test_batch_end(&mut self, _: &TrainerState, _: &dyn Model) {
        self.record(Hook::TestBatchEnd);
    }

    fn name(&self) -> &'static str {
        "HookTrace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_log() {
        let mut trace = HookTrace::new();
        let observer = trace.clone();
        trace.on_init_start(&TrainerState::default());
        trace.on_init_end(&TrainerState::default());
        assert_eq!(observer.hooks(), vec![Hook::InitStart, Hook::InitEnd]);
        assert_eq!(observer.count(Hook::InitEnd), 1);
        assert!(!observer.contains(Hook::TestStart));
    }
}
