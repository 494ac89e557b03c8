//! Callback manager for dispatching lifecycle events to registered callbacks

use tracing::trace;

use super::traits::{Callback, CallbackAction, Hook};
use crate::model::Model;
use crate::trainer::TrainerState;

/// Ordered list of callbacks. Every callback sees every event in registration order.
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn add<C: Callback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn add_boxed(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Callback> {
        self.callbacks.get(index).map(|cb| &**cb)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|cb| cb.name()).collect()
    }

    fn each(&mut self, hook: Hook, mut f: impl FnMut(&mut dyn Callback)) {
        for cb in &mut self.callbacks {
            trace!(hook = hook.as_str(), callback = cb.name(), "Dispatching hook");
            f(cb.as_mut());
        }
    }

    fn fold(
        &mut self,
        hook: Hook,
        mut f: impl FnMut(&mut dyn Callback) -> CallbackAction,
    ) -> CallbackAction {
        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            trace!(hook = hook.as_str(), callback = cb.name(), "Dispatching hook");
            let requested = f(cb.as_mut());
            if requested != CallbackAction::Continue {
                trace!(
                    hook = hook.as_str(),
                    callback = cb.name(),
                    action = ?requested,
                    "Callback requested action"
                );
            }
            action = action.merge(requested);
        }
        action
    }

    /// Dispatch `hook` to every callback. Hooks without a return value yield `Continue`.
    pub fn dispatch(&mut self, hook: Hook, trainer: &TrainerState, model: &dyn Model) -> CallbackAction {
        match hook {
            Hook::InitStart => self.on_init_start(trainer),
            Hook::InitEnd => self.on_init_end(trainer),
            Hook::SanityCheckStart => self.on_sanity_check_start(trainer, model),
            Hook::SanityCheckEnd => self.on_sanity_check_end(trainer, model),
            Hook::TrainStart => self.on_train_start(trainer, model),
            Hook::TrainEnd => self.on_train_end(trainer, model),
            Hook::EpochStart => self.on_epoch_start(trainer, model),
            Hook::EpochEnd => return self.on_epoch_end(trainer, model),
            Hook::BatchStart => self.on_batch_start(trainer, model),
            Hook::BatchEnd => return self.on_batch_end(trainer, model),
            Hook::ValidationStart => self.on_validation_start(trainer, model),
            Hook::ValidationEnd => return self.on_validation_end(trainer, model),
            Hook::ValidationBatchStart => self.on_validation_batch_start(trainer, model),
            Hook::ValidationBatchEnd => self.on_validation_batch_end(trainer, model),
            Hook::TestStart => self.on_test_start(trainer, model),
            Hook::TestEnd => self.on_test_end(trainer, model),
            Hook::TestBatchStart => self.on_test_batch_start(trainer, model),
            Hook::TestBatchEnd => self.on_test_batch_end(trainer, model),
        }
        CallbackAction::Continue
    }

    pub fn on_init_start(&mut self, trainer: &TrainerState) {
        self.each(Hook::InitStart, |cb| cb.on_init_start(trainer));
    }

    pub fn on_init_end(&mut self, trainer: &TrainerState) {
        self.each(Hook::InitEnd, |cb| cb.on_init_end(trainer));
    }

    pub fn on_sanity_check_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::SanityCheckStart, |cb| {
            cb.on_sanity_check_start(trainer, model)
        });
    }

    pub fn on_sanity_check_end(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::SanityCheckEnd, |cb| {
            cb.on_sanity_check_end(trainer, model)
        });
    }

    pub fn on_train_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TrainStart, |cb| cb.on_train_start(trainer, model));
    }

    pub fn on_train_end(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TrainEnd, |cb| cb.on_train_end(trainer, model));
    }

    pub fn on_epoch_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::EpochStart, |cb| cb.on_epoch_start(trainer, model));
    }

    pub fn on_epoch_end(&mut self, trainer: &TrainerState, model: &dyn Model) -> CallbackAction {
        self.fold(Hook::EpochEnd, |cb| cb.on_epoch_end(trainer, model))
    }

    pub fn on_batch_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::BatchStart, |cb| cb.on_batch_start(trainer, model));
    }

    pub fn on_batch_end(&mut self, trainer: &TrainerState, model: &dyn Model) -> CallbackAction {
        self.fold(Hook::BatchEnd, |cb| cb.on_batch_end(trainer, model))
    }

    pub fn on_validation_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::ValidationStart, |cb| {
            cb.on_validation_start(trainer, model)
        });
    }

    pub fn on_validation_end(
        &mut self,
        trainer: &TrainerState,
        model: &dyn Model,
    ) -> CallbackAction {
        self.fold(Hook::ValidationEnd, |cb| cb.on_validation_end(trainer, model))
    }

    pub fn on_validation_batch_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::ValidationBatchStart, |cb| {
            cb.on_validation_batch_start(trainer, model)
        });
    }

    pub fn on_validation_batch_end(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::ValidationBatchEnd, |cb| {
            cb.on_validation_batch_end(trainer, model)
        });
    }

    pub fn on_test_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TestStart, |cb| cb.on_test_start(trainer, model));
    }

    pub fn on_test_end(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TestEnd, |cb| cb.on_test_end(trainer, model));
    }

    pub fn on_test_batch_start(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TestBatchStart, |cb| {
            cb.on_test_batch_start(trainer, model)
        });
    }

    pub fn on_test_batch_end(&mut self, trainer: &TrainerState, model: &dyn Model) {
        self.each(Hook::TestBatchEnd, |cb| cb.on_test_batch_end(trainer, model));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Batch, DataLoader, Sample};
    use crate::error::Result;
    use crate::metrics::StepOutput;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct NullModel;
    impl Model for NullModel {
        fn training_step(&mut self, _: &Batch, _: usize) -> Result<StepOutput> {
            Ok(StepOutput::default())
        }
        fn train_dataloader(&self) -> DataLoader {
            DataLoader::new(Vec::<Sample>::new(), 1)
        }
    }

    struct StopOnEpochEnd {
        calls: Arc<AtomicUsize>,
    }
    impl Callback for StopOnEpochEnd {
        fn on_epoch_end(&mut self, _: &TrainerState, _: &dyn Model) -> CallbackAction {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CallbackAction::Stop
        }
        fn name(&self) -> &'static str {
            "StopOnEpochEnd"
        }
    }

    struct CountingCallback {
        calls: Arc<AtomicUsize>,
    }
    impl Callback for CountingCallback {
        fn on_epoch_end(&mut self, _: &TrainerState, _: &dyn Model) -> CallbackAction {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CallbackAction::Continue
        }
        fn on_train_end(&mut self, _: &TrainerState, _: &dyn Model) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &'static str {
            "CountingCallback"
        }
    }

    #[test]
    fn test_manager_len_and_empty() {
        let mut manager = CallbackManager::new();
        assert!(manager.is_empty());
        manager.add(CountingCallback {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.names(), vec!["CountingCallback"]);
        assert_eq!(manager.get(0).map(|cb| cb.name()), Some("CountingCallback"));
        assert!(manager.get(1).is_none());
    }

    #[test]
    fn test_stop_does_not_short_circuit_later_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = CallbackManager::new();
        manager.add(StopOnEpochEnd {
            calls: calls.clone(),
        });
        manager.add(CountingCallback {
            calls: calls.clone(),
        });

        let state = TrainerState::default();
        let action = manager.on_epoch_end(&state, &NullModel);
        assert_eq!(action, CallbackAction::Stop);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_train_end_reaches_all_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = CallbackManager::new();
        for _ in 0..3 {
            manager.add(CountingCallback {
                calls: calls.clone(),
            });
        }
        manager.on_train_end(&TrainerState::default(), &NullModel);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dispatch_routes_by_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut manager = CallbackManager::new();
        manager.add(StopOnEpochEnd {
            calls: calls.clone(),
        });
        let state = TrainerState::default();
        assert_eq!(
            manager.dispatch(Hook::EpochStart, &state, &NullModel),
            CallbackAction::Continue
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            manager.dispatch(Hook::EpochEnd, &state, &NullModel),
            CallbackAction::Stop
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_continue_folds_to_continue() {
        let mut manager = CallbackManager::new();
        manager.add(CountingCallback {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let state = TrainerState::default();
        assert_eq!(
            manager.on_validation_end(&state, &NullModel),
            CallbackAction::Continue
        );
        assert_eq!(
            manager.on_batch_end(&state, &NullModel),
            CallbackAction::Continue
        );
    }
}
