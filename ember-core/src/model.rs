//! The `Model` trait driven by the trainer, plus a small reference model.
//!
//! A model owns its parameters and their update rule. The trainer only decides
//! when each step runs and which callbacks observe it.

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::callbacks::CallbackAction;
use crate::data::{Batch, DataLoader, Sample, seeded_rng};
use crate::error::{EmberError, Result};
use crate::metrics::{Metrics, StepOutput, mean_metrics};

/// A trainable entity.
///
/// Only `training_step` and `train_dataloader` are required. Validation and
/// testing are enabled by returning a dataloader for the phase and
/// implementing the matching step.
pub trait Model: Send {
    /// Compute the loss for one training batch.
    fn training_step(&mut self, batch: &Batch, batch_idx: usize) -> Result<StepOutput>;

    fn validation_step(&mut self, _batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        Err(EmberError::MissingStep {
            step: "validation_step",
        })
    }

    fn test_step(&mut self, _batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        Err(EmberError::MissingStep { step: "test_step" })
    }

    /// Reduce validation step outputs into epoch metrics.
    fn validation_epoch_end(&mut self, outputs: &[StepOutput]) -> Metrics {
        mean_metrics(outputs)
    }

    /// Reduce test step outputs into the metrics returned by `Trainer::test`.
    fn test_epoch_end(&mut self, outputs: &[StepOutput]) -> Metrics {
        mean_metrics(outputs)
    }

    fn train_dataloader(&self) -> DataLoader;

    fn val_dataloader(&self) -> Option<DataLoader> {
        None
    }

    fn test_dataloader(&self) -> Option<DataLoader> {
        None
    }

    /// Apply the update computed during the last training step.
    fn optimizer_step(&mut self, _epoch: usize, _batch_idx: usize) {}

    fn on_train_start(&mut self) {}

    fn on_train_end(&mut self) {}

    fn on_epoch_start(&mut self) {}

    fn on_epoch_end(&mut self) {}

    /// Returning `SkipEpoch` ends the current epoch before this batch runs.
    fn on_batch_start(&mut self, _batch: &Batch) -> CallbackAction {
        CallbackAction::Continue
    }

    /// Serialisable parameters for checkpointing.
    fn state_dict(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn load_state_dict(&mut self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn hparams(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn name(&self) -> &'static str {
        "Model"
    }
}

/// Hyperparameters of [`LinearRegression`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearHparams {
    pub in_features: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub num_samples: usize,
    pub seed: u64,
}

impl Default for LinearHparams {
    fn default() -> Self {
        Self {
            in_features: 1,
            learning_rate: 0.05,
            batch_size: 16,
            num_samples: 256,
            seed: 1234,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearState {
    weights: Vec<f64>,
    bias: f64,
}

/// Least-squares linear regression trained with plain SGD.
///
/// Splits its synthetic dataset 80/10/10 into train, validation and test sets.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    hparams: LinearHparams,
    state: LinearState,
    pending: Option<(Vec<f64>, f64)>,
    train: Vec<Sample>,
    val: Vec<Sample>,
    test: Vec<Sample>,
}

impl LinearRegression {
    pub fn new(hparams: LinearHparams) -> Self {
        let mut data = synthetic_dataset(hparams.num_samples, hparams.in_features, hparams.seed);
        let n_val = data.len() / 10;
        let test = data.split_off(data.len() - n_val);
        let val = data.split_off(data.len() - n_val);
        Self {
            state: LinearState {
                weights: vec![0.0; hparams.in_features],
                bias: 0.0,
            },
            hparams,
            pending: None,
            train: data,
            val,
            test,
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.state.weights
    }

    pub fn bias(&self) -> f64 {
        self.state.bias
    }

    fn predict(&self, features: &[f64]) -> f64 {
        features
            .iter()
            .zip(&self.state.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.state.bias
    }

    fn mse(&self, batch: &Batch) -> f64 {
        if batch.is_empty() {
            return 0.0;
        }
        batch
            .features
            .iter()
            .zip(&batch.targets)
            .map(|(x, y)| (self.predict(x) - y).powi(2))
            .sum::<f64>()
            / batch.len() as f64
    }
}

impl Model for LinearRegression {
    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        if batch.is_empty() {
            return Err(EmberError::model("empty training batch"));
        }
        let n = batch.len() as f64;
        let mut grad_w = vec![0.0; self.state.weights.len()];
        let mut grad_b = 0.0;
        for (x, y) in batch.features.iter().zip(&batch.targets) {
            let err = self.predict(x) - y;
            for (g, xi) in grad_w.iter_mut().zip(x) {
                *g += 2.0 * err * xi / n;
            }
            grad_b += 2.0 * err / n;
        }
        self.pending = Some((grad_w, grad_b));

        let loss = self.mse(batch);
        Ok(StepOutput::with_loss(loss)
            .log_metric("train_loss", loss)
            .progress_metric("loss", loss))
    }

    fn validation_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        Ok(StepOutput::default().metric("val_loss", self.mse(batch)))
    }

    fn test_step(&mut self, batch: &Batch, _batch_idx: usize) -> Result<StepOutput> {
        Ok(StepOutput::default().metric("test_loss", self.mse(batch)))
    }

    fn train_dataloader(&self) -> DataLoader {
        DataLoader::new(self.train.clone(), self.hparams.batch_size).shuffled()
    }

    fn val_dataloader(&self) -> Option<DataLoader> {
        Some(DataLoader::new(self.val.clone(), self.hparams.batch_size))
    }

    fn test_dataloader(&self) -> Option<DataLoader> {
        Some(DataLoader::new(self.test.clone(), self.hparams.batch_size))
    }

    fn optimizer_step(&mut self, _epoch: usize, _batch_idx: usize) {
        if let Some((grad_w, grad_b)) = self.pending.take() {
            let lr = self.hparams.learning_rate;
            for (w, g) in self.state.weights.iter_mut().zip(grad_w) {
                *w -= lr * g;
            }
            self.state.bias -= lr * grad_b;
        }
    }

    fn state_dict(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> Result<()> {
        let state: LinearState = serde_json::from_value(state)?;
        if state.weights.len() != self.hparams.in_features {
            return Err(EmberError::model(format!(
                "checkpoint has {} weights, model expects {}",
                state.weights.len(),
                self.hparams.in_features
            )));
        }
        self.state = state;
        Ok(())
    }

    fn hparams(&self) -> serde_json::Value {
        serde_json::to_value(&self.hparams).unwrap_or(serde_json::Value::Null)
    }

    fn name(&self) -> &'static str {
        "LinearRegression"
    }
}

/// Noisy samples of `y = 2·sum(x) + 1` with features in `[-1, 1)`.
pub fn synthetic_dataset(n: usize, in_features: usize, seed: u64) -> Vec<Sample> {
    let mut rng: StdRng = seeded_rng(Some(seed));
    (0..n)
        .map(|_| {
            let features: Vec<f64> = (0..in_features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let noise: f64 = rng.gen_range(-0.05..0.05);
            let target = 2.0 * features.iter().sum::<f64>() + 1.0 + noise;
            Sample::new(features, target)
        })
        .collect()
}
