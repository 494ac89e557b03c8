//! Step outputs, metric maps and per-epoch history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named scalar metrics, ordered by key.
pub type Metrics = BTreeMap<String, f64>;

/// What a model step hands back to the trainer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Loss for this step, exposed to callbacks as `"loss"`.
    pub loss: Option<f64>,
    /// Values written through the experiment logger.
    #[serde(default)]
    pub log: Metrics,
    /// Values shown in progress output.
    #[serde(default)]
    pub progress_bar: Metrics,
    /// Any other values, visible to callbacks only.
    #[serde(default)]
    pub extra: Metrics,
}

impl StepOutput {
    pub fn with_loss(loss: f64) -> Self {
        Self {
            loss: Some(loss),
            ..Default::default()
        }
    }

    pub fn metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn log_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.log.insert(key.into(), value);
        self
    }

    pub fn progress_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.progress_bar.insert(key.into(), value);
        self
    }

    /// Everything a monitoring callback may look up.
    ///
    /// Later sources override earlier ones: extra, loss, progress bar, log.
    pub fn callback_metrics(&self) -> Metrics {
        let mut merged = self.extra.clone();
        if let Some(loss) = self.loss {
            merged.insert("loss".to_string(), loss);
        }
        merged.extend(self.progress_bar.iter().map(|(k, v)| (k.clone(), *v)));
        merged.extend(self.log.iter().map(|(k, v)| (k.clone(), *v)));
        merged
    }
}

/// Average every metric key across a set of step outputs.
///
/// Keys missing from some outputs are averaged over the outputs that carry them.
pub fn mean_metrics(outputs: &[StepOutput]) -> Metrics {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for output in outputs {
        for (key, value) in output.callback_metrics() {
            let entry = sums.entry(key).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(key, (sum, count))| (key, sum / count as f64))
        .collect()
}

/// Per-epoch record of what the trainer observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_history: Vec<Metrics>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
}

impl MetricsHistory {
    /// Record a finished epoch. The best epoch tracks `val_loss` when present.
    pub fn record_epoch(&mut self, epoch: usize, loss: f64, val_metrics: Option<&Metrics>) {
        self.loss_history.push(loss);
        let check_loss = match val_metrics {
            Some(metrics) => {
                self.val_history.push(metrics.clone());
                metrics.get("val_loss").copied().unwrap_or(loss)
            }
            None => loss,
        };
        self.epochs_completed += 1;

        if self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(epoch);
        }
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_metrics_merge_order() {
        let output = StepOutput::with_loss(0.5)
            .metric("my_metric", 1.0)
            .metric("loss", 9.0)
            .progress_metric("acc", 0.1)
            .log_metric("acc", 0.2);
        let merged = output.callback_metrics();
        assert_eq!(merged["loss"], 0.5);
        assert_eq!(merged["my_metric"], 1.0);
        assert_eq!(merged["acc"], 0.2);
    }

    #[test]
    fn test_mean_metrics_handles_sparse_keys() {
        let outputs = vec![
            StepOutput::with_loss(1.0).metric("a", 2.0),
            StepOutput::with_loss(3.0),
        ];
        let mean = mean_metrics(&outputs);
        assert_eq!(mean["loss"], 2.0);
        assert_eq!(mean["a"], 2.0);
    }

    #[test]
    fn test_mean_metrics_empty() {
        assert!(mean_metrics(&[]).is_empty());
    }

    #[test]
    fn test_history_tracks_best_val_loss() {
        let mut history = MetricsHistory::default();
        let mut val = Metrics::new();
        val.insert("val_loss".into(), 0.6);
        history.record_epoch(0, 0.5, Some(&val));
        val.insert("val_loss".into(), 0.4);
        history.record_epoch(1, 0.3, Some(&val));
        assert_eq!(history.epochs_completed, 2);
        assert_eq!(history.best_epoch, Some(1));
        assert_eq!(history.best_loss, Some(0.4));
        assert_eq!(history.last_loss(), Some(0.3));
    }

    #[test]
    fn test_history_without_validation_uses_train_loss() {
        let mut history = MetricsHistory::default();
        history.record_epoch(0, 0.9, None);
        history.record_epoch(1, 1.2, None);
        assert_eq!(history.best_epoch, Some(0));
        assert!(history.val_history.is_empty());
    }
}
