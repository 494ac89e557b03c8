//! Error types for the ember-core crate.
//!
//! Uses `thiserror` for the public error enum. Misconfiguration, missing model
//! steps, monitor lookups and checkpoint I/O each get their own variant.

use std::path::PathBuf;

/// Top-level error type for trainer operations.
#[derive(Debug, thiserror::Error)]
pub enum EmberError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model does not implement `{step}`")]
    MissingStep { step: &'static str },

    #[error("No {phase} dataloader defined on the model")]
    MissingDataloader { phase: &'static str },

    #[error("Monitored metric `{monitor}` not found (available: {available})")]
    MetricNotFound { monitor: String, available: String },

    #[error("Checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EmberError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Build a `MetricNotFound` listing the keys that were present.
    pub fn metric_not_found<'a>(
        monitor: &str,
        available: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let available = available
            .into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self::MetricNotFound {
            monitor: monitor.to_string(),
            available,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EmberError>;
