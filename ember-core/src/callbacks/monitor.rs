//! Shared comparison rules for callbacks that monitor a metric.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EmberError;

/// Whether a monitored metric should go down or up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
    /// `Max` for accuracy-like names, `Min` otherwise.
    #[default]
    Auto,
}

impl MonitorMode {
    /// Resolve `Auto` against the monitored key.
    pub fn resolve(self, monitor: &str) -> MonitorMode {
        match self {
            MonitorMode::Auto if monitor.contains("acc") || monitor.starts_with("fmeasure") => {
                MonitorMode::Max
            }
            MonitorMode::Auto => MonitorMode::Min,
            other => other,
        }
    }

    /// Starting "best" value that any finite metric improves on.
    pub fn initial_best(self) -> f64 {
        match self {
            MonitorMode::Max => f64::NEG_INFINITY,
            _ => f64::INFINITY,
        }
    }

    /// `current` beats `best` by more than `min_delta`. Expects a resolved mode.
    pub fn improves(self, current: f64, best: f64, min_delta: f64) -> bool {
        let delta = min_delta.abs();
        match self {
            MonitorMode::Max => current - delta > best,
            _ => current + delta < best,
        }
    }
}

impl FromStr for MonitorMode {
    type Err = EmberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(MonitorMode::Min),
            "max" => Ok(MonitorMode::Max),
            "auto" => Ok(MonitorMode::Auto),
            other => Err(EmberError::config(format!(
                "unknown monitor mode `{other}`, expected min, max or auto"
            ))),
        }
    }
}
