//! Epoch-end callbacks: early stopping, anomaly detection, checkpointing.

use crate::training::metrics::TrainingMetrics;
use serde::{Deserialize, Serialize};

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop(String),
    Checkpoint,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send {
    /// Called at the end of each epoch, after `metrics` has recorded it.
    fn on_epoch_end(&mut self, epoch: usize, metrics: &TrainingMetrics) -> CallbackAction;
}

/// Stops when the loss has not improved by `min_delta` for `patience` epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    counter: usize,
    #[serde(skip)]
    best_loss: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
        }
    }

    pub fn observe(&mut self, loss: f64) -> CallbackAction {
        match self.best_loss {
            None => {
                self.best_loss = Some(loss);
                CallbackAction::Continue
            }
            Some(best) if loss < best - self.min_delta => {
                self.best_loss = Some(loss);
                self.counter = 0;
                CallbackAction::Continue
            }
            Some(_) => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop(format!("no improvement for {} epochs", self.counter))
                } else {
                    CallbackAction::Continue
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    fn on_epoch_end(&mut self, _epoch: usize, metrics: &TrainingMetrics) -> CallbackAction {
        self.observe(metrics.last_loss().unwrap_or(f64::MAX))
    }
}

/// Stops on a non-finite loss or a loss spike over a moving window.
#[derive(Debug, Clone)]
pub struct AnomalyDetectionCallback {
    /// A loss above `threshold * window mean` is a spike.
    pub threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl AnomalyDetectionCallback {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window: Vec::new(),
            window_size,
        }
    }

    pub fn observe(&mut self, loss: f64) -> CallbackAction {
        if !loss.is_finite() {
            return CallbackAction::Stop(format!("non-finite loss {loss}"));
        }

        self.window.push(loss);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }

        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if mean > 0.0 && loss > mean * self.threshold {
                return CallbackAction::Stop(format!("loss spike {loss:.4} over window mean {mean:.4}"));
            }
        }

        CallbackAction::Continue
    }
}

impl TrainingCallback for AnomalyDetectionCallback {
    fn on_epoch_end(&mut self, _epoch: usize, metrics: &TrainingMetrics) -> CallbackAction {
        self.observe(metrics.last_loss().unwrap_or(0.0))
    }
}

/// Requests a checkpoint every `frequency` epochs.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    pub frequency: usize,
}

impl CheckpointCallback {
    pub fn new(frequency: usize) -> Self {
        Self {
            frequency: frequency.max(1),
        }
    }
}

impl TrainingCallback for CheckpointCallback {
    fn on_epoch_end(&mut self, epoch: usize, _metrics: &TrainingMetrics) -> CallbackAction {
        if epoch % self.frequency == 0 {
            CallbackAction::Checkpoint
        } else {
            CallbackAction::Continue
        }
    }
}
