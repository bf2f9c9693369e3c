//! Training metrics tracking.

use serde::{Deserialize, Serialize};

/// Loss history and best epoch of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_steps: u64,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, loss: f64, steps: u64) {
        self.loss_history.push(loss);
        self.epochs_completed += 1;
        self.total_steps += steps;

        if loss.is_finite() && self.best_loss.is_none_or(|best| loss < best) {
            self.best_loss = Some(loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }
}
