//! Fine-tuning: hyperparameters, callbacks, checkpoints and the driver.

pub mod callbacks;
pub mod checkpoint;
pub mod driver;
pub mod metrics;
pub mod reproducibility;

pub use callbacks::{
    AnomalyDetectionCallback, CallbackAction, CheckpointCallback, EarlyStoppingCallback,
    TrainingCallback,
};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use driver::{DatasetSummary, FineTuneDriver, RunManifest, TrainingRun, TrainingStatus};
pub use metrics::TrainingMetrics;
pub use reproducibility::{EnvironmentSnapshot, SeedManager};

use crate::config::{ModelConfig, TrainingConfig};
use crate::format::ModelFamily;
use serde::{Deserialize, Serialize};

/// Hyperparameters handed to a backend for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub warmup_steps: u64,
    pub weight_decay: f64,
    pub gradient_accumulation_steps: usize,
    pub max_length: usize,
    pub label_smoothing: f64,
    pub seed: u64,
}

impl Hyperparameters {
    /// Family defaults, overridden by the global training section, then by the
    /// family's own section.
    pub fn resolve(training: &TrainingConfig, model: &ModelConfig, family: ModelFamily) -> Self {
        Self {
            epochs: training.epochs,
            batch_size: training.batch_size,
            learning_rate: model
                .learning_rate
                .or(training.learning_rate)
                .unwrap_or_else(|| family.default_learning_rate()),
            warmup_steps: training.warmup_steps,
            weight_decay: training.weight_decay,
            gradient_accumulation_steps: training.gradient_accumulation_steps,
            max_length: training.max_length,
            label_smoothing: model
                .label_smoothing
                .unwrap_or_else(|| family.default_label_smoothing()),
            seed: training.seed,
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1) * self.gradient_accumulation_steps.max(1)
    }

    /// Optimizer steps per epoch over `examples` pairs.
    pub fn steps_per_epoch(&self, examples: usize) -> u64 {
        examples.div_ceil(self.effective_batch_size()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_learning_rate_precedence() {
        let training = TrainingConfig::default();
        let model = ModelConfig::default();
        assert_eq!(Hyperparameters::resolve(&training, &model, ModelFamily::KoBart).learning_rate, 5e-5);
        assert_eq!(Hyperparameters::resolve(&training, &model, ModelFamily::FlanT5).learning_rate, 3e-4);

        let training = TrainingConfig {
            learning_rate: Some(1e-4),
            ..TrainingConfig::default()
        };
        assert_eq!(Hyperparameters::resolve(&training, &model, ModelFamily::KoBart).learning_rate, 1e-4);

        let model = ModelConfig {
            learning_rate: Some(2e-5),
            ..ModelConfig::default()
        };
        assert_eq!(Hyperparameters::resolve(&training, &model, ModelFamily::KoBart).learning_rate, 2e-5);
    }

    #[test]
    fn test_steps_per_epoch() {
        let params = Hyperparameters::resolve(&TrainingConfig::default(), &ModelConfig::default(), ModelFamily::PkoT5);
        assert_eq!(params.effective_batch_size(), 8);
        assert_eq!(params.steps_per_epoch(17), 3);
        assert_eq!(params.label_smoothing, 0.1);
    }
}
