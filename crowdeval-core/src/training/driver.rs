//! Fine-tuning driver.
//!
//! Resolves the base checkpoint first, then hands the formatted pairs to the
//! backend and reacts to its epoch reports: metrics, callbacks, checkpoint
//! registration and the run manifest (`run.json`) all live here.

use crate::backend::{
    CheckpointDescriptor, CheckpointSource, EpochDirective, Seq2SeqBackend, TrainingObserver,
};
use crate::config::TrainingConfig;
use crate::error::PipelineError;
use crate::format::{FormattedPair, ModelFamily};
use crate::persistence::atomic_write_json;
use crate::training::callbacks::{
    AnomalyDetectionCallback, CallbackAction, CheckpointCallback, EarlyStoppingCallback,
    TrainingCallback,
};
use crate::training::checkpoint::{Checkpoint, CheckpointManager};
use crate::training::metrics::TrainingMetrics;
use crate::training::reproducibility::EnvironmentSnapshot;
use crate::training::Hyperparameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

pub const RUN_MANIFEST_FILE: &str = "run.json";
pub const TRAINING_LOG_FILE: &str = "training_log.jsonl";

/// Training status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Running,
    Completed,
    /// Ended early by a callback.
    Stopped,
    Failed,
}

/// What the run was trained on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub sources: Vec<PathBuf>,
    pub train_examples: usize,
    pub held_out_examples: usize,
    pub split_seed: u64,
    pub test_ratio: f64,
    /// Pairs flagged for exceeding `max_length`.
    pub length_violations: usize,
}

/// Everything recorded about one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub family: ModelFamily,
    pub backend: String,
    pub base_checkpoint: String,
    pub base_model: String,
    pub hyperparameters: Hyperparameters,
    pub dataset: DatasetSummary,
    pub environment: EnvironmentSnapshot,
    pub status: TrainingStatus,
    pub metrics: TrainingMetrics,
    pub checkpoints: Vec<Checkpoint>,
    pub best_checkpoint: Option<PathBuf>,
    pub final_checkpoint: Option<PathBuf>,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub run_dir: PathBuf,
    pub final_checkpoint: PathBuf,
    pub manifest: RunManifest,
}

/// Drives one fine-tuning run through a backend.
pub struct FineTuneDriver<'a> {
    backend: &'a dyn Seq2SeqBackend,
    training: &'a TrainingConfig,
}

impl<'a> FineTuneDriver<'a> {
    pub fn new(backend: &'a dyn Seq2SeqBackend, training: &'a TrainingConfig) -> Self {
        Self { backend, training }
    }

    fn callbacks(&self) -> Vec<Box<dyn TrainingCallback>> {
        let mut callbacks: Vec<Box<dyn TrainingCallback>> =
            vec![Box::new(AnomalyDetectionCallback::new(self.training.loss_spike_factor, 5))];
        if let Some(patience) = self.training.early_stopping_patience {
            callbacks.push(Box::new(EarlyStoppingCallback::new(
                patience,
                self.training.early_stopping_min_delta,
            )));
        }
        callbacks.push(Box::new(CheckpointCallback::new(self.training.save_every_epochs)));
        callbacks
    }

    /// Fine-tune `family` from `base_checkpoint` on `pairs`.
    ///
    /// The run directory is `<output_dir>/<family>/<run_id>`.
    pub async fn run(
        &self,
        family: ModelFamily,
        base_checkpoint: &str,
        pairs: &[FormattedPair],
        params: Hyperparameters,
        dataset: DatasetSummary,
    ) -> Result<TrainingRun, PipelineError> {
        let handle = self.backend.load(family, base_checkpoint).await?;
        if pairs.is_empty() {
            return Err(PipelineError::invalid_input("no training pairs"));
        }

        let started = Instant::now();
        let started_at = Utc::now();
        let uuid = uuid::Uuid::new_v4().to_string();
        let run_id = format!("{}-{}", started_at.format("%Y%m%d-%H%M%S"), &uuid[..8]);
        let run_dir = self.training.output_dir.join(family.name()).join(&run_id);
        std::fs::create_dir_all(&run_dir).map_err(PipelineError::from_write_failure)?;

        let mut manifest = RunManifest {
            run_id: run_id.clone(),
            family,
            backend: self.backend.name().to_string(),
            base_checkpoint: base_checkpoint.to_string(),
            base_model: handle.base_model.clone(),
            hyperparameters: params.clone(),
            dataset,
            environment: EnvironmentSnapshot::capture(),
            status: TrainingStatus::Running,
            metrics: TrainingMetrics::default(),
            checkpoints: Vec::new(),
            best_checkpoint: None,
            final_checkpoint: None,
            stop_reason: None,
            error: None,
            started_at,
            finished_at: None,
        };
        atomic_write_json(&run_dir.join(RUN_MANIFEST_FILE), &manifest)?;
        info!(
            run_id = %run_id,
            family = %family,
            base = %handle.base_model,
            pairs = pairs.len(),
            epochs = params.epochs,
            "Starting fine-tuning"
        );

        let mut observer = RunObserver {
            metrics: TrainingMetrics::default(),
            callbacks: self.callbacks(),
            checkpoints: CheckpointManager::new(run_dir.clone(), run_id.clone(), self.training.save_total_limit),
            run_dir: run_dir.clone(),
            descriptor: CheckpointDescriptor {
                family,
                base_model: handle.base_model.clone(),
                backend: self.backend.name().to_string(),
                epoch: None,
                created_at: Utc::now(),
            },
            steps_per_epoch: params.steps_per_epoch(pairs.len()),
            stop_reason: None,
        };

        let result = self
            .backend
            .fine_tune(&handle, pairs, &params, &run_dir, &mut observer)
            .await;

        manifest.metrics = observer.metrics.clone();
        manifest.metrics.total_training_time_secs = started.elapsed().as_secs_f64();
        manifest.stop_reason = observer.stop_reason.clone();
        manifest.finished_at = Some(Utc::now());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                manifest.status = TrainingStatus::Failed;
                manifest.error = Some(e.to_string());
                manifest.checkpoints = observer.checkpoints.list().unwrap_or_default();
                if let Err(write_err) = atomic_write_json(&run_dir.join(RUN_MANIFEST_FILE), &manifest) {
                    warn!(error = %write_err, "Could not record failed run");
                }
                return Err(e);
            }
        };

        let final_dir = match &outcome.handle.source {
            CheckpointSource::Local { dir } => dir.clone(),
            CheckpointSource::Pretrained { id } => {
                return Err(PipelineError::backend(format!(
                    "backend returned pretrained model {id} instead of trained weights"
                )));
            }
        };
        CheckpointDescriptor {
            epoch: Some(outcome.epochs_completed),
            created_at: Utc::now(),
            ..observer.descriptor.clone()
        }
        .write(&final_dir)?;

        manifest.status = if manifest.stop_reason.is_some() {
            TrainingStatus::Stopped
        } else {
            TrainingStatus::Completed
        };
        manifest.checkpoints = observer.checkpoints.list()?;
        manifest.best_checkpoint = observer.checkpoints.best()?.map(|c| c.path);
        manifest.final_checkpoint = Some(final_dir.clone());
        atomic_write_json(&run_dir.join(RUN_MANIFEST_FILE), &manifest)?;

        info!(
            run_id = %run_id,
            status = ?manifest.status,
            epochs = outcome.epochs_completed,
            best_loss = ?manifest.metrics.best_loss,
            final_checkpoint = %final_dir.display(),
            "Fine-tuning finished"
        );

        Ok(TrainingRun {
            run_dir,
            final_checkpoint: final_dir,
            manifest,
        })
    }
}

struct RunObserver {
    metrics: TrainingMetrics,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    checkpoints: CheckpointManager,
    run_dir: PathBuf,
    descriptor: CheckpointDescriptor,
    steps_per_epoch: u64,
    stop_reason: Option<String>,
}

#[derive(Serialize)]
struct EpochLogLine {
    epoch: usize,
    loss: f64,
    steps: u64,
    timestamp: DateTime<Utc>,
}

impl RunObserver {
    fn append_log(&self, epoch: usize, loss: f64) -> Result<(), PipelineError> {
        let line = serde_json::to_string(&EpochLogLine {
            epoch,
            loss,
            steps: self.metrics.total_steps,
            timestamp: Utc::now(),
        })?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join(TRAINING_LOG_FILE))
            .map_err(PipelineError::from_write_failure)?;
        writeln!(file, "{line}").map_err(PipelineError::from_write_failure)
    }
}

impl TrainingObserver for RunObserver {
    fn on_epoch_end(&mut self, epoch: usize, loss: f64) -> Result<EpochDirective, PipelineError> {
        self.metrics.record_epoch(loss, self.steps_per_epoch);
        self.append_log(epoch, loss)?;
        info!(epoch, loss, "Epoch complete");

        let mut directive = EpochDirective::default();
        for callback in &mut self.callbacks {
            match callback.on_epoch_end(epoch, &self.metrics) {
                CallbackAction::Continue => {}
                CallbackAction::Checkpoint => {
                    directive.save_to = Some(self.run_dir.join(format!("checkpoint-epoch-{epoch}")));
                }
                CallbackAction::Stop(reason) => {
                    warn!(epoch, reason = %reason, "Stopping training early");
                    directive.stop = true;
                    self.stop_reason.get_or_insert(reason);
                }
            }
        }
        Ok(directive)
    }

    fn on_checkpoint_saved(&mut self, epoch: usize, loss: f64, dir: &Path) -> Result<(), PipelineError> {
        CheckpointDescriptor {
            epoch: Some(epoch),
            created_at: Utc::now(),
            ..self.descriptor.clone()
        }
        .write(dir)?;
        self.checkpoints.register(epoch, loss, dir)?;
        Ok(())
    }
}
