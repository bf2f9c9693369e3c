//! Per-family pipeline: loader, formatter, fine-tuning and evaluation wired
//! together from one [`PipelineConfig`].

use crate::backend::{MemoryBackend, ProcessBackend, Seq2SeqBackend, resolve_checkpoint};
use crate::config::{BackendConfig, BackendKind, PipelineConfig};
use crate::data::{DataSplit, DatasetLoader, train_test_split};
use crate::error::PipelineError;
use crate::eval::{EvaluationDriver, EvaluationReport};
use crate::format::{Formatter, ModelFamily};
use crate::training::driver::DatasetSummary;
use crate::training::{FineTuneDriver, Hyperparameters, TrainingRun};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Build the backend named by the config.
pub fn backend_from_config(config: &BackendConfig) -> Arc<dyn Seq2SeqBackend> {
    match config.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Process => Arc::new(ProcessBackend::new(config.process.clone())),
    }
}

pub struct ModelPipeline {
    config: PipelineConfig,
    backend: Arc<dyn Seq2SeqBackend>,
}

impl ModelPipeline {
    pub fn new(config: PipelineConfig, backend: Arc<dyn Seq2SeqBackend>) -> Self {
        Self { config, backend }
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        let backend = backend_from_config(&config.backend);
        Self::new(config, backend)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Seq2SeqBackend {
        self.backend.as_ref()
    }

    pub fn loader(&self) -> DatasetLoader {
        let loader = DatasetLoader::new().with_default_domain(self.config.data.default_domain.clone());
        match self.config.data.format {
            Some(format) => loader.with_format(format),
            None => loader,
        }
    }

    /// The family's template, or the configured custom one.
    pub fn formatter(&self, family: ModelFamily) -> Result<Formatter, PipelineError> {
        let max_length = self.config.training.max_length;
        let formatter = match self.config.model(family).template {
            Some(template) => Formatter::custom(template, max_length)?,
            None => Formatter::for_family(family, max_length),
        };
        Ok(formatter.strict(self.config.training.strict_length))
    }

    /// Explicit paths win over `data.paths`.
    fn dataset_paths(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, PipelineError> {
        let chosen = if paths.is_empty() {
            self.config.data.paths.clone()
        } else {
            paths.to_vec()
        };
        if chosen.is_empty() {
            return Err(PipelineError::invalid_input(
                "no dataset given; pass files or set data.paths",
            ));
        }
        Ok(chosen)
    }

    /// Load the dataset files and split them with the configured seed.
    pub fn split(&self, paths: &[PathBuf]) -> Result<(Vec<PathBuf>, DataSplit), PipelineError> {
        let paths = self.dataset_paths(paths)?;
        let examples = self.loader().load_many(&paths)?;
        let split = train_test_split(examples, self.config.data.test_ratio, self.config.data.split_seed)?;
        info!(
            train = split.train.len(),
            held_out = split.test.len(),
            seed = self.config.data.split_seed,
            "Split dataset"
        );
        Ok((paths, split))
    }

    /// Fine-tune `family` on the training part of the dataset.
    pub async fn train(&self, family: ModelFamily, paths: &[PathBuf]) -> Result<TrainingRun, PipelineError> {
        let base_checkpoint = self.config.base_checkpoint(family);
        resolve_checkpoint(family, self.backend.name(), &base_checkpoint)?;

        let (sources, split) = self.split(paths)?;
        let pairs = self.formatter(family)?.format_all(&split.train)?;
        let params = Hyperparameters::resolve(&self.config.training, &self.config.model(family), family);
        let dataset = DatasetSummary {
            sources,
            train_examples: split.train.len(),
            held_out_examples: split.test.len(),
            split_seed: self.config.data.split_seed,
            test_ratio: self.config.data.test_ratio,
            length_violations: pairs.iter().filter(|p| !p.violations.is_empty()).count(),
        };

        FineTuneDriver::new(self.backend.as_ref(), &self.config.training)
            .run(family, &base_checkpoint, &pairs, params, dataset)
            .await
    }

    /// Evaluate `checkpoint` on the held-out part of the dataset.
    ///
    /// With `test_ratio = 0` there is no held-out part and every example is used.
    pub async fn evaluate(
        &self,
        family: ModelFamily,
        checkpoint: &str,
        paths: &[PathBuf],
    ) -> Result<EvaluationReport, PipelineError> {
        resolve_checkpoint(family, self.backend.name(), checkpoint)?;

        let (_, split) = self.split(paths)?;
        let held_out = if split.test.is_empty() {
            warn!("No held-out examples; evaluating on the full dataset");
            split.train
        } else {
            split.test
        };

        EvaluationDriver::new(self.backend.as_ref(), &self.config.evaluation)
            .run(
                family,
                checkpoint,
                &self.formatter(family)?,
                &held_out,
                self.config.max_samples(family),
            )
            .await
    }

    /// Evaluate and write the report, by default to `<results_dir>/<family>-<timestamp>.json`.
    pub async fn evaluate_and_save(
        &self,
        family: ModelFamily,
        checkpoint: &str,
        paths: &[PathBuf],
        output: Option<&Path>,
    ) -> Result<(EvaluationReport, PathBuf), PipelineError> {
        let report = self.evaluate(family, checkpoint, paths).await?;
        let path = match output {
            Some(path) => path.to_path_buf(),
            None => report.default_path(&self.config.evaluation.results_dir),
        };
        report.save(&path)?;
        info!(path = %path.display(), "Wrote evaluation report");
        Ok((report, path))
    }
}
