//! Evaluation driver: generate for held-out examples and score the output.

use crate::backend::{CheckpointSource, DecodingConfig, DecodingStrategy, Seq2SeqBackend};
use crate::config::EvaluationConfig;
use crate::data::TrainingExample;
use crate::error::PipelineError;
use crate::eval::metrics::{Metric, SampleScores, score_sample};
use crate::eval::report::{EvaluationReport, EvaluationResult, LatencyStats, SampleResult};
use crate::format::{Formatter, ModelFamily};
use crate::training::checkpoint::{CheckpointManager, hash_dir};
use chrono::Utc;
use tracing::{info, warn};

/// Evaluates one checkpoint through a backend.
pub struct EvaluationDriver<'a> {
    backend: &'a dyn Seq2SeqBackend,
    config: &'a EvaluationConfig,
}

impl<'a> EvaluationDriver<'a> {
    pub fn new(backend: &'a dyn Seq2SeqBackend, config: &'a EvaluationConfig) -> Self {
        Self { backend, config }
    }

    pub fn decoding(&self) -> DecodingConfig {
        DecodingConfig {
            strategy: DecodingStrategy::from_beams(self.config.num_beams),
            max_new_tokens: self.config.max_new_tokens,
        }
    }

    /// Score `checkpoint` on at most `max_samples` of `examples`, in order.
    ///
    /// The checkpoint is loaded before anything else, so an invalid one fails
    /// with `ModelLoad` without generating.
    pub async fn run(
        &self,
        family: ModelFamily,
        checkpoint: &str,
        formatter: &Formatter,
        examples: &[TrainingExample],
        max_samples: usize,
    ) -> Result<EvaluationReport, PipelineError> {
        let handle = self.backend.load(family, checkpoint).await?;
        if let CheckpointSource::Local { dir } = &handle.source {
            if CheckpointManager::verify_saved(dir)? == Some(false) {
                return Err(PipelineError::model_load(format!(
                    "checkpoint {} no longer matches the hash recorded when it was saved",
                    dir.display()
                )));
            }
        }
        let selected = &examples[..examples.len().min(max_samples)];
        if selected.is_empty() {
            return Err(PipelineError::invalid_input("no held-out examples to evaluate"));
        }

        let pairs = formatter.format_all(selected)?;
        let prompts: Vec<String> = pairs.iter().map(|p| p.prompt.clone()).collect();
        let decoding = self.decoding();
        info!(
            family = %family,
            checkpoint,
            samples = prompts.len(),
            beams = decoding.strategy.num_beams(),
            "Generating"
        );

        let generations = self.backend.generate_batch(&handle, &prompts, &decoding).await?;
        if generations.len() != prompts.len() {
            return Err(PipelineError::evaluation(format!(
                "backend returned {} generations for {} prompts",
                generations.len(),
                prompts.len()
            )));
        }

        let mut samples = Vec::with_capacity(pairs.len());
        for ((example, pair), generation) in selected.iter().zip(pairs).zip(generations) {
            let scores = score_sample(
                &generation.text,
                &pair.target,
                &example.observation.traceable_numbers(),
            );
            samples.push(SampleResult {
                example_id: pair.example_id,
                prompt: pair.prompt,
                prediction: generation.text,
                reference: pair.target,
                scores,
                latency_ms: generation.latency_ms,
            });
        }

        let empty = samples.iter().filter(|s| s.prediction.trim().is_empty()).count();
        if empty > 0 {
            warn!(empty, "Empty predictions scored as zero");
        }

        let model_name = family.name().to_string();
        let sample_count = samples.len();
        let scores: Vec<SampleScores> = samples.iter().map(|s| s.scores).collect();
        let results: Vec<EvaluationResult> = aggregate(&scores)
            .into_iter()
            .map(|(metric, score)| EvaluationResult {
                model_name: model_name.clone(),
                metric_name: metric.name().to_string(),
                score,
                sample_count,
            })
            .collect();
        for result in &results {
            info!(metric = %result.metric_name, score = result.score, "Metric");
        }

        let latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        let checkpoint_hash = match &handle.source {
            CheckpointSource::Local { dir } => Some(hash_dir(dir)?.0),
            CheckpointSource::Pretrained { .. } => None,
        };
        samples.truncate(self.config.saved_samples);

        Ok(EvaluationReport {
            model_name,
            family,
            backend: self.backend.name().to_string(),
            base_model: handle.base_model.clone(),
            checkpoint: checkpoint.to_string(),
            checkpoint_hash,
            evaluated_at: Utc::now(),
            decoding,
            sample_count,
            results,
            latency: LatencyStats::from_samples(&latencies),
            samples,
        })
    }
}

/// Mean of each metric over a set of scores.
pub fn aggregate(scores: &[SampleScores]) -> Vec<(Metric, f64)> {
    Metric::all()
        .into_iter()
        .map(|metric| {
            let mean = if scores.is_empty() {
                0.0
            } else {
                scores.iter().map(|s| s.get(metric)).sum::<f64>() / scores.len() as f64
            };
            (metric, mean)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        FineTuneOutcome, MemoryBackend, ModelHandle, TrainingObserver,
        resolve_checkpoint,
    };
    use crate::data::SyntheticGenerator;
    use crate::data::validate::GuidelineRatios;
    use crate::format::FormattedPair;
    use crate::training::Hyperparameters;
    use async_trait::async_trait;
    use std::path::Path;

    /// Echoes a fixed answer for every prompt.
    struct Fixed(&'static str);

    #[async_trait]
    impl Seq2SeqBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn load(&self, family: ModelFamily, checkpoint: &str) -> Result<ModelHandle, PipelineError> {
            resolve_checkpoint(family, self.name(), checkpoint)
        }

        async fn fine_tune(
            &self,
            _handle: &ModelHandle,
            _pairs: &[FormattedPair],
            _params: &Hyperparameters,
            _output_dir: &Path,
            _observer: &mut dyn TrainingObserver,
        ) -> Result<FineTuneOutcome, PipelineError> {
            Err(PipelineError::backend("not trainable"))
        }

        async fn generate(
            &self,
            _handle: &ModelHandle,
            _prompt: &str,
            _decoding: &DecodingConfig,
        ) -> Result<String, PipelineError> {
            Ok(self.0.to_string())
        }
    }

    fn examples(n: usize) -> Vec<TrainingExample> {
        SyntheticGenerator::new(7, GuidelineRatios::default()).generate(n)
    }

    #[tokio::test]
    async fn test_empty_predictions_score_zero() {
        let config = EvaluationConfig::default();
        let backend = Fixed("");
        let report = EvaluationDriver::new(&backend, &config)
            .run(
                ModelFamily::FlanT5,
                "google/flan-t5-small",
                &Formatter::for_family(ModelFamily::FlanT5, 512),
                &examples(5),
                50,
            )
            .await
            .unwrap();
        assert_eq!(report.sample_count, 5);
        assert_eq!(report.results.len(), 5);
        for result in &report.results {
            assert_eq!(result.score, 0.0, "{}", result.metric_name);
        }
    }

    #[tokio::test]
    async fn test_max_samples_and_saved_samples() {
        let config = EvaluationConfig {
            saved_samples: 2,
            num_beams: 1,
            ..EvaluationConfig::default()
        };
        let backend = Fixed("관찰이 필요합니다");
        let report = EvaluationDriver::new(&backend, &config)
            .run(
                ModelFamily::KoBart,
                "gogamza/kobart-base-v2",
                &Formatter::for_family(ModelFamily::KoBart, 512),
                &examples(20),
                8,
            )
            .await
            .unwrap();
        assert_eq!(report.sample_count, 8);
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.decoding.strategy, DecodingStrategy::Greedy);
        assert!(report.checkpoint_hash.is_none());
    }

    #[tokio::test]
    async fn test_invalid_checkpoint_is_model_load() {
        let config = EvaluationConfig::default();
        let backend = MemoryBackend::new();
        let err = EvaluationDriver::new(&backend, &config)
            .run(
                ModelFamily::PkoT5,
                "./nowhere",
                &Formatter::for_family(ModelFamily::PkoT5, 512),
                &examples(3),
                50,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_modified_saved_checkpoint_is_model_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("checkpoint-epoch-1");
        crate::backend::CheckpointDescriptor {
            family: ModelFamily::FlanT5,
            base_model: "google/flan-t5-small".into(),
            backend: "fixed".into(),
            epoch: Some(1),
            created_at: Utc::now(),
        }
        .write(&dir)
        .unwrap();
        std::fs::write(dir.join("weights.bin"), "epoch 1").unwrap();
        CheckpointManager::new(tmp.path().to_path_buf(), "run-1", 3)
            .register(1, 0.5, &dir)
            .unwrap();

        let config = EvaluationConfig::default();
        let backend = Fixed("관찰이 필요합니다");
        let driver = EvaluationDriver::new(&backend, &config);
        let formatter = Formatter::for_family(ModelFamily::FlanT5, 512);
        let checkpoint = dir.to_str().unwrap();

        let report = driver
            .run(ModelFamily::FlanT5, checkpoint, &formatter, &examples(3), 50)
            .await
            .unwrap();
        assert!(report.checkpoint_hash.is_some());

        std::fs::write(dir.join("weights.bin"), "overwritten").unwrap();
        let err = driver
            .run(ModelFamily::FlanT5, checkpoint, &formatter, &examples(3), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }

    #[test]
    fn test_aggregate_means() {
        let a = SampleScores {
            bleu: 1.0,
            exact_match: 1.0,
            ..SampleScores::default()
        };
        let b = SampleScores::default();
        let means = aggregate(&[a, b]);
        assert_eq!(means[0], (Metric::Bleu, 0.5));
        assert_eq!(means[3], (Metric::ExactMatch, 0.5));
    }
}
