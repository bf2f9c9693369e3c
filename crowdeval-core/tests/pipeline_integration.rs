//! End-to-end pipeline tests.
//!
//! Synthesize a dataset, fine-tune with the in-process memory backend, then
//! evaluate the resulting checkpoint and persist the report.

use crowdeval_core::config::PipelineConfig;
use crowdeval_core::data::{DatasetSchema, GuidelineRatios, SyntheticGenerator, write_dataset};
use crowdeval_core::eval::{Metric, compare_reports};
use crowdeval_core::training::TrainingStatus;
use crowdeval_core::{EvaluationReport, ModelFamily, ModelPipeline, PipelineError};
use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_synthetic(dir: &Path, count: usize, schema: DatasetSchema) -> PathBuf {
    let path = dir.join("crowd.csv");
    let examples = SyntheticGenerator::new(42, GuidelineRatios::default()).generate(count);
    write_dataset(&path, &examples, schema).unwrap();
    path
}

fn config(dir: &Path, dataset: PathBuf) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data.paths = vec![dataset];
    config.training.epochs = 3;
    config.training.output_dir = dir.join("runs");
    config.evaluation.results_dir = dir.join("results");
    config
}

#[tokio::test]
async fn train_then_evaluate_with_memory_backend() {
    let tmp = TempDir::new().unwrap();
    let dataset = write_synthetic(tmp.path(), 60, DatasetSchema::Structured);
    let pipeline = ModelPipeline::from_config(config(tmp.path(), dataset));

    let run = pipeline.train(ModelFamily::FlanT5, &[]).await.unwrap();
    assert_ne!(run.manifest.status, TrainingStatus::Failed);
    assert_eq!(run.manifest.dataset.train_examples, 48);
    assert_eq!(run.manifest.dataset.held_out_examples, 12);
    assert!(run.manifest.metrics.best_loss.is_some());
    assert!(run.run_dir.join("run.json").exists());
    assert!(run.run_dir.join("checkpoints.json").exists());

    let checkpoint = run.final_checkpoint.to_string_lossy().into_owned();
    let (report, path) = pipeline
        .evaluate_and_save(ModelFamily::FlanT5, &checkpoint, &[], None)
        .await
        .unwrap();

    assert_eq!(report.sample_count, 12);
    assert_eq!(report.results.len(), Metric::all().len());
    for result in &report.results {
        assert!((0.0..=1.0).contains(&result.score), "{} = {}", result.metric_name, result.score);
        assert_eq!(result.model_name, "flant5");
    }
    assert!(report.checkpoint_hash.is_some());
    assert!(path.starts_with(tmp.path().join("results")));

    let reloaded = EvaluationReport::load(&path).unwrap();
    assert_eq!(reloaded.results, report.results);
    assert!(matches!(reloaded.save(&path), Err(PipelineError::InvalidInput(_))));

    let table = compare_reports(&[reloaded]);
    assert_eq!(table.rows.len(), 1);
}

#[tokio::test]
async fn evaluation_is_deterministic_for_a_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let dataset = write_synthetic(tmp.path(), 30, DatasetSchema::Legacy);
    let pipeline = ModelPipeline::from_config(config(tmp.path(), dataset));

    let run = pipeline.train(ModelFamily::KoBart, &[]).await.unwrap();
    let checkpoint = run.final_checkpoint.to_string_lossy().into_owned();
    let first = pipeline.evaluate(ModelFamily::KoBart, &checkpoint, &[]).await.unwrap();
    let second = pipeline.evaluate(ModelFamily::KoBart, &checkpoint, &[]).await.unwrap();
    assert_eq!(first.results, second.results);
}

#[tokio::test]
async fn checkpoint_of_another_family_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dataset = write_synthetic(tmp.path(), 20, DatasetSchema::Structured);
    let pipeline = ModelPipeline::from_config(config(tmp.path(), dataset));

    let run = pipeline.train(ModelFamily::PkoT5, &[]).await.unwrap();
    let checkpoint = run.final_checkpoint.to_string_lossy().into_owned();
    let err = pipeline
        .evaluate(ModelFamily::FlanT5, &checkpoint, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ModelLoad(_)));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn missing_observed_count_fails_with_data_format() {
    let tmp = TempDir::new().unwrap();
    let dataset = tmp.path().join("broken.csv");
    std::fs::write(
        &dataset,
        "time,location,observed_count,threshold_count,narrative_input,judgment_text\n\
         14:22,백화점 5층 A구역,28,20,\"14:22 백화점 5층 A구역 감지 인원 28명, 기준 인원 20명\",\"기준 20명을 8명 초과했습니다.\"\n\
         14:30,백화점 5층 B구역,,20,\"14:30 백화점 5층 B구역 기준 인원 20명\",\"관찰이 필요합니다.\"\n",
    )
    .unwrap();
    let pipeline = ModelPipeline::from_config(config(tmp.path(), dataset));

    let err = pipeline.train(ModelFamily::FlanT5, &[]).await.unwrap_err();
    match &err {
        PipelineError::DataFormat { record, message } => {
            assert_eq!(record, "broken.csv#1");
            assert!(message.contains("observed_count"));
        }
        other => panic!("expected DataFormat, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
    assert!(!tmp.path().join("runs").exists());
}

#[tokio::test]
async fn ragged_rows_and_truncated_json_fail_with_data_format() {
    let tmp = TempDir::new().unwrap();
    let ragged = tmp.path().join("ragged.csv");
    std::fs::write(
        &ragged,
        "time,location,observed_count,threshold_count,narrative_input,judgment_text\n14:22,A구역,28\n",
    )
    .unwrap();
    let pipeline = ModelPipeline::from_config(config(tmp.path(), ragged));
    let err = pipeline.train(ModelFamily::FlanT5, &[]).await.unwrap_err();
    assert!(matches!(&err, PipelineError::DataFormat { record, .. } if record == "ragged.csv#0"));
    assert_eq!(err.exit_code(), 2);

    let truncated = tmp.path().join("truncated.json");
    std::fs::write(&truncated, r#"[{"Input": "x","#).unwrap();
    let pipeline = ModelPipeline::from_config(config(tmp.path(), truncated));
    let err = pipeline.train(ModelFamily::KoBart, &[]).await.unwrap_err();
    assert!(matches!(&err, PipelineError::DataFormat { record, .. } if record == "truncated.json"));
    assert_eq!(err.exit_code(), 2);
    assert!(!tmp.path().join("runs").exists());
}
