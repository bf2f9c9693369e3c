//! Evaluation artifacts.

use crate::backend::DecodingConfig;
use crate::error::PipelineError;
use crate::eval::metrics::{Metric, SampleScores};
use crate::format::ModelFamily;
use crate::persistence::{load_json, write_new_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One aggregated metric for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub model_name: String,
    pub metric_name: String,
    pub score: f64,
    pub sample_count: usize,
}

/// Per-sample generation latency.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub std_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
}

impl LatencyStats {
    pub fn from_samples(latencies: &[f64]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        let mut sorted = latencies.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Self {
            mean_ms: mean,
            std_ms: variance.sqrt(),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            median_ms: median,
            p95_ms: percentile(&sorted, 95.0),
        }
    }
}

/// Nearest-rank percentile of already sorted values.
pub fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

/// A scored generation kept in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub example_id: String,
    pub prompt: String,
    pub prediction: String,
    pub reference: String,
    pub scores: SampleScores,
    pub latency_ms: f64,
}

/// Write-once artifact of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model_name: String,
    pub family: ModelFamily,
    pub backend: String,
    pub base_model: String,
    pub checkpoint: String,
    /// Content hash of a local checkpoint directory.
    pub checkpoint_hash: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub decoding: DecodingConfig,
    pub sample_count: usize,
    pub results: Vec<EvaluationResult>,
    pub latency: LatencyStats,
    pub samples: Vec<SampleResult>,
}

impl EvaluationReport {
    pub fn score(&self, metric: Metric) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.metric_name == metric.name())
            .map(|r| r.score)
    }

    /// `<results_dir>/<family>-<timestamp>.json`
    pub fn default_path(&self, results_dir: &Path) -> PathBuf {
        results_dir.join(format!(
            "{}-{}.json",
            self.family.name(),
            self.evaluated_at.format("%Y%m%d-%H%M%S%.3f")
        ))
    }

    /// Persist the report. Fails if `path` already exists.
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        write_new_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        load_json(path)?.ok_or_else(|| {
            PipelineError::invalid_input(format!("no evaluation report at {}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DecodingStrategy;
    use tempfile::TempDir;

    fn report() -> EvaluationReport {
        EvaluationReport {
            model_name: "kobart".into(),
            family: ModelFamily::KoBart,
            backend: "memory".into(),
            base_model: "gogamza/kobart-base-v2".into(),
            checkpoint: "runs/kobart/x/final".into(),
            checkpoint_hash: None,
            evaluated_at: Utc::now(),
            decoding: DecodingConfig {
                strategy: DecodingStrategy::Beam { num_beams: 4 },
                max_new_tokens: 512,
            },
            sample_count: 2,
            results: vec![EvaluationResult {
                model_name: "kobart".into(),
                metric_name: "bleu".into(),
                score: 0.25,
                sample_count: 2,
            }],
            latency: LatencyStats::from_samples(&[1.0, 3.0]),
            samples: Vec::new(),
        }
    }

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::from_samples(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 4.0);
        assert_eq!(stats.mean_ms, 2.5);
        assert_eq!(stats.median_ms, 2.5);
        assert!((stats.std_ms - 1.25f64.sqrt()).abs() < 1e-12);
        assert_eq!(LatencyStats::from_samples(&[]), LatencyStats::default());
    }

    #[test]
    fn test_report_is_write_once() {
        let tmp = TempDir::new().unwrap();
        let report = report();
        let path = report.default_path(tmp.path());
        report.save(&path).unwrap();
        assert!(matches!(report.save(&path), Err(PipelineError::InvalidInput(_))));

        let loaded = EvaluationReport::load(&path).unwrap();
        assert_eq!(loaded.score(Metric::Bleu), Some(0.25));
        assert_eq!(loaded.score(Metric::RougeL), None);
    }
}
