//! Side-by-side comparison of evaluation reports.

use crate::error::PipelineError;
use crate::eval::metrics::Metric;
use crate::eval::report::EvaluationReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

/// One report's row in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub model_name: String,
    pub checkpoint: String,
    pub sample_count: usize,
    pub scores: BTreeMap<Metric, f64>,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTable {
    pub rows: Vec<ComparisonRow>,
    /// Model with the highest score per metric.
    pub best: BTreeMap<Metric, String>,
    pub fastest: Option<String>,
}

pub fn load_reports(paths: &[PathBuf]) -> Result<Vec<EvaluationReport>, PipelineError> {
    paths.iter().map(|p| EvaluationReport::load(p)).collect()
}

pub fn compare_reports(reports: &[EvaluationReport]) -> ComparisonTable {
    let rows: Vec<ComparisonRow> = reports
        .iter()
        .map(|r| ComparisonRow {
            model_name: r.model_name.clone(),
            checkpoint: r.checkpoint.clone(),
            sample_count: r.sample_count,
            scores: Metric::all()
                .into_iter()
                .filter_map(|m| r.score(m).map(|s| (m, s)))
                .collect(),
            mean_latency_ms: r.latency.mean_ms,
        })
        .collect();

    let mut best = BTreeMap::new();
    for metric in Metric::all() {
        let leader = rows
            .iter()
            .filter_map(|row| row.scores.get(&metric).map(|s| (row, *s)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((row, _)) = leader {
            best.insert(metric, row.model_name.clone());
        }
    }

    let fastest = rows
        .iter()
        .min_by(|a, b| {
            a.mean_latency_ms
                .partial_cmp(&b.mean_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|r| r.model_name.clone());

    ComparisonTable { rows, best, fastest }
}

impl ComparisonTable {
    /// Plain-text table, one row per report.
    pub fn render(&self) -> String {
        let mut out = format!("{:<10} {:>7}", "model", "samples");
        for metric in Metric::all() {
            let _ = write!(out, " {:>16}", metric.name());
        }
        let _ = writeln!(out, " {:>12}", "latency_ms");

        for row in &self.rows {
            let _ = write!(out, "{:<10} {:>7}", row.model_name, row.sample_count);
            for metric in Metric::all() {
                match row.scores.get(&metric) {
                    Some(score) => {
                        let _ = write!(out, " {score:>16.4}");
                    }
                    None => {
                        let _ = write!(out, " {:>16}", "-");
                    }
                }
            }
            let _ = writeln!(out, " {:>12.1}", row.mean_latency_ms);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DecodingConfig, DecodingStrategy};
    use crate::eval::report::{EvaluationResult, LatencyStats};
    use crate::format::ModelFamily;
    use chrono::Utc;

    fn report(family: ModelFamily, bleu: f64, latency: f64) -> EvaluationReport {
        EvaluationReport {
            model_name: family.name().into(),
            family,
            backend: "memory".into(),
            base_model: family.default_base_checkpoint().into(),
            checkpoint: format!("runs/{family}/final"),
            checkpoint_hash: None,
            evaluated_at: Utc::now(),
            decoding: DecodingConfig {
                strategy: DecodingStrategy::Greedy,
                max_new_tokens: 64,
            },
            sample_count: 10,
            results: vec![EvaluationResult {
                model_name: family.name().into(),
                metric_name: "bleu".into(),
                score: bleu,
                sample_count: 10,
            }],
            latency: LatencyStats::from_samples(&[latency]),
            samples: Vec::new(),
        }
    }

    #[test]
    fn test_compare_picks_leaders() {
        let table = compare_reports(&[
            report(ModelFamily::FlanT5, 0.2, 5.0),
            report(ModelFamily::KoBart, 0.4, 9.0),
        ]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.best.get(&Metric::Bleu).map(String::as_str), Some("kobart"));
        assert!(!table.best.contains_key(&Metric::RougeL));
        assert_eq!(table.fastest.as_deref(), Some("flant5"));

        let text = table.render();
        assert!(text.contains("kobart"));
        assert!(text.contains("0.4000"));
    }
}
