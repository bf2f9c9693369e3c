//! Scoring generated judgments against references.

pub mod compare;
pub mod evaluator;
pub mod metrics;
pub mod normalize;
pub mod report;

pub use compare::{ComparisonTable, compare_reports, load_reports};
pub use evaluator::{EvaluationDriver, aggregate};
pub use metrics::{Metric, SampleScores, score_sample};
pub use report::{EvaluationReport, EvaluationResult, LatencyStats, SampleResult};
