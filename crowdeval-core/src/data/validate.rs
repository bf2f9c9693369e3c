//! Dataset quality report against the authoring guidelines.

use crate::data::record::{SituationClass, TrainingExample};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

/// Target class mix and threshold coverage for an authored dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineRatios {
    #[serde(default = "default_congested")]
    pub congested: f64,
    #[serde(default = "default_cautionary")]
    pub cautionary: f64,
    #[serde(default = "default_normal")]
    pub normal: f64,
    /// Accepted band for the share of examples carrying an explicit threshold.
    #[serde(default = "default_threshold_share")]
    pub threshold_share: (f64, f64),
    /// Absolute deviation allowed on each ratio.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_congested() -> f64 {
    0.7
}
fn default_cautionary() -> f64 {
    0.2
}
fn default_normal() -> f64 {
    0.1
}
fn default_threshold_share() -> (f64, f64) {
    (0.6, 0.7)
}
fn default_tolerance() -> f64 {
    0.1
}

impl Default for GuidelineRatios {
    fn default() -> Self {
        Self {
            congested: default_congested(),
            cautionary: default_cautionary(),
            normal: default_normal(),
            threshold_share: default_threshold_share(),
            tolerance: default_tolerance(),
        }
    }
}

impl GuidelineRatios {
    pub fn expected(&self, class: SituationClass) -> f64 {
        match class {
            SituationClass::Congested => self.congested,
            SituationClass::Cautionary => self.cautionary,
            SituationClass::Normal => self.normal,
        }
    }
}

/// A ratio outside its guideline band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioDeviation {
    pub metric: String,
    pub expected: f64,
    pub actual: f64,
}

/// A problem tied to one example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordIssue {
    pub record: String,
    pub kind: IssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A structured field is not present in the narrative.
    NarrativeGap,
    /// The judgment mentions a number the observation cannot account for.
    UntraceableNumber,
    /// The judgment's class disagrees with the counts.
    ClassMismatch,
    /// A stated excess is not `observed - threshold`.
    WrongExcess,
    /// The judgment text is empty.
    EmptyJudgment,
}

/// Quality report for an authored dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetQualityReport {
    pub total_examples: usize,
    pub class_counts: BTreeMap<SituationClass, usize>,
    pub class_ratios: BTreeMap<SituationClass, f64>,
    pub threshold_share: f64,
    pub ratio_deviations: Vec<RatioDeviation>,
    pub issues: Vec<RecordIssue>,
    pub duplicate_examples: usize,
    /// Distinct judgment texts over total examples.
    pub action_diversity: f64,
    pub overall_score: f64,
    pub passed_gate: bool,
}

impl DatasetQualityReport {
    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &RecordIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

fn stated_excess_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([0-9]+)\s*명\s*(?:초과|상회|넘어|웃도|뛰어넘|더 많)").expect("valid regex")
    })
}

/// Validate a dataset and produce a quality report.
pub fn validate_dataset(
    examples: &[TrainingExample],
    guideline: &GuidelineRatios,
    quality_threshold: f64,
) -> DatasetQualityReport {
    let total = examples.len();
    let ratio = |n: usize| if total > 0 { n as f64 / total as f64 } else { 0.0 };

    let mut class_counts: BTreeMap<SituationClass, usize> =
        SituationClass::all().into_iter().map(|c| (c, 0)).collect();
    for example in examples {
        *class_counts.entry(example.judgment.situation_class).or_default() += 1;
    }
    let class_ratios: BTreeMap<SituationClass, f64> =
        class_counts.iter().map(|(c, n)| (*c, ratio(*n))).collect();

    let with_threshold = examples
        .iter()
        .filter(|e| e.observation.threshold_count.is_some())
        .count();
    let threshold_share = ratio(with_threshold);

    let mut ratio_deviations = Vec::new();
    if total > 0 {
        for (class, actual) in &class_ratios {
            let expected = guideline.expected(*class);
            if (actual - expected).abs() > guideline.tolerance + 1e-9 {
                ratio_deviations.push(RatioDeviation {
                    metric: format!("{class}_ratio"),
                    expected,
                    actual: *actual,
                });
            }
        }
        let (low, high) = guideline.threshold_share;
        let slack = guideline.tolerance + 1e-9;
        if threshold_share < low - slack || threshold_share > high + slack {
            ratio_deviations.push(RatioDeviation {
                metric: "threshold_share".into(),
                expected: (low + high) / 2.0,
                actual: threshold_share,
            });
        }
    }

    let mut issues = Vec::new();
    for example in examples {
        check_example(example, &mut issues);
    }

    let mut seen = HashSet::new();
    let mut duplicate_examples = 0;
    let mut distinct_actions = HashSet::new();
    for example in examples {
        let key = (
            example.observation.narrative_input.as_str(),
            example.judgment.action_text.as_str(),
        );
        if !seen.insert(key) {
            duplicate_examples += 1;
        }
        distinct_actions.insert(example.judgment.action_text.as_str());
    }
    let action_diversity = ratio(distinct_actions.len());

    let flagged: HashSet<&str> = issues.iter().map(|i| i.record.as_str()).collect();
    let issue_penalty = ratio(flagged.len());
    let dup_penalty = ratio(duplicate_examples);
    let ratio_penalty = 0.05 * ratio_deviations.len() as f64;
    let overall_score = if total == 0 {
        0.0
    } else {
        (1.0 - issue_penalty - dup_penalty - ratio_penalty).clamp(0.0, 1.0)
    };
    let passed_gate = overall_score >= quality_threshold;

    DatasetQualityReport {
        total_examples: total,
        class_counts,
        class_ratios,
        threshold_share,
        ratio_deviations,
        issues,
        duplicate_examples,
        action_diversity,
        overall_score,
        passed_gate,
    }
}

fn check_example(example: &TrainingExample, issues: &mut Vec<RecordIssue>) {
    let obs = &example.observation;
    let mut push = |kind, detail: String| {
        issues.push(RecordIssue {
            record: example.id.clone(),
            kind,
            detail,
        })
    };

    let gaps = obs.fields_missing_from_narrative();
    if !gaps.is_empty() {
        push(IssueKind::NarrativeGap, format!("missing from narrative: {}", gaps.join(", ")));
    }

    if example.judgment.action_text.trim().is_empty() {
        push(IssueKind::EmptyJudgment, "judgment text is empty".into());
        return;
    }

    let untraceable = example.untraceable_numbers();
    if !untraceable.is_empty() {
        let listed: Vec<String> = untraceable.iter().map(u32::to_string).collect();
        push(IssueKind::UntraceableNumber, format!("numbers not in observation: {}", listed.join(", ")));
    }

    let derived = obs.situation_class();
    if example.judgment.situation_class != derived {
        push(
            IssueKind::ClassMismatch,
            format!("labelled {} but counts give {derived}", example.judgment.situation_class),
        );
    }

    if let Some(excess) = obs.excess() {
        for cap in stated_excess_re().captures_iter(&example.judgment.action_text) {
            let Some(stated) = cap.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
                continue;
            };
            if stated != excess {
                push(
                    IssueKind::WrongExcess,
                    format!("states excess {stated}, observed - threshold = {excess}"),
                );
            }
        }
    }
}
