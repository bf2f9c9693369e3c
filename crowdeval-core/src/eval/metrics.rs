//! Per-sample text similarity metrics.
//!
//! All scores lie in `[0, 1]`. An empty (after normalization) prediction
//! scores zero on every metric.

use crate::data::narrative::extract_numbers;
use crate::eval::normalize::{normalize, tokens};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Highest n-gram order used by BLEU.
pub const BLEU_MAX_ORDER: usize = 4;

/// The metrics reported for every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Bleu,
    RougeL,
    TokenF1,
    ExactMatch,
    NumericFidelity,
}

impl Metric {
    pub fn all() -> [Self; 5] {
        [
            Self::Bleu,
            Self::RougeL,
            Self::TokenF1,
            Self::ExactMatch,
            Self::NumericFidelity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bleu => "bleu",
            Self::RougeL => "rouge_l",
            Self::TokenF1 => "token_f1",
            Self::ExactMatch => "exact_match",
            Self::NumericFidelity => "numeric_fidelity",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scores of one prediction against its reference.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleScores {
    pub bleu: f64,
    pub rouge_l: f64,
    pub token_f1: f64,
    pub exact_match: f64,
    pub numeric_fidelity: f64,
}

impl SampleScores {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Bleu => self.bleu,
            Metric::RougeL => self.rouge_l,
            Metric::TokenF1 => self.token_f1,
            Metric::ExactMatch => self.exact_match,
            Metric::NumericFidelity => self.numeric_fidelity,
        }
    }
}

/// Score a prediction. `source_numbers` are the numbers the observation allows.
pub fn score_sample(prediction: &str, reference: &str, source_numbers: &BTreeSet<u32>) -> SampleScores {
    let pred = tokens(prediction);
    let refs = tokens(reference);
    SampleScores {
        bleu: bleu_tokens(&pred, &refs),
        rouge_l: rouge_l_tokens(&pred, &refs),
        token_f1: token_f1_tokens(&pred, &refs),
        exact_match: exact_match(prediction, reference),
        numeric_fidelity: numeric_fidelity(prediction, reference, source_numbers),
    }
}

/// 1.0 when the normalized texts are identical and non-empty.
///
/// Two texts that both normalize to nothing (punctuation or whitespace only)
/// score 0.0: an empty prediction never counts as a match, same as on every
/// other metric.
pub fn exact_match(prediction: &str, reference: &str) -> f64 {
    let pred = normalize(prediction);
    if !pred.is_empty() && pred == normalize(reference) {
        1.0
    } else {
        0.0
    }
}

/// Harmonic mean of multiset token precision and recall.
pub fn token_f1(prediction: &str, reference: &str) -> f64 {
    token_f1_tokens(&tokens(prediction), &tokens(reference))
}

fn token_f1_tokens(pred: &[String], refs: &[String]) -> f64 {
    if pred.is_empty() || refs.is_empty() {
        return 0.0;
    }
    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for t in refs {
        *ref_counts.entry(t.as_str()).or_default() += 1;
    }
    let mut common = 0usize;
    for t in pred {
        if let Some(n) = ref_counts.get_mut(t.as_str()) {
            if *n > 0 {
                *n -= 1;
                common += 1;
            }
        }
    }
    f_measure(common, pred.len(), refs.len())
}

/// ROUGE-L F-measure over the longest common token subsequence.
pub fn rouge_l(prediction: &str, reference: &str) -> f64 {
    rouge_l_tokens(&tokens(prediction), &tokens(reference))
}

fn rouge_l_tokens(pred: &[String], refs: &[String]) -> f64 {
    if pred.is_empty() || refs.is_empty() {
        return 0.0;
    }
    f_measure(lcs_len(pred, refs), pred.len(), refs.len())
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn f_measure(overlap: usize, pred_len: usize, ref_len: usize) -> f64 {
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / pred_len as f64;
    let recall = overlap as f64 / ref_len as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Sentence BLEU with brevity penalty.
///
/// The order is capped at the shorter of the two token sequences (and at
/// [`BLEU_MAX_ORDER`]). Orders above one use add-one smoothing, so a short
/// but correct prediction is not zeroed by a missing 4-gram.
pub fn bleu(prediction: &str, reference: &str) -> f64 {
    bleu_tokens(&tokens(prediction), &tokens(reference))
}

fn bleu_tokens(pred: &[String], refs: &[String]) -> f64 {
    if pred.is_empty() || refs.is_empty() {
        return 0.0;
    }
    let order = BLEU_MAX_ORDER.min(pred.len()).min(refs.len());

    let mut log_sum = 0.0;
    for n in 1..=order {
        let ref_counts = ngram_counts(refs, n);
        let pred_counts = ngram_counts(pred, n);
        let matched: usize = pred_counts
            .iter()
            .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
            .sum();
        let total = pred.len() + 1 - n;
        let precision = if n == 1 {
            if matched == 0 {
                return 0.0;
            }
            matched as f64 / total as f64
        } else {
            (matched + 1) as f64 / (total + 1) as f64
        };
        log_sum += precision.ln();
    }
    let geo_mean = (log_sum / order as f64).exp();

    let brevity = if pred.len() >= refs.len() {
        1.0
    } else {
        (1.0 - refs.len() as f64 / pred.len() as f64).exp()
    };
    (brevity * geo_mean).clamp(0.0, 1.0)
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_default() += 1;
    }
    counts
}

/// Fraction of the prediction's numbers that the source observation contains.
///
/// A prediction without numbers scores 1.0 if the reference has none either,
/// otherwise 0.0 (the expected figures were omitted).
pub fn numeric_fidelity(prediction: &str, reference: &str, source_numbers: &BTreeSet<u32>) -> f64 {
    let normalized = normalize(prediction);
    if normalized.is_empty() {
        return 0.0;
    }
    let numbers = extract_numbers(&normalized);
    if numbers.is_empty() {
        return if extract_numbers(&normalize(reference)).is_empty() {
            1.0
        } else {
            0.0
        };
    }
    let traced = numbers.iter().filter(|n| source_numbers.contains(n)).count();
    traced as f64 / numbers.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF: &str = "기준 20명을 8명 초과한 28명이 밀집되어 있습니다. 우회 경로 안내를 권장합니다.";

    fn allowed() -> BTreeSet<u32> {
        [14, 22, 5, 28, 20, 8].into_iter().collect()
    }

    #[test]
    fn test_identical_scores_one() {
        let s = score_sample(REF, REF, &allowed());
        assert_eq!(s.exact_match, 1.0);
        assert!((s.bleu - 1.0).abs() < 1e-12);
        assert!((s.rouge_l - 1.0).abs() < 1e-12);
        assert!((s.token_f1 - 1.0).abs() < 1e-12);
        assert_eq!(s.numeric_fidelity, 1.0);
    }

    #[test]
    fn test_empty_prediction_scores_zero() {
        let s = score_sample("", REF, &allowed());
        assert_eq!(s, SampleScores::default());
        let s = score_sample("  ...  ", REF, &allowed());
        assert_eq!(s, SampleScores::default());
    }

    #[test]
    fn test_exact_match_ignores_punctuation_and_case() {
        assert_eq!(exact_match("Gate A, 28명!", "gate a 28명"), 1.0);
        assert_eq!(exact_match("gate b", "gate a"), 0.0);
        assert_eq!(exact_match("?!", "..."), 0.0);
        assert_eq!(exact_match("", ""), 0.0);
    }

    #[test]
    fn test_token_f1_counts_multiset_overlap() {
        // pred: a a b (3), ref: a b c (3), overlap a b = 2
        let f1 = token_f1("a a b", "a b c");
        assert!((f1 - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(token_f1("x y", "a b"), 0.0);
    }

    #[test]
    fn test_rouge_l() {
        // LCS of "a b c d" and "a c d e" is "a c d" = 3
        let r = rouge_l("a b c d", "a c d e");
        assert!((r - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_bleu_brevity_penalty() {
        let full = bleu("a b c d e f", "a b c d e f");
        let short = bleu("a b c", "a b c d e f");
        assert!((full - 1.0).abs() < 1e-12);
        assert!(short < full);
        assert!(short > 0.0);
        assert_eq!(bleu("x y z", "a b c"), 0.0);
    }

    #[test]
    fn test_numeric_fidelity() {
        assert_eq!(numeric_fidelity("28명이 있습니다", REF, &allowed()), 1.0);
        assert_eq!(numeric_fidelity("28명, 출구 3번 개방", REF, &allowed()), 0.5);
        assert_eq!(numeric_fidelity("분산 유도가 필요합니다", REF, &allowed()), 0.0);
        assert_eq!(numeric_fidelity("분산 유도가 필요합니다", "분산 유도", &allowed()), 1.0);
    }
}
