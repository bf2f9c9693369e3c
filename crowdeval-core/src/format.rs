//! Model families and prompt formatting.
//!
//! Each family has a fixed input convention. Formatting is a pure function of
//! the example and the template; over-long text is flagged, never truncated.

use crate::data::record::TrainingExample;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// The pretrained seq2seq families under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "flant5", alias = "flan-t5", alias = "flan_t5")]
    FlanT5,
    #[serde(rename = "kobart")]
    KoBart,
    #[serde(rename = "pko-t5", alias = "pkot5", alias = "pko_t5")]
    PkoT5,
}

impl ModelFamily {
    pub fn all() -> [Self; 3] {
        [Self::FlanT5, Self::KoBart, Self::PkoT5]
    }

    /// Short name used for directories, config keys and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlanT5 => "flant5",
            Self::KoBart => "kobart",
            Self::PkoT5 => "pko-t5",
        }
    }

    pub fn default_base_checkpoint(&self) -> &'static str {
        match self {
            Self::FlanT5 => "google/flan-t5-small",
            Self::KoBart => "gogamza/kobart-base-v2",
            Self::PkoT5 => "paust/pko-t5-base",
        }
    }

    pub fn default_learning_rate(&self) -> f64 {
        match self {
            Self::KoBart => 5e-5,
            Self::FlanT5 | Self::PkoT5 => 3e-4,
        }
    }

    pub fn default_eval_samples(&self) -> usize {
        match self {
            Self::KoBart => 40,
            Self::FlanT5 | Self::PkoT5 => 50,
        }
    }

    pub fn default_label_smoothing(&self) -> f64 {
        match self {
            Self::PkoT5 => 0.1,
            Self::FlanT5 | Self::KoBart => 0.0,
        }
    }

    pub fn prompt_template(&self) -> &'static str {
        match self {
            Self::FlanT5 => "도메인: {domain}, 입력: {narrative}",
            Self::KoBart => {
                "다음 군중 모니터링 상황을 분석하고 적절한 대응 방안을 제시하세요.\n도메인: {domain}\n상황: {narrative}\n대응방안:"
            }
            Self::PkoT5 => {
                "다음 군중 모니터링 상황을 분석하고 적절한 대응 방안을 한국어로 제시하세요.\n도메인: {domain}\n상황: {narrative}\n대응방안:"
            }
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelFamily {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "flant5" | "flan-t5" => Ok(Self::FlanT5),
            "kobart" | "ko-bart" => Ok(Self::KoBart),
            "pko-t5" | "pkot5" => Ok(Self::PkoT5),
            other => Err(PipelineError::invalid_input(format!(
                "unknown model family `{other}` (expected flant5, kobart or pko-t5)"
            ))),
        }
    }
}

/// Counts tokens the way a model's tokenizer would.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counts Unicode scalar values. Never fewer than a subword tokenizer produces.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenCounter;

impl TokenCounter for CharTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Which half of a pair exceeded the length limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairSide {
    Prompt,
    Target,
}

/// A prompt or target longer than the model accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthViolation {
    pub side: PairSide,
    pub tokens: usize,
    pub max_length: usize,
}

/// A (prompt, target) pair ready for the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedPair {
    pub example_id: String,
    pub prompt: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<LengthViolation>,
}

/// Renders training examples with a family's prompt template.
#[derive(Clone)]
pub struct Formatter {
    template: String,
    max_length: usize,
    strict: bool,
    counter: Arc<dyn TokenCounter>,
}

impl std::fmt::Debug for Formatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formatter")
            .field("template", &self.template)
            .field("max_length", &self.max_length)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Formatter {
    pub fn for_family(family: ModelFamily, max_length: usize) -> Self {
        Self {
            template: family.prompt_template().to_string(),
            max_length,
            strict: false,
            counter: Arc::new(CharTokenCounter),
        }
    }

    /// A caller-supplied template. Must reference `{narrative}`.
    ///
    /// Placeholders: `{domain}`, `{narrative}`, `{time}`, `{location}`,
    /// `{observed_count}`, `{threshold_count}`.
    pub fn custom(template: impl Into<String>, max_length: usize) -> Result<Self, PipelineError> {
        let template = template.into();
        if !template.contains("{narrative}") {
            return Err(PipelineError::Config(
                "custom prompt template must contain {narrative}".into(),
            ));
        }
        Ok(Self {
            template,
            max_length,
            strict: false,
            counter: Arc::new(CharTokenCounter),
        })
    }

    /// Reject over-long pairs instead of flagging them.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn render_prompt(&self, example: &TrainingExample) -> String {
        let obs = &example.observation;
        let threshold = obs
            .threshold_count
            .map(|t| t.to_string())
            .unwrap_or_else(|| "미설정".to_string());
        self.template
            .replace("{domain}", &example.domain)
            .replace("{time}", &obs.time)
            .replace("{location}", &obs.full_location())
            .replace("{observed_count}", &obs.observed_count.to_string())
            .replace("{threshold_count}", &threshold)
            .replace("{narrative}", &obs.narrative_input)
    }

    pub fn format(&self, example: &TrainingExample) -> Result<FormattedPair, PipelineError> {
        let prompt = self.render_prompt(example);
        let target = example.judgment.action_text.clone();

        let mut violations = Vec::new();
        for (side, text) in [(PairSide::Prompt, &prompt), (PairSide::Target, &target)] {
            let tokens = self.counter.count(text);
            if tokens > self.max_length {
                violations.push(LengthViolation {
                    side,
                    tokens,
                    max_length: self.max_length,
                });
            }
        }

        if self.strict {
            if let Some(v) = violations.first() {
                return Err(PipelineError::data_format(
                    &example.id,
                    format!("{:?} has {} tokens, max_length is {}", v.side, v.tokens, v.max_length),
                ));
            }
        }

        Ok(FormattedPair {
            example_id: example.id.clone(),
            prompt,
            target,
            violations,
        })
    }

    pub fn format_all(&self, examples: &[TrainingExample]) -> Result<Vec<FormattedPair>, PipelineError> {
        let pairs = examples
            .iter()
            .map(|e| self.format(e))
            .collect::<Result<Vec<_>, _>>()?;
        let flagged = pairs.iter().filter(|p| !p.violations.is_empty()).count();
        if flagged > 0 {
            warn!(flagged, max_length = self.max_length, "Pairs exceed max_length");
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::record::{JudgmentRecord, ObservationRecord, SituationClass};
    use pretty_assertions::assert_eq;

    fn scenario() -> TrainingExample {
        TrainingExample {
            id: "scenario#0".into(),
            domain: "군중 밀집 및 체류 감지".into(),
            observation: ObservationRecord {
                time: "14:22".into(),
                location: "백화점 5층 A구역".into(),
                sub_zone: None,
                observed_count: 28,
                threshold_count: Some(20),
                narrative_input: "14:22 백화점 5층 A구역 감지 인원 28명, 기준 인원 20명".into(),
            },
            judgment: JudgmentRecord {
                situation_class: SituationClass::Congested,
                action_text: "14:22 백화점 5층 A구역에서 기준 20명을 8명 초과한 28명이 밀집되어 있습니다. 우회 경로 안내를 권장합니다."
                    .into(),
                referenced_threshold: Some(20),
            },
        }
    }

    #[test]
    fn test_scenario_prompt_and_target() {
        let example = scenario();
        for family in ModelFamily::all() {
            let pair = Formatter::for_family(family, 512).format(&example).unwrap();
            assert!(pair.prompt.contains("28"));
            assert!(pair.prompt.contains("20"));
            assert!(pair.prompt.contains("14:22"));
            assert!(pair.violations.is_empty());
        }
        let excess = example.observation.excess().unwrap();
        assert_eq!(excess, 8);
        assert!(example.judgment.action_text.contains("8명 초과"));
        assert!(example.judgment.action_text.contains("권장합니다"));
    }

    #[test]
    fn test_family_templates() {
        let example = scenario();
        let pair = Formatter::for_family(ModelFamily::FlanT5, 512).format(&example).unwrap();
        assert_eq!(
            pair.prompt,
            "도메인: 군중 밀집 및 체류 감지, 입력: 14:22 백화점 5층 A구역 감지 인원 28명, 기준 인원 20명"
        );
        let pair = Formatter::for_family(ModelFamily::KoBart, 512).format(&example).unwrap();
        assert!(pair.prompt.starts_with("다음 군중 모니터링 상황을 분석하고"));
        assert!(pair.prompt.ends_with("대응방안:"));
        assert_eq!(pair.target, example.judgment.action_text);
    }

    #[test]
    fn test_format_is_deterministic() {
        let example = scenario();
        let formatter = Formatter::for_family(ModelFamily::PkoT5, 512);
        assert_eq!(formatter.format(&example).unwrap(), formatter.format(&example).unwrap());
    }

    #[test]
    fn test_length_violation_flagged_not_truncated() {
        let example = scenario();
        let pair = Formatter::for_family(ModelFamily::FlanT5, 10).format(&example).unwrap();
        assert_eq!(pair.violations.len(), 2);
        assert_eq!(pair.violations[0].side, PairSide::Prompt);
        assert!(pair.prompt.ends_with("기준 인원 20명"));
        assert_eq!(pair.target, example.judgment.action_text);
    }

    #[test]
    fn test_strict_mode_rejects() {
        let err = Formatter::for_family(ModelFamily::FlanT5, 10)
            .strict(true)
            .format(&scenario())
            .unwrap_err();
        match err {
            PipelineError::DataFormat { record, .. } => assert_eq!(record, "scenario#0"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_template() {
        assert!(Formatter::custom("{domain}", 512).is_err());
        let pair = Formatter::custom("[{time}] {location} {observed_count}/{threshold_count} :: {narrative}", 512)
            .unwrap()
            .format(&scenario())
            .unwrap();
        assert!(pair.prompt.starts_with("[14:22] 백화점 5층 A구역 28/20 :: "));
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!("FLAN-T5".parse::<ModelFamily>().unwrap(), ModelFamily::FlanT5);
        assert_eq!("pko_t5".parse::<ModelFamily>().unwrap(), ModelFamily::PkoT5);
        assert!("gpt".parse::<ModelFamily>().is_err());
    }
}
