//! Observation, judgment and training example records.

use crate::data::narrative::extract_numbers;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Domain label used when a dataset row carries none.
pub const DEFAULT_DOMAIN: &str = "군중 밀집 및 체류 감지";

/// How a crowd observation should be judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SituationClass {
    /// Observed headcount exceeds the configured threshold.
    Congested,
    /// No threshold configured; the crowd needs watching.
    Cautionary,
    /// Observed headcount is within the threshold.
    Normal,
}

impl SituationClass {
    /// Derive the class from counts.
    pub fn classify(observed_count: u32, threshold_count: Option<u32>) -> Self {
        match threshold_count {
            Some(threshold) if observed_count > threshold => Self::Congested,
            Some(_) => Self::Normal,
            None => Self::Cautionary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Congested => "congested",
            Self::Cautionary => "cautionary",
            Self::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "congested" | "초과" | "초과상황" | "혼잡" => Some(Self::Congested),
            "cautionary" | "caution" | "기준없음" | "주의" => Some(Self::Cautionary),
            "normal" | "정상" | "정상상황" => Some(Self::Normal),
            _ => None,
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Congested, Self::Cautionary, Self::Normal]
    }
}

impl std::fmt::Display for SituationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single crowd-density observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub time: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_zone: Option<String>,
    pub observed_count: u32,
    #[serde(default)]
    pub threshold_count: Option<u32>,
    pub narrative_input: String,
}

impl ObservationRecord {
    pub fn situation_class(&self) -> SituationClass {
        SituationClass::classify(self.observed_count, self.threshold_count)
    }

    /// Headcount above the threshold, when there is one and it is exceeded.
    pub fn excess(&self) -> Option<u32> {
        self.threshold_count
            .filter(|t| self.observed_count > *t)
            .map(|t| self.observed_count - t)
    }

    /// Headcount still available below the threshold.
    pub fn headroom(&self) -> Option<u32> {
        self.threshold_count
            .filter(|t| self.observed_count <= *t)
            .map(|t| t - self.observed_count)
    }

    /// Location including the sub-zone, if any.
    pub fn full_location(&self) -> String {
        match &self.sub_zone {
            Some(zone) if !zone.is_empty() => format!("{} {}", self.location, zone),
            _ => self.location.clone(),
        }
    }

    /// Structured fields whose value does not appear in `narrative_input`.
    pub fn fields_missing_from_narrative(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let narrative = &self.narrative_input;
        if !narrative.contains(self.time.trim()) {
            missing.push("time");
        }
        if !narrative.contains(self.location.trim()) {
            missing.push("location");
        }
        if let Some(zone) = &self.sub_zone {
            if !narrative.contains(zone.trim()) {
                missing.push("sub_zone");
            }
        }
        let numbers = extract_numbers(narrative);
        if !numbers.contains(&self.observed_count) {
            missing.push("observed_count");
        }
        if let Some(threshold) = self.threshold_count {
            if !numbers.contains(&threshold) {
                missing.push("threshold_count");
            }
        }
        missing
    }

    /// Every number a judgment about this observation may legitimately mention.
    pub fn traceable_numbers(&self) -> BTreeSet<u32> {
        let mut allowed: BTreeSet<u32> = extract_numbers(&self.narrative_input).into_iter().collect();
        allowed.extend(extract_numbers(&self.time));
        allowed.extend(extract_numbers(&self.full_location()));
        allowed.insert(self.observed_count);
        if let Some(threshold) = self.threshold_count {
            allowed.insert(threshold);
        }
        if let Some(excess) = self.excess() {
            allowed.insert(excess);
        }
        if let Some(headroom) = self.headroom() {
            allowed.insert(headroom);
        }
        allowed
    }
}

/// The expected judgment and action for an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub situation_class: SituationClass,
    pub action_text: String,
    #[serde(default)]
    pub referenced_threshold: Option<u32>,
}

/// An authored (observation, judgment) pair. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    /// Stable identifier, `<source>#<row>`.
    pub id: String,
    pub domain: String,
    pub observation: ObservationRecord,
    pub judgment: JudgmentRecord,
}

impl TrainingExample {
    /// Numbers in the judgment text that cannot be traced to the observation.
    pub fn untraceable_numbers(&self) -> Vec<u32> {
        let allowed = self.observation.traceable_numbers();
        extract_numbers(&self.judgment.action_text)
            .into_iter()
            .filter(|n| !allowed.contains(n))
            .collect()
    }
}
