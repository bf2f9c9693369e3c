//! Seeded generator for guideline-conformant crowd monitoring datasets.
//!
//! The class mix follows [`GuidelineRatios`] exactly (counts are allocated up
//! front, then shuffled). Every number in a generated judgment is the observed
//! count, the threshold, or their difference, so generated data passes the
//! traceability checks in [`super::validate`].

use crate::data::record::{
    DEFAULT_DOMAIN, JudgmentRecord, ObservationRecord, SituationClass, TrainingExample,
};
use crate::data::validate::GuidelineRatios;
use crate::data::loader::DatasetFormat;
use crate::error::PipelineError;
use crate::persistence::atomic_write;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const LOCATIONS: &[(&str, &[&str])] = &[
    ("지하철역", &["출입구", "대합실", "플랫폼", "환승통로", "계단"]),
    ("버스터미널", &["게이트", "대합실", "승차장", "매표소"]),
    ("공항", &["출발게이트", "보안검색대", "체크인카운터", "출국장", "입국장"]),
    ("기차역", &["승강장", "대합실", "매표소"]),
    ("백화점", &["푸드코트", "중앙광장", "아트리움", "5층 A구역"]),
    ("쇼핑몰", &["푸드코트", "중앙광장", "에스컬레이터"]),
    ("영화관", &["매표소", "로비", "매점"]),
    ("콘서트홀", &["입구", "로비", "관람석"]),
    ("야구장", &["출입구", "매표소", "관람석", "내야석", "외야석"]),
    ("축구경기장", &["게이트", "관람석"]),
    ("전시관", &["입구", "부스", "1층 A입구"]),
    ("박물관", &["전시실", "로비"]),
    ("축제장", &["정문", "광장", "중앙무대"]),
    ("도서관", &["열람실", "복도"]),
    ("병원", &["접수대", "대기실", "외래진료센터"]),
    ("전통시장", &[]),
    ("테마파크", &["정문", "광장"]),
    ("컨벤션센터", &["로비", "2층 홀"]),
];

const VERBS: &[&str] = &[
    "집중되어 있습니다",
    "모여있습니다",
    "밀집되어 있습니다",
    "체류하고 있습니다",
    "머물고 있습니다",
    "대기하고 있습니다",
    "포착되었습니다",
];

const CONGESTED_PHRASES: &[&str] = &[
    "기준 {baseline}명을 {diff}명 상회한 {current}명이",
    "적정 기준치 {baseline}명을 {diff}명 초과한 {current}명이",
    "권장 기준 {baseline}명을 {diff}명 넘어선 {current}명이",
    "허용 기준 {baseline}명을 {diff}명 초과한 {current}명이",
    "기준 인원 {baseline}명을 {diff}명 초과한 {current}명이",
];

const NORMAL_PHRASES: &[&str] = &[
    "기준 인원 {baseline}명보다 {diff}명 적은 {current}명이",
    "허용 기준 {baseline}명보다 {diff}명 미달인 {current}명이",
    "운영 기준 {baseline}명보다 {diff}명 부족한 {current}명이",
];

const UNSET_PHRASES: &[&str] = &[
    "기준 미설정 상태로 {current}명이",
    "기준값 미설정 상태에서 {current}명이",
    "허용치 없이 {current}명이",
];

const PREDICTIONS: &[&str] = &[
    "추가 인원 유입으로 혼잡 가중이 우려됩니다",
    "향후 인파 집중이 예상됩니다",
    "추가 인원 증가가 우려됩니다",
    "혼잡 심화가 우려됩니다",
];

const REASONS: &[&str] = &[
    "진입로 협착으로 대기열이 형성되고 있어",
    "안전사고 위험이 높아지고 있어",
    "행사 시작을 앞두고",
];

const ACTIONS: &[&str] = &[
    "우회 경로 안내를 권장합니다",
    "추가 출입구 개방이 필요합니다",
    "안전사고 방지를 위해 즉시 우회 동선 안내가 필요합니다",
    "즉각적인 인원 분산 조치가 필수입니다",
    "입장 통제와 대기선 재정비가 시급합니다",
    "주변 공간으로의 분산 유도가 필요합니다",
];

const NORMAL_REMARKS: &[&str] = &[
    "원활한 흐름이 유지되고 있어 정상 운영이 가능합니다",
    "안정적인 통행 흐름이 이루어지고 있어 현재 상황은 양호합니다",
    "여유있는 상황이 지속되고 있어 현재 운영 방식을 유지하면 됩니다",
];

const WATCH_ACTIONS: &[&str] = &[
    "기준 인원 설정과 지속적인 모니터링이 필요합니다",
    "현장 인력의 주기적인 관찰이 필요합니다",
];

/// Row schema used when writing a generated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSchema {
    /// `time, location, sub_zone, observed_count, threshold_count, narrative_input,
    /// judgment_text, situation_class, domain`
    #[default]
    Structured,
    /// `Input, Output, Domain`
    Legacy,
}

/// Seeded synthetic dataset generator.
pub struct SyntheticGenerator {
    rng: StdRng,
    guideline: GuidelineRatios,
    domain: String,
}

impl SyntheticGenerator {
    pub fn new(seed: u64, guideline: GuidelineRatios) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            guideline,
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Generate `count` examples with ids `synthetic#<n>`.
    pub fn generate(&mut self, count: usize) -> Vec<TrainingExample> {
        let mut classes = self.allocate_classes(count);
        classes.shuffle(&mut self.rng);
        classes
            .into_iter()
            .enumerate()
            .map(|(i, class)| self.example(i, class))
            .collect()
    }

    /// Class labels in guideline proportions; rounding remainder goes to congested.
    fn allocate_classes(&self, count: usize) -> Vec<SituationClass> {
        let total = self.guideline.congested + self.guideline.cautionary + self.guideline.normal;
        let share = |r: f64| if total > 0.0 { (count as f64 * r / total).round() as usize } else { 0 };
        let cautionary = share(self.guideline.cautionary).min(count);
        let normal = share(self.guideline.normal).min(count - cautionary);
        let congested = count - cautionary - normal;

        let mut classes = Vec::with_capacity(count);
        classes.extend(std::iter::repeat_n(SituationClass::Congested, congested));
        classes.extend(std::iter::repeat_n(SituationClass::Cautionary, cautionary));
        classes.extend(std::iter::repeat_n(SituationClass::Normal, normal));
        classes
    }

    fn example(&mut self, index: usize, class: SituationClass) -> TrainingExample {
        let current = self.person_count();
        let (current, baseline) = match class {
            SituationClass::Congested => {
                let current = current.max(4);
                let diff = self.spread(current).min(current - 1);
                (current, Some(current - diff))
            }
            SituationClass::Normal => {
                let diff = self.spread(current);
                (current, Some(current + diff))
            }
            SituationClass::Cautionary => (current, None),
        };
        let time = self.time_expression();
        let (location, sub_zone) = self.location();
        let full = match &sub_zone {
            Some(zone) => format!("{location} {zone}"),
            None => location.to_string(),
        };

        let narrative = self.narrative(&time, &full, current, baseline);
        let judgment = self.judgment(class, &time, &full, current, baseline);

        TrainingExample {
            id: format!("synthetic#{index}"),
            domain: self.domain.clone(),
            observation: ObservationRecord {
                time,
                location: location.to_string(),
                sub_zone: sub_zone.map(str::to_string),
                observed_count: current,
                threshold_count: baseline,
                narrative_input: narrative,
            },
            judgment: JudgmentRecord {
                situation_class: class,
                action_text: judgment,
                referenced_threshold: baseline,
            },
        }
    }

    /// 3-30 (30%), 31-100 (45%), 101-500 (20%), 501-1000 (5%).
    fn person_count(&mut self) -> u32 {
        let roll = self.rng.gen_range(0..100);
        let (min, max) = match roll {
            0..30 => (3, 30),
            30..75 => (31, 100),
            75..95 => (101, 500),
            _ => (501, 1000),
        };
        self.rng.gen_range(min..=max)
    }

    /// Distance between observed and threshold, scaled to the crowd size.
    fn spread(&mut self, current: u32) -> u32 {
        match current {
            0..=30 => self.rng.gen_range(1..=8),
            31..=100 => self.rng.gen_range(5..=25),
            _ => self.rng.gen_range(20..=100),
        }
    }

    /// `HH:MM` 60% of the time, otherwise a Korean clock phrase.
    fn time_expression(&mut self) -> String {
        let hour: u32 = self.rng.gen_range(6..=23);
        let minute: u32 = self.rng.gen_range(0..=59);
        if self.rng.gen_bool(0.6) {
            return format!("{hour:02}:{minute:02}");
        }
        let (prefix, hour) = match hour {
            0..=11 => ("오전", hour),
            12 => ("오후", 12),
            13..=17 => ("오후", hour - 12),
            _ => ("저녁", hour - 12),
        };
        if minute == 0 {
            format!("{prefix} {hour}시")
        } else {
            format!("{prefix} {hour}시 {minute}분")
        }
    }

    fn location(&mut self) -> (&'static str, Option<&'static str>) {
        let (place, areas) = LOCATIONS[self.rng.gen_range(0..LOCATIONS.len())];
        if areas.is_empty() || !self.rng.gen_bool(0.7) {
            return (place, None);
        }
        (place, Some(areas[self.rng.gen_range(0..areas.len())]))
    }

    fn narrative(&mut self, time: &str, location: &str, current: u32, baseline: Option<u32>) -> String {
        match baseline {
            Some(baseline) => match self.rng.gen_range(0..5) {
                0 => format!("{time} {location} 감지 인원 {current}명, 기준 인원 {baseline}명"),
                1 => format!("{time} {location}에서 {current}명 밀집, 기준 수용인원 {baseline}명"),
                2 => format!(
                    "{location}에 {time} 현재 {current}명이 집계되고 있으며, 기준값은 {baseline}명으로 설정되어 있습니다."
                ),
                3 => format!(
                    "{location}에서 {time} 현재 {current}명의 사람들이 모여있으며, 적정 기준치는 {baseline}명입니다."
                ),
                _ => format!("{location}에 {time} 현재 {current}명이 있으며, 운영 기준은 {baseline}명입니다."),
            },
            None => match self.rng.gen_range(0..3) {
                0 => format!("{time} {location} 감지 인원 {current}명, 기준 미설정"),
                1 => format!("{time} {location}에서 {current}명 파악, 기준값 없음입니다."),
                _ => format!("{location}에 {time} 현재 {current}명이 있으며, 기준값 미설정입니다."),
            },
        }
    }

    fn judgment(
        &mut self,
        class: SituationClass,
        time: &str,
        location: &str,
        current: u32,
        baseline: Option<u32>,
    ) -> String {
        let verb = self.pick(VERBS);
        let prediction = self.pick(PREDICTIONS);
        let lead = format!("{time} {location}에서");
        match (class, baseline) {
            (SituationClass::Congested, Some(baseline)) => {
                let phrase = fill(self.pick(CONGESTED_PHRASES), current, baseline, current - baseline);
                let action = self.pick(ACTIONS);
                if self.rng.gen_bool(0.4) {
                    let reason = self.pick(REASONS);
                    format!("{lead} {phrase} {verb}. {reason} {prediction}. {action}.")
                } else {
                    format!("{lead} {phrase} {verb}. {action}.")
                }
            }
            (SituationClass::Normal, Some(baseline)) => {
                let phrase = fill(self.pick(NORMAL_PHRASES), current, baseline, baseline - current);
                let remark = self.pick(NORMAL_REMARKS);
                format!("{lead} {phrase} {verb}. {remark}.")
            }
            _ => {
                let phrase = fill(self.pick(UNSET_PHRASES), current, 0, 0);
                let action = self.pick(WATCH_ACTIONS);
                format!("{lead} {phrase} {verb}. {prediction}. {action}.")
            }
        }
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options[self.rng.gen_range(0..options.len())]
    }
}

fn fill(template: &str, current: u32, baseline: u32, diff: u32) -> String {
    template
        .replace("{current}", &current.to_string())
        .replace("{baseline}", &baseline.to_string())
        .replace("{diff}", &diff.to_string())
}

#[derive(Serialize)]
struct StructuredRow<'a> {
    time: &'a str,
    location: &'a str,
    sub_zone: Option<&'a str>,
    observed_count: u32,
    threshold_count: Option<u32>,
    narrative_input: &'a str,
    judgment_text: &'a str,
    situation_class: &'a str,
    domain: &'a str,
}

#[derive(Serialize)]
struct LegacyRow<'a> {
    #[serde(rename = "Input")]
    input: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
    #[serde(rename = "Domain")]
    domain: &'a str,
}

fn structured_row(example: &TrainingExample) -> StructuredRow<'_> {
    let obs = &example.observation;
    StructuredRow {
        time: &obs.time,
        location: &obs.location,
        sub_zone: obs.sub_zone.as_deref(),
        observed_count: obs.observed_count,
        threshold_count: obs.threshold_count,
        narrative_input: &obs.narrative_input,
        judgment_text: &example.judgment.action_text,
        situation_class: example.judgment.situation_class.as_str(),
        domain: &example.domain,
    }
}

fn legacy_row(example: &TrainingExample) -> LegacyRow<'_> {
    LegacyRow {
        input: &example.observation.narrative_input,
        output: &example.judgment.action_text,
        domain: &example.domain,
    }
}

/// Write examples to `path`; the format follows the file extension.
pub fn write_dataset(
    path: &Path,
    examples: &[TrainingExample],
    schema: DatasetSchema,
) -> Result<(), PipelineError> {
    let format = DatasetFormat::from_path(path).ok_or_else(|| {
        PipelineError::invalid_input(format!("unsupported dataset extension: {}", path.display()))
    })?;

    let bytes = match format {
        DatasetFormat::Csv | DatasetFormat::Tsv => {
            let delimiter = if format == DatasetFormat::Tsv { b'\t' } else { b',' };
            let mut writer = csv::WriterBuilder::new()
                .delimiter(delimiter)
                .quote_style(csv::QuoteStyle::Always)
                .from_writer(Vec::new());
            for example in examples {
                match schema {
                    DatasetSchema::Structured => writer.serialize(structured_row(example))?,
                    DatasetSchema::Legacy => writer.serialize(legacy_row(example))?,
                }
            }
            writer
                .into_inner()
                .map_err(|e| PipelineError::Io(e.into_error()))?
        }
        DatasetFormat::Json => match schema {
            DatasetSchema::Structured => {
                let rows: Vec<_> = examples.iter().map(structured_row).collect();
                serde_json::to_vec_pretty(&rows)?
            }
            DatasetSchema::Legacy => {
                let rows: Vec<_> = examples.iter().map(legacy_row).collect();
                serde_json::to_vec_pretty(&rows)?
            }
        },
        DatasetFormat::Jsonl => {
            let mut out = Vec::new();
            for example in examples {
                match schema {
                    DatasetSchema::Structured => serde_json::to_writer(&mut out, &structured_row(example))?,
                    DatasetSchema::Legacy => serde_json::to_writer(&mut out, &legacy_row(example))?,
                }
                out.push(b'\n');
            }
            out
        }
    };

    atomic_write(path, &bytes)?;
    info!(path = %path.display(), examples = examples.len(), ?schema, "Wrote dataset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::DatasetLoader;
    use crate::data::validate::{IssueKind, validate_dataset};
    use tempfile::TempDir;

    #[test]
    fn test_generation_is_seeded() {
        let a = SyntheticGenerator::new(42, GuidelineRatios::default()).generate(20);
        let b = SyntheticGenerator::new(42, GuidelineRatios::default()).generate(20);
        assert_eq!(a, b);
        let c = SyntheticGenerator::new(43, GuidelineRatios::default()).generate(20);
        assert_ne!(a, c);
    }

    #[test]
    fn test_class_mix_follows_guideline() {
        let data = SyntheticGenerator::new(7, GuidelineRatios::default()).generate(100);
        let count = |c| data.iter().filter(|e| e.judgment.situation_class == c).count();
        assert_eq!(count(SituationClass::Congested), 70);
        assert_eq!(count(SituationClass::Cautionary), 20);
        assert_eq!(count(SituationClass::Normal), 10);
        for example in &data {
            assert_eq!(example.judgment.situation_class, example.observation.situation_class());
        }
    }

    #[test]
    fn test_generated_data_is_traceable() {
        let data = SyntheticGenerator::new(1, GuidelineRatios::default()).generate(200);
        let report = validate_dataset(&data, &GuidelineRatios::default(), 0.9);
        for kind in [
            IssueKind::NarrativeGap,
            IssueKind::UntraceableNumber,
            IssueKind::ClassMismatch,
            IssueKind::WrongExcess,
        ] {
            let found: Vec<_> = report.issues_of(kind).collect();
            assert!(found.is_empty(), "{kind:?}: {found:?}");
        }
        for example in data.iter().filter(|e| e.judgment.situation_class == SituationClass::Congested) {
            let excess = example.observation.excess().unwrap();
            assert!(example.judgment.action_text.contains(&format!("{excess}명")));
        }
    }

    #[test]
    fn test_written_structured_csv_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("synthetic.csv");
        let data = SyntheticGenerator::new(3, GuidelineRatios::default()).generate(30);
        write_dataset(&path, &data, DatasetSchema::Structured).unwrap();

        let loaded = DatasetLoader::new().load(&path).unwrap();
        assert_eq!(loaded.len(), 30);
        for (orig, back) in data.iter().zip(&loaded) {
            assert_eq!(orig.observation, back.observation);
            assert_eq!(orig.judgment.situation_class, back.judgment.situation_class);
            assert_eq!(orig.judgment.action_text, back.judgment.action_text);
        }
    }

    #[test]
    fn test_written_legacy_csv_parses_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.csv");
        let data = SyntheticGenerator::new(5, GuidelineRatios::default()).generate(40);
        write_dataset(&path, &data, DatasetSchema::Legacy).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("\"Input\",\"Output\",\"Domain\""));

        let loaded = DatasetLoader::new().load(&path).unwrap();
        for (orig, back) in data.iter().zip(&loaded) {
            assert_eq!(orig.observation.observed_count, back.observation.observed_count);
            assert_eq!(orig.observation.threshold_count, back.observation.threshold_count);
            assert_eq!(orig.observation.time, back.observation.time);
            assert_eq!(orig.observation.full_location(), back.observation.location);
        }
    }
}
