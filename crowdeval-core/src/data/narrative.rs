//! Field extraction from free-text observation narratives.
//!
//! Older datasets carry only `Input / Output / Domain` columns. The structured
//! observation fields are recovered from the Korean narrative here.

use crate::data::record::ObservationRecord;
use crate::error::PipelineError;
use regex::Regex;
use std::sync::OnceLock;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]+").expect("valid regex"))
}

fn clock_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9]{1,2}:[0-9]{2}").expect("valid regex"))
}

fn korean_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:(?:새벽|오전|오후|저녁|밤)\s*)?[0-9]{1,2}시(?:\s*[0-9]{1,2}분)?")
            .expect("valid regex")
    })
}

fn headcount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]+)\s*명").expect("valid regex"))
}

fn threshold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:기준|허용|수용|적정|임계|운영)[^0-9]{0,12}?([0-9]+)\s*명")
            .expect("valid regex")
    })
}

/// Phrases meaning "no threshold configured".
const NO_THRESHOLD_MARKERS: &[&str] = &["미설정", "없음", "없이", "없습니다"];

/// Phrases that end the location span in a narrative that starts with the time.
const LOCATION_TERMINATORS: &[&str] = &[" 앞 ", "에서 ", " 감지", " 현재", "에 ", ","];

/// All ASCII-digit runs in `text`, in order of appearance.
pub fn extract_numbers(text: &str) -> Vec<u32> {
    number_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<u32>().ok())
        .collect()
}

/// The first time expression (`14:22`, `오후 2시 5분`, `9시`) in `text`.
pub fn extract_time(text: &str) -> Option<(usize, usize)> {
    clock_time_re()
        .find(text)
        .or_else(|| korean_time_re().find(text))
        .map(|m| (m.start(), m.end()))
}

/// Parse a legacy narrative into an observation record.
///
/// `record` identifies the row in error messages.
pub fn parse_narrative(record: &str, narrative: &str) -> Result<ObservationRecord, PipelineError> {
    let text = narrative.trim().trim_matches('"').trim();

    let (time_start, time_end) = extract_time(text)
        .ok_or_else(|| PipelineError::data_format(record, "no time expression in narrative"))?;
    let time = text[time_start..time_end].to_string();

    let threshold_match = if NO_THRESHOLD_MARKERS.iter().any(|m| text.contains(m)) {
        None
    } else {
        threshold_re().captures(text)
    };
    let threshold_span = threshold_match
        .as_ref()
        .and_then(|c| c.get(0))
        .map(|m| (m.start(), m.end()));
    let threshold_count = match threshold_match.as_ref().and_then(|c| c.get(1)) {
        Some(m) => Some(parse_count(record, "threshold_count", m.as_str())?),
        None => None,
    };

    let observed = headcount_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .find(|m| match threshold_span {
            Some((start, end)) => m.start() < start || m.start() >= end,
            None => true,
        })
        .ok_or_else(|| PipelineError::data_format(record, "no observed headcount in narrative"))?;
    let observed_count = parse_count(record, "observed_count", observed.as_str())?;

    let location = if time_start == 0 {
        let rest = &text[time_end..];
        let cut = LOCATION_TERMINATORS
            .iter()
            .filter_map(|t| rest.find(t))
            .chain(headcount_re().find(rest).map(|m| m.start()))
            .min()
            .unwrap_or(rest.len());
        rest[..cut].trim()
    } else {
        let head = &text[..time_start];
        let cut = ["에서 ", "에 "]
            .iter()
            .filter_map(|t| head.find(t))
            .min()
            .unwrap_or(head.len());
        head[..cut].trim()
    };
    if location.is_empty() {
        return Err(PipelineError::data_format(record, "no location in narrative"));
    }

    Ok(ObservationRecord {
        time,
        location: location.to_string(),
        sub_zone: None,
        observed_count,
        threshold_count,
        narrative_input: text.to_string(),
    })
}

fn parse_count(record: &str, field: &str, raw: &str) -> Result<u32, PipelineError> {
    raw.parse::<u32>().map_err(|e| {
        PipelineError::data_format(record, format!("field `{field}` is not a valid count ({raw}): {e}"))
    })
}
