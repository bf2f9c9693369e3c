//! Dataset loading from CSV / TSV / JSON / JSONL storage.
//!
//! Two row schemas are accepted:
//! - structured: `time, location, observed_count, threshold_count, narrative_input,
//!   judgment_text` (plus optional `sub_zone`, `situation_class`, `domain`);
//! - legacy: `Input, Output, Domain`, where the observation fields are parsed out of
//!   the narrative.
//!
//! A row that declares any structured field is held to the structured schema; no
//! missing field is ever defaulted.

use crate::data::narrative::{extract_numbers, parse_narrative};
use crate::data::record::{
    DEFAULT_DOMAIN, JudgmentRecord, ObservationRecord, SituationClass, TrainingExample,
};
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk dataset format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    Csv,
    Tsv,
    Json,
    Jsonl,
}

impl DatasetFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::Jsonl),
            _ => None,
        }
    }
}

const STRUCTURED_FIELDS: &[&str] = &["time", "location", "observed_count", "threshold_count"];

/// A raw row with lower-cased column names. Empty cells are `Null`.
type RawRow = BTreeMap<String, Value>;

/// Reads training examples from dataset files.
#[derive(Debug, Clone, Default)]
pub struct DatasetLoader {
    /// Forces a format instead of detecting it from the extension.
    pub format: Option<DatasetFormat>,
    /// Domain label for rows without a `domain` column.
    pub default_domain: Option<String>,
}

impl DatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: DatasetFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_default_domain(mut self, domain: impl Into<String>) -> Self {
        self.default_domain = Some(domain.into());
        self
    }

    /// Load one dataset file, preserving row order.
    pub fn load(&self, path: &Path) -> Result<Vec<TrainingExample>, PipelineError> {
        let format = self
            .format
            .or_else(|| DatasetFormat::from_path(path))
            .ok_or_else(|| {
                PipelineError::invalid_input(format!(
                    "cannot detect dataset format of {} (expected .csv, .tsv, .json or .jsonl)",
                    path.display()
                ))
            })?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let rows = match format {
            DatasetFormat::Csv => read_delimited(path, &source, b',')?,
            DatasetFormat::Tsv => read_delimited(path, &source, b'\t')?,
            DatasetFormat::Json => read_json(path, &source)?,
            DatasetFormat::Jsonl => read_jsonl(path, &source)?,
        };
        debug!(file = %path.display(), rows = rows.len(), ?format, "Read dataset rows");

        let examples = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| self.example_from_row(&format!("{source}#{i}"), &row))
            .collect::<Result<Vec<_>, _>>()?;

        info!(file = %path.display(), examples = examples.len(), "Loaded dataset");
        Ok(examples)
    }

    /// Load several files and concatenate them in argument order.
    pub fn load_many(&self, paths: &[PathBuf]) -> Result<Vec<TrainingExample>, PipelineError> {
        let mut all = Vec::new();
        for path in paths {
            all.extend(self.load(path)?);
        }
        if all.is_empty() {
            return Err(PipelineError::invalid_input(
                "no training examples found in the given dataset files",
            ));
        }
        Ok(all)
    }

    fn example_from_row(&self, id: &str, row: &RawRow) -> Result<TrainingExample, PipelineError> {
        let structured = STRUCTURED_FIELDS.iter().any(|f| row.contains_key(*f));

        let narrative = optional_text(row, &["narrative_input", "input"])
            .ok_or_else(|| missing(id, "narrative_input"))?;
        let judgment_text = optional_text(row, &["judgment_text", "output"])
            .ok_or_else(|| missing(id, "judgment_text"))?;

        let observation = if structured {
            ObservationRecord {
                time: optional_text(row, &["time"]).ok_or_else(|| missing(id, "time"))?,
                location: optional_text(row, &["location"])
                    .ok_or_else(|| missing(id, "location"))?,
                sub_zone: optional_text(row, &["sub_zone"]),
                observed_count: count_field(id, row, "observed_count")?
                    .ok_or_else(|| missing(id, "observed_count"))?,
                threshold_count: count_field(id, row, "threshold_count")?,
                narrative_input: narrative,
            }
        } else {
            parse_narrative(id, &narrative)?
        };

        let situation_class = match optional_text(row, &["situation_class"]) {
            Some(label) => SituationClass::parse(&label).ok_or_else(|| {
                PipelineError::data_format(id, format!("unknown situation_class `{label}`"))
            })?,
            None => observation.situation_class(),
        };
        let referenced_threshold = observation
            .threshold_count
            .filter(|t| extract_numbers(&judgment_text).contains(t));

        let domain = optional_text(row, &["domain"])
            .or_else(|| self.default_domain.clone())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());

        Ok(TrainingExample {
            id: id.to_string(),
            domain,
            observation,
            judgment: JudgmentRecord {
                situation_class,
                action_text: judgment_text,
                referenced_threshold,
            },
        })
    }
}

fn missing(id: &str, field: &str) -> PipelineError {
    PipelineError::data_format(id, format!("missing required field `{field}`"))
}

/// First non-empty text value among `keys`.
fn optional_text(row: &RawRow, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match row.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A non-negative integer count. `Ok(None)` when the cell is absent or empty.
fn count_field(id: &str, row: &RawRow, field: &str) -> Result<Option<u32>, PipelineError> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| not_a_count(id, field, s)),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| not_a_count(id, field, n)),
        Some(other) => Err(not_a_count(id, field, other)),
    }
}

fn not_a_count(id: &str, field: &str, raw: impl std::fmt::Display) -> PipelineError {
    PipelineError::data_format(id, format!("field `{field}` is not a non-negative integer: {raw}"))
}

/// A parse failure inside a delimited file, tied to the row it broke on.
fn csv_error(id: &str, err: csv::Error) -> PipelineError {
    if err.is_io_error() {
        return PipelineError::Csv(err);
    }
    let line = err.position().map(|pos| pos.line());
    let message = match err.kind() {
        csv::ErrorKind::UnequalLengths { expected_len, len, .. } => {
            format!("row has {len} fields, header has {expected_len}")
        }
        _ => format!("malformed row: {err}"),
    };
    match line {
        Some(line) => PipelineError::data_format(id, format!("{message} (line {line})")),
        None => PipelineError::data_format(id, message),
    }
}

fn invalid_json(id: &str, err: &serde_json::Error) -> PipelineError {
    PipelineError::data_format(
        id,
        format!("invalid JSON at line {}, column {}: {err}", err.line(), err.column()),
    )
}

fn read_delimited(path: &Path, source: &str, delimiter: u8) -> Result<Vec<RawRow>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(&format!("{source}#header"), e))?
        .iter()
        .map(|h| {
            h.trim_start_matches('\u{feff}')
                .trim()
                .trim_matches('"')
                .to_lowercase()
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| csv_error(&format!("{source}#{}", rows.len()), e))?;
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (h.clone(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn read_json(path: &Path, source: &str) -> Result<Vec<RawRow>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(content.trim_start_matches('\u{feff}'))
        .map_err(|e| invalid_json(source, &e))?;
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => {
            return Err(PipelineError::data_format(
                source,
                "JSON dataset must be an array of objects or a single object",
            ));
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| object_row(&format!("{source}#{i}"), item))
        .collect()
}

fn read_jsonl(path: &Path, source: &str) -> Result<Vec<RawRow>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in content.lines() {
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }
        let id = format!("{source}#{}", rows.len());
        let value: Value = serde_json::from_str(line)
            .map_err(|e| invalid_json(&id, &e))?;
        rows.push(object_row(&id, value)?);
    }
    Ok(rows)
}

fn object_row(id: &str, value: Value) -> Result<RawRow, PipelineError> {
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect()),
        _ => Err(PipelineError::data_format(id, "record is not a JSON object")),
    }
}
