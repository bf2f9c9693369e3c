//! Layered configuration for the pipeline.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. user config `~/.config/crowdeval/config.toml`
//! 3. workspace config `<workspace>/.crowdeval/config.toml`
//! 4. an explicit `--config` file
//! 5. `CROWDEVAL_*` environment variables (`__` separates nested keys)
//! 6. dotted-key overrides from the command line

use crate::backend::ProcessBackendConfig;
use crate::data::loader::DatasetFormat;
use crate::data::record::DEFAULT_DOMAIN;
use crate::data::validate::GuidelineRatios;
use crate::error::PipelineError;
use crate::format::ModelFamily;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Per-family settings keyed by family name (`flant5`, `kobart`, `pko-t5`).
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// Dataset input and quality settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset files, concatenated in order.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Overrides extension-based format detection.
    #[serde(default)]
    pub format: Option<DatasetFormat>,
    #[serde(default = "default_domain")]
    pub default_domain: String,
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,
    #[serde(default = "default_seed")]
    pub split_seed: u64,
    /// Minimum quality score for `validate` to pass (0.0-1.0).
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub guideline: GuidelineRatios,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            format: None,
            default_domain: default_domain(),
            test_ratio: default_test_ratio(),
            split_seed: default_seed(),
            quality_threshold: default_quality_threshold(),
            guideline: GuidelineRatios::default(),
        }
    }
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}
fn default_test_ratio() -> f64 {
    0.2
}
fn default_seed() -> u64 {
    42
}
fn default_quality_threshold() -> f64 {
    0.8
}

/// Fine-tuning hyperparameters shared by all families.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Falls back to the family's learning rate when unset.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,
    /// Token limit for prompts and targets.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Reject over-long pairs instead of flagging them.
    #[serde(default)]
    pub strict_length: bool,
    #[serde(default = "default_save_every")]
    pub save_every_epochs: usize,
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Epochs without improvement before stopping; `None` disables early stopping.
    #[serde(default = "default_patience")]
    pub early_stopping_patience: Option<usize>,
    #[serde(default)]
    pub early_stopping_min_delta: f64,
    /// A loss this many times the running mean counts as a spike.
    #[serde(default = "default_spike_factor")]
    pub loss_spike_factor: f64,
    /// Root directory for training runs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: None,
            warmup_steps: default_warmup_steps(),
            weight_decay: default_weight_decay(),
            gradient_accumulation_steps: default_grad_accum(),
            max_length: default_max_length(),
            strict_length: false,
            save_every_epochs: default_save_every(),
            save_total_limit: default_save_total_limit(),
            seed: default_seed(),
            early_stopping_patience: default_patience(),
            early_stopping_min_delta: 0.0,
            loss_spike_factor: default_spike_factor(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_epochs() -> usize {
    5
}
fn default_batch_size() -> usize {
    2
}
fn default_warmup_steps() -> u64 {
    100
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_grad_accum() -> usize {
    4
}
fn default_max_length() -> usize {
    512
}
fn default_save_every() -> usize {
    1
}
fn default_save_total_limit() -> usize {
    3
}
fn default_patience() -> Option<usize> {
    Some(3)
}
fn default_spike_factor() -> f64 {
    10.0
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

/// Generation and scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// 1 means greedy decoding.
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    #[serde(default = "default_max_length")]
    pub max_new_tokens: usize,
    /// Cap on evaluated examples; falls back to the family default when unset.
    #[serde(default)]
    pub max_samples: Option<usize>,
    /// Number of per-sample results kept in the report.
    #[serde(default = "default_saved_samples")]
    pub saved_samples: usize,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            num_beams: default_num_beams(),
            max_new_tokens: default_max_length(),
            max_samples: None,
            saved_samples: default_saved_samples(),
            results_dir: default_results_dir(),
        }
    }
}

fn default_num_beams() -> usize {
    4
}
fn default_saved_samples() -> usize {
    10
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Which model backend runs training and generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process nearest-neighbour reference model.
    #[default]
    Memory,
    /// External trainer script.
    Process,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub process: ProcessBackendConfig,
}

/// Per-family overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub base_checkpoint: Option<String>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub label_smoothing: Option<f64>,
    /// Custom prompt template with `{domain}` / `{narrative}` placeholders.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub max_samples: Option<usize>,
}

impl PipelineConfig {
    /// Settings for `family`, empty when the config has none.
    pub fn model(&self, family: ModelFamily) -> ModelConfig {
        self.models
            .iter()
            .find(|(key, _)| key.parse::<ModelFamily>().ok() == Some(family))
            .map(|(_, model)| model.clone())
            .unwrap_or_default()
    }

    pub fn base_checkpoint(&self, family: ModelFamily) -> String {
        self.model(family)
            .base_checkpoint
            .unwrap_or_else(|| family.default_base_checkpoint().to_string())
    }

    /// Evaluation cap: family setting, then global setting, then the family default.
    pub fn max_samples(&self, family: ModelFamily) -> usize {
        self.model(family)
            .max_samples
            .or(self.evaluation.max_samples)
            .unwrap_or_else(|| family.default_eval_samples())
    }

    /// Reject settings no run could use.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Config(msg));
        if !(0.0..1.0).contains(&self.data.test_ratio) {
            return fail(format!("data.test_ratio must be in [0, 1), got {}", self.data.test_ratio));
        }
        if self.training.epochs == 0 {
            return fail("training.epochs must be at least 1".into());
        }
        if self.training.batch_size == 0 || self.training.gradient_accumulation_steps == 0 {
            return fail("training.batch_size and gradient_accumulation_steps must be at least 1".into());
        }
        if self.training.save_total_limit == 0 {
            return fail("training.save_total_limit must be at least 1".into());
        }
        if self.training.max_length == 0 {
            return fail("training.max_length must be at least 1".into());
        }
        if self.evaluation.num_beams == 0 {
            return fail("evaluation.num_beams must be at least 1".into());
        }
        let g = &self.data.guideline;
        let sum = g.congested + g.cautionary + g.normal;
        if (sum - 1.0).abs() > 1e-6 {
            return fail(format!("data.guideline ratios must sum to 1.0, got {sum}"));
        }
        let mut seen: BTreeMap<ModelFamily, &str> = BTreeMap::new();
        for key in self.models.keys() {
            let family = key
                .parse::<ModelFamily>()
                .map_err(|_| PipelineError::Config(format!("unknown model section `models.{key}`")))?;
            if let Some(previous) = seen.insert(family, key) {
                return fail(format!(
                    "model sections `models.{previous}` and `models.{key}` both configure {family}"
                ));
            }
        }
        Ok(())
    }

    /// Re-key `models` by canonical family name (`flan-t5` becomes `flant5`).
    pub fn canonicalize_models(&mut self) -> Result<(), PipelineError> {
        self.validate()?;
        let models = std::mem::take(&mut self.models);
        for (key, model) in models {
            let family = key.parse::<ModelFamily>()?;
            self.models.insert(family.name().to_string(), model);
        }
        Ok(())
    }
}

/// User-level config path, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "crowdeval", "crowdeval")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from every layer.
///
/// `overrides` are `(dotted.key, value)` pairs, e.g. `("training.epochs", 3)`.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: &[(String, serde_json::Value)],
) -> Result<PipelineConfig, PipelineError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".crowdeval").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // CROWDEVAL_TRAINING__EPOCHS, CROWDEVAL_BACKEND__KIND, ...
    figment = figment.merge(Env::prefixed("CROWDEVAL_").split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value));
    }

    let mut config: PipelineConfig = figment
        .extract()
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    config.canonicalize_models()?;
    Ok(config)
}

/// Parse a `key=value` override. The value is read as JSON when it parses,
/// otherwise kept as a string.
pub fn parse_override(raw: &str) -> Result<(String, serde_json::Value), PipelineError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| PipelineError::Config(format!("override `{raw}` is not key=value")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(PipelineError::Config(format!("override `{raw}` has an empty key")));
    }
    let value = value.trim();
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}
