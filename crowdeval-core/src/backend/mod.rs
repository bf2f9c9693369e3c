//! The pretrained seq2seq model as an opaque capability.
//!
//! A backend loads a checkpoint, fine-tunes it on formatted pairs and generates
//! text. Two implementations ship: [`ProcessBackend`] drives an external trainer
//! script, [`MemoryBackend`] is a deterministic in-process reference model.

pub mod memory;
pub mod process;

pub use memory::MemoryBackend;
pub use process::{ProcessBackend, ProcessBackendConfig};

use crate::error::PipelineError;
use crate::format::{FormattedPair, ModelFamily};
use crate::persistence::{atomic_write_json, load_json};
use crate::training::Hyperparameters;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

/// Descriptor written into every checkpoint directory this harness produces.
pub const DESCRIPTOR_FILE: &str = "crowdeval.json";

/// Identifies a checkpoint directory: which family, base model and backend made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDescriptor {
    pub family: ModelFamily,
    pub base_model: String,
    pub backend: String,
    pub epoch: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl CheckpointDescriptor {
    pub fn write(&self, dir: &Path) -> Result<(), PipelineError> {
        atomic_write_json(&dir.join(DESCRIPTOR_FILE), self)
    }

    pub fn read(dir: &Path) -> Result<Option<Self>, PipelineError> {
        load_json(&dir.join(DESCRIPTOR_FILE))
    }
}

/// Where a loaded model's weights come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointSource {
    /// A pretrained model id such as `google/flan-t5-small`.
    Pretrained { id: String },
    /// A fine-tuned checkpoint directory produced by this harness.
    Local { dir: PathBuf },
}

/// A loaded model. Cheap to clone; the backend owns the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub id: String,
    pub family: ModelFamily,
    pub backend: String,
    pub base_model: String,
    pub source: CheckpointSource,
}

impl ModelHandle {
    pub fn new(family: ModelFamily, backend: &str, base_model: String, source: CheckpointSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            family,
            backend: backend.to_string(),
            base_model,
            source,
        }
    }

    /// Checkpoint identifier as given to the backend.
    pub fn checkpoint_ref(&self) -> String {
        match &self.source {
            CheckpointSource::Pretrained { id } => id.clone(),
            CheckpointSource::Local { dir } => dir.display().to_string(),
        }
    }
}

fn pretrained_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*/[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

/// Validate a checkpoint reference before any work starts.
///
/// An existing path must be a directory carrying a descriptor for the same
/// family and backend. Anything else must look like a pretrained model id.
pub fn resolve_checkpoint(
    family: ModelFamily,
    backend: &str,
    checkpoint: &str,
) -> Result<ModelHandle, PipelineError> {
    let path = Path::new(checkpoint);
    if path.exists() {
        if !path.is_dir() {
            return Err(PipelineError::model_load(format!(
                "checkpoint {checkpoint} is not a directory"
            )));
        }
        let descriptor = CheckpointDescriptor::read(path)
            .map_err(|e| PipelineError::model_load(format!("unreadable descriptor in {checkpoint}: {e}")))?
            .ok_or_else(|| {
                PipelineError::model_load(format!("{checkpoint} has no {DESCRIPTOR_FILE}; not a crowdeval checkpoint"))
            })?;
        if descriptor.family != family {
            return Err(PipelineError::model_load(format!(
                "checkpoint {checkpoint} was trained for {}, not {family}",
                descriptor.family
            )));
        }
        if descriptor.backend != backend {
            return Err(PipelineError::model_load(format!(
                "checkpoint {checkpoint} was produced by the {} backend, not {backend}",
                descriptor.backend
            )));
        }
        return Ok(ModelHandle::new(
            family,
            backend,
            descriptor.base_model,
            CheckpointSource::Local {
                dir: path.to_path_buf(),
            },
        ));
    }

    if pretrained_id_re().is_match(checkpoint) {
        return Ok(ModelHandle::new(
            family,
            backend,
            checkpoint.to_string(),
            CheckpointSource::Pretrained {
                id: checkpoint.to_string(),
            },
        ));
    }

    Err(PipelineError::model_load(format!(
        "checkpoint {checkpoint} does not exist and is not a pretrained model id"
    )))
}

/// Decoding used at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DecodingStrategy {
    Greedy,
    Beam { num_beams: usize },
}

impl DecodingStrategy {
    /// One beam is greedy decoding.
    pub fn from_beams(num_beams: usize) -> Self {
        if num_beams <= 1 {
            Self::Greedy
        } else {
            Self::Beam { num_beams }
        }
    }

    pub fn num_beams(&self) -> usize {
        match self {
            Self::Greedy => 1,
            Self::Beam { num_beams } => *num_beams,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodingConfig {
    pub strategy: DecodingStrategy,
    pub max_new_tokens: usize,
}

/// One generated text and how long it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub latency_ms: f64,
}

/// What the driver wants done after an epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochDirective {
    /// Save weights into this directory before continuing.
    pub save_to: Option<PathBuf>,
    /// End training after this epoch.
    pub stop: bool,
}

/// Receives training progress from a backend.
pub trait TrainingObserver: Send {
    fn on_epoch_end(&mut self, epoch: usize, loss: f64) -> Result<EpochDirective, PipelineError>;

    /// Called once weights requested via [`EpochDirective::save_to`] are on disk.
    /// An error here aborts training.
    fn on_checkpoint_saved(&mut self, epoch: usize, loss: f64, dir: &Path) -> Result<(), PipelineError>;
}

/// Summary a backend returns after fine-tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneOutcome {
    /// Handle to the final weights, saved under `<output_dir>/final`.
    pub handle: ModelHandle,
    pub epochs_completed: usize,
    pub steps: u64,
}

/// Seq2seq model capability.
#[async_trait]
pub trait Seq2SeqBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve and load a checkpoint. Fails with `ModelLoad` before any work.
    async fn load(&self, family: ModelFamily, checkpoint: &str) -> Result<ModelHandle, PipelineError>;

    /// Fine-tune `handle` on `pairs`, writing checkpoints under `output_dir`.
    async fn fine_tune(
        &self,
        handle: &ModelHandle,
        pairs: &[FormattedPair],
        params: &Hyperparameters,
        output_dir: &Path,
        observer: &mut dyn TrainingObserver,
    ) -> Result<FineTuneOutcome, PipelineError>;

    async fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        decoding: &DecodingConfig,
    ) -> Result<String, PipelineError>;

    /// Generate for each prompt in order.
    async fn generate_batch(
        &self,
        handle: &ModelHandle,
        prompts: &[String],
        decoding: &DecodingConfig,
    ) -> Result<Vec<Generation>, PipelineError> {
        let mut out = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let started = Instant::now();
            let text = self.generate(handle, prompt, decoding).await?;
            out.push(Generation {
                text,
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
        }
        Ok(out)
    }
}
