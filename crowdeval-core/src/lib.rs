//! # crowdeval-core
//!
//! Fine-tuning and evaluation harness for Korean seq2seq models.
//!
//! Compares FlanT5, KoBART and PKO-T5 on crowd-monitoring judgments. Each family
//! runs the same linear pipeline:
//!
//! 1. **Dataset Loader** reads observation/judgment records from CSV, TSV, JSON or JSONL
//! 2. **Example Formatter** renders the family's prompt template
//! 3. **Fine-Tuning Driver** trains through a [`backend::Seq2SeqBackend`] and checkpoints
//! 4. **Evaluation Driver** generates for held-out records and scores BLEU, ROUGE-L,
//!    token F1, exact match and numeric fidelity
//!
//! The model itself is opaque: [`backend::ProcessBackend`] drives an external
//! trainer, [`backend::MemoryBackend`] is an in-process reference model.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Data
pub mod data;
pub mod format;

// Model capability
pub mod backend;

// Training and evaluation
pub mod eval;
pub mod training;

pub mod pipeline;

// Re-exports
pub use backend::{MemoryBackend, ProcessBackend, ProcessBackendConfig, Seq2SeqBackend};
pub use config::{PipelineConfig, load_config};
pub use data::{DatasetLoader, TrainingExample};
pub use error::PipelineError;
pub use eval::{EvaluationReport, EvaluationResult};
pub use format::{Formatter, ModelFamily};
pub use pipeline::{ModelPipeline, backend_from_config};
pub use training::{RunManifest, TrainingRun};
