//! Deterministic in-process reference model.
//!
//! "Training" memorizes (prompt, target) pairs; generation returns the target
//! of the most similar memorized prompt. The epoch loss is the mean of
//! `1 - token_f1(recalled, target)` before each pair is memorized, so it falls
//! as the memory fills. This exercises the whole pipeline without GPUs.

use super::{
    CheckpointSource, DecodingConfig, FineTuneOutcome, ModelHandle, Seq2SeqBackend,
    TrainingObserver, resolve_checkpoint,
};
use crate::error::PipelineError;
use crate::eval::metrics::token_f1;
use crate::eval::normalize::tokens;
use crate::format::{FormattedPair, ModelFamily};
use crate::persistence::{atomic_write_json, load_json};
use crate::training::{Hyperparameters, SeedManager};
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub const WEIGHTS_FILE: &str = "memory_weights.json";

/// Loaded models kept in memory at once.
const MAX_CACHED_MODELS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MemoryEntry {
    prompt: String,
    target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryWeights {
    entries: Vec<MemoryEntry>,
}

impl MemoryWeights {
    fn recall(&self, prompt: &str) -> Option<&str> {
        let query = tokens(prompt).join(" ");
        let mut best: Option<(&MemoryEntry, f64)> = None;
        for entry in &self.entries {
            let score = token_f1(&query, &entry.prompt);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((entry, score));
            }
        }
        best.map(|(entry, _)| entry.target.as_str())
    }

    fn memorize(&mut self, pair: &FormattedPair) {
        let known = self
            .entries
            .iter()
            .any(|e| e.prompt == pair.prompt && e.target == pair.target);
        if !known {
            self.entries.push(MemoryEntry {
                prompt: pair.prompt.clone(),
                target: pair.target.clone(),
            });
        }
    }

    fn save(&self, dir: &Path) -> Result<(), PipelineError> {
        atomic_write_json(&dir.join(WEIGHTS_FILE), self)
    }
}

/// Loaded weights keyed by checkpoint location, oldest evicted first.
#[derive(Default)]
struct ModelCache {
    models: HashMap<String, Arc<MemoryWeights>>,
    order: VecDeque<String>,
}

impl ModelCache {
    fn get(&self, key: &str) -> Option<Arc<MemoryWeights>> {
        self.models.get(key).cloned()
    }

    fn insert(&mut self, key: String, weights: Arc<MemoryWeights>) {
        if self.models.insert(key.clone(), weights).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > MAX_CACHED_MODELS {
            if let Some(oldest) = self.order.pop_front() {
                self.models.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.models.len()
    }
}

fn cache_key(source: &CheckpointSource) -> String {
    match source {
        CheckpointSource::Pretrained { id } => format!("pretrained:{id}"),
        CheckpointSource::Local { dir } => format!("local:{}", dir.display()),
    }
}

/// Nearest-neighbour retrieval model.
#[derive(Default)]
pub struct MemoryBackend {
    models: RwLock<ModelCache>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn weights(&self, handle: &ModelHandle) -> Result<Arc<MemoryWeights>, PipelineError> {
        let key = cache_key(&handle.source);
        if let Some(weights) = self.models.read().await.get(&key) {
            return Ok(weights);
        }
        let weights = Arc::new(read_weights(&handle.source)?);
        self.models.write().await.insert(key, weights.clone());
        Ok(weights)
    }
}

fn read_weights(source: &CheckpointSource) -> Result<MemoryWeights, PipelineError> {
    match source {
        CheckpointSource::Pretrained { .. } => Ok(MemoryWeights::default()),
        CheckpointSource::Local { dir } => load_json(&dir.join(WEIGHTS_FILE))
            .map_err(|e| PipelineError::model_load(format!("unreadable weights in {}: {e}", dir.display())))?
            .ok_or_else(|| {
                PipelineError::model_load(format!("{} has no {WEIGHTS_FILE}", dir.display()))
            }),
    }
}

#[async_trait]
impl Seq2SeqBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, family: ModelFamily, checkpoint: &str) -> Result<ModelHandle, PipelineError> {
        let handle = resolve_checkpoint(family, self.name(), checkpoint)?;
        let weights = read_weights(&handle.source)?;
        debug!(checkpoint, entries = weights.entries.len(), "Loaded memory model");
        self.models
            .write()
            .await
            .insert(cache_key(&handle.source), Arc::new(weights));
        Ok(handle)
    }

    async fn fine_tune(
        &self,
        handle: &ModelHandle,
        pairs: &[FormattedPair],
        params: &Hyperparameters,
        output_dir: &Path,
        observer: &mut dyn TrainingObserver,
    ) -> Result<FineTuneOutcome, PipelineError> {
        let mut weights = (*self.weights(handle).await?).clone();
        let mut seeds = SeedManager::new(params.seed);
        let steps_per_epoch = params.steps_per_epoch(pairs.len());
        let mut epochs_completed = 0;

        for epoch in 1..=params.epochs {
            let mut order: Vec<usize> = (0..pairs.len()).collect();
            let mut rng = StdRng::seed_from_u64(seeds.seed_for(&format!("epoch-{epoch}")));
            order.shuffle(&mut rng);

            let mut total = 0.0;
            for &i in &order {
                let pair = &pairs[i];
                let recalled = weights.recall(&pair.prompt).unwrap_or("");
                total += 1.0 - token_f1(recalled, &pair.target);
                weights.memorize(pair);
            }
            let loss = if pairs.is_empty() { 0.0 } else { total / pairs.len() as f64 };
            epochs_completed = epoch;
            debug!(epoch, loss, steps = steps_per_epoch, "Memory epoch");

            let directive = observer.on_epoch_end(epoch, loss)?;
            if let Some(dir) = &directive.save_to {
                weights.save(dir)?;
                observer.on_checkpoint_saved(epoch, loss, dir)?;
            }
            if directive.stop {
                break;
            }
            tokio::task::yield_now().await;
        }

        let final_dir = output_dir.join("final");
        weights.save(&final_dir)?;
        let trained = ModelHandle::new(
            handle.family,
            self.name(),
            handle.base_model.clone(),
            CheckpointSource::Local { dir: final_dir },
        );
        self.models
            .write()
            .await
            .insert(cache_key(&trained.source), Arc::new(weights));

        Ok(FineTuneOutcome {
            handle: trained,
            epochs_completed,
            steps: steps_per_epoch * epochs_completed as u64,
        })
    }

    async fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        _decoding: &DecodingConfig,
    ) -> Result<String, PipelineError> {
        let weights = self.weights(handle).await?;
        Ok(weights.recall(prompt).unwrap_or("").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DecodingStrategy, EpochDirective};
    use crate::config::{ModelConfig, TrainingConfig};
    use tempfile::TempDir;

    struct Recorder {
        losses: Vec<f64>,
        save_root: std::path::PathBuf,
        saved: Vec<usize>,
    }

    impl TrainingObserver for Recorder {
        fn on_epoch_end(&mut self, epoch: usize, loss: f64) -> Result<EpochDirective, PipelineError> {
            self.losses.push(loss);
            Ok(EpochDirective {
                save_to: Some(self.save_root.join(format!("ckpt-{epoch}"))),
                stop: false,
            })
        }

        fn on_checkpoint_saved(&mut self, epoch: usize, _loss: f64, dir: &Path) -> Result<(), PipelineError> {
            assert!(dir.join(WEIGHTS_FILE).exists());
            self.saved.push(epoch);
            Ok(())
        }
    }

    fn pairs() -> Vec<FormattedPair> {
        vec![
            FormattedPair {
                example_id: "a".into(),
                prompt: "14:22 백화점 28명 기준 20명".into(),
                target: "기준 20명을 8명 초과했습니다. 우회 경로 안내를 권장합니다.".into(),
                violations: Vec::new(),
            },
            FormattedPair {
                example_id: "b".into(),
                prompt: "09:05 터미널 대합실 41명 기준 미설정".into(),
                target: "기준 미설정 상태로 41명이 있습니다. 관찰이 필요합니다.".into(),
                violations: Vec::new(),
            },
        ]
    }

    fn decoding() -> DecodingConfig {
        DecodingConfig {
            strategy: DecodingStrategy::Greedy,
            max_new_tokens: 64,
        }
    }

    #[tokio::test]
    async fn test_fine_tune_memorizes_and_loss_falls() {
        let tmp = TempDir::new().unwrap();
        let backend = MemoryBackend::new();
        let handle = backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        let params = Hyperparameters::resolve(
            &TrainingConfig { epochs: 3, ..TrainingConfig::default() },
            &ModelConfig::default(),
            ModelFamily::FlanT5,
        );
        let mut recorder = Recorder {
            losses: Vec::new(),
            save_root: tmp.path().to_path_buf(),
            saved: Vec::new(),
        };
        let outcome = backend
            .fine_tune(&handle, &pairs(), &params, tmp.path(), &mut recorder)
            .await
            .unwrap();

        assert_eq!(outcome.epochs_completed, 3);
        assert_eq!(recorder.saved, vec![1, 2, 3]);
        assert!(recorder.losses[0] > 0.0);
        assert_eq!(recorder.losses[1], 0.0);

        let text = backend
            .generate(&outcome.handle, "14:22 백화점 28명 기준 20명", &decoding())
            .await
            .unwrap();
        assert!(text.contains("8명 초과"));
    }

    #[tokio::test]
    async fn test_untrained_model_generates_empty_text() {
        let backend = MemoryBackend::new();
        let handle = backend.load(ModelFamily::KoBart, "gogamza/kobart-base-v2").await.unwrap();
        let text = backend.generate(&handle, "아무 입력", &decoding()).await.unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_model_cache_is_keyed_by_checkpoint_and_bounded() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        }
        assert_eq!(backend.models.read().await.len(), 1);

        for i in 0..10 {
            backend
                .load(ModelFamily::KoBart, &format!("local-org/kobart-{i}"))
                .await
                .unwrap();
        }
        assert_eq!(backend.models.read().await.len(), MAX_CACHED_MODELS);
    }

    #[tokio::test]
    async fn test_evicted_model_reloads_from_disk() {
        let tmp = TempDir::new().unwrap();
        let backend = MemoryBackend::new();
        let handle = backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        let params = Hyperparameters::resolve(
            &TrainingConfig { epochs: 1, ..TrainingConfig::default() },
            &ModelConfig::default(),
            ModelFamily::FlanT5,
        );
        let mut recorder = Recorder {
            losses: Vec::new(),
            save_root: tmp.path().to_path_buf(),
            saved: Vec::new(),
        };
        let outcome = backend
            .fine_tune(&handle, &pairs(), &params, tmp.path(), &mut recorder)
            .await
            .unwrap();

        for i in 0..MAX_CACHED_MODELS {
            backend
                .load(ModelFamily::FlanT5, &format!("local-org/flan-{i}"))
                .await
                .unwrap();
        }
        let text = backend
            .generate(&outcome.handle, "09:05 터미널 대합실 41명 기준 미설정", &decoding())
            .await
            .unwrap();
        assert!(text.contains("41명"));
    }

    #[tokio::test]
    async fn test_local_checkpoint_without_weights_fails_to_load() {
        let tmp = TempDir::new().unwrap();
        crate::backend::CheckpointDescriptor {
            family: ModelFamily::FlanT5,
            base_model: "google/flan-t5-small".into(),
            backend: "memory".into(),
            epoch: Some(1),
            created_at: chrono::Utc::now(),
        }
        .write(tmp.path())
        .unwrap();
        let err = MemoryBackend::new()
            .load(ModelFamily::FlanT5, tmp.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }
}
