//! External trainer process backend.
//!
//! Runs `<program> [script] [args..] train|generate <request.json>`. The
//! process reports progress as JSON lines on stdout, tagged by `event`:
//!
//! - `{"event":"epoch","epoch":1,"loss":0.42}` then waits for one directive
//!   line on stdin: `{"save_to":"/path"|null,"stop":false}`
//! - `{"event":"saved","epoch":1,"path":"/path"}` once a requested checkpoint is written
//! - `{"event":"done","epochs":3,"steps":120}` after the final weights are in `final_dir`
//! - `{"event":"generation","index":0,"text":"..","latency_ms":12.5}`
//! - `{"event":"error","kind":"oom","message":".."}`
//! - `{"event":"log","message":".."}`
//!
//! Lines that are not JSON are logged and ignored.

use super::{
    CheckpointSource, DecodingConfig, FineTuneOutcome, Generation, ModelHandle, Seq2SeqBackend,
    TrainingObserver, resolve_checkpoint,
};
use crate::error::PipelineError;
use crate::format::{FormattedPair, ModelFamily};
use crate::persistence::{atomic_write, atomic_write_json};
use crate::training::Hyperparameters;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// How to launch the trainer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessBackendConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Script passed as the first argument, e.g. `trainer.py`.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_train_timeout_secs")]
    pub train_timeout_secs: u64,
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    /// Extra environment for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: None,
            args: Vec::new(),
            working_dir: None,
            train_timeout_secs: default_train_timeout_secs(),
            generate_timeout_secs: default_generate_timeout_secs(),
            env: BTreeMap::new(),
        }
    }
}

fn default_program() -> PathBuf {
    PathBuf::from("python3")
}
fn default_train_timeout_secs() -> u64 {
    86_400
}
fn default_generate_timeout_secs() -> u64 {
    3_600
}

impl ProcessBackendConfig {
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_train_timeout(mut self, timeout: Duration) -> Self {
        self.train_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_generate_timeout(mut self, timeout: Duration) -> Self {
        self.generate_timeout_secs = timeout.as_secs().max(1);
        self
    }
}

#[derive(Debug, Serialize)]
struct TrainRequest<'a> {
    family: ModelFamily,
    base_model: &'a str,
    checkpoint: String,
    pairs_path: PathBuf,
    output_dir: &'a Path,
    final_dir: PathBuf,
    hyperparameters: &'a Hyperparameters,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    family: ModelFamily,
    base_model: &'a str,
    checkpoint: String,
    decoding: &'a DecodingConfig,
    prompts: &'a [String],
}

#[derive(Debug, Serialize)]
struct PairLine<'a> {
    id: &'a str,
    prompt: &'a str,
    target: &'a str,
}

#[derive(Debug, Serialize)]
struct DirectiveLine<'a> {
    save_to: Option<&'a Path>,
    stop: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrainerEvent {
    Epoch { epoch: usize, loss: f64 },
    Saved { epoch: usize, path: PathBuf },
    Done { epochs: usize, steps: u64 },
    Generation { index: usize, text: String, latency_ms: f64 },
    Error { kind: String, message: String },
    Log { message: String },
}

#[derive(Debug, Default)]
struct TrainReport {
    epochs: usize,
    steps: Option<u64>,
}

/// Backend that delegates to an external trainer.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    fn command(&self, mode: &str, request: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        if let Some(script) = &self.config.script {
            cmd.arg(script);
        }
        cmd.args(&self.config.args).arg(mode).arg(request);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.config.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child, PipelineError> {
        cmd.spawn().map_err(|e| {
            PipelineError::backend(format!(
                "failed to spawn {}: {e}",
                self.config.program.display()
            ))
        })
    }
}

fn collect_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    })
}

fn event_error(kind: &str, message: String) -> PipelineError {
    match kind {
        "oom" | "resource_exhausted" => PipelineError::resource_exhausted(message),
        "model_load" => PipelineError::model_load(message),
        _ => PipelineError::backend(format!("{kind}: {message}")),
    }
}

/// Map a failed exit to an error kind using the process's stderr.
fn classify_failure(status: ExitStatus, stderr: &str) -> PipelineError {
    let tail: String = {
        let lines: Vec<&str> = stderr.lines().collect();
        lines[lines.len().saturating_sub(5)..].join("\n")
    };
    let oom = ["out of memory", "OutOfMemoryError", "MemoryError"];
    if oom.iter().any(|p| stderr.contains(p)) {
        return PipelineError::resource_exhausted(format!("trainer ran out of memory: {tail}"));
    }
    if stderr.contains("No space left on device") {
        return PipelineError::resource_exhausted(format!("storage full: {tail}"));
    }
    PipelineError::backend(format!("trainer exited with {status}: {tail}"))
}

fn parse_event(line: &str) -> Option<TrainerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(event) => Some(event),
        Err(_) => {
            debug!(line = trimmed, "Trainer output");
            None
        }
    }
}

async fn read_training_events(
    stdout: ChildStdout,
    stdin: &mut ChildStdin,
    observer: &mut dyn TrainingObserver,
) -> Result<TrainReport, PipelineError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut report = TrainReport::default();
    let mut losses: HashMap<usize, f64> = HashMap::new();

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_event(&line) else {
            continue;
        };
        match event {
            TrainerEvent::Epoch { epoch, loss } => {
                report.epochs = epoch;
                losses.insert(epoch, loss);
                let directive = observer.on_epoch_end(epoch, loss)?;
                let mut reply = serde_json::to_string(&DirectiveLine {
                    save_to: directive.save_to.as_deref(),
                    stop: directive.stop,
                })?;
                reply.push('\n');
                if let Err(e) = stdin.write_all(reply.as_bytes()).await {
                    warn!(error = %e, "Trainer closed stdin");
                    break;
                }
                let _ = stdin.flush().await;
            }
            TrainerEvent::Saved { epoch, path } => {
                let loss = losses.get(&epoch).copied().unwrap_or(f64::NAN);
                observer.on_checkpoint_saved(epoch, loss, &path)?;
            }
            TrainerEvent::Done { epochs, steps } => {
                report.epochs = epochs;
                report.steps = Some(steps);
            }
            TrainerEvent::Error { kind, message } => return Err(event_error(&kind, message)),
            TrainerEvent::Log { message } => info!(target: "trainer", "{message}"),
            TrainerEvent::Generation { .. } => {}
        }
    }
    Ok(report)
}

async fn read_generation_events(
    stdout: ChildStdout,
    expected: usize,
) -> Result<Vec<Option<Generation>>, PipelineError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut out: Vec<Option<Generation>> = vec![None; expected];
    while let Some(line) = lines.next_line().await? {
        match parse_event(&line) {
            Some(TrainerEvent::Generation { index, text, latency_ms }) => {
                let slot = out.get_mut(index).ok_or_else(|| {
                    PipelineError::backend(format!("generation index {index} out of range"))
                })?;
                *slot = Some(Generation { text, latency_ms });
            }
            Some(TrainerEvent::Error { kind, message }) => return Err(event_error(&kind, message)),
            Some(TrainerEvent::Log { message }) => info!(target: "trainer", "{message}"),
            _ => {}
        }
    }
    Ok(out)
}

#[async_trait]
impl Seq2SeqBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn load(&self, family: ModelFamily, checkpoint: &str) -> Result<ModelHandle, PipelineError> {
        resolve_checkpoint(family, self.name(), checkpoint)
    }

    async fn fine_tune(
        &self,
        handle: &ModelHandle,
        pairs: &[FormattedPair],
        params: &Hyperparameters,
        output_dir: &Path,
        observer: &mut dyn TrainingObserver,
    ) -> Result<FineTuneOutcome, PipelineError> {
        let pairs_path = output_dir.join("train_pairs.jsonl");
        let mut jsonl = String::new();
        for pair in pairs {
            jsonl.push_str(&serde_json::to_string(&PairLine {
                id: &pair.example_id,
                prompt: &pair.prompt,
                target: &pair.target,
            })?);
            jsonl.push('\n');
        }
        atomic_write(&pairs_path, jsonl.as_bytes())?;

        let final_dir = output_dir.join("final");
        let request_path = output_dir.join("train_request.json");
        atomic_write_json(
            &request_path,
            &TrainRequest {
                family: handle.family,
                base_model: &handle.base_model,
                checkpoint: handle.checkpoint_ref(),
                pairs_path,
                output_dir,
                final_dir: final_dir.clone(),
                hyperparameters: params,
            },
        )?;

        let mut cmd = self.command("train", &request_path);
        cmd.stdin(Stdio::piped());
        let mut child = self.spawn(cmd)?;
        let stderr = collect_stderr(&mut child);
        let (Some(stdout), Some(mut stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(PipelineError::backend("trainer stdio was not captured"));
        };

        let timeout = Duration::from_secs(self.config.train_timeout_secs);
        info!(program = %self.config.program.display(), pairs = pairs.len(), "Launching trainer");
        let result = tokio::time::timeout(timeout, async {
            let report = read_training_events(stdout, &mut stdin, observer).await?;
            drop(stdin);
            let status = child.wait().await?;
            Ok::<_, PipelineError>((report, status))
        })
        .await;

        let (report, status) = match result {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PipelineError::Timeout(format!(
                    "trainer did not finish within {}s",
                    timeout.as_secs()
                )));
            }
        };
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(classify_failure(status, &stderr));
        }
        let Some(steps) = report.steps else {
            return Err(PipelineError::backend("trainer exited without a done event"));
        };
        if !final_dir.is_dir() {
            return Err(PipelineError::backend(format!(
                "trainer reported done but {} was not written",
                final_dir.display()
            )));
        }

        Ok(FineTuneOutcome {
            handle: ModelHandle::new(
                handle.family,
                self.name(),
                handle.base_model.clone(),
                CheckpointSource::Local { dir: final_dir },
            ),
            epochs_completed: report.epochs,
            steps,
        })
    }

    async fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &str,
        decoding: &DecodingConfig,
    ) -> Result<String, PipelineError> {
        let mut out = self
            .generate_batch(handle, &[prompt.to_string()], decoding)
            .await?;
        Ok(out.pop().map(|g| g.text).unwrap_or_default())
    }

    async fn generate_batch(
        &self,
        handle: &ModelHandle,
        prompts: &[String],
        decoding: &DecodingConfig,
    ) -> Result<Vec<Generation>, PipelineError> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let work_dir = std::env::temp_dir().join(format!("crowdeval-generate-{}", uuid::Uuid::new_v4()));
        let request_path = work_dir.join("generate_request.json");
        atomic_write_json(
            &request_path,
            &GenerateRequest {
                family: handle.family,
                base_model: &handle.base_model,
                checkpoint: handle.checkpoint_ref(),
                decoding,
                prompts,
            },
        )?;

        let mut cmd = self.command("generate", &request_path);
        cmd.stdin(Stdio::null());
        let result = self.run_generation(cmd, prompts.len()).await;
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            debug!(error = %e, dir = %work_dir.display(), "Could not remove generation request");
        }
        result
    }
}

impl ProcessBackend {
    async fn run_generation(&self, cmd: Command, expected: usize) -> Result<Vec<Generation>, PipelineError> {
        let mut child = self.spawn(cmd)?;
        let stderr = collect_stderr(&mut child);
        let Some(stdout) = child.stdout.take() else {
            return Err(PipelineError::backend("generator stdout was not captured"));
        };

        let timeout = Duration::from_secs(self.config.generate_timeout_secs);
        let result = tokio::time::timeout(timeout, async {
            let generations = read_generation_events(stdout, expected).await?;
            let status = child.wait().await?;
            Ok::<_, PipelineError>((generations, status))
        })
        .await;

        let (generations, status) = match result {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PipelineError::Timeout(format!(
                    "generation did not finish within {}s",
                    timeout.as_secs()
                )));
            }
        };
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(classify_failure(status, &stderr));
        }

        generations
            .into_iter()
            .enumerate()
            .map(|(i, g)| g.ok_or_else(|| PipelineError::backend(format!("no generation for prompt {i}"))))
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{DecodingStrategy, EpochDirective};
    use crate::config::{ModelConfig, TrainingConfig};
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> ProcessBackend {
        let path = dir.join("trainer.sh");
        std::fs::write(&path, body).unwrap();
        ProcessBackend::new(ProcessBackendConfig::default().with_program("/bin/sh").with_script(path))
    }

    struct SaveEvery {
        root: PathBuf,
        saved: Vec<(usize, f64)>,
    }

    impl TrainingObserver for SaveEvery {
        fn on_epoch_end(&mut self, epoch: usize, _loss: f64) -> Result<EpochDirective, PipelineError> {
            Ok(EpochDirective {
                save_to: Some(self.root.join(format!("checkpoint-epoch-{epoch}"))),
                stop: false,
            })
        }

        fn on_checkpoint_saved(&mut self, epoch: usize, loss: f64, _dir: &Path) -> Result<(), PipelineError> {
            self.saved.push((epoch, loss));
            Ok(())
        }
    }

    fn pairs() -> Vec<FormattedPair> {
        vec![FormattedPair {
            example_id: "x#0".into(),
            prompt: "입력".into(),
            target: "출력".into(),
            violations: Vec::new(),
        }]
    }

    fn params() -> Hyperparameters {
        Hyperparameters::resolve(&TrainingConfig::default(), &ModelConfig::default(), ModelFamily::FlanT5)
    }

    const TRAINER: &str = r#"
out=$(dirname "$2")
for e in 1 2; do
  echo "{\"event\":\"epoch\",\"epoch\":$e,\"loss\":0.$((5 - e))}"
  read directive
  dir=$(echo "$directive" | sed -n 's/.*"save_to":"\([^"]*\)".*/\1/p')
  if [ -n "$dir" ]; then
    mkdir -p "$dir" && echo w > "$dir/weights.bin"
    echo "{\"event\":\"saved\",\"epoch\":$e,\"path\":\"$dir\"}"
  fi
done
echo "not json"
mkdir -p "$out/final" && echo w > "$out/final/weights.bin"
echo '{"event":"done","epochs":2,"steps":8}'
"#;

    #[tokio::test]
    async fn test_train_protocol() {
        let tmp = TempDir::new().unwrap();
        let backend = script(tmp.path(), TRAINER);
        let handle = backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        let run_dir = tmp.path().join("run");
        let mut observer = SaveEvery {
            root: run_dir.clone(),
            saved: Vec::new(),
        };
        let outcome = backend
            .fine_tune(&handle, &pairs(), &params(), &run_dir, &mut observer)
            .await
            .unwrap();

        assert_eq!(outcome.epochs_completed, 2);
        assert_eq!(outcome.steps, 8);
        assert_eq!(observer.saved, vec![(1, 0.4), (2, 0.3)]);
        assert!(run_dir.join("final/weights.bin").exists());
        assert!(run_dir.join("train_pairs.jsonl").exists());
    }

    #[tokio::test]
    async fn test_oom_is_resource_exhausted() {
        let tmp = TempDir::new().unwrap();
        let backend = script(
            tmp.path(),
            "echo 'torch.cuda.OutOfMemoryError: CUDA out of memory' >&2\nexit 1\n",
        );
        let handle = backend.load(ModelFamily::KoBart, "gogamza/kobart-base-v2").await.unwrap();
        let mut observer = SaveEvery {
            root: tmp.path().to_path_buf(),
            saved: Vec::new(),
        };
        let err = backend
            .fine_tune(&handle, &pairs(), &params(), &tmp.path().join("run"), &mut observer)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_error_event_maps_kind() {
        let tmp = TempDir::new().unwrap();
        let backend = script(
            tmp.path(),
            "echo '{\"event\":\"error\",\"kind\":\"model_load\",\"message\":\"bad weights\"}'\n",
        );
        let handle = backend.load(ModelFamily::PkoT5, "paust/pko-t5-base").await.unwrap();
        let mut observer = SaveEvery {
            root: tmp.path().to_path_buf(),
            saved: Vec::new(),
        };
        let err = backend
            .fine_tune(&handle, &pairs(), &params(), &tmp.path().join("run"), &mut observer)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_train_timeout_kills_process() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("slow.sh");
        std::fs::write(&path, "sleep 30\n").unwrap();
        let backend = ProcessBackend::new(
            ProcessBackendConfig::default()
                .with_program("/bin/sh")
                .with_script(path)
                .with_train_timeout(Duration::from_secs(1)),
        );
        let handle = backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        let mut observer = SaveEvery {
            root: tmp.path().to_path_buf(),
            saved: Vec::new(),
        };
        let err = backend
            .fine_tune(&handle, &pairs(), &params(), &tmp.path().join("run"), &mut observer)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_generate_batch_orders_by_index() {
        let tmp = TempDir::new().unwrap();
        let backend = script(
            tmp.path(),
            concat!(
                "echo '{\"event\":\"generation\",\"index\":1,\"text\":\"둘\",\"latency_ms\":2.0}'\n",
                "echo '{\"event\":\"generation\",\"index\":0,\"text\":\"하나\",\"latency_ms\":1.0}'\n",
            ),
        );
        let handle = backend.load(ModelFamily::FlanT5, "google/flan-t5-small").await.unwrap();
        let decoding = DecodingConfig {
            strategy: DecodingStrategy::Beam { num_beams: 4 },
            max_new_tokens: 32,
        };
        let out = backend
            .generate_batch(&handle, &["a".to_string(), "b".to_string()], &decoding)
            .await
            .unwrap();
        assert_eq!(out[0].text, "하나");
        assert_eq!(out[1].text, "둘");
    }
}
