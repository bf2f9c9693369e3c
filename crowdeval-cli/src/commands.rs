//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crowdeval_core::config::{PipelineConfig, load_config, parse_override};
use crowdeval_core::data::{DatasetSchema, SyntheticGenerator, validate_dataset, write_dataset};
use crowdeval_core::eval::{compare_reports, load_reports};
use crowdeval_core::{EvaluationReport, ModelFamily, ModelPipeline};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
    raw_overrides: &[String],
) -> anyhow::Result<()> {
    let mut overrides = raw_overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<Result<Vec<_>, _>>()?;
    overrides.extend(command_overrides(&command));
    debug!(overrides = overrides.len(), "Resolved config overrides");
    let load = || load_config(Some(workspace), config_path, &overrides);

    match command {
        Commands::Train { family, data, .. } => handle_train(load()?, family, &data).await,
        Commands::Evaluate {
            family,
            checkpoint,
            data,
            output,
            ..
        } => handle_evaluate(load()?, family, &checkpoint, &data, output.as_deref()).await,
        Commands::Synth {
            output,
            count,
            seed,
            legacy,
            domain,
        } => handle_synth(load()?, &output, count, seed, legacy, domain),
        Commands::Validate { data, json } => handle_validate(load()?, &data, json),
        Commands::Compare { reports, json } => handle_compare(&reports, json),
        Commands::Config { action } => handle_config(action, workspace, load),
    }
}

/// Flags that are shorthands for config keys. They sit above `--set`.
fn command_overrides(command: &Commands) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    match command {
        Commands::Train {
            family,
            base_checkpoint,
            epochs,
            output_dir,
            ..
        } => {
            if let Some(checkpoint) = base_checkpoint {
                out.push((format!("models.{}.base_checkpoint", family.name()), json!(checkpoint)));
            }
            if let Some(epochs) = epochs {
                out.push(("training.epochs".to_string(), json!(epochs)));
            }
            if let Some(dir) = output_dir {
                out.push(("training.output_dir".to_string(), json!(dir)));
            }
        }
        Commands::Evaluate {
            beams, max_samples, ..
        } => {
            if let Some(beams) = beams {
                out.push(("evaluation.num_beams".to_string(), json!(beams)));
            }
            if let Some(max) = max_samples {
                out.push(("evaluation.max_samples".to_string(), json!(max)));
            }
        }
        _ => {}
    }
    out
}

async fn handle_train(config: PipelineConfig, family: ModelFamily, data: &[PathBuf]) -> anyhow::Result<()> {
    info!(family = %family, files = data.len(), "Starting fine-tuning");
    let pipeline = ModelPipeline::from_config(config);
    let run = pipeline.train(family, data).await?;
    let manifest = &run.manifest;

    println!("Run {} ({:?})", manifest.run_id, manifest.status);
    println!("  family:          {}", manifest.family);
    println!("  base model:      {}", manifest.base_model);
    println!(
        "  examples:        {} train / {} held out",
        manifest.dataset.train_examples, manifest.dataset.held_out_examples
    );
    println!("  epochs:          {}", manifest.metrics.epochs_completed);
    if let Some(loss) = manifest.metrics.best_loss {
        println!("  best loss:       {loss:.4} (epoch {})", manifest.metrics.best_epoch.unwrap_or(0));
    }
    if let Some(reason) = &manifest.stop_reason {
        println!("  stopped early:   {reason}");
    }
    if manifest.dataset.length_violations > 0 {
        println!("  over max_length: {} pairs", manifest.dataset.length_violations);
    }
    println!("  run directory:   {}", run.run_dir.display());
    println!("  final checkpoint: {}", run.final_checkpoint.display());
    Ok(())
}

async fn handle_evaluate(
    config: PipelineConfig,
    family: ModelFamily,
    checkpoint: &str,
    data: &[PathBuf],
    output: Option<&Path>,
) -> anyhow::Result<()> {
    info!(family = %family, checkpoint, "Starting evaluation");
    let pipeline = ModelPipeline::from_config(config);
    let (report, path) = pipeline.evaluate_and_save(family, checkpoint, data, output).await?;
    print_report(&report);
    println!("\nReport written to {}", path.display());
    Ok(())
}

fn print_report(report: &EvaluationReport) {
    println!(
        "{} on {} examples ({} beam(s))",
        report.model_name,
        report.sample_count,
        report.decoding.strategy.num_beams()
    );
    for result in &report.results {
        println!("  {:<17} {:.4}", result.metric_name, result.score);
    }
    println!(
        "  latency ms        mean {:.1}, median {:.1}, max {:.1}",
        report.latency.mean_ms, report.latency.median_ms, report.latency.max_ms
    );
}

fn handle_synth(
    config: PipelineConfig,
    output: &Path,
    count: usize,
    seed: u64,
    legacy: bool,
    domain: Option<String>,
) -> anyhow::Result<()> {
    let domain = domain.unwrap_or_else(|| config.data.default_domain.clone());
    let examples = SyntheticGenerator::new(seed, config.data.guideline.clone())
        .with_domain(domain)
        .generate(count);
    let schema = if legacy {
        DatasetSchema::Legacy
    } else {
        DatasetSchema::Structured
    };
    write_dataset(output, &examples, schema)?;

    let report = validate_dataset(&examples, &config.data.guideline, config.data.quality_threshold);
    println!(
        "Wrote {} examples to {} (quality score {:.3})",
        examples.len(),
        output.display(),
        report.overall_score
    );
    Ok(())
}

fn handle_validate(config: PipelineConfig, data: &[PathBuf], as_json: bool) -> anyhow::Result<()> {
    let threshold = config.data.quality_threshold;
    let guideline = config.data.guideline.clone();
    let pipeline = ModelPipeline::from_config(config);
    let paths = if data.is_empty() {
        pipeline.config().data.paths.clone()
    } else {
        data.to_vec()
    };
    if paths.is_empty() {
        anyhow::bail!("No dataset given; pass files or set data.paths");
    }
    let examples = pipeline.loader().load_many(&paths)?;
    let report = validate_dataset(&examples, &guideline, threshold);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Examples: {}", report.total_examples);
        for (class, ratio) in &report.class_ratios {
            let count = report.class_counts.get(class).copied().unwrap_or(0);
            println!("  {:<11} {:>5} ({:.1}%)", class.as_str(), count, ratio * 100.0);
        }
        println!("  with threshold: {:.1}%", report.threshold_share * 100.0);
        for deviation in &report.ratio_deviations {
            println!(
                "  ratio off: {} is {:.3}, expected {:.3}",
                deviation.metric, deviation.actual, deviation.expected
            );
        }
        println!("Duplicates: {}", report.duplicate_examples);
        println!("Action diversity: {:.3}", report.action_diversity);
        println!("Record issues: {}", report.issues.len());
        for issue in report.issues.iter().take(20) {
            println!("  {} [{:?}] {}", issue.record, issue.kind, issue.detail);
        }
        if report.issues.len() > 20 {
            println!("  ... {} more", report.issues.len() - 20);
        }
        println!("Quality score: {:.3} (threshold {threshold:.2})", report.overall_score);
    }

    if !report.passed_gate {
        anyhow::bail!(
            "Dataset quality {:.3} is below the threshold {threshold:.2}",
            report.overall_score
        );
    }
    Ok(())
}

fn handle_compare(paths: &[PathBuf], as_json: bool) -> anyhow::Result<()> {
    let reports = load_reports(paths)?;
    let table = compare_reports(&reports);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }
    print!("{}", table.render());
    for (metric, model) in &table.best {
        println!("best {metric}: {model}");
    }
    if let Some(model) = &table.fastest {
        println!("fastest: {model}");
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    load: impl FnOnce() -> Result<PipelineConfig, crowdeval_core::PipelineError>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".crowdeval");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PipelineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_train_flags_become_overrides() {
        let command = Commands::Train {
            family: ModelFamily::PkoT5,
            data: Vec::new(),
            base_checkpoint: Some("paust/pko-t5-small".into()),
            epochs: Some(2),
            output_dir: None,
        };
        let overrides = command_overrides(&command);
        assert_eq!(
            overrides,
            vec![
                ("models.pko-t5.base_checkpoint".to_string(), json!("paust/pko-t5-small")),
                ("training.epochs".to_string(), json!(2)),
            ]
        );
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&PipelineConfig::default()).unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.training.epochs, 5);
        assert_eq!(parsed.evaluation.num_beams, 4);
    }

    #[tokio::test]
    async fn test_synth_then_validate() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("synthetic.jsonl");
        let command = Commands::Synth {
            output: output.clone(),
            count: 50,
            seed: 3,
            legacy: false,
            domain: None,
        };
        handle_command(command, tmp.path(), None, &[]).await.unwrap();
        assert!(output.exists());

        let command = Commands::Validate {
            data: vec![output],
            json: true,
        };
        handle_command(command, tmp.path(), None, &[]).await.unwrap();
    }
}
