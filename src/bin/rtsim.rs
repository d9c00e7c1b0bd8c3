//! rtsim — validate models and run scheduling simulations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use rtsim::{build_audit_report, Engine, ModelSpec, SimError};

/// Exit codes: 0 success, 1 model/config error, 2 runtime invariant
/// violation or failed audit, 3 failed child run in strict batch mode.
#[derive(Parser)]
#[command(name = "rtsim")]
#[command(version)]
#[command(about = "Discrete-event simulator for real-time scheduling")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Validate a model document (schema, semantics, engine build).
    Validate {
        /// Path to the model JSON.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run one simulation and write trace/metrics artifacts.
    Run {
        /// Path to the model JSON.
        #[arg(short, long)]
        config: PathBuf,

        /// Override the simulation horizon.
        #[arg(long)]
        until: Option<f64>,

        /// Freeze the simulation at this time and keep partial results.
        #[arg(long)]
        pause_at: Option<f64>,

        /// Advance event-by-event instead of running to the horizon.
        #[arg(long)]
        step: bool,

        /// Step width for --step mode (simulated time units).
        #[arg(long, requires = "step")]
        delta: Option<f64>,

        /// Where to write the newline-delimited JSON event trace.
        #[arg(long, default_value = "artifacts/events.jsonl")]
        events_out: PathBuf,

        /// Where to write the metrics JSON document.
        #[arg(long, default_value = "artifacts/metrics.json")]
        metrics_out: PathBuf,

        /// Write the audit report and fail the run if it does not pass.
        #[arg(long)]
        audit_out: Option<PathBuf>,
    },

    /// Run a list of models as independent engine instances.
    BatchRun {
        /// Path to the batch JSON ({"runs": [{"name", "config"}]}).
        #[arg(short, long)]
        batch_config: PathBuf,

        /// Output directory for per-run artifacts.
        #[arg(long, default_value = "artifacts/batch")]
        output_dir: PathBuf,

        /// Return non-zero when any child run fails.
        #[arg(long)]
        strict_fail_on_error: bool,
    },
}

#[derive(Deserialize)]
struct BatchConfig {
    runs: Vec<BatchRunSpec>,
}

#[derive(Deserialize)]
struct BatchRunSpec {
    name: String,
    config: PathBuf,
    #[serde(default)]
    until: Option<f64>,
}

#[derive(Serialize)]
struct BatchRunResult {
    name: String,
    status: String,
    events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    std::process::exit(run_cli());
}

fn run_cli() -> i32 {
    let cli = Cli::parse();
    let result = match cli.command {
        Cmd::Validate { config } => cmd_validate(&config),
        Cmd::Run {
            config,
            until,
            pause_at,
            step,
            delta,
            events_out,
            metrics_out,
            audit_out,
        } => cmd_run(
            &config,
            until,
            pause_at,
            step,
            delta,
            &events_out,
            &metrics_out,
            audit_out.as_deref(),
        ),
        Cmd::BatchRun {
            batch_config,
            output_dir,
            strict_fail_on_error,
        } => cmd_batch_run(&batch_config, &output_dir, strict_fail_on_error),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[ERROR] {err:#}");
            match err.downcast_ref::<SimError>() {
                Some(sim) => sim.exit_code(),
                None => 1,
            }
        }
    }
}

fn load_model(path: &Path) -> Result<ModelSpec> {
    let doc = fs::read_to_string(path)
        .with_context(|| format!("cannot read model file {}", path.display()))?;
    let spec = ModelSpec::from_json_str(&doc)
        .with_context(|| format!("invalid model {}", path.display()))?;
    Ok(spec)
}

fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_text(path, &serde_json::to_string_pretty(value)?)
}

fn cmd_validate(config: &Path) -> Result<i32> {
    let spec = load_model(config)?;
    // Strategy resolution must also pass during validate.
    let mut engine = Engine::new();
    engine.build(spec)?;
    println!("[OK] config validation passed");
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: &Path,
    until: Option<f64>,
    pause_at: Option<f64>,
    step: bool,
    delta: Option<f64>,
    events_out: &Path,
    metrics_out: &Path,
    audit_out: Option<&Path>,
) -> Result<i32> {
    if let Some(delta) = delta {
        if delta <= 0.0 {
            anyhow::bail!("--delta must be > 0");
        }
    }
    if matches!(pause_at, Some(t) if t < 0.0) {
        anyhow::bail!("--pause-at must be >= 0");
    }

    let spec = load_model(config)?;
    let horizon = until.unwrap_or(spec.sim.duration);
    let stop_at = pause_at.map_or(horizon, |t| t.min(horizon));

    let mut engine = Engine::new();
    engine.build(spec)?;

    let run_result = if step {
        step_to(&mut engine, stop_at, delta)
    } else {
        engine.run(Some(stop_at))
    };
    if pause_at.is_some() && stop_at < horizon {
        engine.pause();
    }

    // Artifacts are written even when the run failed, so the partial trace
    // and failed-status metrics stay inspectable.
    write_text(events_out, &engine.events_jsonl())?;
    write_json(metrics_out, &engine.metrics_report())?;

    if let Err(err) = run_result {
        eprintln!("[ERROR] {err}");
        return Ok(err.exit_code());
    }

    if let Some(audit_path) = audit_out {
        let report = build_audit_report(engine.events(), engine.scheduler_kind(), engine.model());
        write_json(audit_path, &report)?;
        if !report.passed() {
            eprintln!("[ERROR] simulation audit failed, report={}", audit_path.display());
            return Ok(2);
        }
    }

    println!(
        "[OK] simulation completed, events={}, now={:.3}, metrics={}",
        engine.events().len(),
        engine.now(),
        metrics_out.display()
    );
    Ok(0)
}

fn step_to(engine: &mut Engine, stop_at: f64, delta: Option<f64>) -> Result<(), SimError> {
    while engine.now() < stop_at - 1e-12 {
        let before = engine.now();
        engine.step(delta)?;
        if engine.now() <= before + 1e-12 {
            break;
        }
    }
    engine.run(Some(stop_at))
}

fn cmd_batch_run(batch_config: &Path, output_dir: &Path, strict: bool) -> Result<i32> {
    let doc = fs::read_to_string(batch_config)
        .with_context(|| format!("cannot read batch file {}", batch_config.display()))?;
    let batch: BatchConfig = serde_json::from_str(&doc)
        .with_context(|| format!("invalid batch file {}", batch_config.display()))?;
    if batch.runs.is_empty() {
        anyhow::bail!("batch file declares no runs");
    }

    let base_dir = batch_config.parent().unwrap_or(Path::new("."));
    let mut results = Vec::new();
    let mut failed = 0usize;

    for run in &batch.runs {
        let config_path = if run.config.is_absolute() {
            run.config.clone()
        } else {
            base_dir.join(&run.config)
        };
        let run_dir = output_dir.join(&run.name);
        let outcome = run_one_batch_child(&config_path, &run_dir, run.until);
        match outcome {
            Ok(events) => results.push(BatchRunResult {
                name: run.name.clone(),
                status: "ok".to_string(),
                events,
                error: None,
            }),
            Err(err) => {
                failed += 1;
                results.push(BatchRunResult {
                    name: run.name.clone(),
                    status: "failed".to_string(),
                    events: 0,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }

    write_json(&output_dir.join("summary.json"), &results)?;
    println!(
        "[OK] batch simulation completed, runs={}, success={}, failed={}",
        batch.runs.len(),
        batch.runs.len() - failed,
        failed
    );
    if strict && failed > 0 {
        eprintln!("[ERROR] batch simulation contains failed runs in strict mode");
        return Ok(3);
    }
    Ok(0)
}

/// Each child gets its own engine instance; one failure never poisons the
/// next run.
fn run_one_batch_child(config: &Path, run_dir: &Path, until: Option<f64>) -> Result<usize> {
    let spec = load_model(config)?;
    let mut engine = Engine::new();
    engine.build(spec)?;
    let run_result = engine.run(until);
    write_text(&run_dir.join("events.jsonl"), &engine.events_jsonl())?;
    write_json(&run_dir.join("metrics.json"), &engine.metrics_report())?;
    run_result?;
    Ok(engine.events().len())
}
