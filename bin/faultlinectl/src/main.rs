//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Scenario CLI that drives the fault injector from TOML files."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use faultline_common::{init_tracing, render_text, InjectorConfig};
use faultline_injector::{ChaosScenario, FaultInjector, ScenarioOutcome, ScenarioRunner};
use serde_json::json;
use tracing::{info, warn};

const SERVICE: &str = "faultlinectl";
const DEFAULT_CONFIGS: [&str; 2] = ["faultline.toml", "config/faultline.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Run chaos scenarios through the faultline injector", long_about = None)]
struct Cli {
    /// Injector configuration; `FAULTLINE_CONFIG` takes precedence when set.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inject a scenario's fault, hold it for its duration, then roll it back.
    Run(RunArgs),
    /// Parse scenarios and the configuration without injecting anything.
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Scenario file (TOML).
    #[arg(value_name = "SCENARIO")]
    scenario: PathBuf,
    /// Print the Prometheus exposition after the run.
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(value_name = "SCENARIO", required = true)]
    scenarios: Vec<PathBuf>,
}

fn load_config(explicit: Option<&PathBuf>) -> Result<InjectorConfig> {
    let overridden = std::env::var_os(InjectorConfig::ENV_CONFIG_PATH).is_some();
    match explicit {
        Some(path) => InjectorConfig::load(std::slice::from_ref(path)),
        None if !overridden && !DEFAULT_CONFIGS.iter().any(|path| Path::new(path).exists()) => {
            Ok(InjectorConfig::default())
        }
        None => InjectorConfig::load(&DEFAULT_CONFIGS),
    }
}

fn render_outcome(outcome: &ScenarioOutcome) -> Result<String> {
    let report = json!({
        "scenario": outcome.scenario,
        "fault_id": outcome.fault_id,
        "removed": outcome.removed,
        "restart_required": outcome.restart_required,
        "started_at": outcome.started_at,
        "finished_at": outcome.finished_at,
        "injected": outcome.injected,
        "rolled_back": outcome.rolled_back,
    });
    Ok(serde_json::to_string_pretty(&report)?)
}

async fn run(config: &InjectorConfig, args: RunArgs) -> Result<()> {
    let scenario = ChaosScenario::from_file(&args.scenario)?;
    let injector = FaultInjector::from_config(config)?;
    let runner = ScenarioRunner::new(injector.clone());

    let outcome = tokio::select! {
        outcome = runner.run(&scenario) => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!(scenario = %scenario.name, "interrupted, rolling back active faults");
            let report = injector.cleanup().await;
            info!(removed = report.removed, drained = report.drained_tasks, "cleanup finished");
            anyhow::bail!("scenario {} interrupted", scenario.name);
        }
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            injector.cleanup().await;
            return Err(err).with_context(|| format!("scenario {} failed", scenario.name));
        }
    };

    println!("{}", render_outcome(&outcome)?);
    if args.metrics {
        if let Some(metrics) = injector.metrics() {
            print!("{}", render_text(&metrics.registry())?);
        }
    }
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    for path in &args.scenarios {
        let scenario = ChaosScenario::from_file(path)?;
        println!(
            "{}: {} on {} for {}s",
            scenario.name,
            scenario.fault.fault_type,
            scenario.fault.target,
            scenario.duration.as_secs()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(SERVICE, &config.logging)?;
    match cli.command {
        Commands::Run(args) => run(&config, args).await,
        Commands::Validate(args) => validate(args),
    }
}
