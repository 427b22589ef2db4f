use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use fleetrun::config::{self, GlobalConfig};
use fleetrun::coordination::CancelerRegistry;
use fleetrun::dispatch::{Dispatcher, ScriptedControlPlane};
use fleetrun::domain::RunPlan;
use fleetrun::lock::ResourceLocks;
use fleetrun::manager::RunManager;
use fleetrun::runner::{
    C2_COMPONENT_TYPE, C2Executor, DryRunExecutor, ExecutorRegistry, LoopEngine, PAUSE_COMPONENT_TYPE, PauseExecutor,
};

mod cli;

use cli::Cli;
use cli::commands::Commands;

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetrun")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("fleetrun.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn load_plan(path: &Path, config: &GlobalConfig) -> Result<RunPlan> {
    RunPlan::from_file(path, config.loops.max_depth).context(format!("Failed to load run plan {}", path.display()))
}

fn handle_validate_command(path: &Path, config: &GlobalConfig) -> Result<()> {
    info!("Validating run plan: {}", path.display());
    let plan = load_plan(path, config)?;
    plan.validate().context("Run plan does not resolve")?;

    println!(
        "{} {} ({} runs, {} components)",
        "Valid:".green(),
        path.display(),
        plan.run_count(),
        plan.components().count()
    );

    for run_id in 0..plan.run_count() {
        let spec = plan.run(run_id)?;
        println!(
            "  run {}: depth {}, components: {}",
            run_id,
            spec.depth(),
            spec.component_names().join(", ")
        );
    }
    Ok(())
}

fn build_registry(config: &GlobalConfig, dry_run: bool, recorder: Arc<DryRunExecutor>) -> ExecutorRegistry {
    if dry_run {
        return ExecutorRegistry::new().with_fallback(recorder);
    }

    let plane = Arc::new(ScriptedControlPlane::new());
    let dispatcher = Arc::new(Dispatcher::new(plane, config.dispatch.dispatch_config()));
    let c2 = C2Executor::new(dispatcher).with_default_timeout(config.dispatch.default_timeout());

    ExecutorRegistry::new()
        .with(C2_COMPONENT_TYPE, Arc::new(c2))
        .with(PAUSE_COMPONENT_TYPE, Arc::new(PauseExecutor))
        .with_fallback(recorder)
}

async fn handle_run_command(
    cli: &Cli,
    path: &Path,
    experiment: &str,
    run_id: usize,
    dry_run: bool,
    config: &GlobalConfig,
) -> Result<()> {
    info!("Running {} run {} from {} (dry run: {})", experiment, run_id, path.display(), dry_run);
    let plan = load_plan(path, config)?;

    if !dry_run {
        println!(
            "{}",
            "No C2 transport configured; commands are answered by the in-memory control plane".yellow()
        );
    }

    let recorder = Arc::new(DryRunExecutor::new());
    let registry = build_registry(config, dry_run, recorder.clone());
    let manager = RunManager::new(
        LoopEngine::new(Arc::new(registry)),
        Arc::new(CancelerRegistry::new()),
        Arc::new(ResourceLocks::new(config.locks.ttls())),
    );

    let root = CancellationToken::new();
    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    println!("{} {} run {}", "Running:".cyan(), experiment, run_id);
    let report = manager
        .execute(&root, &plan, experiment, run_id)
        .await
        .context("Run was not started")?;

    if dry_run || cli.is_verbose() {
        for call in recorder.calls() {
            println!("  {}", call);
        }
    }

    println!("  took {:.1}s", report.elapsed().num_milliseconds() as f64 / 1000.0);
    if report.succeeded() {
        println!("{}", report.summary().green());
        Ok(())
    } else if report.cancelled {
        println!("{}", report.summary().yellow());
        eyre::bail!("run {} was cancelled", report.handle)
    } else {
        println!("{}", report.summary().red());
        eyre::bail!("run {} failed with {} errors", report.handle, report.errors.len())
    }
}

async fn run_application(cli: &Cli, config: &GlobalConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Validate { plan } => handle_validate_command(plan, config),
        Commands::Run {
            plan,
            experiment,
            run,
            dry_run,
        } => handle_run_command(cli, plan, experiment, *run, *dry_run, config).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    setup_logging(cli.is_verbose()).context("Failed to setup logging")?;

    // Load configuration
    let config = config::load_config(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
