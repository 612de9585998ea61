//! test-orchestrator - run scripted test plans through the execution engine
//!
//! ## Usage
//!
//! ```bash
//! # Run a plan with 8 workers
//! test-orchestrator run plan.yaml --parallelism 8
//!
//! # Only report checkout tests; their dependencies still run
//! test-orchestrator run plan.yaml --filter checkout --format summary
//!
//! # Inspect constraint groups and dependency edges
//! test-orchestrator list plan.yaml
//!
//! # Write an example configuration
//! test-orchestrator config init
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::info;

use test_orchestrator::cli::{self, Args};
use test_orchestrator::config::env::print_env_help;
use test_orchestrator::config::{ConfigFile, EnvConfig};
use test_orchestrator::discovery::TestPlan;
use test_orchestrator::executor::Engine;
use test_orchestrator::output::{write_results_to_file, Listing, OutputFormat, ResultFormatter};
use test_orchestrator::utils::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let env = EnvConfig::load();

    init_logger(LogLevel::select(args.verbose, args.quiet, &env.log_or("info")));

    match args.command {
        cli::Command::Run(run_args) => run_plan(run_args, args.config.as_deref(), &env).await,
        cli::Command::List(list_args) => {
            list_plan(list_args, args.config.as_deref(), &env)?;
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args, args.config.as_deref(), &env)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_plan(args: cli::RunArgs, config: Option<&Path>, env: &EnvConfig) -> Result<ExitCode> {
    let mut config = ConfigFile::resolve(config, env)?.engine;
    if let Some(parallelism) = args.parallelism {
        config = config.with_parallelism(parallelism);
    }
    if let Some(timeout) = args.timeout {
        config = config.with_default_timeout(timeout);
    }
    if args.fail_fast {
        config = config.with_fail_fast(true);
    }
    config.validate().context("Invalid command-line overrides")?;

    let format = OutputFormat::from_str(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;
    let plan = TestPlan::load(&args.plan)?;
    info!(
        "Running {} test(s) from {} with {} worker(s)",
        plan.tests.len(),
        args.plan.display(),
        config.max_parallelism
    );

    let summary = Engine::new(config)
        .with_resources(plan.resources())
        .with_hooks(plan.hooks())
        .run(plan.stream(args.filter.as_deref()))
        .await?;

    println!("{}", ResultFormatter::new(format).format_summary(&summary));

    if let Some(path) = &args.output {
        write_results_to_file(path, &summary)?;
        info!("Results saved to {}", path);
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_plan(args: cli::ListArgs, config: Option<&Path>, env: &EnvConfig) -> Result<()> {
    let config = ConfigFile::resolve(config, env)?.engine;
    let format = OutputFormat::from_str(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;
    let plan = TestPlan::load(&args.plan)?;

    let listing = Listing::from_units(
        &plan.units(args.filter.as_deref()),
        config.max_resolution_passes,
    );
    println!("{}", ResultFormatter::new(format).format_listing(&listing));
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, config: Option<&Path>, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the file to customize your settings.");
        }

        cli::ConfigAction::Show { env: true, .. } => env.print_summary(),

        cli::ConfigAction::Show { env: false, format } => {
            let config = ConfigFile::resolve(config, env)?;
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        cli::ConfigAction::Env => print_env_help(),
    }

    Ok(())
}
