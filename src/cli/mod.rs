//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parallel test execution engine
#[derive(Parser, Debug)]
#[command(name = "test-orchestrator")]
#[command(version)]
#[command(about = "Run test plans with dependencies, constraint keys and shared resources")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (overrides TEST_ORCHESTRATOR_CONFIG and the search path)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a test plan
    Run(RunArgs),

    /// Show tests, constraint groups and dependency edges of a plan
    List(ListArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Test plan (YAML or JSON)
    pub plan: PathBuf,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Save the session summary as JSON
    #[arg(short, long)]
    pub output: Option<String>,

    /// Worker pool size
    #[arg(short, long)]
    pub parallelism: Option<usize>,

    /// Default per-test timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Skip everything not yet running after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Only report tests whose id or name contains this text
    #[arg(long)]
    pub filter: Option<String>,
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Test plan (YAML or JSON)
    pub plan: PathBuf,

    /// Mark tests not matching this text as deselected
    #[arg(long)]
    pub filter: Option<String>,

    /// Output format (table, json, json-pretty)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "test-orchestrator.yaml")]
        output: String,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Show environment overrides instead
        #[arg(short, long)]
        env: bool,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Show supported environment variables
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "test-orchestrator",
            "run",
            "plan.yaml",
            "--parallelism",
            "3",
            "--fail-fast",
            "--filter",
            "orders",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.plan, PathBuf::from("plan.yaml"));
                assert_eq!(run.parallelism, Some(3));
                assert!(run.fail_fast);
                assert_eq!(run.filter.as_deref(), Some("orders"));
                assert_eq!(run.format, "table");
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from([
            "test-orchestrator",
            "list",
            "plan.json",
            "--quiet",
            "--config",
            "custom.yaml",
        ]);
        assert!(args.quiet);
        assert_eq!(args.config, Some(PathBuf::from("custom.yaml")));
        assert!(matches!(args.command, Command::List(_)));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let parsed = Args::try_parse_from(["test-orchestrator", "-v", "-q", "config", "env"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_config_init_defaults() {
        let args = Args::parse_from(["test-orchestrator", "config", "init"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { output, force },
            }) => {
                assert_eq!(output, "test-orchestrator.yaml");
                assert!(!force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
