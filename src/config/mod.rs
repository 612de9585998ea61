//! Configuration module
//!
//! Engine settings, their file format and environment overrides.

pub mod env;
pub mod file;

pub use env::EnvConfig;
pub use file::ConfigFile;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Execution engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the worker pool
    pub max_parallelism: usize,

    /// Per-test timeout applied when a test declares none
    pub default_timeout_secs: Option<u64>,

    /// How long a cancelled body may take to unwind
    pub timeout_grace_ms: u64,

    /// Resolution passes run once discovery completes
    pub max_resolution_passes: usize,

    /// Circuit breaker: total discovery time
    pub discovery_timeout_secs: u64,

    /// Circuit breaker: total discovered units
    pub max_discovered_units: usize,

    /// Skip everything not yet running after the first visible failure
    pub fail_fast: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            default_timeout_secs: None,
            timeout_grace_ms: 1000,
            max_resolution_passes: 3,
            discovery_timeout_secs: 300,
            max_discovered_units: 100_000,
            fail_fast: false,
        }
    }
}

/// Logical core count, falling back to one worker
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            anyhow::bail!("max_parallelism must be at least 1");
        }
        if self.max_resolution_passes == 0 {
            anyhow::bail!("max_resolution_passes must be at least 1");
        }
        if self.max_discovered_units == 0 {
            anyhow::bail!("max_discovered_units must be at least 1");
        }
        Ok(())
    }

    /// Apply environment overrides over these settings
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(parallelism) = env.parallelism {
            self.max_parallelism = parallelism;
        }
        if let Some(timeout) = env.timeout {
            self.default_timeout_secs = Some(timeout);
        }
        if let Some(fail_fast) = env.fail_fast {
            self.fail_fast = fail_fast;
        }
    }

    /// Load bare engine settings from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Self = if file::is_yaml_file(path.as_ref()) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        config.validate()?;
        Ok(config)
    }
}
