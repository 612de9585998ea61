//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TEST_ORCHESTRATOR";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Worker pool size from TEST_ORCHESTRATOR_PARALLELISM
    pub parallelism: Option<usize>,
    /// Default test timeout in seconds from TEST_ORCHESTRATOR_TIMEOUT
    pub timeout: Option<u64>,
    /// Fail fast from TEST_ORCHESTRATOR_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// Config file from TEST_ORCHESTRATOR_CONFIG
    pub config_file: Option<String>,
    /// Log level from TEST_ORCHESTRATOR_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            parallelism: get_env_parse("PARALLELISM"),
            timeout: get_env_parse("TIMEOUT"),
            fail_fast: get_env_bool("FAIL_FAST"),
            config_file: get_env("CONFIG"),
            log: get_env("LOG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.parallelism.is_some()
            || self.timeout.is_some()
            || self.fail_fast.is_some()
            || self.config_file.is_some()
            || self.log.is_some()
    }

    /// Get log level with fallback
    pub fn log_or(&self, default: &str) -> String {
        self.log.clone().unwrap_or_else(|| default.to_string())
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_PARALLELISM: {:?}", ENV_PREFIX, self.parallelism);
        println!("  {}_TIMEOUT:     {:?}", ENV_PREFIX, self.timeout);
        println!("  {}_FAIL_FAST:   {:?}", ENV_PREFIX, self.fail_fast);
        println!("  {}_CONFIG:      {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_LOG:         {:?}", ENV_PREFIX, self.log);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_PARALLELISM"), parallelism.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_TIMEOUT"), timeout.to_string()));
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_FAIL_FAST"), fail_fast.to_string()));
        self
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TEST_ORCHESTRATOR environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_PARALLELISM  Worker pool size");
    println!("  {ENV_PREFIX}_TIMEOUT      Default per-test timeout in seconds");
    println!("  {ENV_PREFIX}_FAIL_FAST    Stop scheduling after the first failure (true/false)");
    println!("  {ENV_PREFIX}_CONFIG       Path to configuration file");
    println!("  {ENV_PREFIX}_LOG          Log level (trace, debug, info, warn, error)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_PARALLELISM=8");
    println!("  test-orchestrator run plan.yaml");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.parallelism.is_none());
        assert!(!config.has_any());
        assert_eq!(config.log_or("info"), "info");
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .parallelism(6)
            .timeout(60)
            .fail_fast(true)
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.parallelism, Some(6));
        assert_eq!(config.timeout, Some(60));
        assert_eq!(config.fail_fast, Some(true));
        assert!(config.has_any());
    }
}
